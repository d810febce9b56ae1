//! Rate limit middleware rendering decisions as HTTP responses.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

use crate::ratelimit::{Decision, RateLimiter};

/// Body sent with every 429 response.
pub const RATE_LIMITED_BODY: &str =
    "you have reached the maximum number of requests or actions allowed within a certain time frame";

/// Axum middleware consulting the rate limiter before the inner handler.
///
/// Denied requests get a 429 with `Retry-After`; store failures fail closed
/// with a 500 and never reach the inner handler.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = limiter.identify(request.headers(), peer);

    match limiter.evaluate(&identity).await {
        Ok(decision) if decision.allowed => next.run(request).await,
        Ok(decision) => {
            debug!(
                address = %identity.address,
                has_credential = identity.credential.is_some(),
                "Rejecting rate limited request"
            );
            rate_limited_response(&decision)
        }
        Err(e) => {
            error!(error = %e, "Rate limit decision failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::INTERNAL_SERVER_ERROR
                    .canonical_reason()
                    .unwrap_or_default(),
            )
                .into_response()
        }
    }
}

fn rate_limited_response(decision: &Decision) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMITED_BODY).into_response();
    if !decision.retry_after.is_zero() {
        response.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from(retry_after_secs(decision.retry_after)),
        );
    }
    response
}

/// Whole seconds for `Retry-After`, rounded up so clients never retry early.
fn retry_after_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
