//! Turnstile - Fixed-Window Rate Limiting Service
//!
//! This crate classifies each inbound HTTP request under a client address or
//! an API credential, counts requests per identity in fixed one-second
//! windows, and temporarily bans identities that exceed their limit. State
//! lives either in process memory or in Redis, where a server-side script
//! keeps decisions atomic across any number of instances.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
