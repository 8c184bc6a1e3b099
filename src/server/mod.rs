//! HTTP server exposing the artifact cache.
//!
//! - [`http_api`]: Route handlers, error mapping and request ids

pub mod http_api;
