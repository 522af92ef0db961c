//! HTTP layer for the merge integrity pipeline.
//!
//! The axum-based server exposes the pre-receive gate to the git server
//! hook, the queue endpoints to the forge, and the operational endpoints
//! (health, metrics).  Service-to-service trust is an HMAC-SHA256 body
//! signature in `X-Gate-Signature`.

pub mod handler;

pub use handler::create_router;
