//! Relay transport engine: retry, rate limiting, capability tokens, channel
//! provisioning, streaming file transfer, and the end-to-end dispatch flow
//! that ties them together.
//!
//! External collaborators (the chat platform client, the channel-mapping /
//! capability-token / installation stores, the outbound queue) are traits;
//! this crate ships in-memory implementations for single-process
//! deployments and tests.

pub mod backoff;
pub mod capability;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod platform;
pub mod provision;
pub mod tokens;
pub mod transfer;

pub use {
    backoff::{RetryPolicy, Retryable, retry_with_backoff},
    error::{Error, Result},
};
