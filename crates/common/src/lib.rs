//! Shared relay types used across all obridge crates.

pub mod types;

pub use types::{
    RelayDirection, RelayEnvelope, RelayFile, RelayFileSource, WORKSPACE_RESPONDER,
    WORKSPACE_USER_APP, build_relay_key,
};
