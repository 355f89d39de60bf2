//! HTTP surface of the relay: the inbound envelope endpoint and the signed
//! file proxy, plus the state wiring that connects them to the core.

pub mod auth;
pub mod file_proxy;
pub mod inbound;
pub mod server;
pub mod state;

pub use {
    server::{build_router, serve},
    state::GatewayState,
};
