//! Slack Web API client implementing the relay's platform-client seam.

mod client;
mod types;

pub use client::{SlackClient, SlackClientFactory};
