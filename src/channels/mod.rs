//! Conversation backends reachable by the bridge.
//!
//! A channel is deliberately dumb: submit, list recent history, abort.
//! Correlation lives in [`crate::bridge`].

pub mod openclaw;
pub mod traits;

pub use openclaw::OpenClawChannel;
pub use traits::{ChannelError, ChannelMessage, ChatChannel, ContentPart, MessageContent, SendAck};

use crate::config::BridgeConfig;
use std::sync::Arc;

/// Build the channel configured for this process.
pub fn create_channel(config: &BridgeConfig) -> Arc<dyn ChatChannel> {
    Arc::new(OpenClawChannel::from_config(config))
}
