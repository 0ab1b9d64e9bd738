//! Request correlation and cancellation on top of a shared chat session.
//!
//! The backend channel is fire-and-forget: a message goes in, and some time
//! later a reply may show up in the conversation history among unrelated
//! traffic. This module turns that into a single-shot call:
//!
//! - [`prompt`] tags each request with a request id the reply must echo
//! - [`matcher`] finds the reply carrying that id in a history window
//! - [`registry`] tracks in-flight requests so they can be aborted
//! - [`coordinator`] runs submit → poll → match under a deadline

pub mod coordinator;
pub mod matcher;
pub mod prompt;
pub mod registry;

pub use coordinator::{ExplainCoordinator, ExplainOutcome, ExplainRequest, PollSettings};
pub use matcher::{match_reply, ExplanationItem, GRAMMAR_SENTINEL};
pub use registry::{InFlightEntry, InFlightRegistry};

use crate::channels::ChannelError;

/// Terminal failures of an explain call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("failed to submit request: {0}")]
    Submit(#[source] ChannelError),

    #[error("timed out waiting for response to {request_id}")]
    Timeout { request_id: String },

    #[error("request {request_id} canceled")]
    Canceled { request_id: String },
}

impl BridgeError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, BridgeError::Canceled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}
