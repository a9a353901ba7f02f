//! Chat event ingestion.
//!
//! Any relay that can observe the monitored room pushes [`ChatMessage`]s into
//! an `mpsc` channel; [`spawn_ingestor`] drains it into the correlator on its
//! own task so matching never waits on a poll.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::verify::{Correlator, Identity, MatchOutcome};

/// Default capacity of the ingest channel.
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
    pub sender: Identity,
}

/// Start the ingest loop. The task ends once every sender is dropped.
pub fn spawn_ingestor(
    mut rx: mpsc::Receiver<ChatMessage>,
    correlator: Arc<Correlator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut claimed: u64 = 0;
        while let Some(message) = rx.recv().await {
            match correlator.handle_chat_message(&message).await {
                MatchOutcome::Claimed => claimed += 1,
                MatchOutcome::AlreadyClaimed => {
                    debug!(uid = message.sender.uid, "ignoring repeated claim");
                }
                MatchOutcome::NoMatch => {}
            }
        }
        info!(claimed, "chat ingest channel closed");
    })
}
