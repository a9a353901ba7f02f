use axum::{
    extract::{Extension, Json},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::chat::ChatMessage;
use crate::verify::VerifyError;

pub struct IngestState {
    token: SecretString,
    tx: mpsc::Sender<ChatMessage>,
}

impl IngestState {
    #[must_use]
    pub fn new(token: SecretString, tx: mpsc::Sender<ChatMessage>) -> Self {
        Self { token, tx }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| token.trim() == self.token.expose_secret())
    }
}

/// One message or a batch.
#[derive(ToSchema, Deserialize, Debug)]
#[serde(untagged)]
pub enum ChatEvents {
    Batch { messages: Vec<ChatMessage> },
    Single(ChatMessage),
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Accepted {
    pub accepted: usize,
}

#[utoipa::path(
    post,
    path= "/chat/events",
    request_body = ChatEvents,
    responses (
        (status = 202, description = "Messages queued for matching", body = Accepted),
        (status = 401, description = "Missing or wrong ingest token", body = super::ErrorResponse),
        (status = 503, description = "Ingest queue closed"),
    ),
    tag= "chat"
)]
pub async fn chat_events(
    Extension(state): Extension<Arc<IngestState>>,
    headers: HeaderMap,
    Json(events): Json<ChatEvents>,
) -> Response {
    if !state.authorized(&headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(super::ErrorResponse {
                code: VerifyError::Unauthorized.code(),
                data: super::ErrorData {
                    error: VerifyError::Unauthorized.to_string(),
                    query_id: None,
                },
            }),
        )
            .into_response();
    }

    let messages = match events {
        ChatEvents::Batch { messages } => messages,
        ChatEvents::Single(message) => vec![message],
    };

    let accepted = messages.len();
    for message in messages {
        if state.tx.send(message).await.is_err() {
            error!("chat ingest channel closed");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    debug!(accepted, "queued chat messages");

    (StatusCode::ACCEPTED, Json(Accepted { accepted })).into_response()
}
