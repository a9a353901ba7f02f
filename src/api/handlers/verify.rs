use axum::{
    extract::{Extension, Form, FromRequest, Json, Request},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use super::{error_response, error_response_with_query, CallerIdentity};
use crate::verify::{Correlator, Identity, SUCCESS_CODE};

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewVerifyData {
    /// The code to send as a chat message.
    pub verify_msg: String,
    /// Session id to poll with.
    pub query_id: String,
    pub room_id: u64,
    pub room_url: String,
    /// Human readable instructions.
    pub text: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NewVerifyResponse {
    pub code: u8,
    pub data: NewVerifyData,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct QueryVerifyRequest {
    #[serde(rename = "queryId", default)]
    pub query_id: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryVerifyData {
    pub query_id: String,
    pub user_info: Identity,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct QueryVerifyResponse {
    pub code: u8,
    pub data: QueryVerifyData,
}

#[utoipa::path(
    post,
    path= "/verify/new_verify",
    responses (
        (status = 200, description = "Challenge issued, or error envelope with code 4/5", body = NewVerifyResponse),
        (status = 429, description = "Rate limited", body = super::ErrorResponse),
    ),
    tag= "verify"
)]
// axum handler for new_verify
#[instrument(skip_all)]
pub async fn new_verify(
    Extension(correlator): Extension<Arc<Correlator>>,
    Extension(caller): Extension<CallerIdentity>,
) -> Response {
    match correlator.issue_challenge(&caller.0).await {
        Ok(challenge) => {
            debug!(session_id = %challenge.session_id, "challenge issued");
            Json(NewVerifyResponse {
                code: SUCCESS_CODE,
                data: NewVerifyData {
                    verify_msg: challenge.code.to_string(),
                    query_id: challenge.session_id.to_string(),
                    room_id: challenge.room_id,
                    room_url: challenge.room_url,
                    text: challenge.instructions,
                },
            })
            .into_response()
        }
        Err(err) => error_response(err),
    }
}

#[utoipa::path(
    post,
    path= "/verify/query_verify",
    request_body(
        content = QueryVerifyRequest,
        content_type = "application/x-www-form-urlencoded",
        description = "Form or JSON body carrying `queryId`"
    ),
    responses (
        (status = 200, description = "Claimant, or error envelope with code 1/2/3", body = QueryVerifyResponse),
        (status = 429, description = "Rate limited", body = super::ErrorResponse),
    ),
    tag= "verify"
)]
// axum handler for query_verify
#[instrument(skip_all)]
pub async fn query_verify(
    Extension(correlator): Extension<Arc<Correlator>>,
    request: Request,
) -> Response {
    let query_id = query_id_from(request).await;

    match correlator.poll_session(&query_id) {
        Ok(identity) => Json(QueryVerifyResponse {
            code: SUCCESS_CODE,
            data: QueryVerifyData {
                query_id,
                user_info: identity,
            },
        })
        .into_response(),
        Err(err) => {
            let echoed = (!query_id.is_empty()).then_some(query_id);
            error_response_with_query(err, echoed)
        }
    }
}

/// `queryId` from a JSON or form body. Anything unreadable counts as empty.
async fn query_id_from(request: Request) -> String {
    let is_json = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("application/json"));

    let body = if is_json {
        Json::<QueryVerifyRequest>::from_request(request, &())
            .await
            .map(|Json(body)| body)
            .ok()
    } else {
        Form::<QueryVerifyRequest>::from_request(request, &())
            .await
            .map(|Form(body)| body)
            .ok()
    };

    body.and_then(|body| body.query_id)
        .map(|id| id.trim().to_string())
        .unwrap_or_default()
}
