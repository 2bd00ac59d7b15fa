use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::domain::PartyId;
use crate::request_api::{self, NewRequest, RequestApiError};
use crate::store::{RequestId, Store};

#[derive(serde::Deserialize)]
pub struct PostRequestBody {
    party_from: PartyId,
    party_to: PartyId,
    #[serde(default)]
    expand_group: bool,
    subject: String,
    message: String,
    max_retries: Option<i32>,
}

#[derive(serde::Serialize)]
pub struct PostRequestResponse {
    request_id: RequestId,
}

impl std::fmt::Debug for RequestApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::routes::error_chain_fmt(self, f)
    }
}

impl IntoResponse for RequestApiError {
    fn into_response(self) -> Response {
        let status = match self {
            RequestApiError::Validation(_) => StatusCode::BAD_REQUEST,
            RequestApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[tracing::instrument(
    name = "Handle POST /requests",
    skip(store, body),
    fields(party_from = %body.party_from, party_to = %body.party_to)
)]
pub async fn post_request(
    State(store): State<Store>,
    Json(body): Json<PostRequestBody>,
) -> Result<Json<PostRequestResponse>, RequestApiError> {
    let request_id = request_api::post_request(
        &store,
        NewRequest {
            party_from: body.party_from,
            party_to: body.party_to,
            expand_group: body.expand_group,
            subject: body.subject,
            message: body.message,
            max_retries: body.max_retries,
        },
    )
    .await?;

    Ok(Json(PostRequestResponse { request_id }))
}

#[tracing::instrument(name = "Handle POST /requests/:id/cancel", skip(store))]
pub async fn cancel_request(
    State(store): State<Store>,
    Path(request_id): Path<i64>,
) -> Result<StatusCode, RequestApiError> {
    request_api::cancel_request(&store, RequestId::from(request_id)).await?;
    Ok(StatusCode::OK)
}
