//! Webhook intake handler.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{error, info};

use crate::pipeline::{self, Outcome};
use crate::signature::SIGNATURE_HEADER;
use crate::state::AppState;

/// Body returned on any internal failure. The cause is never leaked to
/// the (semi-trusted) webhook sender.
const INTERNAL_ERROR_BODY: &str = "500 - Internal Server Error";

/// Handle one webhook delivery.
///
/// The pipeline runs on its own task: an upstream disconnect or timeout
/// must not cancel an in-flight provisioning attempt.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let result = tokio::spawn(pipeline::handle_event(state, signature, body)).await;

    match result {
        Ok(Ok(outcome)) => {
            if let Outcome::Provisioned(handle) = outcome {
                info!(instance = %handle.name, "Runner instance provisioned");
            }
            StatusCode::OK.into_response()
        }
        Ok(Err(e)) => {
            error!(error = %e, "Failed to handle request");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
        }
        Err(e) => {
            error!(error = %e, "Webhook task failed");
            (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response()
        }
    }
}
