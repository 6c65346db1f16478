//! HTTP front.
//!
//! Every handler answers 200 with a JSON body; failures are reported in the
//! body as `{"error": ...}`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;

use crate::gateway::{Envelope, Gateway};

const USAGE: &str = "GET /reset/{access_token}\nPOST /rpc/{L1|L2}/{access_token}\nGET /flag/{access_token}";

/// Create the service router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/reset/{token}", get(reset))
        .route("/rpc/{chain}/{token}", post(rpc))
        .route("/flag/{token}", get(flag))
        .with_state(gateway)
}

async fn index() -> Json<Envelope> {
    Json(Envelope::message(USAGE))
}

async fn reset(State(gateway): State<Arc<Gateway>>, Path(token): Path<String>) -> Json<Vec<Envelope>> {
    Json(gateway.reset(&token).await)
}

async fn rpc(
    State(gateway): State<Arc<Gateway>>,
    Path((chain, token)): Path<(String, String)>,
    body: Bytes,
) -> Json<Value> {
    let request: Value = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Json(Envelope::error(format!("invalid JSON body: {e}")).to_value()),
    };
    Json(gateway.rpc(&token, &chain, &request).await)
}

async fn flag(State(gateway): State<Arc<Gateway>>, Path(token): Path<String>) -> Json<Envelope> {
    Json(gateway.check_solved(&token).await)
}
