use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::api::driver_id;
use crate::error::AppError;
use crate::hub::session::{run_session, SessionTimings, MAX_MESSAGE_SIZE};
use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/socket/driver/:id/status", get(driver_status))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn driver_status(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Response, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let hub = state.hub.clone();

    info!(driver_id, "status viewer connecting");
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| async move {
            let (conn, outbound) = hub.connection(driver_id);
            run_session(socket, hub, conn, outbound, SessionTimings::default()).await;
        }))
}
