//! Health endpoint handler.

use axum::{extract::State, Json};

use crate::status::{HealthReport, StatusBoard};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub board: StatusBoard,
}

impl AppState {
    pub fn new(board: StatusBoard) -> Self {
        Self { board }
    }
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.board.report())
}
