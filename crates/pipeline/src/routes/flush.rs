//! Manual Flush Route

use aggregator::{trigger_flush, FlushReport, FlushTrigger};
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::{AppState, PipelineError};

/// Flush every device for the current hour
pub async fn post_flush(
    State(state): State<Arc<AppState>>,
) -> Result<Json<FlushReport>, PipelineError> {
    info!("Manual flush requested over HTTP");
    let report = trigger_flush(
        &state.aggregator,
        state.climate.as_deref(),
        FlushTrigger::Manual,
        state.offset,
    )
    .await?;
    Ok(Json(report))
}
