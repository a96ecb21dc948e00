use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;

/// GET /api/config: the loaded engine config plus its validation warnings.
///
/// Read-only: the config is a YAML file next to the data directory and is
/// only picked up on restart.
pub async fn get_config(State(app): State<AppState>) -> Result<Json<serde_json::Value>, AppError> {
    let warnings = app.config.validate();
    Ok(Json(serde_json::json!({
        "config": app.config.as_ref(),
        "warnings": warnings,
    })))
}
