//! HTTP API surface
//!
//! A thin axum layer over the orchestrator. The locate endpoint
//! returns the full run state un-transformed — the same result
//! document the CLI prints in JSON mode.
//!
//! # Endpoints
//!
//! - `POST /v1/locate` — geolocate an image (by server-local path or
//!   inline base64 bytes)
//! - `GET /healthz` — collaborator health report

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use sdk::errors::{GeoError, WaypointErrorExt};

use crate::config::Config;
use crate::media::ImageFile;
use crate::orchestrator::Orchestrator;

/// Default bind address for `waypoint serve`
pub const DEFAULT_BIND: &str = "127.0.0.1:8600";

#[derive(Clone)]
struct ServerState {
    orchestrator: Arc<Orchestrator>,
}

/// Request body for `POST /v1/locate`.
///
/// Exactly one of `image_path` (server-local) or `image_b64` must be
/// provided.
#[derive(Debug, Deserialize)]
struct LocateRequest {
    image_path: Option<PathBuf>,
    image_b64: Option<String>,
}

/// Build and run the server until the process is stopped.
pub async fn serve(config: &Config, bind: Option<String>) -> anyhow::Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(config));
    let state = ServerState { orchestrator };

    let app = Router::new()
        .route("/v1/locate", post(locate_handler))
        .route("/healthz", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr: SocketAddr = bind
        .as_deref()
        .unwrap_or(DEFAULT_BIND)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn locate_handler(
    State(state): State<ServerState>,
    Json(request): Json<LocateRequest>,
) -> Response {
    let image = match load_request_image(&request) {
        Ok(image) => image,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e),
    };

    match state.orchestrator.run_image(image).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => {
            let status = if e.is_recoverable() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::BAD_REQUEST
            };
            error_response(status, &e)
        }
    }
}

async fn health_handler(State(state): State<ServerState>) -> Response {
    let report = state.orchestrator.check_health().await;
    Json(report).into_response()
}

fn load_request_image(request: &LocateRequest) -> Result<ImageFile, GeoError> {
    match (&request.image_path, &request.image_b64) {
        (Some(path), None) => ImageFile::load(path),
        (None, Some(b64)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| GeoError::InvalidImage(format!("bad base64: {e}")))?;
            ImageFile::from_bytes(bytes)
        }
        _ => Err(GeoError::InvalidImage(
            "provide exactly one of image_path or image_b64".to_string(),
        )),
    }
}

fn error_response(status: StatusCode, error: &GeoError) -> Response {
    (
        status,
        Json(json!({
            "error": error.to_string(),
            "hint": error.user_hint(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_request_image_requires_exactly_one_source() {
        let neither = LocateRequest {
            image_path: None,
            image_b64: None,
        };
        assert!(load_request_image(&neither).is_err());

        let both = LocateRequest {
            image_path: Some(PathBuf::from("x.jpg")),
            image_b64: Some("YWJj".to_string()),
        };
        assert!(load_request_image(&both).is_err());
    }

    #[test]
    fn test_load_request_image_from_b64() {
        let jpeg = base64::engine::general_purpose::STANDARD.encode([0xFF, 0xD8, 0xFF, 0xD9]);
        let request = LocateRequest {
            image_path: None,
            image_b64: Some(jpeg),
        };
        let image = load_request_image(&request).expect("valid jpeg");
        assert_eq!(image.format, crate::media::ImageFormat::Jpeg);
    }

    #[test]
    fn test_load_request_image_rejects_bad_b64() {
        let request = LocateRequest {
            image_path: None,
            image_b64: Some("not base64!!!".to_string()),
        };
        assert!(matches!(
            load_request_image(&request),
            Err(GeoError::InvalidImage(_))
        ));
    }
}
