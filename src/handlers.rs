use actix_web::{web, HttpRequest, HttpResponse};
use tracing::{debug, error, info, info_span};
use uuid::Uuid;

use crate::error::PredictError;
use crate::features;
use crate::models::{ErrorResponse, HealthResponse, MessageResponse, PredictionResponse};
use crate::AppState;

/// `POST /api/predict`: JSON features in, fire weather index out.
pub async fn predict(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, PredictError> {
    let span = info_span!("predict", request_id = %Uuid::new_v4());
    let _enter = span.enter();

    match run_prediction(&state, &body) {
        Ok(prediction) => {
            info!(prediction, "prediction served");
            Ok(HttpResponse::Ok().json(PredictionResponse { prediction }))
        }
        Err(e) => {
            error!(error = %e, "prediction failed");
            Err(e)
        }
    }
}

fn run_prediction(state: &AppState, body: &[u8]) -> Result<f64, PredictError> {
    let payload: serde_json::Value = serde_json::from_slice(body)?;
    let vector = features::extract(&payload)?;
    debug!(features = ?vector.values(), "extracted features");

    let scaled = state.store.scale(&vector)?;
    state.store.predict(&scaled)
}

/// `GET /api/health`
pub async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// `GET /`: the built frontend, or a note that only the API is up.
pub async fn index(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    match state.frontend.index().await {
        Some(file) => file.into_response(&req),
        None => HttpResponse::Ok().json(MessageResponse {
            message: "API is running. Build the frontend to serve UI.".to_string(),
        }),
    }
}

/// `GET /{tail}`: a bundle asset, else `index.html` so client-side routes
/// load the app, else a JSON 404.
pub async fn frontend_fallback(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let tail = req.match_info().query("tail");
    if let Some(file) = state.frontend.asset(tail).await {
        return file.into_response(&req);
    }

    match state.frontend.index().await {
        Some(file) => file.into_response(&req),
        None => not_found().await,
    }
}

pub async fn not_found() -> HttpResponse {
    HttpResponse::NotFound().json(ErrorResponse {
        error: "Not found".to_string(),
    })
}
