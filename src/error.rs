use std::path::PathBuf;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

use crate::models::ErrorResponse;

/// Failures while loading the scaler/model pair. All of them are fatal at
/// startup.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("failed to read artifact {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to load ONNX model {}: {source}", path.display())]
    Onnx {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("unsupported artifact format for {} (expected .json or .onnx)", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("{artifact} expects {found} features, service provides {expected}")]
    FeatureCount {
        artifact: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("scaler has {means} means but {scales} scales")]
    ScalerShape { means: usize, scales: usize },

    #[error("scaler entry {index} is not usable: mean={mean}, scale={scale}")]
    InvalidScale { index: usize, mean: f64, scale: f64 },

    #[error("probe prediction failed: {0}")]
    Probe(#[source] PredictError),
}

/// Anything that can go wrong between receiving a request body and producing
/// a prediction. Callers always see a 500 with the message.
#[derive(Debug, Error)]
pub enum PredictError {
    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("\"features\" must be a JSON object")]
    FeaturesNotAnObject,

    #[error("could not convert {name} to float: {value}")]
    InvalidFeature { name: &'static str, value: String },

    #[error("scaling failed: {0}")]
    Scale(String),

    #[error("model failed: {0}")]
    Model(String),
}

impl ResponseError for PredictError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}
