use serde_json::{Map, Value};

use crate::error::PredictError;

/// Number of inputs the fire-weather model is trained on.
pub const FEATURE_COUNT: usize = 9;

/// Field names in the exact column order the scaler and model were fit with.
pub const FEATURE_ORDER: [&str; FEATURE_COUNT] = [
    "Temperature",
    "RH",
    "Ws",
    "Rain",
    "FFMC",
    "DMC",
    "DC",
    "ISI",
    "BUI",
];

/// Raw weather / fire-index readings, positionally bound to [`FEATURE_ORDER`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn zeros() -> Self {
        Self([0.0; FEATURE_COUNT])
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }
}

impl From<[f64; FEATURE_COUNT]> for FeatureVector {
    fn from(values: [f64; FEATURE_COUNT]) -> Self {
        Self(values)
    }
}

/// Builds the feature vector from a request payload of the form
/// `{"features": {"Temperature": 29, "RH": "57", ...}}`.
///
/// A missing `features` key is treated as an empty object and every missing
/// field defaults to `0.0`. Unknown keys are ignored.
pub fn extract(payload: &Value) -> Result<FeatureVector, PredictError> {
    let body = payload.as_object().ok_or(PredictError::NotAnObject)?;

    let empty = Map::new();
    let features = match body.get("features") {
        None => &empty,
        Some(Value::Object(map)) => map,
        Some(_) => return Err(PredictError::FeaturesNotAnObject),
    };

    let mut values = [0.0; FEATURE_COUNT];
    for (slot, name) in values.iter_mut().zip(FEATURE_ORDER) {
        if let Some(raw) = features.get(name) {
            *slot = coerce(name, raw)?;
        }
    }

    Ok(FeatureVector(values))
}

fn coerce(name: &'static str, raw: &Value) -> Result<f64, PredictError> {
    let value = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match value {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(PredictError::InvalidFeature {
            name,
            value: raw.to_string(),
        }),
    }
}
