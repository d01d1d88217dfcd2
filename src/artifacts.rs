//! Pre-fit scaler and regression model, loaded once at startup and shared
//! read-only between workers.
//!
//! Artifacts are exported from the training environment:
//!
//! * scaler: `{"mean": [..], "scale": [..]}`, applied as `(x - mean) / scale`
//! * model: `{"coef": [..], "intercept": ..}` for linear models, or an
//!   `.onnx` graph taking `f32[1, n]`

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, ArrayView, ArrayView1, ArrayView2, Axis};
use serde::Deserialize;
use tract_onnx::prelude::*;
use tracing::info;

use crate::config::ArtifactSettings;
use crate::error::{ArtifactError, PredictError};
use crate::features::{FeatureVector, FEATURE_COUNT};

/// Column-wise transform applied before the model. Operates on batches; the
/// service always passes a single row.
pub trait Scaler: Send + Sync {
    fn n_features(&self) -> usize;

    fn transform(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError>;
}

/// Maps a batch of scaled rows to one prediction per row.
pub trait Regressor: Send + Sync {
    fn n_features(&self) -> usize;

    fn predict(&self, batch: ArrayView2<'_, f64>) -> Result<Array1<f64>, PredictError>;

    fn kind(&self) -> &'static str;
}

/// Output of [`ArtifactStore::scale`]: a one-row batch ready for the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaledFeatureVector(Array2<f64>);

impl ScaledFeatureVector {
    pub fn values(&self) -> ArrayView1<'_, f64> {
        self.0.row(0)
    }
}

pub struct ArtifactStore {
    scaler: Box<dyn Scaler>,
    model: Box<dyn Regressor>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("n_features", &self.scaler.n_features())
            .field("model", &self.model.kind())
            .finish()
    }
}

impl ArtifactStore {
    /// Wires a scaler and a model together, rejecting pairs that do not agree
    /// on the feature count or cannot predict an all-zero vector.
    pub fn new(
        scaler: Box<dyn Scaler>,
        model: Box<dyn Regressor>,
    ) -> Result<Self, ArtifactError> {
        check_feature_count("scaler", scaler.n_features())?;
        check_feature_count("model", model.n_features())?;

        let store = Self { scaler, model };
        store
            .scale(&FeatureVector::zeros())
            .and_then(|scaled| store.predict(&scaled))
            .map_err(ArtifactError::Probe)?;

        Ok(store)
    }

    /// Loads both artifacts from `settings.dir`. The model format is picked
    /// from the file extension.
    pub fn load(settings: &ArtifactSettings) -> Result<Self, ArtifactError> {
        let scaler_path = settings.scaler_path();
        let model_path = settings.model_path();

        let scaler: Box<dyn Scaler> = match extension(&scaler_path) {
            Some("json") => Box::new(StandardScaler::from_path(&scaler_path)?),
            _ => return Err(ArtifactError::UnsupportedFormat { path: scaler_path }),
        };
        info!(path = %scaler_path.display(), "loaded scaler");

        let model: Box<dyn Regressor> = match extension(&model_path) {
            Some("json") => Box::new(LinearModel::from_path(&model_path)?),
            Some("onnx") => Box::new(OnnxRegressor::from_path(&model_path, FEATURE_COUNT)?),
            _ => return Err(ArtifactError::UnsupportedFormat { path: model_path }),
        };
        info!(path = %model_path.display(), kind = model.kind(), "loaded model");

        Self::new(scaler, model)
    }

    pub fn scale(&self, vector: &FeatureVector) -> Result<ScaledFeatureVector, PredictError> {
        let batch = ArrayView::from(&vector.values()[..]).insert_axis(Axis(0));
        let scaled = self.scaler.transform(batch)?;
        if scaled.dim() != (1, FEATURE_COUNT) {
            return Err(PredictError::Scale(format!(
                "expected shape (1, {}), got {:?}",
                FEATURE_COUNT,
                scaled.dim()
            )));
        }
        Ok(ScaledFeatureVector(scaled))
    }

    pub fn predict(&self, vector: &ScaledFeatureVector) -> Result<f64, PredictError> {
        let output = self.model.predict(vector.0.view())?;
        match output.get(0) {
            Some(value) if value.is_finite() => Ok(*value),
            Some(value) => Err(PredictError::Model(format!(
                "non-finite prediction {}",
                value
            ))),
            None => Err(PredictError::Model("model returned no prediction".into())),
        }
    }

    pub fn model_kind(&self) -> &'static str {
        self.model.kind()
    }
}

fn check_feature_count(artifact: &'static str, found: usize) -> Result<(), ArtifactError> {
    if found == FEATURE_COUNT {
        Ok(())
    } else {
        Err(ArtifactError::FeatureCount {
            artifact,
            expected: FEATURE_COUNT,
            found,
        })
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ArtifactError> {
    let bytes = fs::read(path).map_err(|source| ArtifactError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| ArtifactError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Deserialize)]
struct StandardScalerFile {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

/// Standardisation with per-column mean and scale.
#[derive(Debug, Clone)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn new(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self, ArtifactError> {
        if mean.len() != scale.len() {
            return Err(ArtifactError::ScalerShape {
                means: mean.len(),
                scales: scale.len(),
            });
        }
        for (index, (&m, &s)) in mean.iter().zip(&scale).enumerate() {
            if !m.is_finite() || !s.is_finite() || s == 0.0 {
                return Err(ArtifactError::InvalidScale {
                    index,
                    mean: m,
                    scale: s,
                });
            }
        }
        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self, ArtifactError> {
        let file: StandardScalerFile = read_json(path)?;
        Self::new(file.mean, file.scale)
    }
}

impl Scaler for StandardScaler {
    fn n_features(&self) -> usize {
        self.mean.len()
    }

    fn transform(&self, batch: ArrayView2<'_, f64>) -> Result<Array2<f64>, PredictError> {
        if batch.ncols() != self.n_features() {
            return Err(PredictError::Scale(format!(
                "expected {} columns, got {}",
                self.n_features(),
                batch.ncols()
            )));
        }
        Ok((&batch - &self.mean) / &self.scale)
    }
}

#[derive(Debug, Deserialize)]
struct LinearModelFile {
    coef: Vec<f64>,
    intercept: f64,
}

/// Linear regression (ordinary, ridge or lasso fit): `x . coef + intercept`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    coef: Array1<f64>,
    intercept: f64,
}

impl LinearModel {
    pub fn new(coef: Vec<f64>, intercept: f64) -> Self {
        Self {
            coef: Array1::from(coef),
            intercept,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ArtifactError> {
        let file: LinearModelFile = read_json(path)?;
        Ok(Self::new(file.coef, file.intercept))
    }
}

impl Regressor for LinearModel {
    fn n_features(&self) -> usize {
        self.coef.len()
    }

    fn predict(&self, batch: ArrayView2<'_, f64>) -> Result<Array1<f64>, PredictError> {
        if batch.ncols() != self.n_features() {
            return Err(PredictError::Model(format!(
                "expected {} columns, got {}",
                self.n_features(),
                batch.ncols()
            )));
        }
        Ok(batch.dot(&self.coef) + self.intercept)
    }

    fn kind(&self) -> &'static str {
        "linear"
    }
}

/// ONNX regressor compiled for a fixed `f32[1, n]` input.
pub struct OnnxRegressor {
    plan: TypedRunnableModel<TypedModel>,
    n_features: usize,
}

impl OnnxRegressor {
    pub fn from_path(path: &Path, n_features: usize) -> Result<Self, ArtifactError> {
        let plan = onnx()
            .model_for_path(path)
            .and_then(|model| model.with_input_fact(0, f32::fact([1, n_features]).into()))
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|source| ArtifactError::Onnx {
                path: PathBuf::from(path),
                source,
            })?;

        Ok(Self { plan, n_features })
    }
}

impl Regressor for OnnxRegressor {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn predict(&self, batch: ArrayView2<'_, f64>) -> Result<Array1<f64>, PredictError> {
        let mut predictions = Vec::with_capacity(batch.nrows());

        // The plan is compiled for a single row.
        for row in batch.rows() {
            let input: Tensor =
                tract_ndarray::Array2::from_shape_fn((1, row.len()), |(_, j)| row[j] as f32)
                    .into_tensor();
            let outputs = self
                .plan
                .run(tvec!(input.into()))
                .map_err(|e| PredictError::Model(e.to_string()))?;
            let view = outputs[0]
                .to_array_view::<f32>()
                .map_err(|e| PredictError::Model(e.to_string()))?;
            let value = view
                .iter()
                .next()
                .copied()
                .ok_or_else(|| PredictError::Model("model produced an empty tensor".into()))?;
            predictions.push(f64::from(value));
        }

        Ok(Array1::from(predictions))
    }

    fn kind(&self) -> &'static str {
        "onnx"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn identity_scaler() -> StandardScaler {
        StandardScaler::new(vec![0.0; FEATURE_COUNT], vec![1.0; FEATURE_COUNT]).unwrap()
    }

    fn write(dir: &Path, name: &str, contents: &str) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn settings(dir: &Path, scaler: &str, model: &str) -> ArtifactSettings {
        ArtifactSettings {
            dir: dir.to_path_buf(),
            scaler: scaler.into(),
            model: model.into(),
        }
    }

    #[test]
    fn standard_scaler_centres_and_scales() {
        let scaler = StandardScaler::new(
            vec![20.0, 50.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            vec![5.0, 10.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0],
        )
        .unwrap();
        let store = ArtifactStore::new(
            Box::new(scaler),
            Box::new(LinearModel::new(vec![0.0; FEATURE_COUNT], 0.0)),
        )
        .unwrap();

        let vector = FeatureVector::from([30.0, 40.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0]);
        let scaled = store.scale(&vector).unwrap();
        assert_eq!(
            scaled.values().to_vec(),
            vec![2.0, -1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 2.0]
        );
    }

    #[test]
    fn linear_model_is_dot_plus_intercept() {
        let store = ArtifactStore::new(
            Box::new(identity_scaler()),
            Box::new(LinearModel::new(
                vec![1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, -1.0],
                0.5,
            )),
        )
        .unwrap();

        let vector = FeatureVector::from([3.0, 1.0, 9.0, 9.0, 9.0, 9.0, 9.0, 9.0, 2.0]);
        let scaled = store.scale(&vector).unwrap();
        assert_eq!(store.predict(&scaled).unwrap(), 3.5);
    }

    #[test]
    fn repeated_predictions_are_identical() {
        let store = ArtifactStore::new(
            Box::new(identity_scaler()),
            Box::new(LinearModel::new(vec![0.3; FEATURE_COUNT], -1.25)),
        )
        .unwrap();
        let vector = FeatureVector::from([29.0, 57.0, 18.0, 0.0, 65.7, 3.4, 7.6, 1.3, 3.4]);

        let first = store.predict(&store.scale(&vector).unwrap()).unwrap();
        let second = store.predict(&store.scale(&vector).unwrap()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn feature_count_mismatch_is_rejected() {
        let err = ArtifactStore::new(
            Box::new(identity_scaler()),
            Box::new(LinearModel::new(vec![1.0; 8], 0.0)),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::FeatureCount {
                artifact: "model",
                expected: 9,
                found: 8
            }
        ));
    }

    #[test]
    fn zero_scale_is_rejected() {
        let mut scale = vec![1.0; FEATURE_COUNT];
        scale[4] = 0.0;
        let err = StandardScaler::new(vec![0.0; FEATURE_COUNT], scale).unwrap_err();
        assert!(matches!(err, ArtifactError::InvalidScale { index: 4, .. }));
    }

    #[test]
    fn mismatched_scaler_vectors_are_rejected() {
        let err = StandardScaler::new(vec![0.0; 9], vec![1.0; 7]).unwrap_err();
        assert!(matches!(
            err,
            ArtifactError::ScalerShape { means: 9, scales: 7 }
        ));
    }

    #[test]
    fn probe_rejects_non_finite_models() {
        let err = ArtifactStore::new(
            Box::new(identity_scaler()),
            Box::new(LinearModel::new(vec![0.0; FEATURE_COUNT], f64::NAN)),
        )
        .unwrap_err();
        assert!(matches!(err, ArtifactError::Probe(PredictError::Model(_))));
    }

    #[test]
    fn loads_json_artifacts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "scaler.json",
            r#"{"mean": [0,0,0,0,0,0,0,0,0], "scale": [2,2,2,2,2,2,2,2,2]}"#,
        );
        write(
            dir.path(),
            "ridge.json",
            r#"{"coef": [1,1,1,1,1,1,1,1,1], "intercept": 1.0}"#,
        );

        let store = ArtifactStore::load(&settings(dir.path(), "scaler.json", "ridge.json")).unwrap();
        assert_eq!(store.model_kind(), "linear");

        let scaled = store.scale(&FeatureVector::from([2.0; FEATURE_COUNT])).unwrap();
        assert_eq!(store.predict(&scaled).unwrap(), 10.0);
    }

    #[test]
    fn missing_artifact_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArtifactStore::load(&settings(dir.path(), "scaler.json", "ridge.json")).unwrap_err();
        assert!(matches!(err, ArtifactError::Read { .. }));
    }

    #[test]
    fn malformed_artifact_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "scaler.json", "not json");
        let err = ArtifactStore::load(&settings(dir.path(), "scaler.json", "ridge.json")).unwrap_err();
        assert!(matches!(err, ArtifactError::Malformed { .. }));
    }

    #[test]
    fn pickle_files_are_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ArtifactStore::load(&settings(dir.path(), "scaler.pkl", "ridge.pkl")).unwrap_err();
        assert!(matches!(err, ArtifactError::UnsupportedFormat { .. }));
    }

    #[test]
    fn corrupt_onnx_model_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "model.onnx", "definitely not protobuf");
        let err = OnnxRegressor::from_path(&dir.path().join("model.onnx"), FEATURE_COUNT)
            .err()
            .unwrap();
        assert!(matches!(err, ArtifactError::Onnx { .. }));
    }

    #[test]
    fn onnx_model_matches_the_equivalent_linear_model() {
        let coef = [0.5, -0.25, 1.0, 0.0, 2.0, 0.0, 0.0, 0.125, 1.0];
        let intercept = 3.0;

        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "scaler.json",
            r#"{"mean": [0,0,0,0,0,0,0,0,0], "scale": [2,2,2,2,2,2,2,2,2]}"#,
        );
        fs::write(
            dir.path().join("ridge.onnx"),
            onnx_graph::linear(&coef.map(|c| c as f32), intercept as f32),
        )
        .unwrap();

        let store = ArtifactStore::load(&settings(dir.path(), "scaler.json", "ridge.onnx")).unwrap();
        assert_eq!(store.model_kind(), "onnx");

        let reference = ArtifactStore::new(
            Box::new(StandardScaler::new(vec![0.0; FEATURE_COUNT], vec![2.0; FEATURE_COUNT]).unwrap()),
            Box::new(LinearModel::new(coef.to_vec(), intercept)),
        )
        .unwrap();

        let vector = FeatureVector::from([29.0, 57.0, 18.0, 0.0, 65.7, 3.4, 7.6, 1.3, 3.4]);
        let from_onnx = store.predict(&store.scale(&vector).unwrap()).unwrap();
        let from_linear = reference.predict(&reference.scale(&vector).unwrap()).unwrap();
        assert!(
            (from_onnx - from_linear).abs() < 1e-3,
            "onnx={from_onnx} linear={from_linear}"
        );
    }

    #[test]
    fn onnx_model_with_wrong_width_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("narrow.onnx"), onnx_graph::linear(&[1.0; 8], 0.0)).unwrap();

        let err = OnnxRegressor::from_path(&dir.path().join("narrow.onnx"), FEATURE_COUNT)
            .err()
            .unwrap();
        assert!(matches!(err, ArtifactError::Onnx { .. }));
    }

    /// Hand-encoded ONNX protobuf for `Y = X . W + B`, with `X: f32[1, n]`,
    /// `W: f32[n, 1]` and `B: f32[1]`.
    mod onnx_graph {
        fn varint(buf: &mut Vec<u8>, mut v: u64) {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                if v == 0 {
                    buf.push(byte);
                    return;
                }
                buf.push(byte | 0x80);
            }
        }

        fn int(buf: &mut Vec<u8>, field: u64, v: i64) {
            varint(buf, field << 3);
            varint(buf, v as u64);
        }

        fn bytes(buf: &mut Vec<u8>, field: u64, data: &[u8]) {
            varint(buf, (field << 3) | 2);
            varint(buf, data.len() as u64);
            buf.extend_from_slice(data);
        }

        fn message(buf: &mut Vec<u8>, field: u64, fill: impl FnOnce(&mut Vec<u8>)) {
            let mut inner = Vec::new();
            fill(&mut inner);
            bytes(buf, field, &inner);
        }

        fn node(graph: &mut Vec<u8>, op: &str, inputs: &[&str], output: &str) {
            message(graph, 1, |node| {
                for input in inputs {
                    bytes(node, 1, input.as_bytes());
                }
                bytes(node, 2, output.as_bytes());
                bytes(node, 4, op.as_bytes());
            });
        }

        fn initializer(graph: &mut Vec<u8>, name: &str, dims: &[i64], values: &[f32]) {
            message(graph, 5, |tensor| {
                for &dim in dims {
                    int(tensor, 1, dim);
                }
                // FLOAT
                int(tensor, 2, 1);
                bytes(tensor, 8, name.as_bytes());
                let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                bytes(tensor, 9, &raw);
            });
        }

        fn value_info(graph: &mut Vec<u8>, field: u64, name: &str, dims: &[i64]) {
            message(graph, field, |info| {
                bytes(info, 1, name.as_bytes());
                message(info, 2, |ty| {
                    message(ty, 1, |tensor_type| {
                        int(tensor_type, 1, 1);
                        message(tensor_type, 2, |shape| {
                            for &dim in dims {
                                message(shape, 1, |d| int(d, 1, dim));
                            }
                        });
                    });
                });
            });
        }

        pub fn linear(coef: &[f32], intercept: f32) -> Vec<u8> {
            let n = coef.len() as i64;
            let mut model = Vec::new();
            // ir_version
            int(&mut model, 1, 7);
            message(&mut model, 7, |graph| {
                node(graph, "MatMul", &["X", "W"], "XW");
                node(graph, "Add", &["XW", "B"], "Y");
                bytes(graph, 2, b"linear");
                initializer(graph, "W", &[n, 1], coef);
                initializer(graph, "B", &[1], &[intercept]);
                value_info(graph, 11, "X", &[1, n]);
                value_info(graph, 12, "Y", &[1, 1]);
            });
            message(&mut model, 8, |opset| {
                bytes(opset, 1, b"");
                int(opset, 2, 13);
            });
            model
        }
    }
}
