//! Detection model backends and the facade the inference loop talks to

#[cfg(feature = "opencv")]
pub mod dnn;
#[cfg(feature = "onnx")]
pub mod onnx;

use crate::config::{load_class_names, DetectConfig, Device};
use crate::error::{Result, VisionError};
use crate::preprocess::InputTensor;
use ndarray::{Array3, Axis};
use std::path::Path;
use tracing::{debug, info};

/// Raw model output: `[batch, boxes, 5 + classes]`
pub type Predictions = Array3<f32>;

/// Stride assumed when the weights do not declare one
pub const DEFAULT_STRIDE: u32 = 32;

/// A loaded detection network
pub trait Model: Send {
    /// Run one forward pass over a `[B, 3, H, W]` batch.
    fn forward(&mut self, input: &InputTensor, augment: bool, visualize: Option<&Path>) -> Result<Predictions>;

    fn stride(&self) -> u32;

    /// Class names declared by the weights, empty when unknown
    fn names(&self) -> &[String];

    fn is_half(&self) -> bool;
}

/// How batches are handed to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invocation {
    /// The whole batch in one call
    Batched,
    /// One call per image, results concatenated along the batch axis
    PerImage,
}

/// Backend implementations, chosen from the weights file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Onnx,
    OpenCvDnn,
}

impl BackendKind {
    pub fn from_weights(weights: &Path, dnn: bool) -> Result<Self> {
        let is_onnx = weights
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("onnx"))
            .unwrap_or(false);

        match (is_onnx, dnn) {
            (true, true) => Ok(BackendKind::OpenCvDnn),
            (true, false) => Ok(BackendKind::Onnx),
            (false, _) => Err(VisionError::Backend(format!(
                "Unsupported weights {:?}: only .onnx models are supported",
                weights
            ))),
        }
    }
}

/// Uniform entry point over every backend
pub struct Backend {
    model: Box<dyn Model>,
    invocation: Invocation,
    names: Vec<String>,
}

impl Backend {
    /// Load the backend selected by `config.weights` and `config.dnn`.
    pub fn load(config: &DetectConfig) -> Result<Self> {
        let kind = BackendKind::from_weights(&config.weights, config.dnn)?;
        let device = Device::parse(&config.device)?;
        info!("Loading {:?} weights {:?} on {:?}", kind, config.weights, device);

        let (model, invocation): (Box<dyn Model>, Invocation) = match kind {
            BackendKind::Onnx => Self::load_onnx(config, &device)?,
            BackendKind::OpenCvDnn => Self::load_dnn(config, &device)?,
        };

        let fallback = match &config.data {
            Some(data) => Some(load_class_names(data)?),
            None => None,
        };
        Ok(Self::from_model(model, invocation, fallback))
    }

    #[cfg(feature = "onnx")]
    fn load_onnx(config: &DetectConfig, device: &Device) -> Result<(Box<dyn Model>, Invocation)> {
        let model = onnx::OnnxModel::load(&config.weights, device, config.half)?;
        let invocation = model.invocation();
        Ok((Box::new(model), invocation))
    }

    #[cfg(not(feature = "onnx"))]
    fn load_onnx(_config: &DetectConfig, _device: &Device) -> Result<(Box<dyn Model>, Invocation)> {
        Err(VisionError::Backend(
            "ONNX Runtime support is not compiled in (enable the `onnx` feature)".to_string(),
        ))
    }

    #[cfg(feature = "opencv")]
    fn load_dnn(config: &DetectConfig, device: &Device) -> Result<(Box<dyn Model>, Invocation)> {
        let model = dnn::DnnModel::load(&config.weights, device)?;
        Ok((Box::new(model), Invocation::PerImage))
    }

    #[cfg(not(feature = "opencv"))]
    fn load_dnn(_config: &DetectConfig, _device: &Device) -> Result<(Box<dyn Model>, Invocation)> {
        Err(VisionError::Backend(
            "OpenCV DNN support is not compiled in (enable the `opencv` feature)".to_string(),
        ))
    }

    /// Wrap an already loaded model. `fallback_names` apply when the model
    /// declares none.
    pub fn from_model(model: Box<dyn Model>, invocation: Invocation, fallback_names: Option<Vec<String>>) -> Self {
        let names = if model.names().is_empty() {
            fallback_names.unwrap_or_default()
        } else {
            model.names().to_vec()
        };
        Self { model, invocation, names }
    }

    /// Run once on a zero tensor so lazy initialization happens before timing.
    ///
    /// Fills in `class{i}` names from the output width when no names are known.
    pub fn warmup(&mut self, imgsz: (u32, u32), batch_size: usize) -> Result<()> {
        let batch = match self.invocation {
            Invocation::PerImage => 1,
            Invocation::Batched => batch_size.max(1),
        };
        let input = InputTensor::zeros([batch, 3, imgsz.0 as usize, imgsz.1 as usize], self.is_half());
        let output = self.infer(&input, false, None)?;

        if self.names.is_empty() {
            let nc = output.dim().2.saturating_sub(5);
            self.names = (0..nc).map(|i| format!("class{}", i)).collect();
            debug!("No class names declared, using {} generic names", nc);
        }
        Ok(())
    }

    /// Forward a batch, splitting it for single-image backends.
    pub fn infer(&mut self, input: &InputTensor, augment: bool, visualize: Option<&Path>) -> Result<Predictions> {
        match self.invocation {
            Invocation::Batched => self.model.forward(input, augment, visualize),
            Invocation::PerImage => {
                let outputs = input
                    .split()
                    .iter()
                    .map(|item| self.model.forward(item, augment, visualize))
                    .collect::<Result<Vec<_>>>()?;
                if outputs.is_empty() {
                    return Err(VisionError::Backend("Cannot run inference on an empty batch".to_string()));
                }
                let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
                ndarray::concatenate(Axis(0), &views)
                    .map_err(|e| VisionError::Backend(format!("Mismatched per-image outputs: {}", e)))
            }
        }
    }

    pub fn stride(&self) -> u32 {
        self.model.stride()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_half(&self) -> bool {
        self.model.is_half()
    }

    pub fn invocation(&self) -> Invocation {
        self.invocation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingModel {
        calls: Arc<AtomicUsize>,
        classes: usize,
        names: Vec<String>,
    }

    impl Model for CountingModel {
        fn forward(&mut self, input: &InputTensor, _augment: bool, _visualize: Option<&Path>) -> Result<Predictions> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Predictions::zeros((input.batch_size(), 4, 5 + self.classes)))
        }

        fn stride(&self) -> u32 {
            DEFAULT_STRIDE
        }

        fn names(&self) -> &[String] {
            &self.names
        }

        fn is_half(&self) -> bool {
            false
        }
    }

    fn backend(invocation: Invocation, names: Vec<String>) -> (Backend, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = CountingModel { calls: calls.clone(), classes: 3, names };
        (Backend::from_model(Box::new(model), invocation, None), calls)
    }

    #[test]
    fn test_backend_kind_from_weights() {
        assert_eq!(BackendKind::from_weights(&PathBuf::from("y.onnx"), false).unwrap(), BackendKind::Onnx);
        assert_eq!(BackendKind::from_weights(&PathBuf::from("y.ONNX"), true).unwrap(), BackendKind::OpenCvDnn);
        assert!(BackendKind::from_weights(&PathBuf::from("y.pt"), false).is_err());
    }

    #[test]
    fn test_per_image_invocation_splits_and_concatenates() {
        let (mut backend, calls) = backend(Invocation::PerImage, vec![]);
        let input = InputTensor::zeros([3, 3, 32, 32], false);
        let out = backend.infer(&input, false, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(out.dim(), (3, 4, 8));
    }

    #[test]
    fn test_batched_invocation_calls_once() {
        let (mut backend, calls) = backend(Invocation::Batched, vec![]);
        let input = InputTensor::zeros([3, 3, 32, 32], false);
        let out = backend.infer(&input, false, None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.dim().0, 3);
    }

    #[test]
    fn test_warmup_derives_generic_names() {
        let (mut backend, calls) = backend(Invocation::PerImage, vec![]);
        backend.warmup((32, 32), 4).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.names(), &["class0", "class1", "class2"]);
    }

    #[test]
    fn test_model_names_win_over_fallback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = CountingModel { calls, classes: 2, names: vec!["goose".into(), "egg".into()] };
        let backend = Backend::from_model(Box::new(model), Invocation::Batched, Some(vec!["x".into()]));
        assert_eq!(backend.names(), &["goose", "egg"]);
    }
}
