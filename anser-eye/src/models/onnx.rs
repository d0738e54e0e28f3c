//! ONNX Runtime backend

use super::{Invocation, Model, Predictions, DEFAULT_STRIDE};
use crate::config::{parse_class_names, Device};
use crate::error::{Result, VisionError};
use crate::preprocess::InputTensor;
use half::f16;
use ndarray::Array3;
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::Tensor;
use std::path::Path;
use tracing::{debug, info, warn};

/// YOLO detector running on ONNX Runtime
pub struct OnnxModel {
    session: Session,
    stride: u32,
    names: Vec<String>,
    /// Reported precision, drives the preprocessing cast
    half: bool,
    /// Element type the graph actually takes
    fp16_input: bool,
    fixed_batch: bool,
}

impl OnnxModel {
    pub fn load(weights: &Path, device: &Device, half: bool) -> Result<Self> {
        if !weights.is_file() {
            return Err(VisionError::Backend(format!("Weights not found: {:?}", weights)));
        }

        let mut providers: Vec<ExecutionProviderDispatch> = Vec::new();
        if let Device::Cuda(ids) = device {
            let id = ids.first().copied().unwrap_or(0);
            providers.push(CUDAExecutionProvider::default().with_device_id(id as i32).build());
        }
        providers.push(CPUExecutionProvider::default().build());

        let session = Session::builder()
            .map_err(|e| VisionError::Ort(format!("Failed to create session builder: {}", e)))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| VisionError::Ort(format!("Failed to set optimization level: {}", e)))?
            .with_execution_providers(providers)
            .map_err(|e| VisionError::Ort(format!("Failed to register execution providers: {}", e)))?
            .commit_from_file(weights)
            .map_err(|e| VisionError::Backend(format!("Failed to load {:?}: {}", weights, e)))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| VisionError::Backend("Model has no inputs".to_string()))?;
        let fixed_batch = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.first().copied())
            .map(|batch| batch == 1)
            .unwrap_or(false);
        let fp16_input = input.input_type.tensor_type() == Some(TensorElementType::Float16);

        let (stride, names) = Self::read_metadata(&session);
        let half = fp16_input || (half && device.is_gpu());
        if half && !fp16_input {
            warn!("Model input is float32, half precision inputs will be widened before inference");
        }

        info!(
            "ONNX model loaded from {:?}: stride {}, {} classes, fixed batch {}",
            weights,
            stride,
            names.len(),
            fixed_batch
        );

        Ok(Self {
            session,
            stride,
            names,
            half,
            fp16_input,
            fixed_batch,
        })
    }

    fn read_metadata(session: &Session) -> (u32, Vec<String>) {
        let metadata = match session.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!("No model metadata: {}", e);
                return (DEFAULT_STRIDE, Vec::new());
            }
        };

        let stride = metadata
            .custom("stride")
            .ok()
            .flatten()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_STRIDE);
        let names = metadata
            .custom("names")
            .ok()
            .flatten()
            .and_then(|s| match parse_class_names(&s) {
                Ok(names) => Some(names),
                Err(e) => {
                    warn!("Ignoring class names in model metadata: {}", e);
                    None
                }
            })
            .unwrap_or_default();
        (stride, names)
    }

    pub fn invocation(&self) -> Invocation {
        if self.fixed_batch {
            Invocation::PerImage
        } else {
            Invocation::Batched
        }
    }
}

impl Model for OnnxModel {
    fn forward(&mut self, input: &InputTensor, _augment: bool, visualize: Option<&Path>) -> Result<Predictions> {
        if visualize.is_some() {
            debug!("Feature visualization is not available for ONNX models");
        }

        let shape = input.shape();
        let value = match (input, self.fp16_input) {
            (InputTensor::Half(t), true) => {
                let data: Vec<f16> = t.iter().copied().collect();
                Tensor::from_array((shape, data.into_boxed_slice()))?.into_dyn()
            }
            (InputTensor::Full(t), true) => {
                let data: Vec<f16> = t.iter().map(|&v| f16::from_f32(v)).collect();
                Tensor::from_array((shape, data.into_boxed_slice()))?.into_dyn()
            }
            (other, false) => {
                let data: Vec<f32> = other.to_f32().iter().copied().collect();
                Tensor::from_array((shape, data.into_boxed_slice()))?.into_dyn()
            }
        };

        let outputs = self
            .session
            .run(ort::inputs![value])
            .map_err(|e| VisionError::Backend(format!("Inference failed: {}", e)))?;

        let output = &outputs[0];
        let (dims, data): (Vec<i64>, Vec<f32>) = match output.try_extract_tensor::<f32>() {
            Ok((shape, data)) => (shape.to_vec(), data.to_vec()),
            Err(_) => {
                let (shape, data) = output.try_extract_tensor::<f16>()?;
                (shape.to_vec(), data.iter().map(|v| v.to_f32()).collect())
            }
        };

        if dims.len() != 3 || dims.iter().any(|&d| d < 0) {
            return Err(VisionError::Backend(format!(
                "Expected output [batch, boxes, 5 + classes], got {:?}",
                dims
            )));
        }

        Array3::from_shape_vec((dims[0] as usize, dims[1] as usize, dims[2] as usize), data)
            .map_err(|e| VisionError::Backend(format!("Malformed model output: {}", e)))
    }

    fn stride(&self) -> u32 {
        self.stride
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn is_half(&self) -> bool {
        self.half
    }
}
