//! OpenCV DNN backend for ONNX weights

use super::{Model, Predictions, DEFAULT_STRIDE};
use crate::config::Device;
use crate::error::{Result, VisionError};
use crate::preprocess::InputTensor;
use ndarray::Array3;
use opencv::core::{Mat, Scalar};
use opencv::dnn::{self, Net};
use opencv::prelude::*;
use std::path::Path;
use tracing::info;

/// YOLO detector running through `cv::dnn`; accepts one image per call
pub struct DnnModel {
    net: Net,
}

impl DnnModel {
    pub fn load(weights: &Path, device: &Device) -> Result<Self> {
        if !weights.is_file() {
            return Err(VisionError::Backend(format!("Weights not found: {:?}", weights)));
        }

        let mut net = dnn::read_net_from_onnx(&weights.to_string_lossy())
            .map_err(|e| VisionError::Backend(format!("Failed to load {:?}: {}", weights, e.message)))?;

        if device.is_gpu() {
            net.set_preferable_backend(dnn::DNN_BACKEND_CUDA)?;
            net.set_preferable_target(dnn::DNN_TARGET_CUDA)?;
        } else {
            net.set_preferable_backend(dnn::DNN_BACKEND_OPENCV)?;
            net.set_preferable_target(dnn::DNN_TARGET_CPU)?;
        }

        info!("OpenCV DNN model loaded from {:?}", weights);
        Ok(Self { net })
    }
}

impl Model for DnnModel {
    fn forward(&mut self, input: &InputTensor, _augment: bool, _visualize: Option<&Path>) -> Result<Predictions> {
        let shape = input.shape();
        let data: Vec<f32> = input.to_f32().iter().copied().collect();
        let dims = [shape[0] as i32, shape[1] as i32, shape[2] as i32, shape[3] as i32];

        let flat = Mat::from_slice(&data)?;
        let blob = flat.reshape_nd(1, &dims)?.try_clone()?;

        self.net.set_input(&blob, "", 1.0, Scalar::default())?;
        let output = self.net.forward_single("")?;

        let out_dims: Vec<usize> = output.mat_size().iter().map(|&d| d.max(0) as usize).collect();
        if out_dims.len() != 3 {
            return Err(VisionError::Backend(format!(
                "Expected output [batch, boxes, 5 + classes], got {:?}",
                out_dims
            )));
        }

        let values = output.data_typed::<f32>()?.to_vec();
        Array3::from_shape_vec((out_dims[0], out_dims[1], out_dims[2]), values)
            .map_err(|e| VisionError::Backend(format!("Malformed model output: {}", e)))
    }

    fn stride(&self) -> u32 {
        DEFAULT_STRIDE
    }

    fn names(&self) -> &[String] {
        &[]
    }

    fn is_half(&self) -> bool {
        false
    }
}
