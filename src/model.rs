// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Model seam between the streaming pipeline and the inference backends.
//!
//! The pipeline only depends on [`FloodModels`]; the ONNX Runtime
//! implementation lives in [`crate::yolo`]. Weights are loaded once at
//! process start and shared across sessions by reference.

use std::sync::Arc;

use image::GrayImage;

use crate::error::Result;
use crate::protocol::WaterObject;
use crate::source::Frame;

/// Water model invocation parameters for one tick.
#[derive(Debug, Clone, Copy)]
pub struct WaterOptions {
    pub imgsz: u32,
    pub conf: f32,
    pub iou: f32,
}

/// Risk model invocation parameters for one tick.
#[derive(Debug, Clone, Copy)]
pub struct RiskOptions {
    pub imgsz: u32,
    pub conf: f32,
    pub iou: f32,
}

/// Raw water-segmentation output in original-frame coordinates.
pub struct WaterOutput {
    /// 0/255 binary water mask at the frame's dimensions.
    pub mask: GrayImage,
    pub objects: Vec<WaterObject>,
}

/// Top-1 classification result.
pub struct ClsOutput {
    pub top1_idx: usize,
    pub top1_conf: f32,
    pub label: String,
    pub n_classes: usize,
}

/// One risk detection with normalised box coordinates.
pub struct DetBox {
    pub cls_idx: usize,
    pub cls_name: String,
    pub conf: f32,
    /// `[x1, y1, x2, y2]` in `[0,1]` of the original frame.
    pub xyxyn: [f32; 4],
}

/// Raw risk-model output; either head may be absent.
pub struct RiskOutput {
    pub cls: Option<ClsOutput>,
    pub boxes: Vec<DetBox>,
    /// Class count used for the linear index → level mapping.
    pub n_classes: usize,
}

/// The two per-frame model invocations the inference stage composes.
pub trait FloodModels: Send + Sync {
    fn infer_water(&self, frame: &Frame, opts: &WaterOptions) -> Result<WaterOutput>;
    fn infer_risk(&self, frame: &Frame, opts: &RiskOptions) -> Result<RiskOutput>;
}

/// Process-wide shared handle to the loaded model pair.
pub type SharedModels = Arc<dyn FloodModels>;
