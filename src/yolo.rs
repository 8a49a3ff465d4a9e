// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! ONNX Runtime backends for the two YOLO-style models.
//!
//! The water model is segmentation-capable: its second output carries
//! mask prototypes that are combined per detection into a full-resolution
//! binary mask. The risk model may expose a classification head
//! (`[1, n_classes]`) or a detection head (`[1, 4+n_classes, anchors]`);
//! both are handled.

use std::path::Path;

use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array4, ArrayD};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::info;
#[cfg(not(feature = "cuda"))]
use tracing::warn;

use crate::config::ModelConfig;
use crate::error::{MonitorError, Result};
use crate::model::{ClsOutput, DetBox, FloodModels, RiskOptions, RiskOutput, WaterOptions, WaterOutput};
use crate::protocol::WaterObject;
use crate::source::Frame;

/// Number of mask prototype channels in YOLO segmentation exports.
const SEG_COEFS: usize = 32;

/// The loaded water + risk model pair shared across sessions.
pub struct DualModels {
    water: YoloSession,
    risk: YoloSession,
}

impl DualModels {
    /// Load both weight files once at process start.
    pub fn load(cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            water: YoloSession::load(&cfg.water_weights, &cfg.device)?,
            risk: YoloSession::load(&cfg.risk_weights, &cfg.device)?,
        })
    }
}

impl FloodModels for DualModels {
    fn infer_water(&self, frame: &Frame, opts: &WaterOptions) -> Result<WaterOutput> {
        let size = opts.imgsz;
        let (input, lb) = letterbox_tensor(frame, size);
        let outputs = self.water.run(input)?;
        let det_out = outputs
            .first()
            .ok_or_else(|| MonitorError::Inference("water model produced no outputs".into()))?;
        let protos = outputs.get(1);

        let raw = decode_detections(det_out, protos.is_some(), opts.conf, size)?;
        let kept = nms(raw, opts.iou);

        let mut mask = GrayImage::new(frame.width, frame.height);
        if let Some(protos) = protos {
            paint_masks(&mut mask, &kept, protos, &lb, size, frame.width, frame.height);
        }

        let objects = kept
            .iter()
            .map(|d| WaterObject {
                cls: self.water.class_name(d.cls),
                conf: d.conf,
                bbox: Some(lb.unmap_box(d.xyxy, frame.width, frame.height)),
            })
            .collect();

        Ok(WaterOutput { mask, objects })
    }

    fn infer_risk(&self, frame: &Frame, opts: &RiskOptions) -> Result<RiskOutput> {
        let (input, lb) = letterbox_tensor(frame, opts.imgsz);
        let outputs = self.risk.run(input)?;
        let out = outputs
            .first()
            .ok_or_else(|| MonitorError::Inference("risk model produced no outputs".into()))?;

        match out.shape() {
            // Classification head: per-class scores.
            [1, n_classes] => {
                let n_classes = *n_classes;
                let (mut top1_idx, mut top1_conf) = (0usize, f32::MIN);
                for i in 0..n_classes {
                    let score = out[[0, i]];
                    if score > top1_conf {
                        top1_idx = i;
                        top1_conf = score;
                    }
                }
                Ok(RiskOutput {
                    cls: Some(ClsOutput {
                        top1_idx,
                        top1_conf,
                        label: self.risk.class_name(top1_idx),
                        n_classes,
                    }),
                    boxes: Vec::new(),
                    n_classes,
                })
            }
            // Detection head.
            [1, attrs, _] => {
                let raw = decode_detections(out, false, opts.conf, opts.imgsz)?;
                let kept = nms(raw, opts.iou);
                let n_classes = if self.risk.names.is_empty() {
                    attrs.saturating_sub(4)
                } else {
                    self.risk.names.len()
                };
                let boxes = kept
                    .into_iter()
                    .map(|d| {
                        let [x1, y1, x2, y2] = lb.unmap_box(d.xyxy, frame.width, frame.height);
                        DetBox {
                            cls_idx: d.cls,
                            cls_name: self.risk.class_name(d.cls),
                            conf: d.conf,
                            xyxyn: [
                                x1 / frame.width as f32,
                                y1 / frame.height as f32,
                                x2 / frame.width as f32,
                                y2 / frame.height as f32,
                            ],
                        }
                    })
                    .collect();
                Ok(RiskOutput { cls: None, boxes, n_classes })
            }
            shape => Err(MonitorError::Inference(format!(
                "unexpected risk output shape {shape:?}"
            ))),
        }
    }
}

/// One ONNX session plus the metadata needed to interpret it.
struct YoloSession {
    session: Mutex<Session>,
    input_name: String,
    output_names: Vec<String>,
    names: Vec<String>,
}

impl YoloSession {
    fn load(path: &Path, device: &str) -> Result<Self> {
        let session = build_session(path, device)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| MonitorError::Model(format!("{}: model has no inputs", path.display())))?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let names = class_names(&session);
        info!(
            path = %path.display(),
            device,
            outputs = output_names.len(),
            classes = names.len(),
            "Model loaded"
        );
        Ok(Self { session: Mutex::new(session), input_name, output_names, names })
    }

    /// Run the session and copy every output out as an owned array.
    fn run(&self, input: Array4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let tensor = Tensor::from_array(input)
            .map_err(|e| MonitorError::Inference(format!("input tensor: {e}")))?;
        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| MonitorError::Inference(format!("session run: {e}")))?;
        let mut arrays = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let view = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| MonitorError::Inference(format!("output '{name}': {e}")))?;
            arrays.push(view.to_owned());
        }
        Ok(arrays)
    }

    fn class_name(&self, idx: usize) -> String {
        self.names.get(idx).cloned().unwrap_or_else(|| idx.to_string())
    }
}

fn build_session(path: &Path, device: &str) -> Result<Session> {
    let builder = Session::builder()
        .map_err(model_err)?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(model_err)?
        .with_intra_threads(2)
        .map_err(model_err)?;

    #[cfg(feature = "cuda")]
    let builder = if device.starts_with("cuda") {
        use ort::execution_providers::CUDAExecutionProvider;
        builder
            .with_execution_providers([CUDAExecutionProvider::default().build()])
            .map_err(model_err)?
    } else {
        builder
    };
    #[cfg(not(feature = "cuda"))]
    if device.starts_with("cuda") {
        warn!("CUDA device requested but this build has no CUDA support, using CPU");
    }

    builder
        .commit_from_file(path)
        .map_err(|e| MonitorError::Model(format!("load {}: {e}", path.display())))
}

fn model_err(e: ort::Error) -> MonitorError {
    MonitorError::Model(e.to_string())
}

/// Class names from the Ultralytics `names` metadata entry, e.g.
/// `{0: 'water', 1: 'road'}`. Missing or unparseable metadata yields an
/// empty list and indices are used as labels.
fn class_names(session: &Session) -> Vec<String> {
    let raw = session
        .metadata()
        .ok()
        .and_then(|m| m.custom("names").ok().flatten());
    match raw {
        Some(raw) => parse_names_map(&raw),
        None => Vec::new(),
    }
}

fn parse_names_map(raw: &str) -> Vec<String> {
    let mut entries: Vec<(usize, String)> = Vec::new();
    for part in raw.trim().trim_matches(|c| c == '{' || c == '}').split(',') {
        let Some((key, value)) = part.split_once(':') else { continue };
        let Ok(idx) = key.trim().parse::<usize>() else { continue };
        let name = value.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
        entries.push((idx, name));
    }
    entries.sort_by_key(|(idx, _)| *idx);
    entries.into_iter().map(|(_, name)| name).collect()
}

// ──────────────── pre/post-processing ─────────────────────────────────────

/// Mapping between original-frame and letterboxed model coordinates.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    /// Model-space box → original pixel coordinates, clamped to the frame.
    fn unmap_box(&self, xyxy: [f32; 4], w: u32, h: u32) -> [f32; 4] {
        let ux = |v: f32| ((v - self.pad_x) / self.scale).clamp(0.0, w as f32);
        let uy = |v: f32| ((v - self.pad_y) / self.scale).clamp(0.0, h as f32);
        [ux(xyxy[0]), uy(xyxy[1]), ux(xyxy[2]), uy(xyxy[3])]
    }
}

/// BGR frame → normalised RGB NCHW tensor, letterboxed into a square of
/// `size` with 114-grey padding.
fn letterbox_tensor(frame: &Frame, size: u32) -> (Array4<f32>, Letterbox) {
    let (w, h) = (frame.width, frame.height);
    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);

    let data = &frame.data;
    let rgb = RgbImage::from_fn(w, h, |x, y| {
        let i = ((y * w + x) * 3) as usize;
        Rgb([data[i + 2], data[i + 1], data[i]])
    });
    let resized = image::imageops::resize(&rgb, new_w, new_h, image::imageops::FilterType::Triangle);

    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;
    let mut input =
        Array4::<f32>::from_elem((1, 3, size as usize, size as usize), 114.0 / 255.0);
    for (x, y, px) in resized.enumerate_pixels() {
        let ix = (x + pad_x) as usize;
        let iy = (y + pad_y) as usize;
        for c in 0..3 {
            input[[0, c, iy, ix]] = px[c] as f32 / 255.0;
        }
    }

    (input, Letterbox { scale, pad_x: pad_x as f32, pad_y: pad_y as f32 })
}

/// One decoded candidate in model (letterbox) coordinates.
struct RawDet {
    xyxy: [f32; 4],
    conf: f32,
    cls: usize,
    coefs: Vec<f32>,
}

/// Decode a `[1, attrs, anchors]` head: per-anchor box, best class score
/// above `conf`, and mask coefficients when the model is seg-capable.
fn decode_detections(
    out: &ArrayD<f32>,
    has_coefs: bool,
    conf: f32,
    size: u32,
) -> Result<Vec<RawDet>> {
    let shape = out.shape();
    let [1, attrs, anchors] = shape else {
        return Err(MonitorError::Inference(format!(
            "unexpected detection output shape {shape:?}"
        )));
    };
    let (attrs, anchors) = (*attrs, *anchors);
    let coefs = if has_coefs { SEG_COEFS.min(attrs.saturating_sub(4)) } else { 0 };
    let nc = attrs.saturating_sub(4 + coefs);
    if nc == 0 {
        return Ok(Vec::new());
    }

    let mut dets = Vec::new();
    for a in 0..anchors {
        let (mut cls, mut score) = (0usize, f32::MIN);
        for c in 0..nc {
            let s = out[[0, 4 + c, a]];
            if s > score {
                cls = c;
                score = s;
            }
        }
        if score < conf {
            continue;
        }

        let (cx, cy) = (out[[0, 0, a]], out[[0, 1, a]]);
        let (bw, bh) = (out[[0, 2, a]], out[[0, 3, a]]);
        let limit = size as f32;
        let xyxy = [
            (cx - bw / 2.0).clamp(0.0, limit),
            (cy - bh / 2.0).clamp(0.0, limit),
            (cx + bw / 2.0).clamp(0.0, limit),
            (cy + bh / 2.0).clamp(0.0, limit),
        ];

        let coef_vec = (0..coefs).map(|k| out[[0, 4 + nc + k, a]]).collect();
        dets.push(RawDet { xyxy, conf: score, cls, coefs: coef_vec });
    }
    Ok(dets)
}

/// Greedy per-class non-maximum suppression.
fn nms(mut dets: Vec<RawDet>, iou_thr: f32) -> Vec<RawDet> {
    dets.sort_by(|a, b| b.conf.total_cmp(&a.conf));
    let mut kept: Vec<RawDet> = Vec::new();
    'candidates: for det in dets {
        for k in &kept {
            if k.cls == det.cls && iou(&k.xyxy, &det.xyxy) > iou_thr {
                continue 'candidates;
            }
        }
        kept.push(det);
    }
    kept
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = ix * iy;
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Combine per-detection prototype coefficients into one binary mask at
/// the original frame resolution, cropped to each detection's box.
fn paint_masks(
    mask: &mut GrayImage,
    kept: &[RawDet],
    protos: &ArrayD<f32>,
    lb: &Letterbox,
    size: u32,
    w: u32,
    h: u32,
) {
    let shape = protos.shape();
    let [1, k, mh, mw] = shape else {
        return;
    };
    let (k, mh, mw) = (*k, *mh, *mw);
    let sx = mw as f32 / size as f32;
    let sy = mh as f32 / size as f32;

    for det in kept {
        if det.coefs.len() != k {
            continue;
        }

        let mut buf = vec![0f32; mh * mw];
        for (ki, &c) in det.coefs.iter().enumerate() {
            if c == 0.0 {
                continue;
            }
            for y in 0..mh {
                for x in 0..mw {
                    buf[y * mw + x] += c * protos[[0, ki, y, x]];
                }
            }
        }

        let [bx1, by1, bx2, by2] = lb.unmap_box(det.xyxy, w, h);
        let x1 = bx1.floor().max(0.0) as u32;
        let y1 = by1.floor().max(0.0) as u32;
        let x2 = (bx2.ceil() as u32).min(w);
        let y2 = (by2.ceil() as u32).min(h);

        for y in y1..y2 {
            for x in x1..x2 {
                let px = (((x as f32 + 0.5) * lb.scale + lb.pad_x) * sx) as usize;
                let py = (((y as f32 + 0.5) * lb.scale + lb.pad_y) * sy) as usize;
                let v = buf[py.min(mh - 1) * mw + px.min(mw - 1)];
                // sigmoid(v) > 0.5 ⇔ v > 0
                if v > 0.0 {
                    mask.put_pixel(x, y, Luma([255u8]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn letterbox_pads_the_short_side() {
        let frame = Frame {
            width: 640,
            height: 360,
            data: Bytes::from(vec![0u8; 640 * 360 * 3]),
        };
        let (input, lb) = letterbox_tensor(&frame, 640);
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.scale, 1.0);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 140.0);
        // Padding rows keep the 114-grey fill.
        assert!((input[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        // Content rows are the (black) frame.
        assert!(input[[0, 0, 320, 320]].abs() < 1e-6);
    }

    #[test]
    fn unmap_box_inverts_the_letterbox() {
        let lb = Letterbox { scale: 0.5, pad_x: 0.0, pad_y: 70.0 };
        let [x1, y1, x2, y2] = lb.unmap_box([100.0, 170.0, 200.0, 270.0], 1280, 720);
        assert_eq!([x1, y1, x2, y2], [200.0, 200.0, 400.0, 400.0]);
    }

    #[test]
    fn nms_suppresses_same_class_overlaps_only() {
        let dets = vec![
            RawDet { xyxy: [0.0, 0.0, 10.0, 10.0], conf: 0.9, cls: 0, coefs: vec![] },
            RawDet { xyxy: [1.0, 1.0, 11.0, 11.0], conf: 0.8, cls: 0, coefs: vec![] },
            RawDet { xyxy: [1.0, 1.0, 11.0, 11.0], conf: 0.7, cls: 1, coefs: vec![] },
            RawDet { xyxy: [50.0, 50.0, 60.0, 60.0], conf: 0.6, cls: 0, coefs: vec![] },
        ];
        let kept = nms(dets, 0.45);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].conf, 0.9);
    }

    #[test]
    fn iou_is_zero_for_disjoint_boxes() {
        assert_eq!(iou(&[0.0, 0.0, 1.0, 1.0], &[2.0, 2.0, 3.0, 3.0]), 0.0);
        let same = [0.0, 0.0, 2.0, 2.0];
        assert!((iou(&same, &same) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn names_metadata_parses_python_dict_form() {
        let names = parse_names_map("{0: 'water', 1: \"road\", 2: 'vehicle'}");
        assert_eq!(names, vec!["water", "road", "vehicle"]);
        assert!(parse_names_map("").is_empty());
    }
}
