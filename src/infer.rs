// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Per-tick inference stage.
//!
//! Composes the two model invocations on one frame and derives the
//! aggregate signals: water coverage percentage, risk level, polygon
//! export and the optional base64 PNG mask transport. Pure with respect
//! to `(frame, params)` apart from the shared model weights; callers run
//! it on a blocking worker, never on the session task itself.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{ExtendedColorType, GrayImage, ImageEncoder};

use crate::error::Result;
use crate::model::{FloodModels, RiskOptions, RiskOutput, WaterOptions};
use crate::params::Params;
use crate::polygon;
use crate::protocol::{ClsHead, DetHead, RiskPayload, WaterPayload};
use crate::source::Frame;

/// Masks are resampled so their longest side fits this before PNG encode.
pub const MASK_MAX_SIDE: u32 = 640;

/// One tick's derived result, before mask gating and transport framing.
pub struct TickResult {
    pub pct: f32,
    pub level: i32,
    pub water: WaterPayload,
    pub risk: RiskPayload,
}

/// Run both models on `frame` with a consistent [`Params`] snapshot.
/// `want_mask` controls whether the PNG transport is produced at all.
pub fn run_tick(
    models: &dyn FloodModels,
    frame: &Frame,
    params: &Params,
    want_mask: bool,
) -> Result<TickResult> {
    let water_out = models.infer_water(
        frame,
        &WaterOptions {
            imgsz: params.imgsz_water,
            conf: params.conf_water,
            iou: params.iou_water,
        },
    )?;
    let risk_out = models.infer_risk(
        frame,
        &RiskOptions {
            imgsz: params.imgsz_risk,
            conf: params.conf_risk,
            iou: params.iou_risk,
        },
    )?;

    let pct = coverage_pct(&water_out.mask);
    let (level, risk) = risk_from_output(&risk_out);
    let polygons = polygon::mask_to_polygons(&water_out.mask);

    let mut water = WaterPayload {
        objects: water_out.objects,
        image_w: frame.width,
        image_h: frame.height,
        polygons,
        mask_png_b64: None,
    };
    if want_mask {
        water.mask_png_b64 = encode_mask_png_b64(&water_out.mask);
    }

    Ok(TickResult { pct, level, water, risk })
}

/// Percentage of mask pixels classified as water.
pub fn coverage_pct(mask: &GrayImage) -> f32 {
    let total = mask.width() as u64 * mask.height() as u64;
    if total == 0 {
        return 0.0;
    }
    let wet = mask.pixels().filter(|p| p[0] > 0).count() as u64;
    (wet as f64 / total as f64 * 100.0) as f32
}

/// Linear class-index → level mapping, `round(idx · 5 / max(1, n−1))`.
pub fn cls_index_level(idx: usize, n_classes: usize) -> i32 {
    let span = n_classes.saturating_sub(1).max(1) as f64;
    ((idx as f64 * 5.0 / span).round() as i32).clamp(0, 5)
}

/// Level for a named risk class, if the name is one of the known tiers.
pub fn named_level(name: &str) -> Option<i32> {
    match name {
        "low" => Some(1),
        "medium" => Some(3),
        "high" | "very_high" | "critical" => Some(5),
        _ => None,
    }
}

/// Frame level = max over the heads present; 0 when neither fired.
fn risk_from_output(out: &RiskOutput) -> (i32, RiskPayload) {
    let mut levels = Vec::new();
    let mut payload = RiskPayload::default();

    if let Some(cls) = &out.cls {
        let level = cls_index_level(cls.top1_idx, cls.n_classes);
        levels.push(level);
        payload.cls = Some(ClsHead { label: cls.label.clone(), score: cls.top1_conf, level });
    }

    if !out.boxes.is_empty() {
        let mut box_levels = Vec::with_capacity(out.boxes.len());
        let mut boxes_norm = Vec::with_capacity(out.boxes.len());
        for b in &out.boxes {
            let level = named_level(&b.cls_name)
                .unwrap_or_else(|| cls_index_level(b.cls_idx, out.n_classes));
            box_levels.push(level);
            boxes_norm.push((b.xyxyn[0], b.xyxyn[1], b.xyxyn[2], b.xyxyn[3], level));
        }
        let level_max = box_levels.iter().copied().max().unwrap_or(0);
        levels.push(level_max);
        payload.det = Some(DetHead { levels: box_levels, level_max, boxes_norm });
    }

    (levels.into_iter().max().unwrap_or(0), payload)
}

/// Downscale (nearest-neighbour), PNG-encode and base64 a binary mask.
pub fn encode_mask_png_b64(mask: &GrayImage) -> Option<String> {
    let (w, h) = mask.dimensions();
    if w == 0 || h == 0 {
        return None;
    }

    let longest = w.max(h);
    let scaled;
    let out = if longest > MASK_MAX_SIDE {
        let scale = MASK_MAX_SIDE as f64 / longest as f64;
        let nw = ((w as f64 * scale) as u32).max(1);
        let nh = ((h as f64 * scale) as u32).max(1);
        scaled = image::imageops::resize(mask, nw, nh, FilterType::Nearest);
        &scaled
    } else {
        mask
    };

    let mut buf = Vec::new();
    let encoder = PngEncoder::new_with_quality(&mut buf, CompressionType::Fast, PngFilterType::NoFilter);
    encoder
        .write_image(out.as_raw(), out.width(), out.height(), ExtendedColorType::L8)
        .ok()?;
    Some(BASE64.encode(&buf))
}
