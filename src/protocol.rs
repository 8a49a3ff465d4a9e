//! Typed client protocol records.
//!
//! The channel exchanges JSON text. The first inbound message is a bare
//! [`StartRequest`] mapping; everything after it is a tagged [`Inbound`]
//! control record. All server → client traffic is a tagged [`Outbound`]
//! record.

use serde::{Deserialize, Serialize};

use crate::params::{ParamUpdate, Params};
use crate::polygon::Polygon;

/// First inbound message of a session. Unknown keys are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub camera_id: Option<String>,
    #[serde(default)]
    pub camera_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub source_type: Option<String>,
    #[serde(default)]
    pub save_to_db: bool,
    /// Defaults to true for hls/mjpeg sources when absent.
    #[serde(default)]
    pub record_video: Option<bool>,
    #[serde(flatten)]
    pub params: ParamUpdate,
}

impl StartRequest {
    /// `video_url` wins over `url`; empty strings count as absent.
    pub fn source_url(&self) -> Option<&str> {
        [self.video_url.as_deref(), self.url.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|u| !u.is_empty())
    }
}

/// Control records after the start message.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    SetParams(ParamUpdate),
    Stop,
}

/// Server → client records.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SessionCreated { session_id: i64 },
    Tick(TickPayload),
    Ack { updated: Vec<String>, params: Params },
    Eof,
    Error { msg: String },
}

/// One sampled frame's result as sent to the client.
#[derive(Debug, Clone, Serialize)]
pub struct TickPayload {
    pub tick_idx: u64,
    /// Milliseconds on the session's time basis.
    pub ts: i64,
    /// Percentage of image area classified as water.
    pub pct: f32,
    /// Risk level, 0..=5.
    pub level: i32,
    pub water: WaterPayload,
    pub risk: RiskPayload,
    pub params: Params,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WaterPayload {
    pub objects: Vec<WaterObject>,
    pub image_w: u32,
    pub image_h: u32,
    pub polygons: Vec<Polygon>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask_png_b64: Option<String>,
}

/// A raw water-model detection, pixel coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct WaterObject {
    pub cls: String,
    pub conf: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RiskPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cls: Option<ClsHead>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub det: Option<DetHead>,
}

/// Classification head: top-1 label mapped to a level.
#[derive(Debug, Clone, Serialize)]
pub struct ClsHead {
    pub label: String,
    pub score: f32,
    pub level: i32,
}

/// Detection head: per-box levels and normalised boxes.
#[derive(Debug, Clone, Serialize)]
pub struct DetHead {
    pub levels: Vec<i32>,
    pub level_max: i32,
    /// `[x1, y1, x2, y2, level]` rows, coordinates in `[0,1]`.
    pub boxes_norm: Vec<(f32, f32, f32, f32, i32)>,
}
