// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Live-tunable session parameters.
//!
//! A [`ParamStore`] holds the current set behind a read-write lock;
//! `snapshot()` hands out whole copies and `update()` replaces the whole
//! struct at once, so a tick in flight never observes a half-applied
//! update.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::DefaultParams;

/// Tunable per-session parameters, clipped to their accepted ranges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Params {
    /// Ticks per second, 1..=30.
    pub fps: u32,
    pub conf_water: f32,
    pub iou_water: f32,
    pub conf_risk: f32,
    pub iou_risk: f32,
    /// Attach a mask every N ticks; 0 disables mask transport.
    pub send_mask_every: u32,
    pub imgsz_water: u32,
    pub imgsz_risk: u32,
}

/// Partial update parsed from a `start` or `set_params` record.
/// Unknown keys are dropped by serde; absent keys leave the field alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamUpdate {
    pub fps: Option<u32>,
    pub conf_water: Option<f32>,
    pub iou_water: Option<f32>,
    pub conf_risk: Option<f32>,
    pub iou_risk: Option<f32>,
    pub send_mask_every: Option<u32>,
    pub imgsz_water: Option<u32>,
    pub imgsz_risk: Option<u32>,
}

impl Params {
    pub fn from_defaults(d: &DefaultParams) -> Self {
        let mut p = Self {
            fps: d.fps,
            conf_water: d.conf_water,
            iou_water: d.iou_water,
            conf_risk: d.conf_risk,
            iou_risk: d.iou_risk,
            send_mask_every: d.send_mask_every,
            imgsz_water: d.imgsz_water,
            imgsz_risk: d.imgsz_risk,
        };
        p.clip();
        p
    }

    /// Apply the present fields of `update`, re-clip, and return the list
    /// of accepted keys.
    pub fn apply(&mut self, update: &ParamUpdate) -> Vec<&'static str> {
        let mut accepted = Vec::new();
        if let Some(v) = update.fps {
            self.fps = v;
            accepted.push("fps");
        }
        if let Some(v) = update.conf_water {
            self.conf_water = v;
            accepted.push("conf_water");
        }
        if let Some(v) = update.iou_water {
            self.iou_water = v;
            accepted.push("iou_water");
        }
        if let Some(v) = update.conf_risk {
            self.conf_risk = v;
            accepted.push("conf_risk");
        }
        if let Some(v) = update.iou_risk {
            self.iou_risk = v;
            accepted.push("iou_risk");
        }
        if let Some(v) = update.send_mask_every {
            self.send_mask_every = v;
            accepted.push("send_mask_every");
        }
        if let Some(v) = update.imgsz_water {
            self.imgsz_water = v;
            accepted.push("imgsz_water");
        }
        if let Some(v) = update.imgsz_risk {
            self.imgsz_risk = v;
            accepted.push("imgsz_risk");
        }
        self.clip();
        accepted
    }

    fn clip(&mut self) {
        self.fps = self.fps.clamp(1, 30);
        self.conf_water = self.conf_water.clamp(0.0, 1.0);
        self.iou_water = self.iou_water.clamp(0.0, 1.0);
        self.conf_risk = self.conf_risk.clamp(0.0, 1.0);
        self.iou_risk = self.iou_risk.clamp(0.0, 1.0);
        self.imgsz_water = self.imgsz_water.max(64);
        self.imgsz_risk = self.imgsz_risk.max(64);
    }
}

/// Shared holder for the session's current [`Params`].
pub struct ParamStore {
    inner: RwLock<Params>,
}

impl ParamStore {
    pub fn new(initial: Params) -> Self {
        Self { inner: RwLock::new(initial) }
    }

    /// Atomic copy of the current parameter set.
    pub fn snapshot(&self) -> Params {
        self.inner.read().clone()
    }

    /// Apply a partial update under the write lock. Returns the accepted
    /// keys and the resulting snapshot.
    pub fn update(&self, update: &ParamUpdate) -> (Vec<&'static str>, Params) {
        let mut guard = self.inner.write();
        let accepted = guard.apply(update);
        (accepted, guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn defaults() -> Params {
        Params::from_defaults(&DefaultParams::default())
    }

    #[test]
    fn update_clips_to_ranges() {
        let store = ParamStore::new(defaults());
        let (accepted, p) = store.update(&ParamUpdate {
            fps: Some(99),
            conf_water: Some(7.0),
            imgsz_risk: Some(1),
            ..Default::default()
        });
        assert_eq!(accepted, vec!["fps", "conf_water", "imgsz_risk"]);
        assert_eq!(p.fps, 30);
        assert_eq!(p.conf_water, 1.0);
        assert_eq!(p.imgsz_risk, 64);
    }

    #[test]
    fn absent_fields_are_untouched() {
        let store = ParamStore::new(defaults());
        let before = store.snapshot();
        let (accepted, after) = store.update(&ParamUpdate {
            send_mask_every: Some(3),
            ..Default::default()
        });
        assert_eq!(accepted, vec!["send_mask_every"]);
        assert_eq!(after.send_mask_every, 3);
        assert_eq!(after.fps, before.fps);
        assert_eq!(after.conf_risk, before.conf_risk);
    }

    #[test]
    fn snapshots_never_mix_updates() {
        // Two full states toggled from another thread; every snapshot must
        // equal one of them exactly.
        let store = Arc::new(ParamStore::new(defaults()));
        let a = ParamUpdate { fps: Some(2), conf_water: Some(0.1), ..Default::default() };
        let b = ParamUpdate { fps: Some(20), conf_water: Some(0.9), ..Default::default() };

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    store.update(&a);
                    store.update(&b);
                }
            })
        };

        for _ in 0..2000 {
            let s = store.snapshot();
            let consistent = (s.fps == 2 && s.conf_water == 0.1)
                || (s.fps == 20 && s.conf_water == 0.9)
                || (s.fps == 10 && s.conf_water == 0.25); // initial
            assert!(consistent, "torn snapshot: fps={} conf_water={}", s.fps, s.conf_water);
        }
        writer.join().unwrap();
    }
}
