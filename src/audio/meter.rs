//! Input level monitor backing the call screen's volume visualizer.
//!
//! Observational only: it taps captured frames, never the transport path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Silence floor reported when nothing has been measured.
pub const METER_FLOOR_DB: f32 = -60.0;

/// Shared input-level cell, cheap to clone into the capture loop and the UI.
#[derive(Clone, Debug)]
pub struct LevelMeter {
    level_bits: Arc<AtomicU32>,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(METER_FLOOR_DB.to_bits())),
        }
    }

    pub fn set_db(&self, db: f32) {
        self.level_bits.store(db.to_bits(), Ordering::Relaxed);
    }

    pub fn level_db(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Level mapped onto 0–100 between the floor and full scale.
    pub fn level_percent(&self) -> f32 {
        let db = self.level_db().clamp(METER_FLOOR_DB, 0.0);
        (db - METER_FLOOR_DB) / -METER_FLOOR_DB * 100.0
    }

    /// Drop back to the silence floor; called on teardown.
    pub fn reset(&self) {
        self.set_db(METER_FLOOR_DB);
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return METER_FLOOR_DB;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = energy.sqrt().max(1e-6);
    20.0 * rms.log10()
}
