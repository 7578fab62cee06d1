//! Linear frame-position to wall-clock model.
//!
//! Given an anchor `(frame, time)` observed from the hardware driver, the time
//! at which the hardware reaches any nearby frame is predicted as
//! `anchor_time + (frame - anchor_frame) * 1e9 / rate`.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use mixd_core::types::format::{MAX_SAMPLE_RATE, NANOS_PER_SECOND};
use mixd_core::{Error, Result};

#[derive(Debug, Default, Clone)]
pub struct LinearPosTimeModel {
    sample_rate: u32,
    anchor_frame: u64,
    anchor_time_ns: i64,
}

impl LinearPosTimeModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn is_configured(&self) -> bool {
        self.sample_rate != 0
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub const fn anchor(&self) -> (u64, i64) {
        (self.anchor_frame, self.anchor_time_ns)
    }

    /// Set the frame rate. May only be done once.
    pub fn configure_rate(&mut self, sample_rate: u32) -> Result<()> {
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::invalid_param(format!(
                "time model rate {sample_rate} outside (0, {MAX_SAMPLE_RATE}]"
            )));
        }
        if self.is_configured() {
            return Err(Error::illegal_state(format!(
                "time model already runs at {}",
                self.sample_rate
            )));
        }
        self.sample_rate = sample_rate;
        Ok(())
    }

    /// Start predicting from a fresh anchor after a discontinuity.
    pub fn reset_anchor(&mut self, frame: u64, time_ns: i64) {
        self.anchor_frame = frame;
        self.anchor_time_ns = time_ns;
    }

    /// Recalibrate against a new hardware observation.
    ///
    /// Returns the drift of the old prediction against the observed time,
    /// or `None` if the observation was too far from the old anchor to compare.
    pub fn update_anchor(&mut self, frame: u64, time_ns: i64) -> Option<i64> {
        let drift = self.predict_time(frame).ok().map(|predicted| predicted - time_ns);
        self.reset_anchor(frame, time_ns);
        drift
    }

    /// Time at which the hardware handles `frame`.
    ///
    /// Targets one second or more away from the anchor are rejected: a linear
    /// model that far out is no longer trustworthy.
    pub fn predict_time(&self, frame: u64) -> Result<i64> {
        if !self.is_configured() {
            return Err(Error::illegal_state("time model has no sample rate"));
        }
        let delta = i128::from(frame) - i128::from(self.anchor_frame);
        if delta.unsigned_abs() >= u128::from(self.sample_rate) {
            return Err(Error::invalid_param(format!(
                "frame {frame} is {delta} frames from anchor {}",
                self.anchor_frame
            )));
        }
        let offset_ns = delta * i128::from(NANOS_PER_SECOND) / i128::from(self.sample_rate);
        // |offset| < 1s, so this always fits.
        Ok(self.anchor_time_ns + offset_ns as i64)
    }
}
