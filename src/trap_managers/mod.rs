//! Trap-state managers: one per species group, sharing one watermark stack
//! per manager.
//!
//! A manager owns the watermark arrays for every species in its group and
//! implements the per-transfer update: release electrons from filled traps,
//! then capture free electrons into the slabs the cloud can reach. Managers
//! also expose the snapshot pair used by the express loop to replay a column
//! from a known state.

mod continuum;
mod instant_capture;
mod slow_capture;

pub use continuum::{TrapManagerInstantCaptureContinuum, TrapManagerSlowCaptureContinuum};
pub use instant_capture::TrapManagerInstantCapture;
pub use slow_capture::TrapManagerSlowCapture;

use crate::ccd::CCDPhase;
use crate::error::CtiError;
use crate::traps::TrapList;

/// Per-species fill probabilities over one dwell time, after Lindegren
/// (1998) section 3.2.
#[derive(Debug, Clone, Default)]
pub(crate) struct FillProbabilities {
    /// Fraction of empty traps that end the dwell filled.
    pub fill_from_empty: Vec<f64>,
    /// Fraction of filled traps that end the dwell still filled.
    pub fill_from_full: Vec<f64>,
    /// Fraction of filled traps that survive a release-only dwell.
    pub release_remain: Vec<f64>,
    /// Complement of `release_remain`.
    pub release_empty: Vec<f64>,
}

impl FillProbabilities {
    /// A zero capture rate marks instant capture: such traps fill with
    /// certainty whenever the cloud reaches them.
    pub fn from_rates(capture_rates: &[f64], emission_rates: &[f64], dwell_time: f64) -> Self {
        let n = capture_rates.len();
        let mut probs = Self {
            fill_from_empty: vec![0.0; n],
            fill_from_full: vec![0.0; n],
            release_remain: vec![0.0; n],
            release_empty: vec![0.0; n],
        };

        for i in 0..n {
            let capture_rate = capture_rates[i];
            let emission_rate = emission_rates[i];
            let total_rate = capture_rate + emission_rate;
            let exponential_factor = (1.0 - (-total_rate * dwell_time).exp()) / total_rate;

            probs.fill_from_empty[i] = if capture_rate == 0.0 {
                1.0
            } else {
                capture_rate * exponential_factor
            };
            probs.fill_from_full[i] = 1.0 - emission_rate * exponential_factor;
            probs.release_remain[i] = (-emission_rate * dwell_time).exp();
            probs.release_empty[i] = 1.0 - probs.release_remain[i];
        }

        probs
    }
}

/// The managers for every non-empty species group of one clocking
/// direction. Groups are independent; a transfer consults each in turn and
/// sums the electron deltas.
#[derive(Debug, Clone)]
pub struct TrapManagerSet {
    instant_capture: Option<TrapManagerInstantCapture>,
    slow_capture: Option<TrapManagerSlowCapture>,
    instant_capture_continuum: Option<TrapManagerInstantCaptureContinuum>,
    slow_capture_continuum: Option<TrapManagerSlowCaptureContinuum>,
}

impl TrapManagerSet {
    /// Build managers sized for `max_n_transfers` and precompute the fill
    /// probabilities for the given dwell time.
    pub fn new(
        traps: &TrapList,
        max_n_transfers: usize,
        phase: CCDPhase,
        dwell_time: f64,
    ) -> Result<Self, CtiError> {
        let instant_capture = if traps.instant_capture.is_empty() {
            None
        } else {
            let mut manager =
                TrapManagerInstantCapture::new(traps.instant_capture.clone(), max_n_transfers, phase)?;
            manager.set_fill_probabilities_from_dwell_time(dwell_time);
            Some(manager)
        };

        let slow_capture = if traps.slow_capture.is_empty() {
            None
        } else {
            let mut manager =
                TrapManagerSlowCapture::new(traps.slow_capture.clone(), max_n_transfers, phase)?;
            manager.set_fill_probabilities_from_dwell_time(dwell_time);
            Some(manager)
        };

        let instant_capture_continuum = if traps.instant_capture_continuum.is_empty() {
            None
        } else {
            let mut manager = TrapManagerInstantCaptureContinuum::new(
                traps.instant_capture_continuum.clone(),
                max_n_transfers,
                phase,
            )?;
            manager.set_fill_probabilities_from_dwell_time(dwell_time);
            Some(manager)
        };

        let slow_capture_continuum = if traps.slow_capture_continuum.is_empty() {
            None
        } else {
            let mut manager = TrapManagerSlowCaptureContinuum::new(
                traps.slow_capture_continuum.clone(),
                max_n_transfers,
                phase,
            )?;
            manager.set_fill_probabilities_from_dwell_time(dwell_time);
            Some(manager)
        };

        Ok(Self {
            instant_capture,
            slow_capture,
            instant_capture_continuum,
            slow_capture_continuum,
        })
    }

    /// Net electron change for the pixel: released minus captured, summed
    /// over every group.
    pub fn release_and_capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        let mut delta = 0.0;
        if let Some(manager) = self.instant_capture.as_mut() {
            delta += manager.release_and_capture(n_free_electrons)?;
        }
        if let Some(manager) = self.slow_capture.as_mut() {
            delta += manager.release_and_capture(n_free_electrons)?;
        }
        if let Some(manager) = self.instant_capture_continuum.as_mut() {
            delta += manager.release_and_capture(n_free_electrons)?;
        }
        if let Some(manager) = self.slow_capture_continuum.as_mut() {
            delta += manager.release_and_capture(n_free_electrons)?;
        }
        Ok(delta)
    }

    pub fn n_trapped_electrons(&self) -> f64 {
        self.instant_capture
            .as_ref()
            .map_or(0.0, |m| m.n_trapped_electrons())
            + self
                .slow_capture
                .as_ref()
                .map_or(0.0, |m| m.n_trapped_electrons())
            + self
                .instant_capture_continuum
                .as_ref()
                .map_or(0.0, |m| m.n_trapped_electrons())
            + self
                .slow_capture_continuum
                .as_ref()
                .map_or(0.0, |m| m.n_trapped_electrons())
    }

    pub fn reset(&mut self) {
        if let Some(manager) = self.instant_capture.as_mut() {
            manager.reset();
        }
        if let Some(manager) = self.slow_capture.as_mut() {
            manager.reset();
        }
        if let Some(manager) = self.instant_capture_continuum.as_mut() {
            manager.reset();
        }
        if let Some(manager) = self.slow_capture_continuum.as_mut() {
            manager.reset();
        }
    }

    pub fn store(&mut self) {
        if let Some(manager) = self.instant_capture.as_mut() {
            manager.store();
        }
        if let Some(manager) = self.slow_capture.as_mut() {
            manager.store();
        }
        if let Some(manager) = self.instant_capture_continuum.as_mut() {
            manager.store();
        }
        if let Some(manager) = self.slow_capture_continuum.as_mut() {
            manager.store();
        }
    }

    pub fn restore(&mut self) {
        if let Some(manager) = self.instant_capture.as_mut() {
            manager.restore();
        }
        if let Some(manager) = self.slow_capture.as_mut() {
            manager.restore();
        }
        if let Some(manager) = self.instant_capture_continuum.as_mut() {
            manager.restore();
        }
        if let Some(manager) = self.slow_capture_continuum.as_mut() {
            manager.restore();
        }
    }
}
