//! Manager for slow-capture trap species.
//!
//! Capture and release act over the same dwell without either dominating, so
//! a transfer first carves a slab boundary at the cloud height, then relaxes
//! every slab below the cloud toward the capture/release equilibrium while
//! slabs above the cloud only release. Up to two watermark levels can be
//! touched per transfer: the split slab and the new boundary slab.

use crate::ccd::CCDPhase;
use crate::error::CtiError;
use crate::traps::TrapSlowCapture;
use crate::watermarks::WatermarkStack;

use super::FillProbabilities;

const N_WATERMARKS_PER_TRANSFER: usize = 2;

#[derive(Debug, Clone)]
pub struct TrapManagerSlowCapture {
    traps: Vec<TrapSlowCapture>,
    phase: CCDPhase,
    stack: WatermarkStack,
    probs: FillProbabilities,
}

impl TrapManagerSlowCapture {
    pub fn new(
        traps: Vec<TrapSlowCapture>,
        max_n_transfers: usize,
        phase: CCDPhase,
    ) -> Result<Self, CtiError> {
        if traps.is_empty() {
            return Err(CtiError::config(
                "a trap manager needs at least one species",
            ));
        }
        let capacity = max_n_transfers * N_WATERMARKS_PER_TRANSFER + 1;
        let stack = WatermarkStack::new(capacity, traps.len());
        Ok(Self {
            traps,
            phase,
            stack,
            probs: FillProbabilities::default(),
        })
    }

    pub fn set_fill_probabilities_from_dwell_time(&mut self, dwell_time: f64) {
        let capture_rates: Vec<f64> = self.traps.iter().map(|t| t.capture_rate()).collect();
        let emission_rates: Vec<f64> = self.traps.iter().map(|t| t.emission_rate()).collect();
        self.probs = FillProbabilities::from_rates(&capture_rates, &emission_rates, dwell_time);
    }

    pub fn reset(&mut self) {
        self.stack.reset();
    }

    pub fn store(&mut self) {
        self.stack.store();
    }

    pub fn restore(&mut self) {
        self.stack.restore();
    }

    pub fn n_trapped_electrons(&self) -> f64 {
        let mut n_trapped = 0.0;
        for i in self.stack.i_first_active()..self.stack.i_end_active() {
            let volume = self.stack.volume(i);
            let fills = self.stack.fills_row(i);
            let per_volume: f64 = fills
                .iter()
                .zip(&self.traps)
                .map(|(fill, trap)| fill * trap.density)
                .sum();
            n_trapped += per_volume * volume;
        }
        n_trapped
    }

    /// Ensure a slab boundary coincides with the cloud height. New slabs
    /// start with empty traps. Returns one past the top slab that lies below
    /// the cloud.
    fn split_at_cloud(&mut self, cloud: f64) -> Result<usize, CtiError> {
        let i_first = self.stack.i_first_active();
        if cloud == 0.0 {
            return Ok(i_first);
        }

        if self.stack.is_empty() {
            self.stack.ensure_index(i_first)?;
            *self.stack.volume_mut(i_first) = cloud;
            self.stack.grow_active(1);
            return Ok(i_first + 1);
        }

        let i_end = self.stack.i_end_active();
        let i_above = self.stack.index_above_cloud(cloud);

        if i_above == i_end {
            // Cloud reaches above the stack; extend with a fresh top slab
            let extra = cloud - self.stack.total_volume();
            if extra > 0.0 {
                self.stack.ensure_index(i_end)?;
                *self.stack.volume_mut(i_end) = extra;
                self.stack.grow_active(1);
                return Ok(i_end + 1);
            }
            // Cloud exactly at the stack top: the boundary already exists
            return Ok(i_end);
        }

        let volume_below = self.stack.cumulative_volume_below(i_above);
        let lower_part = cloud - volume_below;
        if lower_part == 0.0 {
            // Cloud exactly on an existing boundary
            return Ok(i_above);
        }

        // Split the straddled slab; both halves keep its fills
        self.stack.shift_up(i_above)?;
        self.stack.grow_active(1);
        *self.stack.volume_mut(i_above) = lower_part;
        *self.stack.volume_mut(i_above + 1) -= lower_part;
        Ok(i_above + 1)
    }

    /// The per-transfer update. Returns released minus captured.
    pub fn release_and_capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        // The cloud that sets the split point includes the charge released
        // this transfer, so released electrons stay eligible for recapture
        // by every slab they can reach. Computed without mutating; the
        // below-cloud relaxation already accounts for emission there.
        let mut n_released = 0.0;
        for i in self.stack.i_first_active()..self.stack.i_end_active() {
            let volume = self.stack.volume(i);
            let fills = self.stack.fills_row(i);
            let mut released_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                released_this_level += fills[s] * self.probs.release_empty[s] * trap.density;
            }
            n_released += released_this_level * volume;
        }

        let cloud = self
            .phase
            .cloud_fractional_volume(n_free_electrons + n_released);
        let i_cloud_end = self.split_at_cloud(cloud)?;

        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();

        // Trial pass: net electron change if nothing limited capture
        let mut delta_below = 0.0;
        for i in i_first..i_cloud_end {
            let volume = self.stack.volume(i);
            let fills = self.stack.fills_row(i);
            let mut delta_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                let old = fills[s];
                let target = self.probs.fill_from_empty[s]
                    + (self.probs.fill_from_full[s] - self.probs.fill_from_empty[s]) * old;
                delta_this_level += (old - target) * trap.density;
            }
            delta_below += delta_this_level * volume;
        }
        let mut delta_above = 0.0;
        for i in i_cloud_end..i_end {
            let volume = self.stack.volume(i);
            let fills = self.stack.fills_row(i);
            let mut delta_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                delta_this_level += fills[s] * self.probs.release_empty[s] * trap.density;
            }
            delta_above += delta_this_level * volume;
        }

        // If the below-cloud relaxation would capture more electrons than
        // the pixel holds, move the fills only a fraction of the way
        let net = delta_below + delta_above;
        let enough = if net < 0.0 && n_free_electrons + net < 0.0 {
            ((n_free_electrons + delta_above) / -delta_below).clamp(0.0, 1.0)
        } else {
            1.0
        };

        // Apply pass
        let mut applied = 0.0;
        for i in i_first..i_cloud_end {
            let volume = self.stack.volume(i);
            let mut delta_this_level = 0.0;
            let fills = self.stack.fills_row_mut(i);
            for (s, trap) in self.traps.iter().enumerate() {
                let old = fills[s];
                let target = self.probs.fill_from_empty[s]
                    + (self.probs.fill_from_full[s] - self.probs.fill_from_empty[s]) * old;
                let new = old + (target - old) * enough;
                delta_this_level += (old - new) * trap.density;
                fills[s] = new;
            }
            applied += delta_this_level * volume;
        }
        for i in i_cloud_end..i_end {
            let volume = self.stack.volume(i);
            let mut delta_this_level = 0.0;
            let fills = self.stack.fills_row_mut(i);
            for (s, trap) in self.traps.iter().enumerate() {
                let released_fraction = fills[s] * self.probs.release_empty[s];
                fills[s] -= released_fraction;
                delta_this_level += released_fraction * trap.density;
            }
            applied += delta_this_level * volume;
        }

        Ok(applied)
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &WatermarkStack {
        &self.stack
    }
}
