//! Manager for instant-capture trap species.
//!
//! Release and capture happen in two phases per transfer: every filled trap
//! first releases its dwell-time fraction, then the enlarged cloud captures
//! instantly into every slab it reaches. Capture rewrites the watermark
//! topology: everything at or below the cloud height collapses into a single
//! fully-filled slab, with the partially-overwritten slab above trimmed so
//! the volumes above the cloud are preserved.

use crate::ccd::CCDPhase;
use crate::error::CtiError;
use crate::traps::TrapInstantCapture;
use crate::watermarks::WatermarkStack;

use super::FillProbabilities;

/// Instant capture fills at most one new watermark level per transfer.
const N_WATERMARKS_PER_TRANSFER: usize = 1;

#[derive(Debug, Clone)]
pub struct TrapManagerInstantCapture {
    traps: Vec<TrapInstantCapture>,
    phase: CCDPhase,
    stack: WatermarkStack,
    probs: FillProbabilities,
}

impl TrapManagerInstantCapture {
    /// Allocate watermark buffers at the capacity implied by
    /// `max_n_transfers`. The initial snapshot is the empty state.
    pub fn new(
        traps: Vec<TrapInstantCapture>,
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

    /// Total number of electrons currently held in traps.
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

    /// Release electrons from every active slab and update the fills.
    fn release(&mut self) -> f64 {
        let mut n_released = 0.0;
        for i in self.stack.i_first_active()..self.stack.i_end_active() {
            let volume = self.stack.volume(i);
            let mut released_this_level = 0.0;
            let fills = self.stack.fills_row_mut(i);
            for (s, trap) in self.traps.iter().enumerate() {
                let released_fraction = fills[s] * self.probs.release_empty[s];
                fills[s] -= released_fraction;
                released_this_level += released_fraction * trap.density;
            }
            n_released += released_this_level * volume;
        }
        n_released
    }

    /// Empty capacity per unit volume of slab `i`, i.e. how many electrons
    /// the slab's unfilled traps could take.
    fn empty_per_volume(&self, i: usize) -> f64 {
        self.stack
            .fills_row(i)
            .iter()
            .zip(&self.traps)
            .map(|(fill, trap)| (1.0 - fill) * trap.density)
            .sum()
    }

    fn total_density(&self) -> f64 {
        self.traps.iter().map(|t| t.density).sum()
    }

    /// Capture electrons into every slab the cloud reaches and rewrite the
    /// watermark topology. Returns the number of captured electrons.
    fn capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        let cloud = self.phase.cloud_fractional_volume(n_free_electrons);
        if cloud == 0.0 {
            return Ok(0.0);
        }

        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();
        let i_above = self.stack.index_above_cloud(cloud);

        // Electrons the reached traps could take: full slabs below the
        // cloud, plus the partial region up to the cloud itself. Above the
        // stack that region is virgin volume with every trap empty.
        let mut n_would_capture = 0.0;
        let mut cumulative = 0.0;
        for i in i_first..i_above {
            let volume = self.stack.volume(i);
            n_would_capture += self.empty_per_volume(i) * volume;
            cumulative += volume;
        }
        let partial_volume = cloud - cumulative;
        if partial_volume > 0.0 {
            let empty = if i_above < i_end {
                self.empty_per_volume(i_above)
            } else {
                self.total_density()
            };
            n_would_capture += empty * partial_volume;
        }

        if n_free_electrons >= n_would_capture {
            self.capture_full(cloud, i_above)?;
            Ok(n_would_capture)
        } else {
            // Each reached slab fills only a fraction of the way, so the
            // captured count matches the electrons actually available. Only
            // relevant for tiny clouds that reach disproportionately many
            // traps.
            let enough = n_free_electrons / n_would_capture;
            self.capture_partial(cloud, i_above, enough)?;
            Ok(n_would_capture * enough)
        }
    }

    /// Full capture: everything up to the cloud becomes one fully-filled
    /// slab.
    fn capture_full(&mut self, cloud: f64, i_above: usize) -> Result<(), CtiError> {
        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();

        if self.stack.is_empty() {
            // First capture
            self.stack.ensure_index(i_first)?;
            *self.stack.volume_mut(i_first) = cloud;
            self.stack.fills_row_mut(i_first).fill(1.0);
            self.stack.grow_active(1);
        } else if i_above == i_first {
            // Cloud below the whole stack: insert a new bottom slab and
            // carve its volume out of the old bottom
            let i_new = self.stack.make_room_below()?;
            self.stack.grow_active(1);
            *self.stack.volume_mut(i_new) = cloud;
            self.stack.fills_row_mut(i_new).fill(1.0);
            *self.stack.volume_mut(i_new + 1) -= cloud;
        } else if i_above == i_end {
            // Cloud above the whole stack: all levels collapse into one
            self.stack.set_single_level(i_above - 1, cloud);
            self.stack.fills_row_mut(i_above - 1).fill(1.0);
        } else {
            // Cloud inside the stack: levels at or below i_above collapse,
            // and the straddled slab keeps only its part above the cloud
            let overwritten =
                self.stack.cumulative_volume_below(i_above) + self.stack.volume(i_above);
            *self.stack.volume_mut(i_above) = overwritten - cloud;
            let n_active_new = self.stack.n_active() - (i_above - i_first) + 1;
            self.stack.collapse_bottom_to(i_above - 1, n_active_new);
            *self.stack.volume_mut(i_above - 1) = cloud;
            self.stack.fills_row_mut(i_above - 1).fill(1.0);
        }
        Ok(())
    }

    /// Partial capture: reached slabs blend a fraction `enough` of the way
    /// to full instead of collapsing.
    fn capture_partial(&mut self, cloud: f64, i_above: usize, enough: f64) -> Result<(), CtiError> {
        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();

        if self.stack.is_empty() {
            self.stack.ensure_index(i_first)?;
            *self.stack.volume_mut(i_first) = cloud;
            self.stack.fills_row_mut(i_first).fill(enough);
            self.stack.grow_active(1);
        } else if i_above == i_first {
            // New bottom slab at exactly `enough`; the displaced region's
            // old fills do not carry over
            let i_new = self.stack.make_room_below()?;
            self.stack.grow_active(1);
            *self.stack.volume_mut(i_new) = cloud;
            self.stack.fills_row_mut(i_new).fill(enough);
            *self.stack.volume_mut(i_new + 1) -= cloud;
        } else if i_above == i_end {
            // New top slab from the stack top to the cloud, then every
            // reached slab moves part-way to full
            self.stack.ensure_index(i_end)?;
            let new_top_volume = cloud - self.stack.total_volume();
            *self.stack.volume_mut(i_end) = new_top_volume;
            self.stack.grow_active(1);
            for i in i_first..=i_end {
                for fill in self.stack.fills_row_mut(i) {
                    *fill = *fill * (1.0 - enough) + enough;
                }
            }
        } else {
            // Split the straddled slab at the cloud height, then blend
            // everything at or below the new boundary
            self.stack.shift_up(i_above)?;
            self.stack.grow_active(1);
            let volume_below = self.stack.cumulative_volume_below(i_above);
            let new_volume = cloud - volume_below;
            *self.stack.volume_mut(i_above) = new_volume;
            *self.stack.volume_mut(i_above + 1) -= new_volume;
            for i in i_first..=i_above {
                for fill in self.stack.fills_row_mut(i) {
                    *fill = *fill * (1.0 - enough) + enough;
                }
            }
        }
        Ok(())
    }

    /// The per-transfer update: release, then capture from the enlarged
    /// cloud. Returns released minus captured.
    pub fn release_and_capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        let n_released = self.release();
        let n_captured = self.capture(n_free_electrons + n_released)?;
        Ok(n_released - n_captured)
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &WatermarkStack {
        &self.stack
    }
}
