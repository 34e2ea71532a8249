//! Managers for continuum-release trap species.
//!
//! A continuum species draws its release timescale from a log-normal
//! distribution, so a slab's state cannot be a single fill fraction: traps
//! with short timescales drain first and skew the surviving population
//! toward long timescales. The slab instead stores the time elapsed since it
//! was filled, and the effective fill fraction comes from integrating the
//! exponential decay over the timescale distribution:
//!
//! ```text
//! fill(t) = ∫ lognormal(τ; median, σ) · exp(−t/τ) dτ
//! ```
//!
//! The integral and its inverse are precomputed per species into a monotone
//! lookup table, so the hot loop only ever interpolates.

use crate::ccd::CCDPhase;
use crate::error::CtiError;
use crate::traps::{TrapInstantCaptureContinuum, TrapSlowCaptureContinuum};
use crate::watermarks::WatermarkStack;

use super::FillProbabilities;

/// Trapezoid integration of the decayed fill fraction over the log-normal
/// timescale distribution, normalised so that fill(0) is exactly 1.
fn integrate_fill_fraction(median: f64, sigma: f64, elapsed: f64) -> f64 {
    const N_STEPS: usize = 200;
    let mu = median.ln();
    let lo = mu - 6.0 * sigma;
    let hi = mu + 6.0 * sigma;
    let du = (hi - lo) / N_STEPS as f64;

    let mut weighted = 0.0;
    let mut norm = 0.0;
    for i in 0..=N_STEPS {
        let u = lo + i as f64 * du;
        let z = (u - mu) / sigma;
        let pdf = (-0.5 * z * z).exp();
        let weight = if i == 0 || i == N_STEPS { 0.5 } else { 1.0 };
        norm += weight * pdf;
        // τ = e^u, so the per-timescale survival factor is exp(−t·e^(−u))
        weighted += weight * pdf * (-elapsed * (-u).exp()).exp();
    }
    weighted / norm
}

/// Precomputed, invertible fill-fraction profile for one continuum species.
#[derive(Debug, Clone)]
pub(crate) struct ReleaseProfile {
    /// Ascending elapsed times; first entry is 0.
    times: Vec<f64>,
    /// Matching fill fractions; strictly decreasing from 1.
    fills: Vec<f64>,
}

impl ReleaseProfile {
    pub fn new(median: f64, sigma: f64) -> Self {
        const N_POINTS: usize = 256;
        // Log-spaced knots spanning well below the fastest and well beyond
        // the slowest timescales in the distribution
        let t_max = median * (6.0 * sigma).exp() * 40.0;
        let t_min = median * (-6.0 * sigma).exp() * 1e-3;

        let mut times = Vec::with_capacity(N_POINTS + 1);
        times.push(0.0);
        let log_lo = t_min.ln();
        let log_hi = t_max.ln();
        for i in 0..N_POINTS {
            let fraction = i as f64 / (N_POINTS - 1) as f64;
            times.push((log_lo + fraction * (log_hi - log_lo)).exp());
        }

        let fills = times
            .iter()
            .map(|&t| integrate_fill_fraction(median, sigma, t))
            .collect();

        Self { times, fills }
    }

    /// Effective fill fraction after `elapsed` time since filling.
    pub fn fill_at(&self, elapsed: f64) -> f64 {
        if elapsed <= 0.0 {
            return 1.0;
        }
        let n = self.times.len();
        if elapsed >= self.times[n - 1] {
            return self.fills[n - 1];
        }
        let i = self.times.partition_point(|&t| t <= elapsed);
        let t0 = self.times[i - 1];
        let t1 = self.times[i];
        let fraction = (elapsed - t0) / (t1 - t0);
        self.fills[i - 1] + (self.fills[i] - self.fills[i - 1]) * fraction
    }

    /// Elapsed time whose effective fill fraction equals `fill`: the inverse
    /// of `fill_at` on the table domain.
    pub fn time_at(&self, fill: f64) -> f64 {
        if fill >= 1.0 {
            return 0.0;
        }
        let n = self.fills.len();
        if fill <= self.fills[n - 1] {
            return self.times[n - 1];
        }
        let i = self.fills.partition_point(|&f| f > fill);
        let f0 = self.fills[i - 1];
        let f1 = self.fills[i];
        let fraction = (fill - f0) / (f1 - f0);
        self.times[i - 1] + (self.times[i] - self.times[i - 1]) * fraction
    }

    /// Elapsed time representing traps that have fully drained.
    pub fn empty_time(&self) -> f64 {
        *self.times.last().unwrap()
    }
}

/// Instant capture with continuum release: the two-phase release-then-capture
/// update of the instant-capture manager, expressed through the
/// elapsed-time/fill-fraction conversions.
#[derive(Debug, Clone)]
pub struct TrapManagerInstantCaptureContinuum {
    traps: Vec<TrapInstantCaptureContinuum>,
    profiles: Vec<ReleaseProfile>,
    phase: CCDPhase,
    stack: WatermarkStack,
    dwell_time: f64,
}

const N_WATERMARKS_PER_TRANSFER_INSTANT: usize = 1;
const N_WATERMARKS_PER_TRANSFER_SLOW: usize = 2;

impl TrapManagerInstantCaptureContinuum {
    pub fn new(
        traps: Vec<TrapInstantCaptureContinuum>,
        max_n_transfers: usize,
        phase: CCDPhase,
    ) -> Result<Self, CtiError> {
        if traps.is_empty() {
            return Err(CtiError::config(
                "a trap manager needs at least one species",
            ));
        }
        let capacity = max_n_transfers * N_WATERMARKS_PER_TRANSFER_INSTANT + 1;
        let stack = WatermarkStack::new(capacity, traps.len());
        let profiles = traps
            .iter()
            .map(|t| ReleaseProfile::new(t.release_timescale, t.release_timescale_sigma))
            .collect();
        Ok(Self {
            traps,
            profiles,
            phase,
            stack,
            dwell_time: 1.0,
        })
    }

    /// Continuum release works directly off the profile tables; only the
    /// dwell time itself needs recording.
    pub fn set_fill_probabilities_from_dwell_time(&mut self, dwell_time: f64) {
        self.dwell_time = dwell_time;
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
            let times = self.stack.fills_row(i);
            let mut per_volume = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                per_volume += self.profiles[s].fill_at(times[s]) * trap.density;
            }
            n_trapped += per_volume * volume;
        }
        n_trapped
    }

    /// Advance every slab's elapsed time by one dwell and sum what decayed.
    fn release(&mut self) -> f64 {
        let dwell_time = self.dwell_time;
        let mut n_released = 0.0;
        for i in self.stack.i_first_active()..self.stack.i_end_active() {
            let volume = self.stack.volume(i);
            let mut released_this_level = 0.0;
            for s in 0..self.traps.len() {
                let elapsed = self.stack.fills_row(i)[s];
                let advanced = elapsed + dwell_time;
                let released_fraction =
                    self.profiles[s].fill_at(elapsed) - self.profiles[s].fill_at(advanced);
                released_this_level += released_fraction * self.traps[s].density;
                self.stack.fills_row_mut(i)[s] = advanced;
            }
            n_released += released_this_level * volume;
        }
        n_released
    }

    fn empty_per_volume(&self, i: usize) -> f64 {
        let times = self.stack.fills_row(i);
        self.traps
            .iter()
            .enumerate()
            .map(|(s, trap)| (1.0 - self.profiles[s].fill_at(times[s])) * trap.density)
            .sum()
    }

    fn total_density(&self) -> f64 {
        self.traps.iter().map(|t| t.density).sum()
    }

    /// Blend a slab's effective fills a fraction `enough` of the way to full
    /// and store the equivalent elapsed times.
    fn blend_level(&mut self, i: usize, enough: f64) {
        for s in 0..self.traps.len() {
            let elapsed = self.stack.fills_row(i)[s];
            let fill = self.profiles[s].fill_at(elapsed);
            let blended = fill * (1.0 - enough) + enough;
            self.stack.fills_row_mut(i)[s] = self.profiles[s].time_at(blended);
        }
    }

    /// Set a slab to fills of exactly `fill` (1.0 for a fresh full slab).
    fn set_level_fill(&mut self, i: usize, fill: f64) {
        for s in 0..self.traps.len() {
            self.stack.fills_row_mut(i)[s] = self.profiles[s].time_at(fill);
        }
    }

    fn capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        let cloud = self.phase.cloud_fractional_volume(n_free_electrons);
        if cloud == 0.0 {
            return Ok(0.0);
        }

        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();
        let i_above = self.stack.index_above_cloud(cloud);

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
            // Full capture: same topology as the occupancy manager, with
            // elapsed time 0 as "full"
            if self.stack.is_empty() {
                self.stack.ensure_index(i_first)?;
                *self.stack.volume_mut(i_first) = cloud;
                self.stack.fills_row_mut(i_first).fill(0.0);
                self.stack.grow_active(1);
            } else if i_above == i_first {
                let i_new = self.stack.make_room_below()?;
                self.stack.grow_active(1);
                *self.stack.volume_mut(i_new) = cloud;
                self.stack.fills_row_mut(i_new).fill(0.0);
                *self.stack.volume_mut(i_new + 1) -= cloud;
            } else if i_above == i_end {
                self.stack.set_single_level(i_above - 1, cloud);
                self.stack.fills_row_mut(i_above - 1).fill(0.0);
            } else {
                let overwritten =
                    self.stack.cumulative_volume_below(i_above) + self.stack.volume(i_above);
                *self.stack.volume_mut(i_above) = overwritten - cloud;
                let n_active_new = self.stack.n_active() - (i_above - i_first) + 1;
                self.stack.collapse_bottom_to(i_above - 1, n_active_new);
                *self.stack.volume_mut(i_above - 1) = cloud;
                self.stack.fills_row_mut(i_above - 1).fill(0.0);
            }
            Ok(n_would_capture)
        } else {
            let enough = n_free_electrons / n_would_capture;
            if self.stack.is_empty() {
                self.stack.ensure_index(i_first)?;
                *self.stack.volume_mut(i_first) = cloud;
                self.stack.grow_active(1);
                self.set_level_fill(i_first, enough);
            } else if i_above == i_first {
                let i_new = self.stack.make_room_below()?;
                self.stack.grow_active(1);
                *self.stack.volume_mut(i_new) = cloud;
                self.set_level_fill(i_new, enough);
                *self.stack.volume_mut(i_new + 1) -= cloud;
            } else if i_above == i_end {
                self.stack.ensure_index(i_end)?;
                let new_top_volume = cloud - self.stack.total_volume();
                *self.stack.volume_mut(i_end) = new_top_volume;
                self.stack.grow_active(1);
                // The fresh top slab starts empty of trapped electrons
                self.set_level_fill(i_end, 0.0);
                for i in i_first..=i_end {
                    self.blend_level(i, enough);
                }
            } else {
                self.stack.shift_up(i_above)?;
                self.stack.grow_active(1);
                let volume_below = self.stack.cumulative_volume_below(i_above);
                let new_volume = cloud - volume_below;
                *self.stack.volume_mut(i_above) = new_volume;
                *self.stack.volume_mut(i_above + 1) -= new_volume;
                for i in i_first..=i_above {
                    self.blend_level(i, enough);
                }
            }
            Ok(n_would_capture * enough)
        }
    }

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

/// Slow capture with continuum release: split-at-cloud topology, with the
/// capture competition below the cloud driven by the capture rate against
/// the median emission rate and mapped through the elapsed-time profile.
#[derive(Debug, Clone)]
pub struct TrapManagerSlowCaptureContinuum {
    traps: Vec<TrapSlowCaptureContinuum>,
    profiles: Vec<ReleaseProfile>,
    phase: CCDPhase,
    stack: WatermarkStack,
    probs: FillProbabilities,
    dwell_time: f64,
}

impl TrapManagerSlowCaptureContinuum {
    pub fn new(
        traps: Vec<TrapSlowCaptureContinuum>,
        max_n_transfers: usize,
        phase: CCDPhase,
    ) -> Result<Self, CtiError> {
        if traps.is_empty() {
            return Err(CtiError::config(
                "a trap manager needs at least one species",
            ));
        }
        let capacity = max_n_transfers * N_WATERMARKS_PER_TRANSFER_SLOW + 1;
        let stack = WatermarkStack::new(capacity, traps.len());
        let profiles = traps
            .iter()
            .map(|t| ReleaseProfile::new(t.release_timescale, t.release_timescale_sigma))
            .collect();
        Ok(Self {
            traps,
            profiles,
            phase,
            stack,
            probs: FillProbabilities::default(),
            dwell_time: 1.0,
        })
    }

    pub fn set_fill_probabilities_from_dwell_time(&mut self, dwell_time: f64) {
        let capture_rates: Vec<f64> = self.traps.iter().map(|t| t.capture_rate()).collect();
        let emission_rates: Vec<f64> = self.traps.iter().map(|t| t.emission_rate()).collect();
        self.probs = FillProbabilities::from_rates(&capture_rates, &emission_rates, dwell_time);
        self.dwell_time = dwell_time;
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
            let times = self.stack.fills_row(i);
            let mut per_volume = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                per_volume += self.profiles[s].fill_at(times[s]) * trap.density;
            }
            n_trapped += per_volume * volume;
        }
        n_trapped
    }

    /// As for slow capture, but brand-new slabs must be marked explicitly
    /// empty: in time-space the empty sentinel would read as freshly full.
    fn split_at_cloud(&mut self, cloud: f64) -> Result<usize, CtiError> {
        let i_first = self.stack.i_first_active();
        if cloud == 0.0 {
            return Ok(i_first);
        }

        if self.stack.is_empty() {
            self.stack.ensure_index(i_first)?;
            *self.stack.volume_mut(i_first) = cloud;
            self.stack.grow_active(1);
            for s in 0..self.traps.len() {
                self.stack.fills_row_mut(i_first)[s] = self.profiles[s].empty_time();
            }
            return Ok(i_first + 1);
        }

        let i_end = self.stack.i_end_active();
        let i_above = self.stack.index_above_cloud(cloud);

        if i_above == i_end {
            let extra = cloud - self.stack.total_volume();
            if extra > 0.0 {
                self.stack.ensure_index(i_end)?;
                *self.stack.volume_mut(i_end) = extra;
                self.stack.grow_active(1);
                for s in 0..self.traps.len() {
                    self.stack.fills_row_mut(i_end)[s] = self.profiles[s].empty_time();
                }
                return Ok(i_end + 1);
            }
            return Ok(i_end);
        }

        let volume_below = self.stack.cumulative_volume_below(i_above);
        let lower_part = cloud - volume_below;
        if lower_part == 0.0 {
            return Ok(i_above);
        }

        self.stack.shift_up(i_above)?;
        self.stack.grow_active(1);
        *self.stack.volume_mut(i_above) = lower_part;
        *self.stack.volume_mut(i_above + 1) -= lower_part;
        Ok(i_above + 1)
    }

    pub fn release_and_capture(&mut self, n_free_electrons: f64) -> Result<f64, CtiError> {
        let dwell_time = self.dwell_time;

        // The cloud that sets the split point includes the charge released
        // this transfer, so released electrons stay eligible for recapture
        // by every slab they can reach. Computed without mutating; the
        // below-cloud relaxation already accounts for emission there.
        let mut n_released = 0.0;
        for i in self.stack.i_first_active()..self.stack.i_end_active() {
            let volume = self.stack.volume(i);
            let times = self.stack.fills_row(i);
            let mut released_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                let released_fraction = self.profiles[s].fill_at(times[s])
                    - self.profiles[s].fill_at(times[s] + dwell_time);
                released_this_level += released_fraction * trap.density;
            }
            n_released += released_this_level * volume;
        }

        let cloud = self
            .phase
            .cloud_fractional_volume(n_free_electrons + n_released);
        let i_cloud_end = self.split_at_cloud(cloud)?;

        let i_first = self.stack.i_first_active();
        let i_end = self.stack.i_end_active();

        // Trial pass
        let mut delta_below = 0.0;
        for i in i_first..i_cloud_end {
            let volume = self.stack.volume(i);
            let times = self.stack.fills_row(i);
            let mut delta_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                let old = self.profiles[s].fill_at(times[s]);
                let target = self.probs.fill_from_empty[s]
                    + (self.probs.fill_from_full[s] - self.probs.fill_from_empty[s]) * old;
                delta_this_level += (old - target) * trap.density;
            }
            delta_below += delta_this_level * volume;
        }
        let mut delta_above = 0.0;
        for i in i_cloud_end..i_end {
            let volume = self.stack.volume(i);
            let times = self.stack.fills_row(i);
            let mut delta_this_level = 0.0;
            for (s, trap) in self.traps.iter().enumerate() {
                let released_fraction = self.profiles[s].fill_at(times[s])
                    - self.profiles[s].fill_at(times[s] + dwell_time);
                delta_this_level += released_fraction * trap.density;
            }
            delta_above += delta_this_level * volume;
        }

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
            for s in 0..self.traps.len() {
                let elapsed = self.stack.fills_row(i)[s];
                let old = self.profiles[s].fill_at(elapsed);
                let target = self.probs.fill_from_empty[s]
                    + (self.probs.fill_from_full[s] - self.probs.fill_from_empty[s]) * old;
                let new = old + (target - old) * enough;
                delta_this_level += (old - new) * self.traps[s].density;
                self.stack.fills_row_mut(i)[s] = self.profiles[s].time_at(new);
            }
            applied += delta_this_level * volume;
        }
        for i in i_cloud_end..i_end {
            let volume = self.stack.volume(i);
            let mut delta_this_level = 0.0;
            for s in 0..self.traps.len() {
                let elapsed = self.stack.fills_row(i)[s];
                let advanced = elapsed + dwell_time;
                let released_fraction =
                    self.profiles[s].fill_at(elapsed) - self.profiles[s].fill_at(advanced);
                delta_this_level += released_fraction * self.traps[s].density;
                self.stack.fills_row_mut(i)[s] = advanced;
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
