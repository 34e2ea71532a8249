//! Watermark stack: the fill state of all traps in one pixel volume.
//!
//! Each active level describes one contiguous slab of the pixel volume, with
//! a fractional volume and one fill value per trap species (a fill fraction
//! for occupancy-based managers, an elapsed time for continuum managers).
//! Slabs are ordered bottom-up: the lowest slab holds the deepest,
//! most-easily-reached traps. Storage is a pair of fixed-capacity buffers
//! plus a window [i_first_active, i_first_active + n_active) of live levels;
//! everything outside the window stays at the empty sentinel 0.0.

use crate::error::CtiError;

pub(crate) const EMPTY_WATERMARK: f64 = 0.0;

#[derive(Debug, Clone)]
pub(crate) struct WatermarkStack {
    /// Total number of levels the buffers can hold.
    capacity: usize,
    /// Fill values stored per level (one per trap species in the group).
    n_values: usize,
    volumes: Vec<f64>,
    fills: Vec<f64>,
    i_first_active: usize,
    n_active: usize,
    // Single-slot snapshot, duplicated buffers reused across store() calls.
    stored_volumes: Vec<f64>,
    stored_fills: Vec<f64>,
    stored_i_first_active: usize,
    stored_n_active: usize,
}

impl WatermarkStack {
    /// Allocate an empty stack. `capacity` comes from the clocker's
    /// max-transfers bookkeeping and never changes afterwards.
    pub fn new(capacity: usize, n_values: usize) -> Self {
        Self {
            capacity,
            n_values,
            volumes: vec![EMPTY_WATERMARK; capacity],
            fills: vec![EMPTY_WATERMARK; capacity * n_values],
            i_first_active: 0,
            n_active: 0,
            stored_volumes: vec![EMPTY_WATERMARK; capacity],
            stored_fills: vec![EMPTY_WATERMARK; capacity * n_values],
            stored_i_first_active: 0,
            stored_n_active: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn n_active(&self) -> usize {
        self.n_active
    }

    pub fn i_first_active(&self) -> usize {
        self.i_first_active
    }

    /// One past the top active level.
    pub fn i_end_active(&self) -> usize {
        self.i_first_active + self.n_active
    }

    pub fn is_empty(&self) -> bool {
        self.n_active == 0
    }

    pub fn volume(&self, i: usize) -> f64 {
        self.volumes[i]
    }

    pub fn volume_mut(&mut self, i: usize) -> &mut f64 {
        &mut self.volumes[i]
    }

    pub fn fills_row(&self, i: usize) -> &[f64] {
        &self.fills[i * self.n_values..(i + 1) * self.n_values]
    }

    pub fn fills_row_mut(&mut self, i: usize) -> &mut [f64] {
        &mut self.fills[i * self.n_values..(i + 1) * self.n_values]
    }

    /// Clear the active window without reallocating.
    pub fn reset(&mut self) {
        self.volumes.fill(EMPTY_WATERMARK);
        self.fills.fill(EMPTY_WATERMARK);
        self.i_first_active = 0;
        self.n_active = 0;
    }

    /// Save a by-value snapshot of the complete state. At most one snapshot
    /// is kept; a second store overwrites the first.
    pub fn store(&mut self) {
        self.stored_volumes.copy_from_slice(&self.volumes);
        self.stored_fills.copy_from_slice(&self.fills);
        self.stored_i_first_active = self.i_first_active;
        self.stored_n_active = self.n_active;
    }

    /// Restore the last stored snapshot.
    pub fn restore(&mut self) {
        self.volumes.copy_from_slice(&self.stored_volumes);
        self.fills.copy_from_slice(&self.stored_fills);
        self.i_first_active = self.stored_i_first_active;
        self.n_active = self.stored_n_active;
    }

    /// Sum of the active fractional volumes.
    pub fn total_volume(&self) -> f64 {
        self.volumes[self.i_first_active..self.i_end_active()]
            .iter()
            .sum()
    }

    /// Cumulative volume of the active levels strictly below level `i`.
    pub fn cumulative_volume_below(&self, i: usize) -> f64 {
        self.volumes[self.i_first_active..i].iter().sum()
    }

    /// Index of the lowest active level whose cumulative volume strictly
    /// exceeds the cloud, or one past the top if the cloud reaches above the
    /// whole stack. A cloud landing exactly on a slab boundary belongs to
    /// the level above that boundary.
    pub fn index_above_cloud(&self, cloud_fractional_volume: f64) -> usize {
        let mut cumulative = 0.0;
        for i in self.i_first_active..self.i_end_active() {
            cumulative += self.volumes[i];
            if cumulative > cloud_fractional_volume {
                return i;
            }
        }
        self.i_end_active()
    }

    /// Block-move levels [i_from, top] up by one cell to open a gap at
    /// `i_from`. The gap keeps its old contents; the active window is not
    /// adjusted here.
    pub fn shift_up(&mut self, i_from: usize) -> Result<(), CtiError> {
        let i_end = self.i_end_active();
        if i_end >= self.capacity {
            return Err(CtiError::Capacity {
                needed: i_end,
                capacity: self.capacity,
            });
        }
        self.volumes.copy_within(i_from..i_end, i_from + 1);
        self.fills.copy_within(
            i_from * self.n_values..i_end * self.n_values,
            (i_from + 1) * self.n_values,
        );
        Ok(())
    }

    /// Open a cell beneath the current bottom level, either by claiming
    /// headroom below `i_first_active` or by shifting the whole window up.
    /// Returns the index of the freed bottom cell; the caller fills it in
    /// and grows `n_active`. Either way the formerly-bottom level ends up at
    /// the returned index + 1.
    pub fn make_room_below(&mut self) -> Result<usize, CtiError> {
        if self.i_first_active > 0 {
            self.i_first_active -= 1;
        } else {
            self.shift_up(self.i_first_active)?;
        }
        Ok(self.i_first_active)
    }

    /// Fail if level `i` would fall outside the preallocated buffers.
    pub fn ensure_index(&self, i: usize) -> Result<(), CtiError> {
        if i >= self.capacity {
            return Err(CtiError::Capacity {
                needed: i,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn grow_active(&mut self, by: usize) {
        self.n_active += by;
    }

    /// Move the bottom of the active window up to `i_new_first` and set the
    /// level count, zeroing every cell that drops out of the window so
    /// inactive cells always read as the empty sentinel.
    pub fn collapse_bottom_to(&mut self, i_new_first: usize, n_active: usize) {
        for i in self.i_first_active..i_new_first {
            self.volumes[i] = EMPTY_WATERMARK;
            self.fills[i * self.n_values..(i + 1) * self.n_values].fill(EMPTY_WATERMARK);
        }
        self.i_first_active = i_new_first;
        self.n_active = n_active;
    }

    /// Make the stack a single level: one slab of the given volume at index
    /// `i`, everything else sentinel.
    pub fn set_single_level(&mut self, i: usize, volume: f64) {
        for j in self.i_first_active..self.i_end_active() {
            if j != i {
                self.volumes[j] = EMPTY_WATERMARK;
                self.fills[j * self.n_values..(j + 1) * self.n_values].fill(EMPTY_WATERMARK);
            }
        }
        self.volumes[i] = volume;
        self.i_first_active = i;
        self.n_active = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stack_with_levels(levels: &[(f64, f64)]) -> WatermarkStack {
        let mut stack = WatermarkStack::new(8, 1);
        for (i, (volume, fill)) in levels.iter().enumerate() {
            *stack.volume_mut(i) = *volume;
            stack.fills_row_mut(i)[0] = *fill;
        }
        stack.grow_active(levels.len());
        stack
    }

    #[test]
    fn index_above_cloud_uses_strict_comparison() {
        let stack = stack_with_levels(&[(0.2, 1.0), (0.3, 0.5), (0.1, 0.25)]);
        assert_eq!(stack.index_above_cloud(0.0), 0);
        assert_eq!(stack.index_above_cloud(0.1), 0);
        // Exactly on a boundary: the cloud sits on top of level 0
        assert_eq!(stack.index_above_cloud(0.2), 1);
        assert_eq!(stack.index_above_cloud(0.45), 1);
        assert_eq!(stack.index_above_cloud(0.55), 2);
        // Above the whole stack
        assert_eq!(stack.index_above_cloud(0.7), 3);
    }

    #[test]
    fn store_restore_round_trips() {
        let mut stack = stack_with_levels(&[(0.25, 0.75), (0.5, 0.5)]);
        stack.store();

        *stack.volume_mut(0) = 0.9;
        stack.fills_row_mut(1)[0] = 0.0;
        stack.collapse_bottom_to(1, 1);
        stack.restore();

        assert_eq!(stack.i_first_active(), 0);
        assert_eq!(stack.n_active(), 2);
        assert_relative_eq!(stack.volume(0), 0.25);
        assert_relative_eq!(stack.fills_row(1)[0], 0.5);

        // Snapshot idempotence: restoring twice gives the same state
        stack.restore();
        assert_relative_eq!(stack.volume(0), 0.25);
        assert_relative_eq!(stack.total_volume(), 0.75);
    }

    #[test]
    fn reset_matches_fresh_stack() {
        let mut stack = stack_with_levels(&[(0.25, 0.75), (0.5, 0.5)]);
        stack.reset();

        let fresh = WatermarkStack::new(8, 1);
        assert_eq!(stack.n_active(), fresh.n_active());
        assert_eq!(stack.i_first_active(), fresh.i_first_active());
        for i in 0..8 {
            assert_eq!(stack.volume(i), EMPTY_WATERMARK);
            assert_eq!(stack.fills_row(i)[0], EMPTY_WATERMARK);
        }
    }

    #[test]
    fn shift_up_moves_a_block_and_checks_capacity() {
        let mut stack = stack_with_levels(&[(0.1, 0.9), (0.2, 0.8), (0.3, 0.7)]);
        stack.shift_up(1).unwrap();
        // Gap at index 1 keeps its old contents; 2 and 3 hold the moved block
        assert_relative_eq!(stack.volume(0), 0.1);
        assert_relative_eq!(stack.volume(2), 0.2);
        assert_relative_eq!(stack.volume(3), 0.3);
        assert_relative_eq!(stack.fills_row(3)[0], 0.7);

        let mut full = WatermarkStack::new(3, 1);
        full.grow_active(3);
        assert!(matches!(
            full.shift_up(0),
            Err(CtiError::Capacity { .. })
        ));
    }

    #[test]
    fn make_room_below_prefers_headroom() {
        let mut stack = stack_with_levels(&[(0.1, 0.9), (0.2, 0.8)]);
        stack.collapse_bottom_to(1, 1); // leave headroom below

        let i_new = stack.make_room_below().unwrap();
        assert_eq!(i_new, 0);
        assert_eq!(stack.i_first_active(), 0);
        // Former bottom is directly above the freed cell
        assert_relative_eq!(stack.volume(1), 0.2);
    }

    #[test]
    fn collapse_zeroes_dropped_cells() {
        let mut stack = stack_with_levels(&[(0.1, 0.9), (0.2, 0.8), (0.3, 0.7)]);
        stack.collapse_bottom_to(2, 1);
        assert_eq!(stack.volume(0), EMPTY_WATERMARK);
        assert_eq!(stack.fills_row(0)[0], EMPTY_WATERMARK);
        assert_eq!(stack.volume(1), EMPTY_WATERMARK);
        assert_relative_eq!(stack.volume(2), 0.3);
    }
}
