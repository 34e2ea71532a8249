//! Readout electronics: clocking schedule and the express speed-up.
//!
//! A full readout performs `r + 1` transfers for the pixel at row `r`, which
//! is quadratic in image size if every transfer is simulated. The express
//! scheme instead splits the schedule into a small number of passes, each
//! simulating one transfer per row and weighting its electron delta by the
//! number of identical transfers it stands in for.

use crate::error::CtiError;

/// Clocking schedule plus the policies governing when trap states reset.
#[derive(Debug, Clone)]
pub struct ROE {
    /// Time spent in each step of the clock sequence within one pixel;
    /// length 1 for single-phase clocking.
    pub dwell_times: Vec<f64>,
    /// Reset the watermarks when starting each new column.
    pub empty_traps_between_columns: bool,
    /// Treat the trap state as empty for the first transfer of each express
    /// pass, approximating that early transfers see fresh silicon.
    pub empty_traps_for_first_transfers: bool,
    /// Round the express multipliers up to integers.
    pub use_integer_express_matrix: bool,
    /// Skip transfers whose free and trapped electrons both fall below this
    /// threshold. Zero disables pruning.
    pub prune_n_electrons: f64,
    /// Even when pruning, still process every nth transfer of a column.
    pub prune_frequency: usize,
}

impl Default for ROE {
    fn default() -> Self {
        Self {
            dwell_times: vec![1.0],
            empty_traps_between_columns: true,
            empty_traps_for_first_transfers: true,
            use_integer_express_matrix: false,
            prune_n_electrons: 0.0,
            prune_frequency: 20,
        }
    }
}

impl ROE {
    pub fn new(
        dwell_times: Vec<f64>,
        empty_traps_between_columns: bool,
        empty_traps_for_first_transfers: bool,
    ) -> Result<Self, CtiError> {
        if dwell_times.is_empty() {
            return Err(CtiError::config("dwell_times must not be empty"));
        }
        if dwell_times.iter().any(|&dt| !(dt > 0.0)) {
            return Err(CtiError::config("dwell_times must all be positive"));
        }
        Ok(Self {
            dwell_times,
            empty_traps_between_columns,
            empty_traps_for_first_transfers,
            ..Self::default()
        })
    }

    /// Build the express multiplier matrix for an image of `n_rows`, read
    /// out `offset` pixels from the register.
    ///
    /// `express` of 0 (or anything at least the transfer count) means exact:
    /// one pass per transfer. Each pass covers a contiguous band of the
    /// per-row transfer counts, and the bands partition the full schedule:
    /// the multipliers for row `r` always sum to exactly `r + offset + 1`,
    /// for fractional and integer matrices alike. Fractional multipliers
    /// scale a single simulated delta by a non-integer count, a documented
    /// approximation of the separate transfers they replace.
    pub fn express_matrix(&self, n_rows: usize, express: usize, offset: usize) -> ExpressMatrix {
        let n_transfers = n_rows + offset;
        let n_express = if express == 0 {
            n_transfers
        } else {
            express.min(n_transfers)
        };

        let mut max_multiplier = n_transfers as f64 / n_express as f64;
        if self.use_integer_express_matrix {
            max_multiplier = max_multiplier.ceil();
        }

        let mut values = vec![0.0; n_express * n_rows];
        for e in 0..n_express {
            for r in 0..n_rows {
                let total = (r + offset + 1) as f64;
                values[e * n_rows + r] =
                    (total - e as f64 * max_multiplier).clamp(0.0, max_multiplier);
            }
        }

        ExpressMatrix {
            n_express,
            n_rows,
            values,
        }
    }

    /// Mark where each express pass should snapshot the trap state so the
    /// next pass can resume from it: the row just below the next pass's
    /// first active row. Unused (all false) when the first transfers run
    /// with emptied traps, since every pass then restarts from the
    /// column-start state.
    pub fn store_trap_states_matrix(&self, matrix: &ExpressMatrix) -> Vec<bool> {
        let mut store = vec![false; matrix.n_express * matrix.n_rows];
        if self.empty_traps_for_first_transfers || matrix.n_express < 2 {
            return store;
        }
        for e in 0..matrix.n_express - 1 {
            let first_active = (0..matrix.n_rows).find(|&r| matrix.multiplier(e + 1, r) > 0.0);
            if let Some(r0) = first_active {
                if r0 > 0 {
                    store[e * matrix.n_rows + (r0 - 1)] = true;
                }
            }
        }
        store
    }
}

/// The express multiplier matrix: `multiplier(e, r)` is the number of
/// identical transfers represented by the one simulated transfer of row `r`
/// during pass `e`.
#[derive(Debug, Clone)]
pub struct ExpressMatrix {
    n_express: usize,
    n_rows: usize,
    values: Vec<f64>,
}

impl ExpressMatrix {
    pub fn n_express(&self) -> usize {
        self.n_express
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn multiplier(&self, e: usize, r: usize) -> f64 {
        self.values[e * self.n_rows + r]
    }

    /// Total transfers simulated for row `r` across all passes.
    pub fn column_sum(&self, r: usize) -> f64 {
        (0..self.n_express).map(|e| self.multiplier(e, r)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rejects_bad_dwell_times() {
        assert!(ROE::new(vec![], true, true).is_err());
        assert!(ROE::new(vec![0.0], true, true).is_err());
        assert!(ROE::new(vec![-1.0], true, true).is_err());
        assert!(ROE::new(vec![1.0, 0.5], true, true).is_ok());
    }

    #[test]
    fn express_zero_means_exact() {
        let roe = ROE::default();
        let matrix = roe.express_matrix(5, 0, 0);
        assert_eq!(matrix.n_express(), 5);
        // Pass e simulates one transfer for every row at or above e
        for e in 0..5 {
            for r in 0..5 {
                let expected = if r >= e { 1.0 } else { 0.0 };
                assert_relative_eq!(matrix.multiplier(e, r), expected);
            }
        }
    }

    #[test]
    fn column_sums_match_transfer_counts() {
        let roe = ROE::default();
        for &express in &[1, 5, 10, 200, 2000] {
            let matrix = roe.express_matrix(2000, express, 0);
            for r in (0..2000).step_by(97) {
                assert_relative_eq!(
                    matrix.column_sum(r),
                    (r + 1) as f64,
                    epsilon = 1e-9,
                    max_relative = 1e-12
                );
            }
            assert_relative_eq!(matrix.column_sum(1999), 2000.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn column_sums_include_the_offset() {
        let roe = ROE::default();
        let matrix = roe.express_matrix(100, 10, 17);
        for r in 0..100 {
            assert_relative_eq!(
                matrix.column_sum(r),
                (r + 17 + 1) as f64,
                max_relative = 1e-12
            );
        }
    }

    #[test]
    fn integer_matrix_is_integral_with_exact_sums() {
        let roe = ROE {
            use_integer_express_matrix: true,
            ..ROE::default()
        };
        let matrix = roe.express_matrix(97, 7, 3);
        for e in 0..matrix.n_express() {
            for r in 0..97 {
                let value = matrix.multiplier(e, r);
                assert_eq!(value, value.round(), "non-integer multiplier {value}");
            }
        }
        for r in 0..97 {
            assert_relative_eq!(matrix.column_sum(r), (r + 3 + 1) as f64);
        }
    }

    #[test]
    fn passes_cover_contiguous_bands() {
        let roe = ROE::default();
        let matrix = roe.express_matrix(64, 4, 0);
        for e in 0..4 {
            // Once a pass's multiplier rises above zero it stays positive
            let mut seen_active = false;
            for r in 0..64 {
                let active = matrix.multiplier(e, r) > 0.0;
                if seen_active {
                    assert!(active, "pass {e} went inactive again at row {r}");
                }
                seen_active |= active;
            }
        }
    }

    #[test]
    fn store_matrix_marks_the_handover_rows() {
        let roe = ROE {
            empty_traps_for_first_transfers: false,
            ..ROE::default()
        };
        let matrix = roe.express_matrix(8, 0, 0);
        let store = roe.store_trap_states_matrix(&matrix);

        // Exact schedule: pass e+1 first touches row e+1, so pass e stores
        // at row e
        for e in 0..7 {
            for r in 0..8 {
                let expected = r == e;
                assert_eq!(store[e * 8 + r], expected, "pass {e}, row {r}");
            }
        }
        // The final pass never stores
        assert!(store[7 * 8..].iter().all(|&s| !s));
    }

    #[test]
    fn store_matrix_empty_when_first_transfers_reset() {
        let roe = ROE::default();
        let matrix = roe.express_matrix(8, 4, 0);
        let store = roe.store_trap_states_matrix(&matrix);
        assert!(store.iter().all(|&s| !s));
    }
}
