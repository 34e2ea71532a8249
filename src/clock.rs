//! Clocking engine: drive an image through parallel and serial transfers.
//!
//! Each column is clocked independently: its pixels move one-by-one toward
//! the readout register, interacting with the trap managers at every
//! simulated transfer. The express matrix decides how many identical
//! transfers each simulated one stands in for, and trap-state snapshots let
//! every express pass replay the column from a consistent starting point.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayViewMut1, Axis};

use crate::ccd::CCD;
use crate::error::CtiError;
use crate::roe::{ExpressMatrix, ROE};
use crate::trap_managers::TrapManagerSet;
use crate::traps::TrapList;

/// Everything needed to clock one direction (parallel or serial): the
/// readout electronics, the well-filling model, the trap species, and the
/// schedule controls.
#[derive(Debug, Clone)]
pub struct CtiParams {
    pub roe: ROE,
    pub ccd: CCD,
    pub traps: TrapList,
    /// Number of express passes; 0 means exact (one pass per transfer).
    pub express: usize,
    /// Gap in pixels between the readout register and the first image row.
    pub offset: usize,
    /// First row (inclusive) of the transfer window.
    pub window_start: usize,
    /// One past the last row of the transfer window; negative means the full
    /// extent.
    pub window_stop: i64,
}

impl CtiParams {
    pub fn new(roe: ROE, ccd: CCD, traps: TrapList, express: usize) -> Self {
        Self {
            roe,
            ccd,
            traps,
            express,
            offset: 0,
            window_start: 0,
            window_stop: -1,
        }
    }
}

fn normalise_window(start: usize, stop: i64, n_rows: usize) -> (usize, usize) {
    let stop = if stop < 0 {
        n_rows
    } else {
        (stop as usize).min(n_rows)
    };
    (start.min(n_rows), stop)
}

/// Clock every column of `image` toward row 0, updating it in place.
pub(crate) fn clock_charge_in_one_direction(
    image: &mut Array2<f64>,
    params: &CtiParams,
) -> Result<(), CtiError> {
    let (n_rows, n_cols) = image.dim();
    if n_rows == 0 || n_cols == 0 || params.traps.is_empty() {
        return Ok(());
    }
    let (row_start, row_stop) = normalise_window(params.window_start, params.window_stop, n_rows);
    if row_start >= row_stop {
        return Ok(());
    }

    let matrix = params.roe.express_matrix(n_rows, params.express, params.offset);
    let store_matrix = params.roe.store_trap_states_matrix(&matrix);
    let max_n_transfers = n_rows + params.offset;
    let dwell_time = params.roe.dwell_times[0];
    let phase = *params.ccd.phase(0);

    // Built once; each column gets its own copy so workers never share
    // mutable trap state
    let prototype = TrapManagerSet::new(&params.traps, max_n_transfers, phase, dwell_time)?;

    if params.roe.empty_traps_between_columns {
        // Columns are mutually independent: fan out across workers, each
        // owning its own managers and snapshots
        image
            .axis_iter_mut(Axis(1))
            .into_par_iter()
            .try_for_each(|mut column| {
                let mut managers = prototype.clone();
                clock_column(
                    &mut column,
                    &mut managers,
                    &matrix,
                    &store_matrix,
                    params,
                    row_start,
                    row_stop,
                )
            })?;
    } else {
        // Trap state carries across columns, so they must run in order
        let mut managers = prototype;
        for mut column in image.axis_iter_mut(Axis(1)) {
            clock_column(
                &mut column,
                &mut managers,
                &matrix,
                &store_matrix,
                params,
                row_start,
                row_stop,
            )?;
        }
    }

    Ok(())
}

fn clock_column(
    column: &mut ArrayViewMut1<f64>,
    managers: &mut TrapManagerSet,
    matrix: &ExpressMatrix,
    store_matrix: &[bool],
    params: &CtiParams,
    row_start: usize,
    row_stop: usize,
) -> Result<(), CtiError> {
    let n_rows = matrix.n_rows();
    if params.roe.empty_traps_between_columns {
        managers.reset();
    }
    // Baseline snapshot for the first pass: the column-start trap state
    managers.store();

    let prune_threshold = params.roe.prune_n_electrons;
    let pruning = prune_threshold > 0.0 && params.roe.prune_frequency > 0;
    let mut n_transfers_done: usize = 0;

    for e in 0..matrix.n_express() {
        managers.restore();
        let mut first_transfer_of_pass = true;

        for r in row_start..row_stop {
            let multiplier = matrix.multiplier(e, r);
            if multiplier == 0.0 {
                continue;
            }

            if first_transfer_of_pass && params.roe.empty_traps_for_first_transfers {
                managers.reset();
            }
            first_transfer_of_pass = false;
            n_transfers_done += 1;

            let n_free_electrons = column[r];
            if pruning
                && n_free_electrons < prune_threshold
                && n_transfers_done % params.roe.prune_frequency != 0
                && managers.n_trapped_electrons() < prune_threshold
            {
                continue;
            }

            let delta = managers.release_and_capture(n_free_electrons)?;
            column[r] = n_free_electrons + delta * multiplier;

            if store_matrix[e * n_rows + r] {
                managers.store();
            }
        }
    }

    Ok(())
}

fn check_non_negative(image: &Array2<f64>) -> Result<(), CtiError> {
    if let Some(value) = image.iter().find(|&&value| value < 0.0) {
        return Err(CtiError::Domain(format!(
            "negative pixel value {value} in input image"
        )));
    }
    Ok(())
}

/// Core of `add_cti` without the input validation, so the correction loop
/// can pass intermediate images with small negative excursions.
fn add_cti_to_image(
    image: &Array2<f64>,
    parallel: Option<&CtiParams>,
    serial: Option<&CtiParams>,
) -> Result<Array2<f64>, CtiError> {
    let mut output = image.to_owned();

    if let Some(params) = parallel {
        clock_charge_in_one_direction(&mut output, params)?;
    }
    if let Some(params) = serial {
        // Serial clocking reads each row out of the register: run the same
        // engine over the transposed image
        let mut transposed = output.t().to_owned();
        clock_charge_in_one_direction(&mut transposed, params)?;
        output = transposed.t().to_owned();
    }

    Ok(output)
}

/// Add CTI trails to an image: parallel (row) clocking first, then serial
/// (column) clocking, each with its own electronics, CCD, and trap species.
/// Returns the trailed image; the input is not modified.
pub fn add_cti(
    image: &Array2<f64>,
    parallel: Option<&CtiParams>,
    serial: Option<&CtiParams>,
) -> Result<Array2<f64>, CtiError> {
    check_non_negative(image)?;
    add_cti_to_image(image, parallel, serial)
}

/// Remove CTI trails by iterating the forward model: repeatedly trail the
/// current estimate and subtract the residual against the observed image.
/// A handful of iterations converges to well below one electron per pixel.
pub fn remove_cti(
    image: &Array2<f64>,
    n_iterations: usize,
    parallel: Option<&CtiParams>,
    serial: Option<&CtiParams>,
) -> Result<Array2<f64>, CtiError> {
    check_non_negative(image)?;

    let mut corrected = image.to_owned();
    for iteration in 1..=n_iterations {
        let trailed = add_cti_to_image(&corrected, parallel, serial)?;

        let mut max_residual = 0.0_f64;
        ndarray::Zip::from(&mut corrected)
            .and(&trailed)
            .and(image)
            .for_each(|corrected_value, &trailed_value, &observed_value| {
                let residual = trailed_value - observed_value;
                *corrected_value -= residual;
                max_residual = max_residual.max(residual.abs());
            });

        log::debug!("remove_cti iteration {iteration}: max |residual| = {max_residual:.3e}");
    }

    Ok(corrected)
}
