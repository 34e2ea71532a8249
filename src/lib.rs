//! Charge Transfer Inefficiency (CTI) modelling and correction for CCD
//! detectors.
//!
//! During readout a CCD shifts each pixel's electron packet through the
//! silicon toward the register. Lattice defects ("traps") grab electrons
//! from passing packets and let them go later, smearing point sources into
//! trails. This crate implements the forward model (add trails to a clean
//! image) and its iterative inverse (remove trails from an observed image),
//! built around a watermark representation of the trap fill state inside
//! each pixel and an express schedule that amortises identical transfers.

pub mod ccd;
pub mod clock;
pub mod error;
pub mod image_io;
pub mod roe;
pub mod trap_managers;
pub mod traps;

mod watermarks;

// Re-exports for easier access
pub use ccd::{CCDPhase, CCD};
pub use clock::{add_cti, remove_cti, CtiParams};
pub use error::CtiError;
pub use image_io::{load_image_from_txt, save_image_to_txt};
pub use roe::{ExpressMatrix, ROE};
pub use trap_managers::TrapManagerSet;
pub use traps::{
    TrapInstantCapture, TrapInstantCaptureContinuum, TrapList, TrapSlowCapture,
    TrapSlowCaptureContinuum,
};
