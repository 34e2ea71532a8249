//! Trap species parameters.
//!
//! A trap species is described by its volume density (traps per pixel), how
//! quickly it captures free electrons, and how quickly it releases them
//! again. Capture may be effectively instantaneous or act over a finite
//! timescale, and the release timescale may be a single value or a
//! log-normal continuum of values sharing one set of watermarks.

use crate::error::CtiError;

fn check_density(density: f64) -> Result<(), CtiError> {
    if !(density >= 0.0) {
        return Err(CtiError::config(format!(
            "trap density must be non-negative, got {density}"
        )));
    }
    Ok(())
}

fn check_timescale(name: &str, timescale: f64) -> Result<(), CtiError> {
    if !(timescale > 0.0) {
        return Err(CtiError::config(format!(
            "trap {name} must be positive, got {timescale}"
        )));
    }
    Ok(())
}

/// A species whose capture is treated as instantaneous; only release has a
/// finite timescale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapInstantCapture {
    pub density: f64,
    pub release_timescale: f64,
}

impl TrapInstantCapture {
    pub fn new(density: f64, release_timescale: f64) -> Result<Self, CtiError> {
        check_density(density)?;
        check_timescale("release timescale", release_timescale)?;
        Ok(Self {
            density,
            release_timescale,
        })
    }

    pub fn emission_rate(&self) -> f64 {
        1.0 / self.release_timescale
    }

    /// Instant capture is modelled as an infinite capture rate; the fill
    /// probabilities treat a zero rate as the instant-capture marker.
    pub fn capture_rate(&self) -> f64 {
        0.0
    }
}

/// A species with a finite capture timescale competing against release over
/// the same dwell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapSlowCapture {
    pub density: f64,
    pub release_timescale: f64,
    pub capture_timescale: f64,
}

impl TrapSlowCapture {
    pub fn new(
        density: f64,
        release_timescale: f64,
        capture_timescale: f64,
    ) -> Result<Self, CtiError> {
        check_density(density)?;
        check_timescale("release timescale", release_timescale)?;
        check_timescale("capture timescale", capture_timescale)?;
        Ok(Self {
            density,
            release_timescale,
            capture_timescale,
        })
    }

    pub fn emission_rate(&self) -> f64 {
        1.0 / self.release_timescale
    }

    pub fn capture_rate(&self) -> f64 {
        1.0 / self.capture_timescale
    }
}

/// Instant capture with the release timescale drawn from a log-normal
/// distribution: a continuum of sub-species sharing one watermark, whose
/// state is stored as time elapsed since filling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapInstantCaptureContinuum {
    pub density: f64,
    /// Median of the release-timescale distribution.
    pub release_timescale: f64,
    /// Log-normal shape parameter (sigma of ln timescale).
    pub release_timescale_sigma: f64,
}

impl TrapInstantCaptureContinuum {
    pub fn new(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
    ) -> Result<Self, CtiError> {
        check_density(density)?;
        check_timescale("release timescale", release_timescale)?;
        check_timescale("release timescale sigma", release_timescale_sigma)?;
        Ok(Self {
            density,
            release_timescale,
            release_timescale_sigma,
        })
    }

    /// Emission rate at the median timescale.
    pub fn emission_rate(&self) -> f64 {
        1.0 / self.release_timescale
    }

    pub fn capture_rate(&self) -> f64 {
        0.0
    }
}

/// Continuum release combined with a finite capture timescale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapSlowCaptureContinuum {
    pub density: f64,
    pub release_timescale: f64,
    pub release_timescale_sigma: f64,
    pub capture_timescale: f64,
}

impl TrapSlowCaptureContinuum {
    pub fn new(
        density: f64,
        release_timescale: f64,
        release_timescale_sigma: f64,
        capture_timescale: f64,
    ) -> Result<Self, CtiError> {
        check_density(density)?;
        check_timescale("release timescale", release_timescale)?;
        check_timescale("release timescale sigma", release_timescale_sigma)?;
        check_timescale("capture timescale", capture_timescale)?;
        Ok(Self {
            density,
            release_timescale,
            release_timescale_sigma,
            capture_timescale,
        })
    }

    pub fn emission_rate(&self) -> f64 {
        1.0 / self.release_timescale
    }

    pub fn capture_rate(&self) -> f64 {
        1.0 / self.capture_timescale
    }
}

/// All trap species for one clocking direction, grouped by watermarking
/// discipline. Each group gets its own manager; an absent group is simply an
/// empty list.
#[derive(Debug, Clone, Default)]
pub struct TrapList {
    pub instant_capture: Vec<TrapInstantCapture>,
    pub slow_capture: Vec<TrapSlowCapture>,
    pub instant_capture_continuum: Vec<TrapInstantCaptureContinuum>,
    pub slow_capture_continuum: Vec<TrapSlowCaptureContinuum>,
}

impl TrapList {
    pub fn is_empty(&self) -> bool {
        self.instant_capture.is_empty()
            && self.slow_capture.is_empty()
            && self.instant_capture_continuum.is_empty()
            && self.slow_capture_continuum.is_empty()
    }

    /// Total trap density across every species in every group.
    pub fn total_density(&self) -> f64 {
        self.instant_capture.iter().map(|t| t.density).sum::<f64>()
            + self.slow_capture.iter().map(|t| t.density).sum::<f64>()
            + self
                .instant_capture_continuum
                .iter()
                .map(|t| t.density)
                .sum::<f64>()
            + self
                .slow_capture_continuum
                .iter()
                .map(|t| t.density)
                .sum::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn instant_capture_rates() {
        let trap = TrapInstantCapture::new(10.0, -1.0 / 0.5_f64.ln()).unwrap();
        // release_timescale = 1/ln2 gives a half-life of one dwell
        assert_relative_eq!(trap.emission_rate(), std::f64::consts::LN_2, epsilon = 1e-12);
        assert_eq!(trap.capture_rate(), 0.0);
    }

    #[test]
    fn slow_capture_rates() {
        let trap = TrapSlowCapture::new(5.0, 2.0, 0.5).unwrap();
        assert_relative_eq!(trap.emission_rate(), 0.5);
        assert_relative_eq!(trap.capture_rate(), 2.0);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(TrapInstantCapture::new(-1.0, 1.0).is_err());
        assert!(TrapInstantCapture::new(1.0, 0.0).is_err());
        assert!(TrapInstantCapture::new(1.0, -2.0).is_err());
        assert!(TrapSlowCapture::new(1.0, 1.0, 0.0).is_err());
        assert!(TrapInstantCaptureContinuum::new(1.0, 1.0, 0.0).is_err());
        assert!(TrapSlowCaptureContinuum::new(1.0, 1.0, 0.5, -1.0).is_err());
        // NaN parameters must not slip through the comparisons
        assert!(TrapInstantCapture::new(f64::NAN, 1.0).is_err());
        assert!(TrapInstantCapture::new(1.0, f64::NAN).is_err());
    }

    #[test]
    fn trap_list_groups_are_independent() {
        let mut traps = TrapList::default();
        assert!(traps.is_empty());

        traps
            .instant_capture
            .push(TrapInstantCapture::new(10.0, 1.0).unwrap());
        traps
            .slow_capture
            .push(TrapSlowCapture::new(2.0, 1.0, 0.1).unwrap());
        assert!(!traps.is_empty());
        assert_relative_eq!(traps.total_density(), 12.0);
    }
}
