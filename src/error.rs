//! Error types for CTI modelling and correction.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while configuring or running the CTI engine.
#[derive(Error, Debug)]
pub enum CtiError {
    /// Invalid model parameters (negative density, non-positive timescale,
    /// bad well shape, empty dwell times, ...)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A transfer tried to create a watermark beyond the preallocated
    /// capacity. Indicates a bug in the max-transfers bookkeeping.
    #[error("Watermark capacity exceeded: needed index {needed}, capacity {capacity}")]
    Capacity { needed: usize, capacity: usize },

    /// Underlying file I/O failure while reading or writing an image.
    #[error("Image I/O error for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An image file that opened fine but does not parse: bad header,
    /// non-numeric cell, or too few values for the declared dimensions.
    #[error("Malformed image file '{}': {reason}", .path.display())]
    ImageFormat { path: PathBuf, reason: String },

    /// Caller contract violation, e.g. a negative pixel value handed to the
    /// well-filling model.
    #[error("Domain error: {0}")]
    Domain(String),
}

impl CtiError {
    /// Shorthand for a configuration failure.
    pub fn config(msg: impl Into<String>) -> Self {
        CtiError::Configuration(msg.into())
    }
}
