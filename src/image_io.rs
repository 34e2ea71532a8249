//! Plain-text image reader and writer.
//!
//! Format: a header line `n_rows n_columns`, then the pixel values row by
//! row, all whitespace-separated. Parsing is locale-independent and
//! tolerates arbitrary whitespace, including trailing newlines.

use std::fs;
use std::io::Write;
use std::path::Path;

use ndarray::Array2;

use crate::error::CtiError;

fn format_error(path: &Path, reason: impl Into<String>) -> CtiError {
    CtiError::ImageFormat {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Load a 2-D image from a text file.
pub fn load_image_from_txt(path: impl AsRef<Path>) -> Result<Array2<f64>, CtiError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| CtiError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tokens = contents.split_whitespace();

    let n_rows: usize = tokens
        .next()
        .ok_or_else(|| format_error(path, "missing row count in header"))?
        .parse()
        .map_err(|_| format_error(path, "invalid row count in header"))?;
    let n_columns: usize = tokens
        .next()
        .ok_or_else(|| format_error(path, "missing column count in header"))?
        .parse()
        .map_err(|_| format_error(path, "invalid column count in header"))?;

    let mut values = Vec::with_capacity(n_rows * n_columns);
    for token in tokens {
        let value: f64 = token
            .parse()
            .map_err(|_| format_error(path, format!("non-numeric value '{token}'")))?;
        values.push(value);
    }

    if values.len() != n_rows * n_columns {
        return Err(format_error(
            path,
            format!(
                "expected {} values for a {n_rows}x{n_columns} image, found {}",
                n_rows * n_columns,
                values.len()
            ),
        ));
    }

    Array2::from_shape_vec((n_rows, n_columns), values)
        .map_err(|e| format_error(path, e.to_string()))
}

/// Save a 2-D image to a text file in the same format.
pub fn save_image_to_txt(path: impl AsRef<Path>, image: &Array2<f64>) -> Result<(), CtiError> {
    let path = path.as_ref();
    let io_error = |source| CtiError::Io {
        path: path.to_path_buf(),
        source,
    };

    let (n_rows, n_columns) = image.dim();
    let mut buffer = String::new();
    buffer.push_str(&format!("{n_rows} {n_columns}\n"));
    for row in image.rows() {
        let mut first = true;
        for value in row {
            if !first {
                buffer.push(' ');
            }
            buffer.push_str(&format!("{value}"));
            first = false;
        }
        buffer.push('\n');
    }

    let mut file = fs::File::create(path).map_err(io_error)?;
    file.write_all(buffer.as_bytes()).map_err(io_error)?;
    Ok(())
}
