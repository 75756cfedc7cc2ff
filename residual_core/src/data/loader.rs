//! Reconstruct training arrays from logged text files.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use ndarray::Array2;

use crate::error::{ResidualError, ResidualResult};

/// Read one comma-separated matrix. Blank lines are skipped; a single-column
/// file still yields shape `(rows, 1)`.
pub fn read_matrix<P: AsRef<Path>>(path: P) -> ResidualResult<Array2<f64>> {
    let path = path.as_ref();
    let context = path.display().to_string();
    let file = File::open(path).map_err(|err| ResidualError::io(format!("opening {context}"), &err))?;
    let reader = BufReader::new(file);

    let mut width: Option<usize> = None;
    let mut values = Vec::new();
    let mut rows = 0usize;

    for (line_no, line) in reader.lines().enumerate() {
        let line = line.map_err(|err| ResidualError::io(format!("reading {context}"), &err))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let before = values.len();
        for field in trimmed.split(',') {
            let value: f64 = field.trim().parse().map_err(|_| {
                ResidualError::parse(
                    format!("{context} line {}", line_no + 1),
                    format!("'{}' is not a number", field.trim()),
                )
            })?;
            values.push(value);
        }

        let row_width = values.len() - before;
        match width {
            None => width = Some(row_width),
            Some(expected) if expected != row_width => {
                return Err(ResidualError::shape(
                    expected,
                    row_width,
                    format!("{context} line {}", line_no + 1),
                ));
            }
            Some(_) => {}
        }
        rows += 1;
    }

    Array2::from_shape_vec((rows, width.unwrap_or(0)), values)
        .map_err(|err| ResidualError::parse(context, err.to_string()))
}

/// Load the paired x/y logs written by
/// [`RecordDataStrategy`](crate::strategy::RecordDataStrategy).
///
/// Both results are two-dimensional and share the same row count.
pub fn load_data<P, Q>(x_path: P, y_path: Q) -> ResidualResult<(Array2<f64>, Array2<f64>)>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let x = read_matrix(x_path)?;
    let y = read_matrix(y_path)?;
    if x.nrows() != y.nrows() {
        return Err(ResidualError::shape(x.nrows(), y.nrows(), "logged y row count"));
    }
    Ok((x, y))
}
