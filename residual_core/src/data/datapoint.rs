use std::fmt::Write;

use ndarray::{Array1, ArrayView1};

/// One unreduced observation from a control step.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDatapoint {
    pub x: Array1<f64>,
    pub y: Array1<f64>,
}

impl RawDatapoint {
    pub fn new(x: ArrayView1<'_, f64>, y: ArrayView1<'_, f64>) -> Self {
        Self {
            x: x.to_owned(),
            y: y.to_owned(),
        }
    }
}

/// Comma-separated row with a trailing newline.
///
/// Values use the shortest exponent form that parses back to the same `f64`.
pub fn format_row(values: ArrayView1<'_, f64>, out: &mut String) {
    for (idx, value) in values.iter().enumerate() {
        if idx > 0 {
            out.push(',');
        }
        // Writing into a String cannot fail.
        let _ = write!(out, "{value:e}");
    }
    out.push('\n');
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn row_round_trips_through_text() {
        let values = array![0.1, -2.5e-7, 1.0 / 3.0, 12345.678];
        let mut row = String::new();
        format_row(values.view(), &mut row);

        assert!(row.ends_with('\n'));
        let parsed: Vec<f64> = row
            .trim_end()
            .split(',')
            .map(|field| field.parse().unwrap())
            .collect();
        assert_eq!(parsed, values.to_vec());
    }
}
