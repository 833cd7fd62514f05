//! # Data Loading and Output
//!
//! Reads tab-separated tables with a header row. The first `num_inputs` columns
//! are input features and must be finite. Any remaining columns are outputs, in
//! which an empty cell, `NA` or `NaN` marks a missing observation.
//!
//! Prediction tables are written in the same format, with a `_mean`, `_lower`
//! and `_upper` column per output.

use crate::missing::MISSING;
use crate::regressor::Prediction;
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed TSV: {0}")]
    CsvError(#[from] csv::Error),

    #[error("The file has {found} columns, but {required} input columns were requested.")]
    TooFewColumns { found: usize, required: usize },

    #[error("Row {row} has {found} fields, but the header has {expected}.")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Row {row}, column '{column}': '{value}' is not a number.")]
    NotANumber {
        row: usize,
        column: String,
        value: String,
    },

    #[error(
        "Row {row}, column '{column}' is an input feature and must be a finite number, but is missing or non-finite."
    )]
    NonFiniteInput { row: usize, column: String },

    #[error("The file contains a header but no data rows.")]
    Empty,

    #[error("Prediction has {found} output columns, but {expected} output names were given.")]
    OutputNameMismatch { expected: usize, found: usize },
}

/// A table split into features and outputs.
#[derive(Debug, Clone)]
pub struct Table {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    /// Shape `[n_rows, num_inputs]`.
    pub inputs: Array2<f64>,
    /// Shape `[n_rows, num_outputs]`; missing cells hold `MISSING`.
    pub outputs: Array2<f64>,
}

/// Loads a TSV whose first `num_inputs` columns are features.
pub fn load_table(path: &Path, num_inputs: usize) -> Result<Table, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let header: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
    if header.len() < num_inputs {
        return Err(DataError::TooFewColumns {
            found: header.len(),
            required: num_inputs,
        });
    }
    let num_outputs = header.len() - num_inputs;

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    let mut rows = 0;
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let row = index + 1;
        if record.len() != header.len() {
            return Err(DataError::RaggedRow {
                row,
                expected: header.len(),
                found: record.len(),
            });
        }
        for (column, field) in record.iter().enumerate() {
            let value = internal::parse_cell(field).ok_or_else(|| DataError::NotANumber {
                row,
                column: header[column].clone(),
                value: field.to_string(),
            })?;
            if column < num_inputs {
                if !value.is_finite() {
                    return Err(DataError::NonFiniteInput {
                        row,
                        column: header[column].clone(),
                    });
                }
                inputs.push(value);
            } else {
                outputs.push(value);
            }
        }
        rows += 1;
    }
    if rows == 0 {
        return Err(DataError::Empty);
    }
    log::info!(
        "Loaded {} rows with {} inputs and {} outputs from {}",
        rows,
        num_inputs,
        num_outputs,
        path.display()
    );

    let output_names = header[num_inputs..].to_vec();
    let mut input_names = header;
    input_names.truncate(num_inputs);
    Ok(Table {
        input_names,
        output_names,
        inputs: internal::into_matrix(inputs, rows, num_inputs)?,
        outputs: internal::into_matrix(outputs, rows, num_outputs)?,
    })
}

/// Writes the mean, and the bounds when present, of every output.
pub fn write_predictions(
    path: &Path,
    output_names: &[String],
    prediction: &Prediction,
) -> Result<(), DataError> {
    let (rows, columns) = prediction.mean.dim();
    if columns != output_names.len() {
        return Err(DataError::OutputNameMismatch {
            expected: output_names.len(),
            found: columns,
        });
    }
    let bounds = prediction.lower.as_ref().zip(prediction.upper.as_ref());

    let mut file = BufWriter::new(File::create(path)?);
    let mut header = Vec::with_capacity(3 * columns);
    for name in output_names {
        header.push(format!("{name}_mean"));
        if bounds.is_some() {
            header.push(format!("{name}_lower"));
            header.push(format!("{name}_upper"));
        }
    }
    writeln!(file, "{}", header.join("\t"))?;

    for i in 0..rows {
        let mut fields = Vec::with_capacity(3 * columns);
        for j in 0..columns {
            fields.push(prediction.mean[[i, j]].to_string());
            if let Some((lower, upper)) = bounds {
                fields.push(lower[[i, j]].to_string());
                fields.push(upper[[i, j]].to_string());
            }
        }
        writeln!(file, "{}", fields.join("\t"))?;
    }
    file.flush()?;
    Ok(())
}

mod internal {
    use super::*;

    /// Parses a cell, mapping the missing-value spellings to `MISSING`.
    pub(super) fn parse_cell(field: &str) -> Option<f64> {
        let trimmed = field.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("na") || trimmed.eq_ignore_ascii_case("nan") {
            return Some(MISSING);
        }
        trimmed.parse::<f64>().ok()
    }

    pub(super) fn into_matrix(
        values: Vec<f64>,
        rows: usize,
        columns: usize,
    ) -> Result<Array2<f64>, DataError> {
        Array2::from_shape_vec((rows, columns), values).map_err(|_| DataError::RaggedRow {
            row: rows,
            expected: columns,
            found: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::missing::is_missing;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_tsv(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn loads_features_and_outputs_with_missing_cells() {
        let file = write_tsv("x\ty1\ty2\n0.5\t1.0\tNA\n1.5\t\t2.0\n2.5\tNaN\t3.0\n");
        let table = load_table(file.path(), 1).unwrap();
        assert_eq!(table.input_names, vec!["x"]);
        assert_eq!(table.output_names, vec!["y1", "y2"]);
        assert_eq!(table.inputs, array![[0.5], [1.5], [2.5]]);
        assert_eq!(table.outputs[[0, 0]], 1.0);
        assert!(is_missing(table.outputs[[0, 1]]));
        assert!(is_missing(table.outputs[[1, 0]]));
        assert!(is_missing(table.outputs[[2, 0]]));
        assert_eq!(table.outputs[[2, 1]], 3.0);
    }

    #[test]
    fn missing_input_feature_is_rejected() {
        let file = write_tsv("x\ty\nNA\t1.0\n");
        let err = load_table(file.path(), 1).unwrap_err();
        assert!(matches!(err, DataError::NonFiniteInput { row: 1, .. }));
    }

    #[test]
    fn text_cell_is_rejected() {
        let file = write_tsv("x\ty\n1.0\tabc\n");
        let err = load_table(file.path(), 1).unwrap_err();
        assert!(matches!(err, DataError::NotANumber { row: 1, .. }));
    }

    #[test]
    fn ragged_and_empty_files_are_rejected() {
        let ragged = write_tsv("x\ty\n1.0\t2.0\t3.0\n");
        assert!(matches!(
            load_table(ragged.path(), 1).unwrap_err(),
            DataError::RaggedRow { row: 1, expected: 2, found: 3 }
        ));
        let empty = write_tsv("x\ty\n");
        assert!(matches!(load_table(empty.path(), 1).unwrap_err(), DataError::Empty));
        let narrow = write_tsv("x\n1.0\n");
        assert!(matches!(
            load_table(narrow.path(), 2).unwrap_err(),
            DataError::TooFewColumns { found: 1, required: 2 }
        ));
    }

    #[test]
    fn predictions_are_written_with_bounds() {
        let prediction = Prediction {
            mean: array![[1.0], [2.0]],
            lower: Some(array![[0.5], [1.5]]),
            upper: Some(array![[1.5], [2.5]]),
        };
        let file = NamedTempFile::new().unwrap();
        write_predictions(file.path(), &["y".to_string()], &prediction).unwrap();
        let written = std::fs::read_to_string(file.path()).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "y_mean\ty_lower\ty_upper");
        assert_eq!(lines[1], "1\t0.5\t1.5");
        assert_eq!(lines.len(), 3);
    }
}
