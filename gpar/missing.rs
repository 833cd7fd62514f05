//! # Missing-Value Bookkeeping
//!
//! Targets are stored as dense `f64` matrices in which an absent observation is
//! the `MISSING` sentinel. The sentinel is never inspected through arithmetic:
//! every consumer asks [`is_missing`] or builds an [`observed_mask`] and selects
//! rows explicitly, so a missing value cannot leak into a kernel matrix.
//!
//! The three building blocks of the layer chain live here:
//!
//! - [`merge`] splices a compressed vector of updates into a column at the
//!   positions flagged by a mask.
//! - [`last`] walks a sequence and flags its final element.
//! - [`per_output`] partitions the rows of a target matrix by missingness, one
//!   output column at a time.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use thiserror::Error;

/// The sentinel marking an unobserved target value.
pub const MISSING: f64 = f64::NAN;

#[derive(Error, Debug, PartialEq)]
pub enum MissingError {
    #[error("Original ({original}) and mask ({mask}) must have the same length.")]
    MaskLengthMismatch { original: usize, mask: usize },

    #[error("Mask selects {selected} positions but {updates} updates were supplied.")]
    UpdateCountMismatch { selected: usize, updates: usize },
}

/// Returns `true` when `value` is the missing sentinel.
#[inline]
pub fn is_missing(value: f64) -> bool {
    value.is_nan()
}

/// Flags the observed (non-missing) entries of a column.
pub fn observed_mask(column: ArrayView1<f64>) -> Array1<bool> {
    column.mapv(|v| !is_missing(v))
}

/// Row indices selected by `mask`, in order.
pub fn mask_indices(mask: ArrayView1<bool>) -> Vec<usize> {
    mask.iter()
        .enumerate()
        .filter_map(|(i, &keep)| keep.then_some(i))
        .collect()
}

/// Selects the rows of `x` flagged by `mask`.
pub fn select_rows(x: ArrayView2<f64>, mask: ArrayView1<bool>) -> Array2<f64> {
    x.select(Axis(0), &mask_indices(mask))
}

/// Selects the entries of `column` flagged by `mask`.
pub fn select_entries(column: ArrayView1<f64>, mask: ArrayView1<bool>) -> Array1<f64> {
    column.select(Axis(0), &mask_indices(mask))
}

/// Replaces the entries of `original` flagged by `mask` with `updates`.
///
/// `updates` is compressed: it holds one value per `true` in `mask`, consumed in
/// order. Neither input is modified.
///
/// ```
/// use gpar::missing::merge;
/// use ndarray::array;
///
/// let merged = merge(
///     array![1.0, 2.0, 3.0, 4.0].view(),
///     array![5.0, 6.0].view(),
///     array![true, false, true, false].view(),
/// )
/// .unwrap();
/// assert_eq!(merged, array![5.0, 2.0, 6.0, 4.0]);
/// ```
pub fn merge<T: Copy>(
    original: ArrayView1<T>,
    updates: ArrayView1<T>,
    mask: ArrayView1<bool>,
) -> Result<Array1<T>, MissingError> {
    if original.len() != mask.len() {
        return Err(MissingError::MaskLengthMismatch {
            original: original.len(),
            mask: mask.len(),
        });
    }
    let selected = mask.iter().filter(|&&m| m).count();
    if selected != updates.len() {
        return Err(MissingError::UpdateCountMismatch {
            selected,
            updates: updates.len(),
        });
    }

    // Counts were checked above, so the update iterator never runs dry.
    let mut next_update = updates.iter().copied();
    Ok(original
        .iter()
        .zip(mask.iter())
        .map(|(&value, &replace)| {
            if replace {
                next_update.next().unwrap_or(value)
            } else {
                value
            }
        })
        .collect())
}

/// Walks `xs`, yielding `(is_last, element)` for every element whose index is
/// listed in `keys` (every index when `keys` is `None`).
///
/// `is_last` is true only for the final element of the whole sequence, so a
/// selection that omits the final index never reports a last element.
pub fn last<'a, T>(
    xs: &'a [T],
    keys: Option<&'a [usize]>,
) -> impl Iterator<Item = (bool, &'a T)> + 'a {
    let final_index = xs.len().checked_sub(1);
    xs.iter()
        .enumerate()
        .filter(move |(i, _)| keys.is_none_or(|k| k.contains(i)))
        .map(move |(i, x)| (Some(i) == final_index, x))
}

/// One step of [`per_output`]: the values of a single output over the rows that
/// survive to this layer, and the mask that selected those rows from the rows
/// that survived the previous layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub column: Array1<f64>,
    pub mask: Array1<bool>,
}

impl Partition {
    /// Flags the observed entries of [`Partition::column`].
    pub fn observed(&self) -> Array1<bool> {
        observed_mask(self.column.view())
    }
}

/// Lazy, restartable walk over the output columns of a target matrix.
///
/// Clone the iterator before consuming it to walk the partitions again.
#[derive(Debug, Clone)]
pub struct PerOutput {
    remaining: Array2<f64>,
    output: usize,
    keep: bool,
}

/// Partitions the rows of `y` by missingness, one output at a time.
///
/// For output `i` the rows that observed `i` are kept. With `keep`, rows that
/// miss `i` but observed some later output are kept as well (carrying the
/// sentinel), so later layers still see them. Rows not kept are dropped from
/// every subsequent partition.
pub fn per_output(y: ArrayView2<f64>, keep: bool) -> PerOutput {
    PerOutput {
        remaining: y.to_owned(),
        output: 0,
        keep,
    }
}

impl Iterator for PerOutput {
    type Item = Partition;

    fn next(&mut self) -> Option<Partition> {
        let num_outputs = self.remaining.ncols();
        if self.output >= num_outputs {
            return None;
        }
        let i = self.output;

        let mut available = observed_mask(self.remaining.column(i));
        if self.keep && i + 1 < num_outputs {
            let future = self.remaining.slice(s![.., i + 1..]);
            for (flag, row) in available.iter_mut().zip(future.rows()) {
                *flag |= row.iter().any(|&v| !is_missing(v));
            }
        }

        let column = select_entries(self.remaining.column(i), available.view());
        self.remaining = select_rows(self.remaining.view(), available.view());
        self.output += 1;

        Some(Partition {
            column,
            mask: available,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.remaining.ncols().saturating_sub(self.output);
        (left, Some(left))
    }
}

impl ExactSizeIterator for PerOutput {}
