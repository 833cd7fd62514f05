use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum KernelError {
    #[error("Kernel reads input column {column}, but the inputs only have {available} columns.")]
    ColumnOutOfRange { column: usize, available: usize },

    #[error("Kernel was given {params} parameters for {columns} selected columns.")]
    ParameterCountMismatch { params: usize, columns: usize },

    #[error("Inputs have {left} and {right} columns; a kernel needs both sides to agree.")]
    InputWidthMismatch { left: usize, right: usize },
}

/// Covariance functions used to build the layers of a chain.
///
/// Stationary and linear components act on an explicit list of input columns,
/// which is how a layer separates the original features from the
/// autoregressive output columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    /// `variance` everywhere.
    Constant { variance: f64 },
    /// Exponentiated quadratic with one length scale per selected column.
    Eq {
        variance: f64,
        scales: Array1<f64>,
        columns: Vec<usize>,
    },
    /// Dot product of the selected columns, each multiplied by its slope.
    Linear {
        slopes: Array1<f64>,
        columns: Vec<usize>,
    },
    Sum(Vec<Kernel>),
}

impl Kernel {
    pub fn constant(variance: f64) -> Self {
        Kernel::Constant { variance }
    }

    pub fn eq(variance: f64, scales: Array1<f64>, columns: Vec<usize>) -> Self {
        Kernel::Eq {
            variance,
            scales,
            columns,
        }
    }

    pub fn linear(slopes: Array1<f64>, columns: Vec<usize>) -> Self {
        Kernel::Linear { slopes, columns }
    }

    /// Covariance matrix between the rows of `a` and the rows of `b`.
    pub fn matrix(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, KernelError> {
        if a.ncols() != b.ncols() {
            return Err(KernelError::InputWidthMismatch {
                left: a.ncols(),
                right: b.ncols(),
            });
        }
        match self {
            Kernel::Constant { variance } => Ok(Array2::from_elem((a.nrows(), b.nrows()), *variance)),
            Kernel::Eq {
                variance,
                scales,
                columns,
            } => {
                let a_scaled = internal::project(a, columns, scales.view(), internal::Scaling::Divide)?;
                let b_scaled = internal::project(b, columns, scales.view(), internal::Scaling::Divide)?;
                let dists = internal::squared_distances(a_scaled.view(), b_scaled.view());
                Ok(dists.mapv(|d| variance * (-0.5 * d).exp()))
            }
            Kernel::Linear { slopes, columns } => {
                let a_scaled = internal::project(a, columns, slopes.view(), internal::Scaling::Multiply)?;
                let b_scaled = internal::project(b, columns, slopes.view(), internal::Scaling::Multiply)?;
                Ok(a_scaled.dot(&b_scaled.t()))
            }
            Kernel::Sum(kernels) => {
                let mut total = Array2::zeros((a.nrows(), b.nrows()));
                for kernel in kernels {
                    total += &kernel.matrix(a, b)?;
                }
                Ok(total)
            }
        }
    }

    /// Diagonal of `matrix(a, a)` without forming the full matrix.
    pub fn diagonal(&self, a: ArrayView2<f64>) -> Result<Array1<f64>, KernelError> {
        match self {
            Kernel::Constant { variance } => Ok(Array1::from_elem(a.nrows(), *variance)),
            Kernel::Eq {
                variance,
                scales,
                columns,
            } => {
                internal::check_columns(a.ncols(), columns, scales.len())?;
                Ok(Array1::from_elem(a.nrows(), *variance))
            }
            Kernel::Linear { slopes, columns } => {
                let scaled = internal::project(a, columns, slopes.view(), internal::Scaling::Multiply)?;
                Ok(scaled.mapv(|v| v * v).sum_axis(Axis(1)))
            }
            Kernel::Sum(kernels) => {
                let mut total = Array1::zeros(a.nrows());
                for kernel in kernels {
                    total += &kernel.diagonal(a)?;
                }
                Ok(total)
            }
        }
    }
}

impl std::ops::Add for Kernel {
    type Output = Kernel;

    fn add(self, rhs: Kernel) -> Kernel {
        match (self, rhs) {
            (Kernel::Sum(mut left), Kernel::Sum(right)) => {
                left.extend(right);
                Kernel::Sum(left)
            }
            (Kernel::Sum(mut left), right) => {
                left.push(right);
                Kernel::Sum(left)
            }
            (left, right) => Kernel::Sum(vec![left, right]),
        }
    }
}

mod internal {
    use super::*;

    #[derive(Clone, Copy)]
    pub(super) enum Scaling {
        Divide,
        Multiply,
    }

    pub(super) fn check_columns(
        available: usize,
        columns: &[usize],
        params: usize,
    ) -> Result<(), KernelError> {
        if params != columns.len() {
            return Err(KernelError::ParameterCountMismatch {
                params,
                columns: columns.len(),
            });
        }
        if let Some(&column) = columns.iter().find(|&&c| c >= available) {
            return Err(KernelError::ColumnOutOfRange { column, available });
        }
        Ok(())
    }

    /// Selects `columns` of `x` and rescales each by its parameter.
    pub(super) fn project(
        x: ArrayView2<f64>,
        columns: &[usize],
        params: ArrayView1<f64>,
        scaling: Scaling,
    ) -> Result<Array2<f64>, KernelError> {
        check_columns(x.ncols(), columns, params.len())?;
        let mut selected = x.select(Axis(1), columns);
        for (mut column, &param) in selected.columns_mut().into_iter().zip(params.iter()) {
            match scaling {
                Scaling::Divide => column.mapv_inplace(|v| v / param),
                Scaling::Multiply => column.mapv_inplace(|v| v * param),
            }
        }
        Ok(selected)
    }

    /// Pairwise squared Euclidean distances, clamped at zero against round-off.
    pub(super) fn squared_distances(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        let a_norms = a.mapv(|v| v * v).sum_axis(Axis(1));
        let b_norms = b.mapv(|v| v * v).sum_axis(Axis(1));
        let mut dists = a.dot(&b.t()) * -2.0;
        for ((i, j), d) in dists.indexed_iter_mut() {
            *d = (*d + a_norms[i] + b_norms[j]).max(0.0);
        }
        dists
    }
}
