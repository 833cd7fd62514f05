//! # Gaussian-Process Capability
//!
//! The layer chain never touches kernel algebra directly. It talks to the
//! [`Process`] trait, which exposes exactly what autoregressive chaining needs:
//! a mean, a covariance, joint sampling, a log-density, and conditioning through
//! an [`Observation`].
//!
//! Two observation kinds are supported:
//!
//! 1.  **Dense:** exact conditioning of `f` on noisy values `y = f(x) + e(x)`.
//! 2.  **Sparse:** the variational inducing-point approximation of Titsias
//!     (2009). The posterior of `f` is summarised by its values at a small set
//!     of inducing inputs `z`, and the evidence is replaced by its lower bound.
//!
//! Both produce a [`Posterior`], which is itself a [`Process`] and can be
//! conditioned again or used as the latent function of a layer.

use crate::kernel::{Kernel, KernelError};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{Cholesky, Diag, SolveTriangular, UPLO};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Jitter ladder tried, in order, when a covariance matrix fails to factorise.
const JITTER_LADDER: [f64; 6] = [0.0, 1e-10, 1e-8, 1e-6, 1e-5, 1e-4];

#[derive(Error, Debug)]
pub enum GpError {
    #[error("Kernel evaluation failed: {0}")]
    Kernel(#[from] KernelError),

    #[error(
        "Covariance matrix is not positive definite, even after adding a jitter of {jitter:.1e} to its diagonal."
    )]
    NotPositiveDefinite { jitter: f64 },

    #[error("A triangular solve failed: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),

    #[error("An observation has {inputs} input rows but {targets} targets.")]
    ObservationShape { inputs: usize, targets: usize },

    #[error("Sparse conditioning needs strictly positive noise variance, but found {0:e}.")]
    NonPositiveNoise(f64),

    #[error("Observed targets must be finite, but row {0} is not.")]
    NonFiniteTarget(usize),
}

/// A Gaussian process over rows of a design matrix.
pub trait Process: Debug + Send + Sync {
    fn mean(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError>;

    fn covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError>;

    /// Marginal variances at the rows of `x`.
    fn variance(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(self.covariance(x, x)?.diag().to_owned())
    }

    /// Draws one joint sample of the process at the rows of `x`.
    fn sample(&self, x: ArrayView2<f64>, rng: &mut dyn RngCore) -> Result<Array1<f64>, GpError> {
        let mean = self.mean(x)?;
        let chol = robust_cholesky(self.covariance(x, x)?)?;
        let z: Array1<f64> = (0..x.nrows()).map(|_| rng.sample(StandardNormal)).collect();
        Ok(mean + chol.dot(&z))
    }

    /// Joint Gaussian log-density of `y` at the rows of `x`.
    fn log_density(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<f64, GpError> {
        if x.nrows() != y.len() {
            return Err(GpError::ObservationShape {
                inputs: x.nrows(),
                targets: y.len(),
            });
        }
        let residual = &y - &self.mean(x)?;
        let chol = robust_cholesky(self.covariance(x, x)?)?;
        let whitened = solve_lower_vec(&chol, residual.view())?;
        let log_det: f64 = chol.diag().iter().map(|d| d.ln()).sum();
        Ok(-0.5 * whitened.dot(&whitened)
            - log_det
            - 0.5 * y.len() as f64 * (2.0 * PI).ln())
    }
}

/// A zero-mean Gaussian process with a fixed kernel.
#[derive(Debug, Clone)]
pub struct Gp {
    pub kernel: Kernel,
}

impl Gp {
    pub fn new(kernel: Kernel) -> Self {
        Gp { kernel }
    }
}

impl Process for Gp {
    fn mean(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(Array1::zeros(x.nrows()))
    }

    fn covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError> {
        Ok(self.kernel.matrix(a, b)?)
    }

    fn variance(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(self.kernel.diagonal(x)?)
    }
}

/// Observation noise: independent `N(0, variance)` for every row evaluated.
///
/// Rows are never correlated with each other, even when their inputs coincide.
/// Cross-covariance between two point sets is zero unless both arguments are
/// the same view, in which case it is `variance · I`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Noise {
    pub variance: f64,
}

impl Noise {
    pub fn new(variance: f64) -> Self {
        Noise { variance }
    }
}

impl Process for Noise {
    fn mean(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(Array1::zeros(x.nrows()))
    }

    fn covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError> {
        if internal::same_points(a, b) {
            Ok(Array2::<f64>::eye(a.nrows()) * self.variance)
        } else {
            Ok(Array2::zeros((a.nrows(), b.nrows())))
        }
    }

    fn variance(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(Array1::from_elem(x.nrows(), self.variance))
    }

    fn sample(&self, x: ArrayView2<f64>, rng: &mut dyn RngCore) -> Result<Array1<f64>, GpError> {
        let sd = self.variance.max(0.0).sqrt();
        Ok((0..x.nrows())
            .map(|_| sd * rng.sample::<f64, _>(StandardNormal))
            .collect())
    }
}

/// The sum of two independent processes, e.g. a latent function plus its noise.
#[derive(Debug, Clone)]
pub struct Sum {
    pub left: Arc<dyn Process>,
    pub right: Arc<dyn Process>,
}

impl Sum {
    pub fn new(left: Arc<dyn Process>, right: Arc<dyn Process>) -> Self {
        Sum { left, right }
    }
}

impl Process for Sum {
    fn mean(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(self.left.mean(x)? + self.right.mean(x)?)
    }

    fn covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError> {
        Ok(self.left.covariance(a, b)? + self.right.covariance(a, b)?)
    }

    fn variance(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        Ok(self.left.variance(x)? + self.right.variance(x)?)
    }
}

/// Exact observation of `latent + noise` at the rows of `x`.
#[derive(Debug, Clone)]
pub struct DenseObservation {
    pub latent: Arc<dyn Process>,
    pub noise: Arc<dyn Process>,
    pub x: Array2<f64>,
    pub y: Array1<f64>,
}

/// Observation of `latent + noise` summarised through the inducing inputs `z`.
#[derive(Debug, Clone)]
pub struct SparseObservation {
    pub latent: Arc<dyn Process>,
    pub noise: Arc<dyn Process>,
    pub x: Array2<f64>,
    pub y: Array1<f64>,
    pub z: Array2<f64>,
}

#[derive(Debug, Clone)]
pub enum Observation {
    Dense(DenseObservation),
    Sparse(SparseObservation),
}

impl Observation {
    pub fn dense(
        latent: Arc<dyn Process>,
        noise: Arc<dyn Process>,
        x: Array2<f64>,
        y: Array1<f64>,
    ) -> Result<Self, GpError> {
        internal::validate_targets(x.view(), y.view())?;
        Ok(Observation::Dense(DenseObservation { latent, noise, x, y }))
    }

    pub fn sparse(
        latent: Arc<dyn Process>,
        noise: Arc<dyn Process>,
        x: Array2<f64>,
        y: Array1<f64>,
        z: Array2<f64>,
    ) -> Result<Self, GpError> {
        internal::validate_targets(x.view(), y.view())?;
        Ok(Observation::Sparse(SparseObservation {
            latent,
            noise,
            x,
            y,
            z,
        }))
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Observation::Sparse(_))
    }

    /// Number of observed rows.
    pub fn len(&self) -> usize {
        match self {
            Observation::Dense(obs) => obs.y.len(),
            Observation::Sparse(obs) => obs.y.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Posterior of the latent process given this observation.
    pub fn condition(&self) -> Result<Posterior, GpError> {
        match self {
            Observation::Dense(obs) => internal::dense_posterior(obs),
            Observation::Sparse(obs) => Ok(internal::sparse_fit(obs)?.posterior),
        }
    }

    /// Log marginal likelihood of the targets (dense), or its variational lower
    /// bound (sparse).
    pub fn log_evidence(&self) -> Result<f64, GpError> {
        match self {
            Observation::Dense(obs) => {
                Sum::new(obs.latent.clone(), obs.noise.clone()).log_density(obs.x.view(), obs.y.view())
            }
            Observation::Sparse(obs) => Ok(internal::sparse_fit(obs)?.elbo),
        }
    }
}

#[derive(Debug, Clone)]
enum Correction {
    /// Lower Cholesky factor of `K_{f+e}(x, x)`.
    Dense { chol: Array2<f64> },
    /// Lower Cholesky factors of `K_uu` and `K_uu + K_uf Λ⁻¹ K_fu`.
    Sparse {
        chol_uu: Array2<f64>,
        chol_sigma: Array2<f64>,
    },
}

/// The latent process of a layer after conditioning on an [`Observation`].
#[derive(Debug, Clone)]
pub struct Posterior {
    prior: Arc<dyn Process>,
    /// Observed inputs (dense) or inducing inputs (sparse).
    basis: Array2<f64>,
    /// `mean(x*) = prior.mean(x*) + prior.cov(x*, basis) · weights`.
    weights: Array1<f64>,
    correction: Correction,
}

impl Process for Posterior {
    fn mean(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, GpError> {
        let cross = self.prior.covariance(x, self.basis.view())?;
        Ok(self.prior.mean(x)? + cross.dot(&self.weights))
    }

    fn covariance(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError> {
        let prior_ab = self.prior.covariance(a, b)?;
        let k_ba = self.prior.covariance(self.basis.view(), a)?;
        let k_bb = self.prior.covariance(self.basis.view(), b)?;
        match &self.correction {
            Correction::Dense { chol } => {
                let va = solve_lower(chol, k_ba.view())?;
                let vb = solve_lower(chol, k_bb.view())?;
                Ok(prior_ab - va.t().dot(&vb))
            }
            Correction::Sparse {
                chol_uu,
                chol_sigma,
            } => {
                let ua = solve_lower(chol_uu, k_ba.view())?;
                let ub = solve_lower(chol_uu, k_bb.view())?;
                let sa = solve_lower(chol_sigma, k_ba.view())?;
                let sb = solve_lower(chol_sigma, k_bb.view())?;
                Ok(prior_ab - ua.t().dot(&ub) + sa.t().dot(&sb))
            }
        }
    }
}

/// Lower Cholesky factor of `k`, adding diagonal jitter only when needed.
pub fn robust_cholesky(k: Array2<f64>) -> Result<Array2<f64>, GpError> {
    let n = k.nrows();
    let scale = k
        .diag()
        .iter()
        .fold(0.0_f64, |acc, &v| acc.max(v.abs()))
        .max(1.0);
    let mut last_jitter = 0.0;
    for &jitter in JITTER_LADDER.iter() {
        let attempt = if jitter > 0.0 {
            &k + &(Array2::<f64>::eye(n) * (jitter * scale))
        } else {
            k.clone()
        };
        match attempt.cholesky(UPLO::Lower) {
            Ok(chol) => {
                if jitter > 0.0 {
                    log::debug!("Cholesky needed a diagonal jitter of {:.1e}", jitter * scale);
                }
                return Ok(chol);
            }
            Err(_) => last_jitter = jitter * scale,
        }
    }
    log::warn!(
        "Cholesky failed for a {}x{} covariance matrix after jitter {:.1e}",
        n,
        n,
        last_jitter
    );
    Err(GpError::NotPositiveDefinite { jitter: last_jitter })
}

/// Solves `L X = B` for lower-triangular `L`.
pub fn solve_lower(chol: &Array2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>, GpError> {
    Ok(chol.solve_triangular(UPLO::Lower, Diag::NonUnit, &b.to_owned())?)
}

fn solve_lower_vec(chol: &Array2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, GpError> {
    let rhs = b.to_owned().insert_axis(Axis(1));
    Ok(solve_lower(chol, rhs.view())?.column(0).to_owned())
}

/// Solves `(L Lᵀ) x = b` given the lower factor `L`.
fn solve_cholesky_vec(chol: &Array2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>, GpError> {
    let half = solve_lower_vec(chol, b)?.insert_axis(Axis(1));
    let upper = chol.t().to_owned();
    Ok(upper
        .solve_triangular(UPLO::Upper, Diag::NonUnit, &half)?
        .column(0)
        .to_owned())
}

mod internal {
    use super::*;

    /// True when `a` and `b` view the same memory with the same layout.
    pub(super) fn same_points(a: ArrayView2<f64>, b: ArrayView2<f64>) -> bool {
        a.as_ptr() == b.as_ptr() && a.dim() == b.dim() && a.strides() == b.strides()
    }

    pub(super) fn validate_targets(x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<(), GpError> {
        if x.nrows() != y.len() {
            return Err(GpError::ObservationShape {
                inputs: x.nrows(),
                targets: y.len(),
            });
        }
        if let Some(row) = y.iter().position(|v| !v.is_finite()) {
            return Err(GpError::NonFiniteTarget(row));
        }
        Ok(())
    }

    pub(super) fn dense_posterior(obs: &DenseObservation) -> Result<Posterior, GpError> {
        let observed = Sum::new(obs.latent.clone(), obs.noise.clone());
        let residual = &obs.y - &observed.mean(obs.x.view())?;
        let chol = robust_cholesky(observed.covariance(obs.x.view(), obs.x.view())?)?;
        let weights = solve_cholesky_vec(&chol, residual.view())?;
        Ok(Posterior {
            prior: obs.latent.clone(),
            basis: obs.x.clone(),
            weights,
            correction: Correction::Dense { chol },
        })
    }

    pub(super) struct SparseFit {
        pub posterior: Posterior,
        pub elbo: f64,
    }

    /// Optimal variational posterior and evidence lower bound for a sparse observation.
    pub(super) fn sparse_fit(obs: &SparseObservation) -> Result<SparseFit, GpError> {
        let n = obs.y.len();
        let x = obs.x.view();
        let z = obs.z.view();

        let noise_var = obs.noise.variance(x)?;
        if let Some(&bad) = noise_var.iter().find(|&&v| !(v > 0.0)) {
            return Err(GpError::NonPositiveNoise(bad));
        }
        let precision = noise_var.mapv(|v| 1.0 / v);

        let k_uu = obs.latent.covariance(z, z)?;
        let k_uf = obs.latent.covariance(z, x)?;
        let chol_uu = robust_cholesky(k_uu.clone())?;

        // Σ = K_uu + K_uf Λ⁻¹ K_fu
        let k_uf_scaled = &k_uf * &precision.view().insert_axis(Axis(0));
        let sigma = &k_uu + &k_uf_scaled.dot(&k_uf.t());
        let chol_sigma = robust_cholesky(sigma)?;

        let residual = &obs.y - &(obs.latent.mean(x)? + obs.noise.mean(x)?);
        let projected = k_uf_scaled.dot(&residual);
        let weights = solve_cholesky_vec(&chol_sigma, projected.view())?;

        // log N(y | m, Q + Λ) via the matrix determinant lemma and Woodbury.
        let log_det_sigma: f64 = 2.0 * chol_sigma.diag().iter().map(|d| d.ln()).sum::<f64>();
        let log_det_uu: f64 = 2.0 * chol_uu.diag().iter().map(|d| d.ln()).sum::<f64>();
        let log_det_noise: f64 = noise_var.iter().map(|v| v.ln()).sum();
        let quad = residual.dot(&(&residual * &precision)) - projected.dot(&weights);
        let log_marginal = -0.5
            * (n as f64 * (2.0 * PI).ln() + log_det_sigma - log_det_uu + log_det_noise + quad);

        // Trace term: Σᵢ (k_ii - q_ii) / λᵢ
        let a = solve_lower(&chol_uu, k_uf.view())?;
        let q_diag = a.mapv(|v| v * v).sum_axis(Axis(0));
        let k_diag = obs.latent.variance(x)?;
        let trace: f64 = (&k_diag - &q_diag)
            .iter()
            .zip(precision.iter())
            .map(|(d, p)| d.max(0.0) * p)
            .sum();

        Ok(SparseFit {
            posterior: Posterior {
                prior: obs.latent.clone(),
                basis: obs.z.clone(),
                weights,
                correction: Correction::Sparse {
                    chol_uu,
                    chol_sigma,
                },
            },
            elbo: log_marginal - 0.5 * trace,
        })
    }
}
