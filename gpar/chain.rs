// gpar/chain.rs

//! # The Autoregressive Layer Chain
//!
//! A chain models `p` outputs as an ordered product of single-output GPs:
//!
//! ```text
//! p(y₁, …, y_p | x) = p(y₁ | x) · p(y₂ | x, y₁) · … · p(y_p | x, y₁, …, y_{p-1})
//! ```
//!
//! Layer `i` therefore sees a design matrix made of the original features
//! followed by the `i - 1` outputs before it. Under missing data that matrix has
//! to be rebuilt layer by layer:
//!
//! 1.  [`per_output`] decides which training rows take part in each layer.
//! 2.  [`Gpar::obs`] binds the observed rows to the layer's GP pair, densely or
//!     through the shared inducing points.
//! 3.  [`Gpar::update_inputs`] appends the layer's column to the design matrix,
//!     imputing missing entries and/or replacing observed ones with the
//!     predictive mean, and grows the inducing-point matrix alongside.
//!
//! Conditioning, log-density evaluation and sampling all walk the layers in this
//! order.

use crate::missing::{
    MissingError, Partition, last, mask_indices, merge, observed_mask, per_output, select_entries,
    select_rows,
};
use crate::process::{GpError, Observation, Posterior, Process, Sum};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use rand::RngCore;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(
        "None of the {rows} rows reaching this layer has an observed target, so the layer cannot be conditioned."
    )]
    EmptyObservation { rows: usize },

    #[error("Layer {layer} failed: {source}")]
    Layer {
        layer: usize,
        #[source]
        source: Box<ChainError>,
    },

    #[error("Gaussian-process computation failed: {0}")]
    Gp(#[from] GpError),

    #[error("Missing-value bookkeeping failed: {0}")]
    Missing(#[from] MissingError),

    #[error("Inputs have {inputs} rows but targets have {targets}.")]
    RowMismatch { inputs: usize, targets: usize },

    #[error("The chain has {layers} layers, but the targets only have {outputs} columns.")]
    TooFewOutputs { layers: usize, outputs: usize },

    #[error("Output index {index} is out of range for a chain with {layers} layers.")]
    OutputOutOfRange { index: usize, layers: usize },

    #[error("No outputs were selected for evaluation.")]
    NoOutputsSelected,

    #[error("Could not assemble the layer inputs: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("The chain has no layers.")]
    NoLayers,
}

impl ChainError {
    fn at_layer(self, layer: usize) -> ChainError {
        match self {
            ChainError::Layer { .. } => self,
            other => ChainError::Layer {
                layer,
                source: Box::new(other),
            },
        }
    }
}

/// A latent function and its observation noise.
#[derive(Debug, Clone)]
pub struct Layer {
    pub latent: Arc<dyn Process>,
    pub noise: Arc<dyn Process>,
}

impl Layer {
    pub fn new(latent: Arc<dyn Process>, noise: Arc<dyn Process>) -> Self {
        Layer { latent, noise }
    }
}

/// Options for [`Gpar::logpdf`].
#[derive(Debug, Clone, Default)]
pub struct LogpdfOptions {
    /// Only the final evaluated layer contributes to the density.
    pub only_last_layer: bool,
    /// Only these layer indices contribute; evaluation stops after the greatest.
    pub outputs: Option<Vec<usize>>,
    /// Complete missing targets with a posterior draw instead of the mean. The
    /// result is then an estimate of the density, not the exact marginal.
    pub sample_missing: bool,
    /// Return the inputs reaching the final evaluated layer instead of a density.
    pub return_inputs: bool,
}

/// Inputs and targets seen by one layer, as reconstructed by the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerInputs {
    pub x: Array2<f64>,
    pub x_ind: Option<Array2<f64>>,
    /// Targets of the layer over the rows of `x`; may contain missing values.
    pub y: Array1<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogpdfOutput {
    Density(f64),
    Inputs(LayerInputs),
}

impl LogpdfOutput {
    /// The density, or `None` when inputs were requested instead.
    pub fn density(&self) -> Option<f64> {
        match self {
            LogpdfOutput::Density(value) => Some(*value),
            LogpdfOutput::Inputs(_) => None,
        }
    }

    pub fn into_inputs(self) -> Option<LayerInputs> {
        match self {
            LogpdfOutput::Inputs(inputs) => Some(inputs),
            LogpdfOutput::Density(_) => None,
        }
    }
}

/// Prior layers and training data remembered by a conditioned chain.
#[derive(Debug, Clone)]
struct Conditioning {
    prior: Vec<Layer>,
    rows: usize,
}

/// An ordered chain of GP layers with a shared missing-data policy.
#[derive(Debug, Clone, Default)]
pub struct Gpar {
    /// Forward predictive means instead of observed values.
    pub replace: bool,
    /// Fill missing values with predictive means before forwarding them.
    pub impute: bool,
    /// Shared inducing inputs over the original features; `None` means dense.
    pub x_ind: Option<Array2<f64>>,
    layers: Vec<Layer>,
    conditioning: Option<Conditioning>,
}

impl Gpar {
    pub fn new(replace: bool, impute: bool, x_ind: Option<Array2<f64>>) -> Self {
        Gpar {
            replace,
            impute,
            x_ind,
            layers: Vec::new(),
            conditioning: None,
        }
    }

    pub fn sparse(&self) -> bool {
        self.x_ind.is_some()
    }

    /// Returns a new chain with `layer` appended.
    pub fn add_layer(&self, layer: Layer) -> Gpar {
        let mut chain = self.clone();
        chain.layers.push(layer);
        chain
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn is_conditioned(&self) -> bool {
        self.conditioning.is_some()
    }

    /// Number of training rows the chain was conditioned on.
    pub fn conditioned_rows(&self) -> Option<usize> {
        self.conditioning.as_ref().map(|c| c.rows)
    }

    fn prior_layers(&self) -> &[Layer] {
        self.conditioning
            .as_ref()
            .map_or(&self.layers, |c| &c.prior)
    }

    fn needs_posterior(&self) -> bool {
        self.replace || self.impute || self.sparse()
    }

    /// Builds the observation of `f + e` on the rows of `x` whose target is
    /// observed. Sparse when `x_ind` is given, dense otherwise.
    pub fn obs(
        &self,
        x: ArrayView2<f64>,
        x_ind: Option<ArrayView2<f64>>,
        y: ArrayView1<f64>,
        f: &Arc<dyn Process>,
        e: &Arc<dyn Process>,
    ) -> Result<Observation, ChainError> {
        if x.nrows() != y.len() {
            return Err(ChainError::RowMismatch {
                inputs: x.nrows(),
                targets: y.len(),
            });
        }
        let available = observed_mask(y);
        if !available.iter().any(|&a| a) {
            return Err(ChainError::EmptyObservation { rows: x.nrows() });
        }
        let x_obs = select_rows(x, available.view());
        let y_obs = select_entries(y, available.view());

        let obs = match x_ind {
            None => Observation::dense(f.clone(), e.clone(), x_obs, y_obs)?,
            Some(z) => Observation::sparse(f.clone(), e.clone(), x_obs, y_obs, z.to_owned())?,
        };
        Ok(obs)
    }

    /// Appends the column `y` to `x` under the replace/impute policy, and the
    /// predictive mean at the inducing inputs to `x_ind`.
    ///
    /// The predictive mean is that of `posterior` when given, and of the prior
    /// `f` otherwise.
    pub fn update_inputs(
        &self,
        x: ArrayView2<f64>,
        x_ind: Option<ArrayView2<f64>>,
        y: ArrayView1<f64>,
        f: &Arc<dyn Process>,
        posterior: Option<&Posterior>,
    ) -> Result<(Array2<f64>, Option<Array2<f64>>), ChainError> {
        if x.nrows() != y.len() {
            return Err(ChainError::RowMismatch {
                inputs: x.nrows(),
                targets: y.len(),
            });
        }
        let predictive: &dyn Process = match posterior {
            Some(post) => post,
            None => f.as_ref(),
        };

        let x_ind = match x_ind {
            Some(z) => {
                let mean = predictive.mean(z)?;
                Some(append_column(z, mean.view())?)
            }
            None => None,
        };

        let mut column = y.to_owned();
        if self.replace || self.impute {
            let mean = predictive.mean(x)?;
            let available = observed_mask(y);
            if self.replace {
                let updates = select_entries(mean.view(), available.view());
                column = merge(column.view(), updates.view(), available.view())?;
            }
            if self.impute {
                let missing = available.mapv(|a| !a);
                let updates = select_entries(mean.view(), missing.view());
                column = merge(column.view(), updates.view(), missing.view())?;
            }
        }

        Ok((append_column(x, column.view())?, x_ind))
    }

    /// Conditions every layer on the training data, returning the posterior chain.
    ///
    /// Conditioning always starts from the prior layers, so conditioning a
    /// conditioned chain replaces its data rather than counting it twice.
    pub fn condition(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<Gpar, ChainError> {
        let prior = self.prior_layers();
        if prior.is_empty() {
            return Err(ChainError::NoLayers);
        }
        internal::check_data(x, y, prior.len())?;
        log::debug!(
            "Conditioning a {}-layer chain on {} rows (replace={}, impute={}, sparse={})",
            prior.len(),
            x.nrows(),
            self.replace,
            self.impute,
            self.sparse()
        );

        let steps: Vec<(Partition, &Layer)> = per_output(y, self.impute).zip(prior.iter()).collect();
        let mut inputs = x.to_owned();
        let mut inducing = self.x_ind.clone();
        let mut posterior_layers = Vec::with_capacity(steps.len());

        for (index, (is_last, (partition, layer))) in last(&steps, None).enumerate() {
            let step = || -> Result<(Posterior, Option<(Array2<f64>, Option<Array2<f64>>)>), ChainError> {
                let rows = select_rows(inputs.view(), partition.mask.view());
                let obs = self.obs(
                    rows.view(),
                    inducing.as_ref().map(|z| z.view()),
                    partition.column.view(),
                    &layer.latent,
                    &layer.noise,
                )?;
                log::debug!("Layer {}: conditioning on {} observed rows", index, obs.len());
                let posterior = obs.condition()?;
                let next = if is_last {
                    None
                } else {
                    Some(self.update_inputs(
                        rows.view(),
                        inducing.as_ref().map(|z| z.view()),
                        partition.column.view(),
                        &layer.latent,
                        Some(&posterior),
                    )?)
                };
                Ok((posterior, next))
            };
            let (posterior, next) = step().map_err(|e| e.at_layer(index))?;
            if let Some((next_inputs, next_inducing)) = next {
                inputs = next_inputs;
                inducing = next_inducing;
            }
            posterior_layers.push(Layer::new(Arc::new(posterior), layer.noise.clone()));
        }

        Ok(Gpar {
            replace: self.replace,
            impute: self.impute,
            x_ind: self.x_ind.clone(),
            layers: posterior_layers,
            conditioning: Some(Conditioning {
                prior: prior.to_vec(),
                rows: x.nrows(),
            }),
        })
    }

    /// Joint log-density of `y` given `x`, using fresh randomness when
    /// `sample_missing` is set.
    pub fn logpdf(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        options: &LogpdfOptions,
    ) -> Result<LogpdfOutput, ChainError> {
        let mut rng = StdRng::from_entropy();
        self.logpdf_with_rng(x, y, options, &mut rng)
    }

    /// Joint log-density of `y` given `x`: the sum of every selected layer's
    /// conditional density given the reconstructed inputs of that layer.
    pub fn logpdf_with_rng(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        options: &LogpdfOptions,
        rng: &mut dyn RngCore,
    ) -> Result<LogpdfOutput, ChainError> {
        let evaluated = internal::evaluated_layers(self.layers.len(), options.outputs.as_deref())?;
        internal::check_data(x, y, evaluated)?;

        let keep_missing = self.impute || options.sample_missing;
        let steps: Vec<(Partition, &Layer)> = per_output(y, keep_missing)
            .zip(self.layers[..evaluated].iter())
            .collect();
        let mut inputs = x.to_owned();
        let mut inducing = self.x_ind.clone();
        let mut total = 0.0;

        for (index, (is_last, (partition, layer))) in last(&steps, None).enumerate() {
            let rows = select_rows(inputs.view(), partition.mask.view());
            if is_last && options.return_inputs {
                return Ok(LogpdfOutput::Inputs(LayerInputs {
                    x: rows,
                    x_ind: inducing,
                    y: partition.column.clone(),
                }));
            }

            let contributes = options.outputs.as_ref().is_none_or(|o| o.contains(&index))
                && (!options.only_last_layer || is_last);
            let forwards = !is_last;
            let completes = forwards && options.sample_missing;

            let mut step = || -> Result<Option<(Array2<f64>, Option<Array2<f64>>)>, ChainError> {
                let obs = if contributes || completes || (forwards && self.needs_posterior()) {
                    Some(self.obs(
                        rows.view(),
                        inducing.as_ref().map(|z| z.view()),
                        partition.column.view(),
                        &layer.latent,
                        &layer.noise,
                    )?)
                } else {
                    None
                };
                if contributes {
                    if let Some(obs) = &obs {
                        let contribution = obs.log_evidence()?;
                        log::debug!("Layer {}: log-density contribution {:.6}", index, contribution);
                        total += contribution;
                    }
                }
                if !forwards {
                    return Ok(None);
                }

                let posterior = match &obs {
                    Some(obs) if self.needs_posterior() || completes => Some(obs.condition()?),
                    _ => None,
                };
                let column = if completes {
                    internal::complete_missing(
                        rows.view(),
                        partition.column.view(),
                        layer,
                        posterior.as_ref(),
                        rng,
                    )?
                } else {
                    partition.column.clone()
                };
                Ok(Some(self.update_inputs(
                    rows.view(),
                    inducing.as_ref().map(|z| z.view()),
                    column.view(),
                    &layer.latent,
                    posterior.as_ref(),
                )?))
            };
            if let Some((next_inputs, next_inducing)) = step().map_err(|e| e.at_layer(index))? {
                inputs = next_inputs;
                inducing = next_inducing;
            }
        }

        Ok(LogpdfOutput::Density(total))
    }

    /// Density contribution of layer `index` on inputs previously reconstructed
    /// with [`LogpdfOptions::return_inputs`].
    pub fn layer_logpdf(&self, index: usize, inputs: &LayerInputs) -> Result<f64, ChainError> {
        let layer = self.layers.get(index).ok_or(ChainError::OutputOutOfRange {
            index,
            layers: self.layers.len(),
        })?;
        let obs = self
            .obs(
                inputs.x.view(),
                inputs.x_ind.as_ref().map(|z| z.view()),
                inputs.y.view(),
                &layer.latent,
                &layer.noise,
            )
            .map_err(|e| e.at_layer(index))?;
        obs.log_evidence()
            .map_err(|e| ChainError::from(e).at_layer(index))
    }

    /// Draws one joint sample of all outputs at the rows of `x`.
    ///
    /// Each layer sees this draw's earlier outputs. With `latent` the noise-free
    /// function values are returned; otherwise observation noise is added. Under
    /// `replace` the noise-free values are what later layers see.
    pub fn sample(
        &self,
        x: ArrayView2<f64>,
        latent: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Array2<f64>, ChainError> {
        if self.layers.is_empty() {
            return Err(ChainError::NoLayers);
        }
        let mut inputs = x.to_owned();
        let mut draws = Vec::with_capacity(self.layers.len());

        for (index, (is_last, layer)) in last(&self.layers, None).enumerate() {
            let f = layer
                .latent
                .sample(inputs.view(), rng)
                .map_err(|e| ChainError::from(e).at_layer(index))?;
            let output = if latent {
                f.clone()
            } else {
                let e = layer
                    .noise
                    .sample(inputs.view(), rng)
                    .map_err(|e| ChainError::from(e).at_layer(index))?;
                &f + &e
            };
            if !is_last {
                let forwarded = if self.replace { &f } else { &output };
                inputs = append_column(inputs.view(), forwarded.view())?;
            }
            draws.push(output);
        }

        internal::stack_columns(&draws)
    }
}

impl std::ops::BitOr<(ArrayView2<'_, f64>, ArrayView2<'_, f64>)> for &Gpar {
    type Output = Result<Gpar, ChainError>;

    fn bitor(self, (x, y): (ArrayView2<'_, f64>, ArrayView2<'_, f64>)) -> Self::Output {
        self.condition(x, y)
    }
}

/// `x` with `column` appended on the right.
pub fn append_column(x: ArrayView2<f64>, column: ArrayView1<f64>) -> Result<Array2<f64>, ChainError> {
    Ok(concatenate(Axis(1), &[x.view(), column.view().insert_axis(Axis(1))])?)
}

mod internal {
    use super::*;

    pub(super) fn check_data(
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        layers: usize,
    ) -> Result<(), ChainError> {
        if x.nrows() != y.nrows() {
            return Err(ChainError::RowMismatch {
                inputs: x.nrows(),
                targets: y.nrows(),
            });
        }
        if y.ncols() < layers {
            return Err(ChainError::TooFewOutputs {
                layers,
                outputs: y.ncols(),
            });
        }
        Ok(())
    }

    /// Number of leading layers that must be walked for the selected outputs.
    pub(super) fn evaluated_layers(
        layers: usize,
        outputs: Option<&[usize]>,
    ) -> Result<usize, ChainError> {
        if layers == 0 {
            return Err(ChainError::NoLayers);
        }
        match outputs {
            None => Ok(layers),
            Some([]) => Err(ChainError::NoOutputsSelected),
            Some(selected) => {
                let greatest = selected.iter().copied().max().unwrap_or(0);
                if greatest >= layers {
                    return Err(ChainError::OutputOutOfRange {
                        index: greatest,
                        layers,
                    });
                }
                Ok(greatest + 1)
            }
        }
    }

    /// Fills the missing entries of `y` with one draw from the layer's
    /// predictive distribution (latent plus noise) at those rows.
    pub(super) fn complete_missing(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        layer: &Layer,
        posterior: Option<&Posterior>,
        rng: &mut dyn RngCore,
    ) -> Result<Array1<f64>, ChainError> {
        let missing = observed_mask(y).mapv(|a| !a);
        if mask_indices(missing.view()).is_empty() {
            return Ok(y.to_owned());
        }
        let latent: Arc<dyn Process> = match posterior {
            Some(post) => Arc::new(post.clone()),
            None => layer.latent.clone(),
        };
        let predictive = Sum::new(latent, layer.noise.clone());
        let rows = select_rows(x, missing.view());
        let draw = predictive.sample(rows.view(), rng)?;
        Ok(merge(y, draw.view(), missing.view())?)
    }

    pub(super) fn stack_columns(columns: &[Array1<f64>]) -> Result<Array2<f64>, ChainError> {
        let views: Vec<ArrayView2<f64>> = columns
            .iter()
            .map(|c| c.view().insert_axis(Axis(1)))
            .collect();
        Ok(concatenate(Axis(1), &views)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::missing::MISSING;
    use crate::process::{Gp, Noise};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, array};

    fn eq_gp() -> Arc<dyn Process> {
        Arc::new(Gp::new(Kernel::eq(1.0, array![1.0], vec![0])))
    }

    fn white(variance: f64) -> Arc<dyn Process> {
        Arc::new(Noise::new(variance))
    }

    fn assert_matrix_eq(actual: &Array2<f64>, expected: &Array2<f64>) {
        assert_eq!(actual.shape(), expected.shape());
        for (a, e) in actual.iter().zip(expected.iter()) {
            if e.is_nan() {
                assert!(a.is_nan(), "expected missing, found {a}");
            } else {
                assert_abs_diff_eq!(*a, *e, epsilon = 1e-6);
            }
        }
    }

    /// Noiseless posterior pinning `f` to 9..13 at 1, 2, 3, 6, 7.
    fn pinned_posterior(f: &Arc<dyn Process>) -> Posterior {
        let obs = Observation::dense(
            f.clone(),
            white(1e-12),
            array![[1.0], [2.0], [3.0], [6.0], [7.0]],
            array![9.0, 10.0, 11.0, 12.0, 13.0],
        )
        .unwrap();
        obs.condition().unwrap()
    }

    struct Scenario {
        x: Array2<f64>,
        y: Array1<f64>,
        y_missing: Array1<f64>,
        x_ind: Array2<f64>,
        f: Arc<dyn Process>,
    }

    fn scenario() -> Scenario {
        Scenario {
            x: array![[1.0], [2.0], [3.0]],
            y: array![4.0, 5.0, 6.0],
            y_missing: array![4.0, MISSING, 6.0],
            x_ind: array![[6.0], [7.0]],
            f: eq_gp(),
        }
    }

    fn run(
        chain: &Gpar,
        s: &Scenario,
        y: &Array1<f64>,
        posterior: Option<&Posterior>,
    ) -> (Array2<f64>, Array2<f64>) {
        let (x, x_ind) = chain
            .update_inputs(s.x.view(), Some(s.x_ind.view()), y.view(), &s.f, posterior)
            .unwrap();
        (x, x_ind.unwrap())
    }

    #[test]
    fn update_inputs_with_prior() {
        let s = scenario();
        let prior_ind = array![[6.0, 0.0], [7.0, 0.0]];

        let vanilla = Gpar::new(false, false, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&vanilla, &s, &s.y, None);
        assert_matrix_eq(&x, &array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
        assert_matrix_eq(&x_ind, &prior_ind);

        let impute = Gpar::new(false, true, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&impute, &s, &s.y_missing, None);
        assert_matrix_eq(&x, &array![[1.0, 4.0], [2.0, 0.0], [3.0, 6.0]]);
        assert_matrix_eq(&x_ind, &prior_ind);

        let replace = Gpar::new(true, false, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&replace, &s, &s.y_missing, None);
        assert_matrix_eq(&x, &array![[1.0, 0.0], [2.0, MISSING], [3.0, 0.0]]);
        assert_matrix_eq(&x_ind, &prior_ind);

        let both = Gpar::new(true, true, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&both, &s, &s.y, None);
        assert_matrix_eq(&x, &array![[1.0, 0.0], [2.0, 0.0], [3.0, 0.0]]);
        assert_matrix_eq(&x_ind, &prior_ind);
    }

    #[test]
    fn update_inputs_with_posterior() {
        let s = scenario();
        let posterior = pinned_posterior(&s.f);
        let posterior_ind = array![[6.0, 12.0], [7.0, 13.0]];

        let vanilla = Gpar::new(false, false, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&vanilla, &s, &s.y, Some(&posterior));
        assert_matrix_eq(&x, &array![[1.0, 4.0], [2.0, 5.0], [3.0, 6.0]]);
        assert_matrix_eq(&x_ind, &posterior_ind);

        let impute = Gpar::new(false, true, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&impute, &s, &s.y_missing, Some(&posterior));
        assert_matrix_eq(&x, &array![[1.0, 4.0], [2.0, 10.0], [3.0, 6.0]]);
        assert_matrix_eq(&x_ind, &posterior_ind);

        let replace = Gpar::new(true, false, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&replace, &s, &s.y_missing, Some(&posterior));
        assert_matrix_eq(&x, &array![[1.0, 9.0], [2.0, MISSING], [3.0, 11.0]]);
        assert_matrix_eq(&x_ind, &posterior_ind);

        let both = Gpar::new(true, true, Some(s.x_ind.clone()));
        let (x, x_ind) = run(&both, &s, &s.y, Some(&posterior));
        assert_matrix_eq(&x, &array![[1.0, 9.0], [2.0, 10.0], [3.0, 11.0]]);
        assert_matrix_eq(&x_ind, &posterior_ind);
    }

    #[test]
    fn update_inputs_without_policy_slices_back_to_the_input() {
        let s = scenario();
        let chain = Gpar::new(false, false, None);
        let (x, x_ind) = chain
            .update_inputs(s.x.view(), None, s.y_missing.view(), &s.f, None)
            .unwrap();
        assert!(x_ind.is_none());
        assert_eq!(x.ncols(), s.x.ncols() + 1);
        assert_eq!(x.slice(ndarray::s![.., ..1]), s.x);
        assert!(x[[1, 1]].is_nan());
    }

    #[test]
    fn obs_selects_dense_or_sparse() {
        let f = eq_gp();
        let e = white(1e-4);
        let x = Array::linspace(0.0, 4.5, 10).insert_axis(Axis(1));
        let y_full = x.column(0).mapv(f64::sin);
        let mut y = y_full.clone();
        for i in (0..10).step_by(2) {
            y[i] = MISSING;
        }

        let dense = Gpar::new(false, false, None)
            .obs(x.view(), None, y.view(), &f, &e)
            .unwrap();
        assert!(!dense.is_sparse());
        assert_eq!(dense.len(), 5);

        let sparse = Gpar::new(false, false, Some(x.clone()))
            .obs(x.view(), Some(x.view()), y.view(), &f, &e)
            .unwrap();
        assert!(sparse.is_sparse());
        assert_eq!(sparse.len(), 5);

        // Both interpolate the observed points.
        for obs in [dense, sparse] {
            let mean = obs.condition().unwrap().mean(x.view()).unwrap();
            for i in (1..10).step_by(2) {
                assert_abs_diff_eq!(mean[i], y_full[i], epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn obs_without_observed_rows_is_an_error() {
        let chain = Gpar::new(false, false, None);
        let err = chain
            .obs(
                array![[0.0], [1.0]].view(),
                None,
                array![MISSING, MISSING].view(),
                &eq_gp(),
                &white(0.1),
            )
            .unwrap_err();
        assert!(matches!(err, ChainError::EmptyObservation { rows: 2 }));
    }

    fn two_layer_chain(replace: bool, impute: bool) -> Gpar {
        let first = Layer::new(eq_gp(), white(0.01));
        let second = Layer::new(
            Arc::new(Gp::new(
                Kernel::eq(1.0, array![1.0, 2.0], vec![0, 1]) + Kernel::constant(0.1),
            )),
            white(0.01),
        );
        Gpar::new(replace, impute, None).add_layer(first).add_layer(second)
    }

    fn toy_data() -> (Array2<f64>, Array2<f64>) {
        let x = Array::linspace(0.0, 3.0, 8).insert_axis(Axis(1));
        let y1 = x.column(0).mapv(f64::sin);
        let y2 = y1.mapv(|v| v * v);
        let y = ndarray::stack(Axis(1), &[y1.view(), y2.view()]).unwrap();
        (x, y)
    }

    #[test]
    fn add_layer_leaves_the_original_chain_untouched() {
        let chain = Gpar::new(false, false, None);
        let grown = chain.add_layer(Layer::new(eq_gp(), white(0.1)));
        assert!(chain.is_empty());
        assert_eq!(grown.len(), 1);
        assert!(!grown.sparse());
        assert!(Gpar::new(false, false, Some(array![[0.0]])).sparse());
    }

    #[test]
    fn logpdf_is_the_sum_of_layer_contributions() {
        let (x, y) = toy_data();
        let chain = two_layer_chain(false, false);
        let joint = chain
            .logpdf(x.view(), y.view(), &LogpdfOptions::default())
            .unwrap()
            .density()
            .unwrap();

        let first = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    outputs: Some(vec![0]),
                    ..Default::default()
                },
            )
            .unwrap()
            .density()
            .unwrap();
        let last_only = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    only_last_layer: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .density()
            .unwrap();
        assert_abs_diff_eq!(joint, first + last_only, epsilon = 1e-8);

        let cached = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    return_inputs: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .into_inputs()
            .unwrap();
        assert_eq!(cached.x.ncols(), 2);
        assert_eq!(cached.x.column(1), y.column(0));
        assert_abs_diff_eq!(
            chain.layer_logpdf(1, &cached).unwrap(),
            last_only,
            epsilon = 1e-8
        );
    }

    #[test]
    fn logpdf_rejects_bad_output_selection() {
        let (x, y) = toy_data();
        let chain = two_layer_chain(false, false);
        let err = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    outputs: Some(vec![5]),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, ChainError::OutputOutOfRange { index: 5, layers: 2 }));
    }

    #[test]
    fn logpdf_propagates_empty_layers() {
        let x = array![[0.0], [1.0]];
        let y = array![[1.0, MISSING], [2.0, MISSING]];
        let err = two_layer_chain(false, false)
            .logpdf(x.view(), y.view(), &LogpdfOptions::default())
            .unwrap_err();
        match err {
            ChainError::Layer { layer, source } => {
                assert_eq!(layer, 1);
                assert!(matches!(*source, ChainError::EmptyObservation { .. }));
            }
            other => panic!("expected a layer error, got {other:?}"),
        }
    }

    #[test]
    fn conditioning_twice_matches_conditioning_once() {
        let (x, y) = toy_data();
        let chain = two_layer_chain(true, true);
        let once = chain.condition(x.view(), y.view()).unwrap();
        let twice = (&once | (x.view(), y.view())).unwrap();
        assert!(twice.is_conditioned());
        assert_eq!(twice.conditioned_rows(), Some(x.nrows()));

        let query = Array::linspace(-0.5, 3.5, 9).insert_axis(Axis(1));
        let a = once.layers()[0].latent.mean(query.view()).unwrap();
        let b = twice.layers()[0].latent.mean(query.view()).unwrap();
        for (u, v) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*u, *v, epsilon = 1e-10);
        }
        let mut rng = StdRng::seed_from_u64(4);
        let draw_once = once.sample(query.view(), true, &mut rng).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let draw_twice = twice.sample(query.view(), true, &mut rng).unwrap();
        for (u, v) in draw_once.iter().zip(draw_twice.iter()) {
            assert_abs_diff_eq!(*u, *v, epsilon = 1e-6);
        }
    }

    #[test]
    fn posterior_mean_tracks_training_targets() {
        let (x, y) = toy_data();
        let posterior = two_layer_chain(false, false)
            .condition(x.view(), y.view())
            .unwrap();
        let first = posterior.layers()[0].latent.mean(x.view()).unwrap();
        let extended = append_column(x.view(), y.column(0)).unwrap();
        let second = posterior.layers()[1].latent.mean(extended.view()).unwrap();
        for (mean, column) in [(first, 0), (second, 1)] {
            for (m, t) in mean.iter().zip(y.column(column).iter()) {
                assert_abs_diff_eq!(*m, *t, epsilon = 0.1);
            }
        }
    }

    #[test]
    fn conditioning_with_missing_values_imputes_upstream_outputs() {
        let (x, mut y) = toy_data();
        y[[2, 0]] = MISSING;
        y[[5, 0]] = MISSING;
        let chain = two_layer_chain(false, true);
        let posterior = chain.condition(x.view(), y.view()).unwrap();
        assert_eq!(posterior.len(), 2);

        // Rows missing the first output still reach the second layer.
        let inputs = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    return_inputs: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .into_inputs()
            .unwrap();
        assert_eq!(inputs.x.nrows(), 8);
        assert!(inputs.x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn sample_missing_gives_a_finite_estimate() {
        let (x, mut y) = toy_data();
        y[[3, 0]] = MISSING;
        let chain = two_layer_chain(false, true);
        let mut rng = StdRng::seed_from_u64(3);
        let estimate = chain
            .logpdf_with_rng(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    sample_missing: true,
                    ..Default::default()
                },
                &mut rng,
            )
            .unwrap()
            .density()
            .unwrap();
        assert!(estimate.is_finite());
    }

    fn sampled_density(chain: &Gpar, x: &Array2<f64>, y: &Array2<f64>, seed: u64) -> f64 {
        let mut rng = StdRng::seed_from_u64(seed);
        chain
            .logpdf_with_rng(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    sample_missing: true,
                    ..Default::default()
                },
                &mut rng,
            )
            .unwrap()
            .density()
            .unwrap()
    }

    #[test]
    fn sample_missing_completes_rows_without_imputation() {
        let (x, mut y) = toy_data();
        y[[3, 0]] = MISSING;
        let chain = two_layer_chain(false, false);

        let exact = chain
            .logpdf(x.view(), y.view(), &LogpdfOptions::default())
            .unwrap()
            .density()
            .unwrap();
        let first = sampled_density(&chain, &x, &y, 1);
        let second = sampled_density(&chain, &x, &y, 2);
        assert!(first.is_finite() && second.is_finite());
        assert!((first - exact).abs() > 1e-9, "completion left the density unchanged");
        assert!((first - second).abs() > 1e-12, "completion ignored the seed");
        assert_abs_diff_eq!(first, sampled_density(&chain, &x, &y, 1), epsilon = 1e-12);

        // The completed row reaches the last layer with a finite input.
        let mut rng = StdRng::seed_from_u64(1);
        let inputs = chain
            .logpdf_with_rng(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    sample_missing: true,
                    return_inputs: true,
                    ..Default::default()
                },
                &mut rng,
            )
            .unwrap()
            .into_inputs()
            .unwrap();
        assert_eq!(inputs.x.nrows(), x.nrows());
        assert!(inputs.x.iter().all(|v| v.is_finite()));

        let plain = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    return_inputs: true,
                    ..Default::default()
                },
            )
            .unwrap()
            .into_inputs()
            .unwrap();
        assert_eq!(plain.x.nrows(), x.nrows() - 1);
    }

    #[test]
    fn sample_draws_every_output() {
        let (x, _) = toy_data();
        let chain = two_layer_chain(true, false);
        let mut rng = StdRng::seed_from_u64(11);
        let draw = chain.sample(x.view(), false, &mut rng).unwrap();
        assert_eq!(draw.shape(), &[8, 2]);
        assert!(draw.iter().all(|v| v.is_finite()));

        let mut again = StdRng::seed_from_u64(11);
        assert_eq!(chain.sample(x.view(), false, &mut again).unwrap(), draw);
    }
}
