// gpar/regressor.rs

//! # The GPAR Regressor
//!
//! This module owns everything around the chain that a user touches:
//! configuration, hyperparameters, training data, fitting, prediction and
//! persistence. The chain itself is rebuilt from [`Variables`] on every
//! objective evaluation; the regressor only keeps the records.
//!
//! Fitting maximises the joint log-density of the training targets over the
//! log-transformed hyperparameters with BFGS, either for all layers at once or
//! one layer at a time (`progressive`).

use crate::chain::{ChainError, Gpar, LayerInputs, LogpdfOptions};
use crate::optimize::{OptimizeError, OptimizerConfig, minimize};
use crate::params::{LayerConfig, ParamsError, Selection, Variables};
use ndarray::{Array2, ArrayView, ArrayView1, ArrayView2, Axis, Dimension, Ix2};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Lower credible bound, in percent.
const LOWER_PERCENTILE: f64 = 2.5;
/// Upper credible bound, in percent.
const UPPER_PERCENTILE: f64 = 97.5;

#[derive(Error, Debug)]
pub enum RegressorError {
    #[error("Invalid rank {0}: inputs and outputs must have at most two dimensions.")]
    InvalidRank(usize),

    #[error("The model must be fit before {0}.")]
    NotFit(&'static str),

    #[error("Sampling from the prior requires the number of outputs.")]
    MissingOutputCount,

    #[error("{0} is not implemented.")]
    NotImplemented(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Layer chain failed: {0}")]
    Chain(#[from] ChainError),

    #[error("Hyperparameters are inconsistent with the model: {0}")]
    Params(#[from] ParamsError),

    #[error("Hyperparameter optimisation failed: {0}")]
    Optimize(#[from] OptimizeError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegressorConfig {
    /// Forward predictive means instead of observed outputs.
    pub replace: bool,
    /// Fill missing outputs with predictive means before forwarding them.
    pub impute: bool,
    /// Search over output orderings. Not implemented; fitting fails fast.
    pub greedy: bool,
    /// Initial inducing inputs. Enables sparse conditioning.
    pub x_ind: Option<Array2<f64>>,
    pub layers: LayerConfig,
    pub optimizer: OptimizerConfig,
}

impl Default for RegressorConfig {
    fn default() -> Self {
        RegressorConfig {
            replace: true,
            impute: true,
            greedy: false,
            x_ind: None,
            layers: LayerConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl RegressorConfig {
    pub fn sparse(&self) -> bool {
        self.x_ind.is_some()
    }

    /// Reads a configuration from TOML; absent keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, RegressorError> {
        let toml_string = fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_string)?)
    }
}

/// Predictive summary of posterior draws, one column per output.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Array2<f64>,
    /// 2.5th percentile, when credible bounds were requested.
    pub lower: Option<Array2<f64>>,
    /// 97.5th percentile, when credible bounds were requested.
    pub upper: Option<Array2<f64>>,
}

/// Training data and fitted hyperparameters; the saved form of a regressor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    /// Column names of the outputs, in chain order; empty when never named.
    #[serde(default)]
    pub output_names: Vec<String>,
    pub config: RegressorConfig,
    pub variables: Variables,
    pub x: Array2<f64>,
    /// Training targets; missing values are stored as `nan`.
    pub y: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct GparRegressor {
    config: RegressorConfig,
    variables: Option<Variables>,
    data: Option<(Array2<f64>, Array2<f64>)>,
    output_names: Vec<String>,
}

impl GparRegressor {
    pub fn new(config: RegressorConfig) -> Self {
        GparRegressor {
            config,
            variables: None,
            data: None,
            output_names: Vec::new(),
        }
    }

    /// Names the outputs, in chain order. Carried through `save` and `load`.
    pub fn with_output_names(mut self, names: Vec<String>) -> Self {
        self.output_names = names;
        self
    }

    /// Output names given at construction, or `y1..yp` when none were given.
    pub fn output_names(&self) -> Vec<String> {
        if !self.output_names.is_empty() {
            return self.output_names.clone();
        }
        let outputs = self.data.as_ref().map_or(0, |(_, y)| y.ncols());
        (1..=outputs).map(|i| format!("y{i}")).collect()
    }

    pub fn config(&self) -> &RegressorConfig {
        &self.config
    }

    pub fn is_fit(&self) -> bool {
        self.data.is_some()
    }

    /// Current hyperparameters; `None` until fit.
    pub fn variables(&self) -> Option<&Variables> {
        self.variables.as_ref()
    }

    /// Fits the hyperparameters to `(x, y)`. Inputs of rank 0 or 1 are treated
    /// as a single column; missing targets are `MISSING`.
    pub fn fit<D1: Dimension, D2: Dimension>(
        &mut self,
        x: ArrayView<f64, D1>,
        y: ArrayView<f64, D2>,
        progressive: bool,
    ) -> Result<(), RegressorError> {
        if self.config.greedy {
            return Err(RegressorError::NotImplemented("Greedy output ordering"));
        }
        let x = uprank(x)?;
        let y = uprank(y)?;
        internal::validate_training_data(&self.config, x.view(), y.view())?;
        let (m, p) = (x.ncols(), y.ncols());
        internal::check_output_names(&self.output_names, p)?;
        log::info!(
            "Fitting GPAR on {} rows with {} inputs and {} outputs ({})",
            x.nrows(),
            m,
            p,
            if progressive { "layer by layer" } else { "all layers at once" }
        );

        let mut variables = Variables::initial(m, p, &self.config.layers, self.config.x_ind.clone());
        let sparse = self.config.sparse();

        if progressive {
            let only_last = !(self.config.replace || self.config.impute || sparse);
            for i in 1..=p {
                log::info!("Fitting layer {} of {}", i, p);
                let selection = Selection {
                    layers: vec![i - 1],
                    inducing_points: sparse,
                };
                variables = if only_last {
                    internal::fit_last_layer(&self.config, &variables, &selection, &x, &y, m, i)?
                } else {
                    internal::fit_selection(&self.config, &variables, &selection, &x, &y, m, i)?
                };
            }
        } else {
            let selection = Selection::all(p, sparse);
            variables = internal::fit_selection(&self.config, &variables, &selection, &x, &y, m, p)?;
        }

        self.variables = Some(variables);
        self.data = Some((x, y));
        Ok(())
    }

    /// The chain conditioned on the training data.
    fn posterior(&self, operation: &'static str) -> Result<Gpar, RegressorError> {
        let ((x, y), variables) = self
            .data
            .as_ref()
            .zip(self.variables.as_ref())
            .ok_or(RegressorError::NotFit(operation))?;
        let chain = internal::construct_chain(&self.config, variables, x.ncols(), y.ncols())?;
        Ok(chain.condition(x.view(), y.view())?)
    }

    /// Draws `num_samples` joint samples at `x`, one `n × p` matrix each.
    ///
    /// Posterior draws need a fitted model. Prior draws use the fitted
    /// hyperparameters when present and the initial ones otherwise;
    /// `num_outputs` defaults to the number of fitted outputs.
    pub fn sample<D: Dimension>(
        &self,
        x: ArrayView<f64, D>,
        num_samples: usize,
        latent: bool,
        posterior: bool,
        num_outputs: Option<usize>,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Array2<f64>>, RegressorError> {
        let x = uprank(x)?;
        let chain = if posterior {
            self.posterior("sampling from the posterior")?
        } else {
            let p = num_outputs
                .or_else(|| self.data.as_ref().map(|(_, y)| y.ncols()))
                .ok_or(RegressorError::MissingOutputCount)?;
            let mut variables = self.variables.clone().unwrap_or_else(|| {
                Variables::initial(x.ncols(), p, &self.config.layers, self.config.x_ind.clone())
            });
            variables.resize(x.ncols(), p, &self.config.layers);
            internal::construct_chain(&self.config, &variables, x.ncols(), p)?
        };
        internal::draw_samples(&chain, x.view(), num_samples, latent, rng)
    }

    /// Posterior predictive mean from `num_samples` draws, and optionally the
    /// 2.5 and 97.5 percentiles across the draws.
    pub fn predict<D: Dimension>(
        &self,
        x: ArrayView<f64, D>,
        num_samples: usize,
        latent: bool,
        credible_bounds: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Prediction, RegressorError> {
        if num_samples == 0 {
            return Err(RegressorError::InvalidInput(
                "prediction needs at least one sample".to_string(),
            ));
        }
        let samples = self.sample(x, num_samples, latent, true, None, rng)?;
        let stacked = ndarray::stack(
            Axis(0),
            &samples.iter().map(|s| s.view()).collect::<Vec<_>>(),
        )?;
        let mean = stacked
            .mean_axis(Axis(0))
            .ok_or_else(|| RegressorError::InvalidInput("no samples were drawn".to_string()))?;

        let (lower, upper) = if credible_bounds {
            (
                Some(internal::percentile(&stacked, LOWER_PERCENTILE)),
                Some(internal::percentile(&stacked, UPPER_PERCENTILE)),
            )
        } else {
            (None, None)
        };
        Ok(Prediction { mean, lower, upper })
    }

    /// Log-density of `y` at `x` under the fitted hyperparameters; with
    /// `posterior` the chain is first conditioned on the training data.
    pub fn logpdf<D1: Dimension, D2: Dimension>(
        &self,
        x: ArrayView<f64, D1>,
        y: ArrayView<f64, D2>,
        options: &LogpdfOptions,
        posterior: bool,
    ) -> Result<f64, RegressorError> {
        let x = uprank(x)?;
        let y = uprank(y)?;
        let chain = if posterior {
            self.posterior("evaluating the posterior log-density")?
        } else {
            let variables = self
                .variables
                .as_ref()
                .ok_or(RegressorError::NotFit("evaluating the log-density"))?;
            internal::construct_chain(&self.config, variables, x.ncols(), variables.layers.len())?
        };
        let output = chain.logpdf(
            x.view(),
            y.view(),
            &LogpdfOptions {
                return_inputs: false,
                ..options.clone()
            },
        )?;
        output
            .density()
            .ok_or_else(|| RegressorError::InvalidInput("log-density was not computed".to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<(), RegressorError> {
        let ((x, y), variables) = self
            .data
            .as_ref()
            .zip(self.variables.as_ref())
            .ok_or(RegressorError::NotFit("saving"))?;
        let model = FittedModel {
            output_names: self.output_names.clone(),
            config: self.config.clone(),
            variables: variables.clone(),
            x: x.clone(),
            y: y.clone(),
        };
        let toml_string = toml::to_string_pretty(&model)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        log::info!("Saved fitted model to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, RegressorError> {
        let toml_string = fs::read_to_string(path)?;
        let model: FittedModel = toml::from_str(&toml_string)?;
        internal::validate_training_data(&model.config, model.x.view(), model.y.view())?;
        if model.variables.layers.len() != model.y.ncols() {
            return Err(RegressorError::InvalidInput(format!(
                "model has {} layer records for {} outputs",
                model.variables.layers.len(),
                model.y.ncols()
            )));
        }
        internal::check_output_names(&model.output_names, model.y.ncols())?;
        Ok(GparRegressor {
            config: model.config,
            variables: Some(model.variables),
            data: Some((model.x, model.y)),
            output_names: model.output_names,
        })
    }
}

/// Promotes rank-0 and rank-1 arrays to a single column; rank 3 and above is an error.
pub fn uprank<D: Dimension>(x: ArrayView<f64, D>) -> Result<Array2<f64>, RegressorError> {
    match x.ndim() {
        0 | 1 => Ok(Array2::from_shape_vec((x.len(), 1), x.iter().copied().collect())?),
        2 => Ok(x.into_dimensionality::<Ix2>()?.to_owned()),
        rank => Err(RegressorError::InvalidRank(rank)),
    }
}

mod internal {
    use super::*;
    use crate::missing::is_missing;

    pub(super) fn validate_training_data(
        config: &RegressorConfig,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
    ) -> Result<(), RegressorError> {
        if x.nrows() != y.nrows() {
            return Err(RegressorError::InvalidInput(format!(
                "inputs have {} rows but outputs have {}",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 || y.ncols() == 0 {
            return Err(RegressorError::InvalidInput(
                "training data must have at least one row and one output".to_string(),
            ));
        }
        if let Some(((row, column), _)) = x.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(RegressorError::InvalidInput(format!(
                "input features must be finite, but row {row}, column {column} is not"
            )));
        }
        if let Some(((row, column), _)) = y
            .indexed_iter()
            .find(|(_, v)| !is_missing(**v) && !v.is_finite())
        {
            return Err(RegressorError::InvalidInput(format!(
                "observed outputs must be finite, but row {row}, column {column} is not"
            )));
        }
        if let Some(z) = &config.x_ind {
            if z.ncols() != x.ncols() {
                return Err(RegressorError::InvalidInput(format!(
                    "inducing points have {} columns but inputs have {}",
                    z.ncols(),
                    x.ncols()
                )));
            }
        }
        Ok(())
    }

    /// Names are optional, but when given there is one per output.
    pub(super) fn check_output_names(names: &[String], outputs: usize) -> Result<(), RegressorError> {
        if !names.is_empty() && names.len() != outputs {
            return Err(RegressorError::InvalidInput(format!(
                "{} output names were given for {} outputs",
                names.len(),
                outputs
            )));
        }
        Ok(())
    }

    /// Builds a prior chain of `p` layers over `m` inputs.
    pub(super) fn construct_chain(
        config: &RegressorConfig,
        variables: &Variables,
        m: usize,
        p: usize,
    ) -> Result<Gpar, RegressorError> {
        let chain = Gpar::new(config.replace, config.impute, variables.inducing_points.clone());
        Ok(variables
            .build_layers(m, p, &config.layers)?
            .into_iter()
            .fold(chain, |chain, layer| chain.add_layer(layer)))
    }

    /// Optimises the selected variables against the joint log-density of the
    /// first `p` layers.
    pub(super) fn fit_selection(
        config: &RegressorConfig,
        variables: &Variables,
        selection: &Selection,
        x: &Array2<f64>,
        y: &Array2<f64>,
        m: usize,
        p: usize,
    ) -> Result<Variables, RegressorError> {
        let initial = variables.pack(selection)?;
        let (base, chosen, cfg) = (variables.clone(), selection.clone(), config.clone());
        let (x, y) = (x.clone(), y.clone());
        let objective = move |point: ArrayView1<f64>| -> Result<f64, RegressorError> {
            let candidate = base.unpack(&chosen, point)?;
            let chain = construct_chain(&cfg, &candidate, m, p)?;
            let density = chain
                .logpdf(x.view(), y.view(), &LogpdfOptions::default())?
                .density()
                .unwrap_or(f64::NEG_INFINITY);
            Ok(-density)
        };
        let minimum = minimize(objective, initial, &config.optimizer)?;
        Ok(variables.unpack(selection, minimum.point.view())?)
    }

    /// Optimises layer `p` alone on inputs reconstructed once from the layers
    /// before it, which stay fixed.
    pub(super) fn fit_last_layer(
        config: &RegressorConfig,
        variables: &Variables,
        selection: &Selection,
        x: &Array2<f64>,
        y: &Array2<f64>,
        m: usize,
        p: usize,
    ) -> Result<Variables, RegressorError> {
        let chain = construct_chain(config, variables, m, p)?;
        let cached: LayerInputs = chain
            .logpdf(
                x.view(),
                y.view(),
                &LogpdfOptions {
                    return_inputs: true,
                    ..LogpdfOptions::default()
                },
            )?
            .into_inputs()
            .ok_or_else(|| RegressorError::InvalidInput("layer inputs were not returned".to_string()))?;
        log::debug!(
            "Cached {} rows of inputs for layer {}",
            cached.x.nrows(),
            p
        );

        let initial = variables.pack(selection)?;
        let (base, chosen, cfg) = (variables.clone(), selection.clone(), config.clone());
        let objective = move |point: ArrayView1<f64>| -> Result<f64, RegressorError> {
            let candidate = base.unpack(&chosen, point)?;
            let chain = construct_chain(&cfg, &candidate, m, p)?;
            Ok(-chain.layer_logpdf(p - 1, &cached)?)
        };
        let minimum = minimize(objective, initial, &config.optimizer)?;
        Ok(variables.unpack(selection, minimum.point.view())?)
    }

    /// Independent joint draws in parallel, each seeded from `rng` in order.
    pub(super) fn draw_samples(
        chain: &Gpar,
        x: ArrayView2<f64>,
        num_samples: usize,
        latent: bool,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Array2<f64>>, RegressorError> {
        let seeds: Vec<u64> = (0..num_samples).map(|_| rng.next_u64()).collect();
        let draws: Result<Vec<Array2<f64>>, ChainError> = seeds
            .par_iter()
            .map(|&seed| {
                let mut local = StdRng::seed_from_u64(seed);
                chain.sample(x, latent, &mut local)
            })
            .collect();
        Ok(draws?)
    }

    /// Elementwise percentile across the first axis, interpolating linearly
    /// between order statistics.
    pub(super) fn percentile(samples: &ndarray::Array3<f64>, percent: f64) -> Array2<f64> {
        let position = percent / 100.0 * (samples.len_of(Axis(0)) - 1) as f64;
        let below = position.floor() as usize;
        let above = position.ceil() as usize;
        let weight = position - below as f64;
        let (n, p) = (samples.len_of(Axis(1)), samples.len_of(Axis(2)));
        Array2::from_shape_fn((n, p), |(i, j)| {
            let mut values: Vec<f64> = samples.slice(ndarray::s![.., i, j]).to_vec();
            values.sort_by(|a, b| a.total_cmp(b));
            values[below] + weight * (values[above] - values[below])
        })
    }
}
