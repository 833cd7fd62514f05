//! # Hyperparameters and the Layer Factory
//!
//! Every layer of a chain is rebuilt from an immutable [`LayerParams`] record by
//! the pure factory [`layer`]. Layer `p` (1-based) sees `m` input features and
//! `p - 1` earlier outputs, and its latent kernel is
//!
//! ```text
//! constant
//!   + variance_in  · EQ(scales_in)   over the input columns
//!   + Linear(slopes)                 over the inputs and the visible outputs   (if linear)
//!   + variance_out · EQ(scales_out)  over the visible outputs                  (if nonlinear, p > 1)
//! ```
//!
//! with observation noise independent across rows. A Markov order `k` makes only the `k` most
//! recent outputs visible.
//!
//! The optimizer works on a flat vector. [`Variables::pack`] and
//! [`Variables::unpack`] translate between the records and that vector for a
//! [`Selection`] of trainable layers. Positive parameters travel as logarithms;
//! inducing inputs travel untransformed.

use crate::chain::Layer;
use crate::kernel::Kernel;
use crate::process::{Gp, Noise};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ParamsError {
    #[error("Layer {layer} expects {expected} values for '{field}', but its record holds {found}.")]
    FieldLength {
        layer: usize,
        field: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Layer {layer} has no '{field}' parameter, but the configuration requires one.")]
    MissingField { layer: usize, field: &'static str },

    #[error("Parameter vector has {found} entries, but the selection needs {expected}.")]
    VectorLength { expected: usize, found: usize },

    #[error("Layer {layer} was selected for training, but only {layers} layers exist.")]
    UnknownLayer { layer: usize, layers: usize },

    #[error("Inducing points were selected for training, but the model is dense.")]
    NoInducingPoints,
}

/// Structure of every layer kernel and the initial values of its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    /// Initial length scale of the EQ kernel over the inputs.
    pub scale: f64,
    pub linear: bool,
    /// Initial slope of the linear kernel.
    pub linear_slope: f64,
    pub nonlinear: bool,
    /// Initial length scale of the EQ kernel over the outputs.
    pub nonlinear_scale: f64,
    /// Initial noise variance; also the initial constant-kernel variance.
    pub noise: f64,
    /// Number of most recent outputs each layer may see; `None` sees all.
    pub markov: Option<usize>,
}

impl Default for LayerConfig {
    fn default() -> Self {
        LayerConfig {
            scale: 1.0,
            linear: true,
            linear_slope: 0.1,
            nonlinear: true,
            nonlinear_scale: 0.1,
            noise: 0.1,
            markov: None,
        }
    }
}

impl LayerConfig {
    /// Number of earlier outputs visible to layer `p` (1-based).
    pub fn visible_outputs(&self, p: usize) -> usize {
        let previous = p.saturating_sub(1);
        self.markov.map_or(previous, |k| k.min(previous))
    }

    /// Design-matrix columns holding the outputs visible to layer `p`.
    pub fn output_columns(&self, m: usize, p: usize) -> Range<usize> {
        let end = m + p.saturating_sub(1);
        end - self.visible_outputs(p)..end
    }
}

/// Hyperparameters of one layer. All values are strictly positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub constant: f64,
    pub input_variance: f64,
    pub input_scales: Vec<f64>,
    /// One slope per input and visible output; empty without a linear kernel.
    #[serde(default)]
    pub slopes: Vec<f64>,
    #[serde(default)]
    pub output_variance: Option<f64>,
    #[serde(default)]
    pub output_scales: Vec<f64>,
    pub noise: f64,
}

impl LayerParams {
    /// Initial record for layer `p` (1-based) over `m` input features.
    pub fn initial(m: usize, p: usize, config: &LayerConfig) -> Self {
        let visible = config.visible_outputs(p);
        let has_output_kernel = config.nonlinear && visible > 0;
        LayerParams {
            constant: config.noise,
            input_variance: 1.0,
            input_scales: vec![config.scale; m],
            slopes: if config.linear {
                vec![config.linear_slope; m + visible]
            } else {
                Vec::new()
            },
            output_variance: has_output_kernel.then_some(1.0),
            output_scales: if has_output_kernel {
                vec![config.nonlinear_scale; visible]
            } else {
                Vec::new()
            },
            noise: config.noise,
        }
    }

    /// Number of scalars in the record.
    pub fn num_values(&self) -> usize {
        3 + self.input_scales.len()
            + self.slopes.len()
            + usize::from(self.output_variance.is_some())
            + self.output_scales.len()
    }

    fn values(&self) -> Vec<f64> {
        let mut values = Vec::with_capacity(self.num_values());
        values.push(self.constant);
        values.push(self.input_variance);
        values.extend_from_slice(&self.input_scales);
        values.extend_from_slice(&self.slopes);
        values.extend(self.output_variance);
        values.extend_from_slice(&self.output_scales);
        values.push(self.noise);
        values
    }

    /// A record of the same shape holding `values` in [`LayerParams::values`] order.
    fn with_values(&self, values: &[f64]) -> LayerParams {
        let mut cursor = values.iter().copied();
        let mut take = |count: usize| -> Vec<f64> { cursor.by_ref().take(count).collect() };
        let constant = take(1);
        let input_variance = take(1);
        let input_scales = take(self.input_scales.len());
        let slopes = take(self.slopes.len());
        let output_variance = take(usize::from(self.output_variance.is_some()));
        let output_scales = take(self.output_scales.len());
        let noise = take(1);
        LayerParams {
            constant: constant.first().copied().unwrap_or(self.constant),
            input_variance: input_variance.first().copied().unwrap_or(self.input_variance),
            input_scales,
            slopes,
            output_variance: output_variance.first().copied(),
            output_scales,
            noise: noise.first().copied().unwrap_or(self.noise),
        }
    }
}

/// Builds layer `p` (1-based) over `m` input features from its record.
pub fn layer(
    params: &LayerParams,
    m: usize,
    p: usize,
    config: &LayerConfig,
) -> Result<Layer, ParamsError> {
    internal::check_shape(params, m, p, config)?;

    let outputs: Vec<usize> = config.output_columns(m, p).collect();
    let inputs: Vec<usize> = (0..m).collect();

    let mut kernel = Kernel::constant(params.constant)
        + Kernel::eq(
            params.input_variance,
            Array1::from(params.input_scales.clone()),
            inputs.clone(),
        );
    if config.linear {
        let columns: Vec<usize> = inputs.iter().chain(outputs.iter()).copied().collect();
        kernel = kernel + Kernel::linear(Array1::from(params.slopes.clone()), columns);
    }
    if let Some(variance) = params.output_variance {
        kernel = kernel
            + Kernel::eq(
                variance,
                Array1::from(params.output_scales.clone()),
                outputs,
            );
    }

    Ok(Layer::new(
        Arc::new(Gp::new(kernel)),
        Arc::new(Noise::new(params.noise)),
    ))
}

/// Which parts of [`Variables`] the optimizer may move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    /// 0-based layer indices, in packing order.
    pub layers: Vec<usize>,
    pub inducing_points: bool,
}

impl Selection {
    pub fn all(layers: usize, inducing_points: bool) -> Self {
        Selection {
            layers: (0..layers).collect(),
            inducing_points,
        }
    }
}

/// Every hyperparameter of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variables {
    pub layers: Vec<LayerParams>,
    #[serde(default)]
    pub inducing_points: Option<Array2<f64>>,
}

impl Variables {
    /// Initial records for `p` layers over `m` inputs.
    pub fn initial(m: usize, p: usize, config: &LayerConfig, x_ind: Option<Array2<f64>>) -> Self {
        Variables {
            layers: (1..=p).map(|i| LayerParams::initial(m, i, config)).collect(),
            inducing_points: x_ind,
        }
    }

    /// Truncates or extends, with initial records, to exactly `p` layers.
    pub fn resize(&mut self, m: usize, p: usize, config: &LayerConfig) {
        self.layers.truncate(p);
        for i in self.layers.len() + 1..=p {
            self.layers.push(LayerParams::initial(m, i, config));
        }
    }

    /// Builds the first `p` layers.
    pub fn build_layers(
        &self,
        m: usize,
        p: usize,
        config: &LayerConfig,
    ) -> Result<Vec<Layer>, ParamsError> {
        if p > self.layers.len() {
            return Err(ParamsError::UnknownLayer {
                layer: p - 1,
                layers: self.layers.len(),
            });
        }
        self.layers[..p]
            .iter()
            .enumerate()
            .map(|(i, params)| layer(params, m, i + 1, config))
            .collect()
    }

    /// Flattens the selected parameters: logarithms of the layer records, then
    /// the raw inducing inputs.
    pub fn pack(&self, selection: &Selection) -> Result<Array1<f64>, ParamsError> {
        let mut values = Vec::new();
        for &index in &selection.layers {
            let record = self.layer_record(index)?;
            values.extend(record.values().into_iter().map(f64::ln));
        }
        if selection.inducing_points {
            let z = self.inducing_points.as_ref().ok_or(ParamsError::NoInducingPoints)?;
            values.extend(z.iter().copied());
        }
        Ok(Array1::from(values))
    }

    /// Copy of `self` with the selected parameters taken from `point`.
    pub fn unpack(
        &self,
        selection: &Selection,
        point: ArrayView1<f64>,
    ) -> Result<Variables, ParamsError> {
        let expected = self.packed_len(selection)?;
        if point.len() != expected {
            return Err(ParamsError::VectorLength {
                expected,
                found: point.len(),
            });
        }

        let mut updated = self.clone();
        let mut offset = 0;
        for &index in &selection.layers {
            let record = self.layer_record(index)?;
            let count = record.num_values();
            let values: Vec<f64> = point
                .slice(ndarray::s![offset..offset + count])
                .iter()
                .map(|v| v.exp())
                .collect();
            updated.layers[index] = record.with_values(&values);
            offset += count;
        }
        if selection.inducing_points {
            let z = self.inducing_points.as_ref().ok_or(ParamsError::NoInducingPoints)?;
            let values = point.slice(ndarray::s![offset..]).to_owned();
            updated.inducing_points = Some(
                values
                    .into_shape_with_order(z.raw_dim())
                    .map_err(|_| ParamsError::VectorLength {
                        expected,
                        found: point.len(),
                    })?,
            );
        }
        Ok(updated)
    }

    fn packed_len(&self, selection: &Selection) -> Result<usize, ParamsError> {
        let mut total = 0;
        for &index in &selection.layers {
            total += self.layer_record(index)?.num_values();
        }
        if selection.inducing_points {
            total += self
                .inducing_points
                .as_ref()
                .ok_or(ParamsError::NoInducingPoints)?
                .len();
        }
        Ok(total)
    }

    fn layer_record(&self, index: usize) -> Result<&LayerParams, ParamsError> {
        self.layers.get(index).ok_or(ParamsError::UnknownLayer {
            layer: index,
            layers: self.layers.len(),
        })
    }
}

mod internal {
    use super::*;

    fn expect_len(
        layer: usize,
        field: &'static str,
        expected: usize,
        found: usize,
    ) -> Result<(), ParamsError> {
        if expected == found {
            Ok(())
        } else {
            Err(ParamsError::FieldLength {
                layer,
                field,
                expected,
                found,
            })
        }
    }

    /// Checks that a record matches the kernel structure of layer `p`.
    pub(super) fn check_shape(
        params: &LayerParams,
        m: usize,
        p: usize,
        config: &LayerConfig,
    ) -> Result<(), ParamsError> {
        let visible = config.visible_outputs(p);
        expect_len(p, "input_scales", m, params.input_scales.len())?;
        if config.linear {
            expect_len(p, "slopes", m + visible, params.slopes.len())?;
        }
        if config.nonlinear && visible > 0 {
            if params.output_variance.is_none() {
                return Err(ParamsError::MissingField {
                    layer: p,
                    field: "output_variance",
                });
            }
            expect_len(p, "output_scales", visible, params.output_scales.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn initial_records_follow_the_configuration() {
        let config = LayerConfig::default();
        let first = LayerParams::initial(2, 1, &config);
        assert_eq!(first.input_scales, vec![1.0, 1.0]);
        assert_eq!(first.slopes, vec![0.1, 0.1]);
        assert_eq!(first.output_variance, None);
        assert!(first.output_scales.is_empty());
        assert_eq!(first.constant, 0.1);
        assert_eq!(first.noise, 0.1);

        let third = LayerParams::initial(2, 3, &config);
        assert_eq!(third.slopes.len(), 4);
        assert_eq!(third.output_variance, Some(1.0));
        assert_eq!(third.output_scales, vec![0.1, 0.1]);
        assert_eq!(third.num_values(), 3 + 2 + 4 + 1 + 2);
    }

    #[test]
    fn markov_order_limits_visible_outputs() {
        let config = LayerConfig {
            markov: Some(1),
            ..LayerConfig::default()
        };
        assert_eq!(config.visible_outputs(1), 0);
        assert_eq!(config.visible_outputs(4), 1);
        assert_eq!(config.output_columns(2, 4), 4..5);

        let record = LayerParams::initial(2, 4, &config);
        assert_eq!(record.slopes.len(), 3);
        assert_eq!(record.output_scales.len(), 1);

        // Only the most recent output moves the kernel.
        let built = layer(&record, 2, 4, &config).unwrap();
        let a = array![[0.0, 0.0, 5.0, -5.0, 1.0]];
        let b = array![[0.0, 0.0, -5.0, 5.0, 1.0]];
        let kab = built.latent.covariance(a.view(), b.view()).unwrap();
        let kaa = built.latent.covariance(a.view(), a.view()).unwrap();
        assert_abs_diff_eq!(kab[[0, 0]], kaa[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn layer_kernel_uses_output_columns() {
        let config = LayerConfig {
            linear: false,
            ..LayerConfig::default()
        };
        let record = LayerParams::initial(1, 2, &config);
        let built = layer(&record, 1, 2, &config).unwrap();
        let a = array![[0.0, 0.0]];
        let b = array![[0.0, 1.0]];
        let k = built.latent.covariance(a.view(), b.view()).unwrap();
        // constant + input EQ at distance 0 + output EQ at distance 1 / 0.1
        let expected = 0.1 + 1.0 + (-0.5 * 100.0_f64).exp();
        assert_abs_diff_eq!(k[[0, 0]], expected, epsilon = 1e-12);

        let noise = built.noise.covariance(a.view(), a.view()).unwrap();
        assert_abs_diff_eq!(noise[[0, 0]], 0.1, epsilon = 1e-12);
    }

    #[test]
    fn mismatched_record_is_rejected() {
        let config = LayerConfig::default();
        let record = LayerParams::initial(1, 2, &config);
        let err = layer(&record, 3, 2, &config).unwrap_err();
        assert_eq!(
            err,
            ParamsError::FieldLength {
                layer: 2,
                field: "input_scales",
                expected: 3,
                found: 1
            }
        );
    }

    #[test]
    fn pack_and_unpack_touch_only_the_selection() {
        let config = LayerConfig::default();
        let vars = Variables::initial(1, 3, &config, Some(array![[0.0], [1.0]]));
        let selection = Selection {
            layers: vec![1],
            inducing_points: true,
        };
        let packed = vars.pack(&selection).unwrap();
        assert_eq!(packed.len(), vars.layers[1].num_values() + 2);
        assert_abs_diff_eq!(packed[0], 0.1_f64.ln(), epsilon = 1e-12);

        let mut moved = packed.clone();
        moved[0] = 0.0;
        let last = moved.len() - 1;
        moved[last] = 4.0;
        let updated = vars.unpack(&selection, moved.view()).unwrap();
        assert_abs_diff_eq!(updated.layers[1].constant, 1.0, epsilon = 1e-12);
        assert_eq!(updated.layers[0], vars.layers[0]);
        assert_eq!(updated.layers[2], vars.layers[2]);
        assert_eq!(updated.inducing_points, Some(array![[0.0], [4.0]]));

        let restored = vars.unpack(&selection, packed.view()).unwrap();
        for (a, b) in restored.layers[1].values().iter().zip(vars.layers[1].values()) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn unpack_checks_the_vector_length() {
        let vars = Variables::initial(1, 2, &LayerConfig::default(), None);
        let selection = Selection::all(2, false);
        let err = vars.unpack(&selection, array![0.0].view()).unwrap_err();
        assert!(matches!(err, ParamsError::VectorLength { found: 1, .. }));
        assert_eq!(
            vars.pack(&Selection::all(2, true)).unwrap_err(),
            ParamsError::NoInducingPoints
        );
    }

    #[test]
    fn resize_keeps_fitted_layers() {
        let config = LayerConfig::default();
        let mut vars = Variables::initial(1, 1, &config, None);
        vars.layers[0].noise = 0.5;
        vars.resize(1, 3, &config);
        assert_eq!(vars.layers.len(), 3);
        assert_eq!(vars.layers[0].noise, 0.5);
        assert_eq!(vars.layers[2], LayerParams::initial(1, 3, &config));
        assert_eq!(vars.build_layers(1, 3, &config).unwrap().len(), 3);
        vars.resize(1, 2, &config);
        assert_eq!(vars.layers.len(), 2);
    }
}
