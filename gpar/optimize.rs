//! BFGS minimisation of a scalar objective with a finite-difference gradient.
//!
//! The chain's log-density has no analytic gradient here, so the gradient is
//! taken by central differences. Coordinates are evaluated in parallel.

use ndarray::{Array1, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Cost reported to the line search in place of a failed or non-finite value.
const PENALTY_COST: f64 = 1e10;

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Objective is not finite at the starting point ({0}); cannot start BFGS.")]
    NonFiniteStart(String),

    #[error("BFGS failed without visiting a finite point: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Step of the central-difference gradient, in optimizer coordinates.
    pub gradient_step: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            tolerance: 1e-6,
            max_iterations: 100,
            gradient_step: 1e-5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    pub value: f64,
    pub iterations: usize,
}

/// Minimises `objective` from `initial`.
///
/// Evaluation errors and non-finite values are reported to the line search as a
/// large finite cost. If BFGS stops with an error, the best point it evaluated
/// is returned instead.
pub fn minimize<F, E>(
    objective: F,
    initial: Array1<f64>,
    config: &OptimizerConfig,
) -> Result<Minimum, OptimizeError>
where
    F: Fn(ArrayView1<f64>) -> Result<f64, E> + Send + Sync + 'static,
    E: Display,
{
    match objective(initial.view()) {
        Ok(value) if value.is_finite() => {
            log::info!("Initial objective: {:.6}", value);
        }
        Ok(value) => return Err(OptimizeError::NonFiniteStart(value.to_string())),
        Err(e) => return Err(OptimizeError::NonFiniteStart(e.to_string())),
    }

    let objective = Arc::new(objective);
    let best: Arc<Mutex<Option<(f64, Array1<f64>)>>> = Arc::new(Mutex::new(None));
    let step = config.gradient_step;

    let tracker = best.clone();
    let cost_and_grad = move |point: &Array1<f64>| -> (f64, Array1<f64>) {
        let cost = internal::guarded_cost(objective.as_ref(), point.view());
        if cost < PENALTY_COST {
            if let Ok(mut best) = tracker.lock() {
                if best.as_ref().is_none_or(|(value, _)| cost < *value) {
                    *best = Some((cost, point.clone()));
                }
            }
        }
        let grad = internal::central_difference(objective.as_ref(), point.view(), step);
        (cost, grad)
    };

    log::info!("Starting BFGS over {} parameters", initial.len());
    match Bfgs::new(initial, cost_and_grad)
        .with_tolerance(config.tolerance)
        .with_max_iterations(config.max_iterations)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            final_value,
            iterations,
            ..
        }) => {
            log::info!(
                "BFGS finished after {} iterations with objective {:.6}",
                iterations,
                final_value
            );
            Ok(Minimum {
                point: final_point,
                value: final_value,
                iterations,
            })
        }
        Err(e) => {
            let recovered = best.lock().ok().and_then(|mut best| best.take());
            match recovered {
                Some((value, point)) => {
                    log::warn!(
                        "BFGS stopped early ({:?}); keeping the best point seen, objective {:.6}",
                        e,
                        value
                    );
                    Ok(Minimum {
                        point,
                        value,
                        iterations: 0,
                    })
                }
                None => Err(OptimizeError::Failed(format!("{e:?}"))),
            }
        }
    }
}

mod internal {
    use super::*;

    pub(super) fn guarded_cost<F, E>(objective: &F, point: ArrayView1<f64>) -> f64
    where
        F: Fn(ArrayView1<f64>) -> Result<f64, E>,
        E: Display,
    {
        match objective(point) {
            Ok(cost) if cost.is_finite() => cost,
            Ok(cost) => {
                log::warn!("Non-finite objective {}, returning a large finite value", cost);
                PENALTY_COST
            }
            Err(e) => {
                log::warn!("Objective evaluation failed: {}, returning a large finite value", e);
                PENALTY_COST
            }
        }
    }

    /// Central-difference gradient; each coordinate is evaluated in parallel.
    pub(super) fn central_difference<F, E>(
        objective: &F,
        point: ArrayView1<f64>,
        step: f64,
    ) -> Array1<f64>
    where
        F: Fn(ArrayView1<f64>) -> Result<f64, E> + Sync,
        E: Display,
    {
        let grad: Vec<f64> = (0..point.len())
            .into_par_iter()
            .map(|i| {
                let mut forward = point.to_owned();
                let mut backward = point.to_owned();
                forward[i] += step;
                backward[i] -= step;
                let up = guarded_cost(objective, forward.view());
                let down = guarded_cost(objective, backward.view());
                if up >= PENALTY_COST || down >= PENALTY_COST {
                    0.0
                } else {
                    (up - down) / (2.0 * step)
                }
            })
            .collect();
        Array1::from(grad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quadratic(x: ArrayView1<f64>) -> Result<f64, String> {
        Ok((x[0] - 1.0).powi(2) + 3.0 * (x[1] + 2.0).powi(2))
    }

    #[test]
    fn central_difference_matches_analytic_gradient() {
        let grad = internal::central_difference(&quadratic, array![0.0, 0.0].view(), 1e-5);
        assert_abs_diff_eq!(grad[0], -2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[1], 12.0, epsilon = 1e-6);
    }

    #[test]
    fn minimize_finds_quadratic_minimum() {
        let minimum = minimize(quadratic, array![3.0, 3.0], &OptimizerConfig::default()).unwrap();
        assert_abs_diff_eq!(minimum.point[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(minimum.point[1], -2.0, epsilon = 1e-3);
        assert!(minimum.value < 1e-5);
    }

    #[test]
    fn failing_objective_is_penalised() {
        let failing = |_: ArrayView1<f64>| -> Result<f64, String> { Err("boom".to_string()) };
        assert_eq!(internal::guarded_cost(&failing, array![0.0].view()), PENALTY_COST);
        assert!(matches!(
            minimize(failing, array![0.0], &OptimizerConfig::default()),
            Err(OptimizeError::NonFiniteStart(_))
        ));
    }
}
