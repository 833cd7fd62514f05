#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

//! Autoregressive Gaussian-process regression (GPAR) for multi-output data
//! with missing observations.

pub mod chain;
pub mod data;
pub mod kernel;
pub mod missing;
pub mod optimize;
pub mod params;
pub mod process;
pub mod regressor;

pub use chain::{Gpar, Layer, LogpdfOptions};
pub use missing::MISSING;
pub use regressor::{GparRegressor, Prediction, RegressorConfig, RegressorError};
