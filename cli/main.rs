#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::{Path, PathBuf};
use std::process;

use gpar::data::{load_table, write_predictions};
use gpar::{GparRegressor, RegressorConfig};

const MODEL_PATH: &str = "model.toml";
const PREDICTIONS_PATH: &str = "predictions.tsv";

#[derive(Args)]
pub struct TrainArgs {
    /// Path to training TSV: input columns first, then one column per output
    pub training_data: PathBuf,

    /// Number of leading columns that are input features
    #[arg(long, value_name = "N")]
    pub num_inputs: usize,

    /// Optional TOML configuration; absent keys take their defaults
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Fit layers one at a time instead of all at once
    #[arg(long)]
    pub progressive: bool,

    /// Forward observed outputs instead of their predictive means
    #[arg(long)]
    pub no_replace: bool,

    /// Leave missing outputs unimputed when forwarding them
    #[arg(long)]
    pub no_impute: bool,

    /// Let each layer see only the K most recent outputs
    #[arg(long, value_name = "K")]
    pub markov: Option<usize>,

    /// Maximum number of BFGS iterations
    #[arg(long)]
    pub max_iterations: Option<usize>,
}

#[derive(Args)]
pub struct InferArgs {
    /// Path to TSV with the same input columns as the training data
    pub test_data: PathBuf,

    /// Path to trained model file (.toml)
    #[arg(long, default_value = MODEL_PATH)]
    pub model: PathBuf,

    /// Number of posterior draws
    #[arg(long, default_value = "100")]
    pub num_samples: usize,

    /// Include observation noise in the draws
    #[arg(long)]
    pub noisy: bool,

    /// Omit the 2.5% and 97.5% credible bounds
    #[arg(long)]
    pub no_bounds: bool,

    /// Seed for the posterior draws
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {}", path.display());
            RegressorConfig::load(path)?
        }
        None => RegressorConfig::default(),
    };
    if args.no_replace {
        config.replace = false;
    }
    if args.no_impute {
        config.impute = false;
    }
    if args.markov.is_some() {
        config.layers.markov = args.markov;
    }
    if let Some(max_iterations) = args.max_iterations {
        config.optimizer.max_iterations = max_iterations;
    }

    println!("Loading training data from: {}", args.training_data.display());
    let table = load_table(&args.training_data, args.num_inputs)?;
    println!(
        "Loaded {} rows with {} inputs and {} outputs",
        table.inputs.nrows(),
        table.inputs.ncols(),
        table.outputs.ncols()
    );
    let missing = table.outputs.iter().filter(|v| gpar::missing::is_missing(**v)).count();
    if missing > 0 {
        println!("{missing} output values are missing");
    }

    println!("Training GPAR model...");
    let mut regressor = GparRegressor::new(config).with_output_names(table.output_names.clone());
    regressor.fit(table.inputs.view(), table.outputs.view(), args.progressive)?;
    regressor.save(Path::new(MODEL_PATH))?;
    println!("Model saved to: {MODEL_PATH}");
    Ok(())
}

pub fn infer(args: InferArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", args.model.display());
    let regressor = GparRegressor::load(&args.model)?;
    let num_inputs = regressor
        .variables()
        .and_then(|v| v.layers.first())
        .map_or(0, |layer| layer.input_scales.len());

    println!("Loading test data from: {}", args.test_data.display());
    let table = load_table(&args.test_data, num_inputs)?;
    println!("Loaded {} rows for prediction", table.inputs.nrows());

    let output_names = regressor.output_names();

    println!("Drawing {} posterior samples...", args.num_samples);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let prediction = regressor.predict(
        table.inputs.view(),
        args.num_samples,
        !args.noisy,
        !args.no_bounds,
        &mut rng,
    )?;
    write_predictions(Path::new(PREDICTIONS_PATH), &output_names, &prediction)?;
    println!("Predictions saved to: {PREDICTIONS_PATH}");
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "gpar",
    about = "Autoregressive Gaussian-process regression for multi-output data",
    long_about = "Fits a chain of Gaussian processes, one per output, where each output is \
                 modelled given the inputs and all earlier outputs. Missing outputs are allowed."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a GPAR model to training data
    #[command(about = "Fit a GPAR model (outputs: model.toml)")]
    Train(TrainArgs),

    /// Predict outputs for new inputs with a fitted model
    #[command(about = "Predict with a fitted model (outputs: predictions.tsv)")]
    Infer(InferArgs),

    /// Display version information
    Version,
}

fn main() {
    env_logger::init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Infer(args)) => infer(args),
        Some(Commands::Version) => {
            println!("gpar {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|_| println!())
            .map_err(|e| e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
