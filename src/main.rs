//! Trains a network assembled by `lumen_nn::model_builder` on a toy dataset and plots how
//! the trained model uses its features
//!
//! # Usage
//! Runnable via
//! ```sh
//! cargo run -- -h
//! RUST_LOG=info cargo run -- --dataset moon --model-arg width=32 --model-arg act=selu
//! ```
//!
//! Writes a permutation importance chart, a heatmap of the first layer weights and 1D/2D
//! partial dependence charts to the output directory.

use std::{error::Error, fs, path::PathBuf};

use lumen_nn::{
    config::Objective,
    dataloader::DataLoader,
    datasets::{
        Dataset, FEATURE_NAMES, encode_targets, feature_names, get_class, load_dataset, n_classes,
    },
    interpretation::{
        InteractOptions, PdpOptions, plot_1d_partial_dependence, plot_2d_partial_dependence,
        plot_embedding, plot_importance,
    },
    loss::Loss,
    model_builder::{ModelBuilder, Network},
    nn::Module,
    partial_dependence::{FeatureFrame, permutation_importance, predict},
    plot_settings::PlotSettings,
};

use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = Dataset::Moon)]
    dataset: Dataset,
    /// Task label, e.g. "binary classification", "multiclass" or "regression".
    /// Follows the dataset when omitted
    #[clap(long)]
    objective: Option<String>,
    /// Model hyperparameter as key=value (width, depth, do, bn, act, res, dense), applied over
    /// width=16 depth=3
    #[clap(long = "model-arg", value_parser = parse_key_val)]
    model_args: Vec<(String, String)>,
    /// Optimiser setting as key=value (opt, lr, momentum, beta1, beta2, eps, weight_decay),
    /// applied over opt=adam lr=0.01
    #[clap(long = "opt-arg", value_parser = parse_key_val)]
    opt_args: Vec<(String, String)>,
    /// Overrides the loss chosen from the objective
    #[clap(long)]
    loss: Option<Loss>,
    #[clap(short, long, default_value_t = 200)]
    class_size: usize,
    #[clap(short, long, default_value_t = 32)]
    batch_size: usize,
    #[clap(short, long, default_value_t = 30)]
    epochs: usize,
    #[clap(short, long, default_value_t = 5)]
    print_epochs: usize,
    #[clap(short, long, default_value_t = format!("output"))]
    output_dir: String,
    /// Chart file extension, `.png` or `.svg`
    #[clap(long, default_value_t = format!(".png"))]
    format: String,
    #[clap(long, default_value_t = 42)]
    seed: u64,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

const MODEL_DEFAULTS: [(&str, &str); 2] = [("width", "16"), ("depth", "3")];
const OPT_DEFAULTS: [(&str, &str); 2] = [("opt", "adam"), ("lr", "0.01")];

/// Defaults followed by the user's pairs, later keys win when parsed
fn with_defaults(
    defaults: &[(&str, &str)],
    pairs: &[(String, String)],
) -> Vec<(String, String)> {
    defaults
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain(pairs.iter().cloned())
        .collect()
}

/// Share of correctly classified samples
fn accuracy(
    model: &Network,
    data: &[Vec<f32>],
    targets: &[f32],
    n_out: usize,
) -> Result<f32, Box<dyn Error>> {
    let mut correct = 0;
    for (row, target) in data.iter().zip(targets) {
        let pred = if n_out > 1 {
            let outputs = (0..n_out)
                .map(|o| predict(model, row, o))
                .collect::<Result<Vec<_>, _>>()?;
            get_class(&outputs) as f32
        } else if predict(model, row, 0)? > 0.5 {
            1.0
        } else {
            0.0
        };
        if pred == *target {
            correct += 1;
        }
    }
    Ok(correct as f32 / data.len().max(1) as f32)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut rng = Pcg64Mcg::seed_from_u64(args.seed);
    let samples = load_dataset(args.dataset, args.class_size, &mut rng);

    let objective_label = args
        .objective
        .clone()
        .unwrap_or_else(|| args.dataset.default_objective().to_string());
    let objective: Objective = objective_label.parse()?;
    let n_out = match objective {
        Objective::MulticlassClassification => n_classes(&samples.targets),
        _ => 1,
    };
    let n_in = FEATURE_NAMES.len();

    let builder = ModelBuilder::from_pairs(
        &objective_label,
        n_in,
        n_out,
        with_defaults(&MODEL_DEFAULTS, &args.model_args),
        with_defaults(&OPT_DEFAULTS, &args.opt_args),
        args.loss,
    )?
    .with_seed(rng.random());
    let (mut model, mut optim, loss) = builder.get_model();
    log::info!("Training on {} with {}", args.dataset, model.summary());

    let targets = encode_targets(&samples.targets, objective, n_out);
    let data_loader = DataLoader::new(&samples.data, &targets, args.batch_size, true)?;
    let print_every = args.print_epochs.max(1);

    for epoch in 0..args.epochs {
        let mut epoch_loss = 0.0;
        let mut n_batches = 0;
        for (batch_data, batch_targets) in data_loader.iter_with(&mut rng) {
            let y_pred = model.forward_batch(&batch_data)?;
            let batch_loss = loss.batch_mean(&y_pred, &batch_targets);
            batch_loss.backward();
            optim.step();
            optim.zero_grad();
            epoch_loss += batch_loss.data();
            n_batches += 1;
        }
        if epoch % print_every == 0 || epoch + 1 == args.epochs {
            log::info!(
                "epoch: {}, mean {} loss: {}",
                epoch + 1,
                loss,
                epoch_loss / n_batches.max(1) as f32
            );
        }
    }

    model.set_training(false);
    if objective.is_classification() {
        log::info!(
            "Training accuracy: {:.3}",
            accuracy(&model, &samples.data, &samples.targets, n_out)?
        );
    }

    fs::create_dir_all(&args.output_dir)?;
    let settings = PlotSettings {
        savepath: PathBuf::from(&args.output_dir),
        format: args.format.clone(),
        title: format!("{} ({})", args.dataset, objective),
        ..Default::default()
    };

    let frame = FeatureFrame::new(feature_names(), samples.data.clone())?;
    let importances = permutation_importance(&model, &frame, &targets, loss, 5, &mut rng)?;
    for imp in &importances {
        log::info!(
            "importance of {}: {:.4} +/- {:.4}",
            imp.feature,
            imp.importance,
            imp.uncertainty.unwrap_or(0.0)
        );
    }
    plot_importance(
        &importances,
        Some(format!("importance_{}", args.dataset).as_str()),
        &settings,
    )?;
    plot_embedding(
        &model.head_weights(),
        "Hidden unit",
        Some(format!("head_weights_{}", args.dataset).as_str()),
        &settings,
    )?;

    let sample_size = Some(frame.n_rows().min(100));
    let pdp_opts = PdpOptions {
        sample_size,
        ..Default::default()
    };
    for feat in FEATURE_NAMES {
        plot_1d_partial_dependence(
            &model,
            &frame,
            feat,
            &pdp_opts,
            &mut rng,
            Some(format!("pdp_{}_{}", feat, args.dataset).as_str()),
            &settings,
        )?;
    }
    let interact_opts = InteractOptions {
        sample_size,
        n_points: (15, 15),
        ..Default::default()
    };
    plot_2d_partial_dependence(
        &model,
        &frame,
        (FEATURE_NAMES[0], FEATURE_NAMES[1]),
        &interact_opts,
        &mut rng,
        Some(format!("pdp_x_y_{}", args.dataset).as_str()),
        &settings,
    )?;
    Ok(())
}
