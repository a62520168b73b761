use std::{fs::File, io::BufReader, path::Path};

use anyhow::{Context, Error};
use log::debug;
use reclearn::cml::CmlConfig;
use structopt::StructOpt;

use self::{evaluate::EvaluateCmd, train::TrainCmd};

mod cli_callbacks;
mod evaluate;
mod train;

/// Commands related to collaborative metric learning (train, evaluate).
#[derive(StructOpt, Debug)]
pub enum CmlCmd {
    Train(TrainCmd),
    Evaluate(EvaluateCmd),
}

impl CmlCmd {
    pub fn run(self) -> Result<i32, Error> {
        use CmlCmd::*;
        match self {
            Train(cmd) => cmd.run(),
            Evaluate(cmd) => cmd.run(),
        }
    }
}

/// Hyper-parameters which override the ones of the config file.
#[derive(StructOpt, Debug, Default)]
pub(crate) struct ConfigOverrides {
    /// Dimension of the user and item embeddings.
    #[structopt(long)]
    embed_dim: Option<usize>,

    /// Hinge loss threshold.
    #[structopt(long)]
    margin: Option<f32>,

    /// Learning rate of the Adagrad optimizers.
    #[structopt(long)]
    learning_rate: Option<f32>,

    /// Upper bound of the embedding norms.
    #[structopt(long)]
    clip_norm: Option<f32>,

    /// Units in the hidden layer of the feature projector.
    #[structopt(long)]
    hidden_layer_dim: Option<usize>,

    /// Dropout rate of the feature projector.
    #[structopt(long)]
    dropout_rate: Option<f32>,

    /// Weight of the feature loss.
    #[structopt(long)]
    feature_l2_reg: Option<f32>,

    /// Scaling of the feature projection.
    #[structopt(long)]
    feature_projection_scaling_factor: Option<f32>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut CmlConfig) {
        let Self {
            embed_dim,
            margin,
            learning_rate,
            clip_norm,
            hidden_layer_dim,
            dropout_rate,
            feature_l2_reg,
            feature_projection_scaling_factor,
        } = self;

        fn set<T>(field: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *field = value;
            }
        }
        set(&mut config.embed_dim, embed_dim);
        set(&mut config.margin, margin);
        set(&mut config.master_learning_rate, learning_rate);
        set(&mut config.clip_norm, clip_norm);
        set(&mut config.hidden_layer_dim, hidden_layer_dim);
        set(&mut config.dropout_rate, dropout_rate);
        set(&mut config.feature_l2_reg, feature_l2_reg);
        set(
            &mut config.feature_projection_scaling_factor,
            feature_projection_scaling_factor,
        );
    }
}

/// Loads the JSON config if given, applies the overrides and validates the result.
pub(crate) fn load_config(
    file: Option<&Path>,
    overrides: ConfigOverrides,
) -> Result<CmlConfig, Error> {
    let mut config = match file {
        Some(file) => {
            let reader = BufReader::new(
                File::open(file).with_context(|| format!("Opening {} failed.", file.display()))?,
            );
            serde_json::from_reader(reader)
                .with_context(|| format!("Parsing config {} failed.", file.display()))?
        }
        None => CmlConfig::default(),
    };
    overrides.apply(&mut config);
    config.validate().context("Invalid CML config.")?;
    debug!("using {:?}", config);
    Ok(config)
}
