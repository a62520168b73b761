use std::path::PathBuf;

use anyhow::{Context, Error};
use reclearn::{cml::Cml, evaluation::RankingEvaluator};
use structopt::StructOpt;

use super::{load_config, ConfigOverrides};
use crate::{
    data::{load_dense_matrix, load_pairs, train_and_test_matrices},
    exit_code::{NON_FATAL_ERROR, NO_ERROR},
    utils::{format_report, progress_spin_until_done, EvaluationArgs},
};

/// Evaluates a trained CML model on held out interactions.
#[derive(StructOpt, Debug)]
pub struct EvaluateCmd {
    /// A csv file with the `user,item` training interactions, they are excluded from the rankings.
    #[structopt(long)]
    train: PathBuf,

    /// A csv file with the `user,item` test interactions.
    #[structopt(long)]
    test: PathBuf,

    /// File containing the model parameters.
    ///
    /// E.g. `cml_final.binparams`
    #[structopt(long)]
    parameters: PathBuf,

    /// A csv file with one row of features per item, required if the model has a feature projector.
    #[structopt(long)]
    features: Option<PathBuf>,

    /// The JSON file with the hyper-parameters the model was trained with.
    #[structopt(long)]
    config: Option<PathBuf>,

    #[structopt(flatten)]
    overrides: ConfigOverrides,

    #[structopt(flatten)]
    evaluation: EvaluationArgs,

    /// Prints the report as JSON.
    #[structopt(long)]
    json: bool,
}

impl EvaluateCmd {
    pub fn run(self) -> Result<i32, Error> {
        let Self {
            train,
            test,
            parameters,
            features,
            config,
            overrides,
            evaluation,
            json,
        } = self;

        let config = load_config(config.as_deref(), overrides)?;
        let settings = evaluation.into_settings();
        let features = features
            .map(|path| load_dense_matrix(&path, b','))
            .transpose()?;
        let model = Cml::load_from_file(parameters, features, config)
            .context("Loading the model failed.")?;

        let (train, test) =
            progress_spin_until_done("Loading interactions", || -> Result<_, Error> {
                train_and_test_matrices(
                    load_pairs(&train)?,
                    load_pairs(&test)?,
                    Some(model.nr_users()),
                    Some(model.nr_items()),
                )
            })?;
        let evaluator = RankingEvaluator::new(train, test)?;

        let report =
            progress_spin_until_done("Evaluating", || evaluator.evaluate(&model, &settings))?;
        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}", format_report(&report));
        }

        if report.nr_users == 0 {
            eprintln!("No user with test interactions was evaluated.");
            Ok(NON_FATAL_ERROR)
        } else {
            Ok(NO_ERROR)
        }
    }
}
