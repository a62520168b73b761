use std::{
    fs::{self, File},
    io::BufWriter,
    path::PathBuf,
};

use anyhow::{bail, Context, Error};
use log::info;
use rand::{rngs::StdRng, SeedableRng};
use reclearn::{
    cml::{Adagrad, Cml, CmlConfig, CmlTrainer, DEFAULT_BATCHES_PER_ROUND},
    evaluation::{EvaluationSettings, RankingEvaluator, ValidationReport},
    sampler::WarpSampler,
};
use serde::Serialize;
use structopt::StructOpt;

use super::{
    cli_callbacks::{
        CliTrainingControllerBuilder,
        NoFeedback,
        OutputDir,
        ProgressBarTrainingFeedback,
        TrainingFeedback,
        TrainingSummary,
    },
    load_config,
    ConfigOverrides,
};
use crate::{
    data::{load_dense_matrix, load_pairs, train_and_test_matrices},
    exit_code::NO_ERROR,
    utils::{format_report, progress_spin_until_done, rng_from_seed, EvaluationArgs},
};

/// Trains a CML model.
#[derive(StructOpt, Debug)]
pub struct TrainCmd {
    /// A csv file with the `user,item` training interactions.
    #[structopt(long)]
    train: PathBuf,

    /// A csv file with the `user,item` validation interactions.
    #[structopt(long)]
    validation: PathBuf,

    /// Number of users, inferred from the interactions if not given.
    #[structopt(long)]
    num_users: Option<usize>,

    /// Number of items, inferred from the interactions if not given.
    #[structopt(long)]
    num_items: Option<usize>,

    /// A csv file with one row of features per item, enables the feature projector.
    #[structopt(long)]
    features: Option<PathBuf>,

    /// A JSON file with the hyper-parameters.
    #[structopt(long)]
    config: Option<PathBuf>,

    #[structopt(flatten)]
    overrides: ConfigOverrides,

    /// Number of interactions in each batch.
    #[structopt(long, default_value = "50000")]
    batch_size: usize,

    /// Number of negative items sampled for each interaction.
    #[structopt(long, default_value = "20")]
    nr_negatives: usize,

    /// Maximal number of training rounds.
    #[structopt(long)]
    rounds: usize,

    /// Number of batches in each round, the model is validated before each round.
    #[structopt(long, default_value = "100")]
    batches_per_round: usize,

    #[structopt(flatten)]
    evaluation: EvaluationArgs,

    /// Stops once the validation recall didn't improve for this many rounds.
    #[structopt(long)]
    patience: Option<usize>,

    /// Seed for the initialization, sampling and dropout.
    #[structopt(long)]
    seed: Option<u64>,

    /// Uses given parameters instead of initializing them randomly.
    #[structopt(long)]
    use_initial_parameters: Option<PathBuf>,

    /// Directory to store outputs in.
    #[structopt(short, long, default_value = "./")]
    out_dir: PathBuf,

    /// After how many rounds an intermediate result should be dumped (if at all).
    #[structopt(long)]
    dump_every: Option<usize>,

    /// Dumps the initial parameters before any training was done.
    #[structopt(long)]
    dump_initial_parameters: bool,

    /// Logs the progress instead of showing progress bars.
    #[structopt(long)]
    no_progress_bars: bool,
}

/// Everything written to `training.json` after training.
#[derive(Serialize)]
struct TrainingHistory<'a> {
    config: &'a CmlConfig,
    settings: &'a EvaluationSettings,
    best_round: Option<usize>,
    round_losses: &'a [f32],
    reports: &'a [ValidationReport],
}

impl TrainCmd {
    pub fn run(self) -> Result<i32, Error> {
        if self.no_progress_bars {
            self.run_with_feedback(NoFeedback)
        } else {
            self.run_with_feedback(ProgressBarTrainingFeedback::new())
        }
    }

    fn run_with_feedback(self, training_feedback: impl TrainingFeedback) -> Result<i32, Error> {
        let TrainCmd {
            train,
            validation,
            num_users,
            num_items,
            features,
            config,
            overrides,
            batch_size,
            nr_negatives,
            rounds,
            batches_per_round,
            evaluation,
            patience,
            seed,
            use_initial_parameters,
            out_dir,
            dump_every,
            dump_initial_parameters,
            no_progress_bars: _,
        } = self;

        if batches_per_round == 0 {
            bail!(
                "At least one batch per round is needed, the default is {}.",
                DEFAULT_BATCHES_PER_ROUND
            );
        }
        let config = load_config(config.as_deref(), overrides)?;
        let settings = evaluation.into_settings();
        let mut rng = rng_from_seed(seed);

        let (train, validation, features) =
            progress_spin_until_done("Loading data", || -> Result<_, Error> {
                let (train, validation) = train_and_test_matrices(
                    load_pairs(&train)?,
                    load_pairs(&validation)?,
                    num_users,
                    num_items,
                )?;
                let features = features
                    .map(|path| load_dense_matrix(&path, b','))
                    .transpose()?;
                Ok((train, validation, features))
            })
            .context("Loading training & validation data failed.")?;
        info!(
            "{} users, {} items, {} training and {} validation interactions",
            train.num_users(),
            train.num_items(),
            train.nnz(),
            validation.nnz()
        );

        let model = if let Some(initial_params_file) = use_initial_parameters {
            let model = Cml::load_from_file(initial_params_file, features, config.clone())
                .context("Loading initial parameters failed.")?;
            if (model.nr_users(), model.nr_items()) != train.shape() {
                bail!(
                    "Initial parameters are for {} users and {} items, the interactions have shape {:?}.",
                    model.nr_users(),
                    model.nr_items(),
                    train.shape()
                );
            }
            model
        } else {
            Cml::new(
                train.num_users(),
                train.num_items(),
                features,
                config.clone(),
                &mut rng,
            )
            .context("Creating the model failed.")?
        };

        fs::create_dir_all(&out_dir)
            .with_context(|| format!("Creating {} failed.", out_dir.display()))?;
        let file_output = OutputDir::new(&out_dir);
        if dump_initial_parameters {
            file_output.save_model_parameters(&model, OutputDir::SUFFIX_INITIAL)?;
        }

        let sampler_rng = StdRng::from_rng(&mut rng)?;
        let sampler = WarpSampler::new(&train, batch_size, nr_negatives, sampler_rng)
            .context("Creating the batch sampler failed.")?;
        let evaluator = RankingEvaluator::new(train, validation)?;
        let controller = CliTrainingControllerBuilder {
            file_output: file_output.clone(),
            training_feedback,
            dump_every,
            patience,
        }
        .build();
        let optimizer = Adagrad::new(config.master_learning_rate);

        let summary = CmlTrainer::new(model, sampler, evaluator, controller, optimizer, rng)
            .train(rounds, batches_per_round, &settings)
            .context("Training failed.")?;

        file_output.save_model_parameters(&summary.model, OutputDir::SUFFIX_FINAL)?;
        write_history(&file_output, &config, &settings, &summary)?;
        if let Some(report) = summary.reports.last() {
            println!("{}", format_report(report));
        }
        Ok(NO_ERROR)
    }
}

fn write_history(
    file_output: &OutputDir,
    config: &CmlConfig,
    settings: &EvaluationSettings,
    summary: &TrainingSummary,
) -> Result<(), Error> {
    let history = TrainingHistory {
        config,
        settings,
        best_round: summary.best_round,
        round_losses: &summary.round_losses,
        reports: &summary.reports,
    };
    let path = file_output.path().join("training.json");
    let writer = BufWriter::new(
        File::create(&path).with_context(|| format!("Creating {} failed.", path.display()))?,
    );
    serde_json::to_writer_pretty(writer, &history).context("Writing the training history failed.")
}
