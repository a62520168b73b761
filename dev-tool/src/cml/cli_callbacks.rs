use std::{path::Path, sync::Arc, time::Instant};

use indicatif::{FormattedDuration, MultiProgress, ProgressBar, ProgressStyle};
use layer::io::StoringBinParamsFailed;
use log::{debug, info, trace};
use reclearn::{
    cml::{BatchLoss, Cml, RoundOutcome, TrainingController},
    evaluation::ValidationReport,
};

use crate::utils::format_report;

/// Builder to create a [`CliTrainingController`].
pub(crate) struct CliTrainingControllerBuilder<F>
where
    F: TrainingFeedback,
{
    /// The output used to store the model parameters.
    pub(crate) file_output: OutputDir,

    /// Implementation used to hint the training progress to the user.
    pub(crate) training_feedback: F,

    /// If included dumps the current model parameters every `n` rounds.
    ///
    /// The model will be written to the output folder in the form of
    /// `cml_{round}.binparams`.
    pub(crate) dump_every: Option<usize>,

    /// If included stops once the validation recall didn't improve for this many rounds.
    pub(crate) patience: Option<usize>,
}

impl<F> CliTrainingControllerBuilder<F>
where
    F: TrainingFeedback,
{
    /// Builds the `CliTrainingController`.
    pub(crate) fn build(self) -> CliTrainingController<F> {
        CliTrainingController {
            early_stopping: EarlyStopping::new(self.patience),
            setup: self,
            reports: Vec::new(),
            round_losses: Vec::new(),
            batch_losses: Vec::new(),
            start_time: None,
        }
    }
}

/// Result of a training run.
pub(crate) struct TrainingSummary {
    pub(crate) model: Cml,
    /// Validation result before each round and after the last one.
    pub(crate) reports: Vec<ValidationReport>,
    /// Mean training loss of each round.
    pub(crate) round_losses: Vec<f32>,
    /// Round with the best validation recall.
    pub(crate) best_round: Option<usize>,
}

/// Training controller for usage in a CLI setup.
pub(crate) struct CliTrainingController<F>
where
    F: TrainingFeedback,
{
    setup: CliTrainingControllerBuilder<F>,
    early_stopping: EarlyStopping,
    reports: Vec<ValidationReport>,
    round_losses: Vec<f32>,
    /// Losses of the batches of the current round.
    batch_losses: Vec<f32>,
    /// The time at which the training started.
    start_time: Option<Instant>,
}

impl<F> TrainingController for CliTrainingController<F>
where
    F: TrainingFeedback,
{
    type Error = StoringBinParamsFailed;
    type Outcome = TrainingSummary;

    fn begin_of_training(&mut self, nr_rounds: usize) -> Result<(), Self::Error> {
        self.start_time = Some(Instant::now());
        info!("Beginning of training for {} rounds", nr_rounds);

        self.setup.training_feedback.start_feedback();
        self.setup
            .training_feedback
            .reset_train_progress(nr_rounds as u64);
        Ok(())
    }

    fn evaluation_result(
        &mut self,
        round: usize,
        report: &ValidationReport,
    ) -> Result<(), Self::Error> {
        let line = format!("Validation before round {:0>4}: {}", round, format_report(report));
        debug!("{}", line);
        self.setup.training_feedback.println(&line);

        self.early_stopping.observe(round, report.recall);
        self.reports.push(*report);
        Ok(())
    }

    fn begin_of_round(&mut self, round: usize, nr_batches: usize) -> Result<(), Self::Error> {
        debug!("Beginning of round #{:0>4} ({} batches)", round, nr_batches);
        self.batch_losses.clear();
        self.setup
            .training_feedback
            .reset_round_progress(nr_batches as u64);
        Ok(())
    }

    fn end_of_batch(&mut self, loss: &BatchLoss) -> Result<(), Self::Error> {
        trace!(
            "End of batch #{}: loss={} impostors={}",
            self.batch_losses.len(),
            loss.total(),
            loss.nr_impostors
        );
        self.batch_losses.push(loss.total());
        self.setup
            .training_feedback
            .hint_round_progress(1, mean_loss(&self.batch_losses));
        Ok(())
    }

    fn end_of_round(
        &mut self,
        round: usize,
        mean_loss: f32,
        model: &Cml,
    ) -> Result<RoundOutcome, Self::Error> {
        debug!("End of round #{:0>4}", round);
        self.setup
            .training_feedback
            .println(&format!("Training loss of round {:0>4}: {}", round, mean_loss));
        self.round_losses.push(mean_loss);

        if let Some(dump_every) = self.setup.dump_every {
            if (round + 1) % dump_every == 0 {
                trace!("Dumping parameters.");
                self.setup
                    .file_output
                    .save_model_parameters(model, &format!("{:0>4}", round))?;
            }
        }

        self.setup.training_feedback.hint_train_progress(1);
        if self.early_stopping.should_stop() {
            self.setup.training_feedback.println(&format!(
                "No improvement of the validation recall since round {:0>4}, stopping.",
                self.early_stopping.best_round().unwrap_or_default()
            ));
            Ok(RoundOutcome::Stop)
        } else {
            Ok(RoundOutcome::Continue)
        }
    }

    fn end_of_training(&mut self) -> Result<(), Self::Error> {
        let elapsed = self.start_time.map(|t| t.elapsed()).unwrap_or_default();
        info!("End of training. Duration: {}", FormattedDuration(elapsed));
        Ok(())
    }

    fn training_result(mut self, model: Cml) -> Result<Self::Outcome, Self::Error> {
        self.setup.training_feedback.end_feedback();
        Ok(TrainingSummary {
            model,
            reports: self.reports,
            round_losses: self.round_losses,
            best_round: self.early_stopping.best_round(),
        })
    }
}

/// Tracks the best validation recall.
#[derive(Debug)]
struct EarlyStopping {
    patience: Option<usize>,
    best: Option<(usize, f32)>,
    rounds_since_best: usize,
}

impl EarlyStopping {
    fn new(patience: Option<usize>) -> Self {
        Self {
            patience,
            best: None,
            rounds_since_best: 0,
        }
    }

    fn observe(&mut self, round: usize, recall: f32) {
        match self.best {
            Some((_, best)) if recall <= best => self.rounds_since_best += 1,
            _ => {
                self.best = Some((round, recall));
                self.rounds_since_best = 0;
            }
        }
    }

    fn best_round(&self) -> Option<usize> {
        self.best.map(|(round, _)| round)
    }

    fn should_stop(&self) -> bool {
        self.patience
            .map_or(false, |patience| self.rounds_since_best >= patience)
    }
}

pub(crate) trait TrainingFeedback {
    fn start_feedback(&mut self);
    fn end_feedback(&mut self);

    fn reset_train_progress(&mut self, max_process: u64);
    fn reset_round_progress(&mut self, max_process: u64);

    fn hint_train_progress(&self, inc_process: u64);
    fn hint_round_progress(&self, inc_process: u64, mean_loss: f32);

    fn println(&self, line: &str);
}

/// Gives no feedback except for logging.
pub(crate) struct NoFeedback;

impl TrainingFeedback for NoFeedback {
    fn start_feedback(&mut self) {}

    fn end_feedback(&mut self) {}

    fn reset_train_progress(&mut self, _max_process: u64) {}

    fn reset_round_progress(&mut self, _max_process: u64) {}

    fn hint_train_progress(&self, _inc_process: u64) {}

    fn hint_round_progress(&self, _inc_process: u64, _mean_loss: f32) {}

    fn println(&self, line: &str) {
        info!("{}", line);
    }
}

/// Training feedback with one progress bar for the rounds and one for the batches of a round.
pub(crate) struct ProgressBarTrainingFeedback {
    train_progress_bar: ProgressBar,
    round_progress_bar: ProgressBar,
}

impl ProgressBarTrainingFeedback {
    pub(crate) fn new() -> Self {
        let train_progress_bar = ProgressBar::new(0);
        train_progress_bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "Rounds:  [{bar:30.green}] {percent:>3}% ({pos:>5}/{len:>5}) {elapsed_precise}",
                )
                .progress_chars("=> "),
        );

        let round_progress_bar = ProgressBar::new(0);
        round_progress_bar.set_style(
            ProgressStyle::default_bar()
                .template("Batches: [{bar:30.green}] {percent:>3}% ({pos:>5}/{len:>5}) {msg}")
                .progress_chars("=> "),
        );
        round_progress_bar.set_draw_delta(5);

        Self {
            train_progress_bar,
            round_progress_bar,
        }
    }
}

impl TrainingFeedback for ProgressBarTrainingFeedback {
    fn start_feedback(&mut self) {
        let multi_bar = MultiProgress::new();
        multi_bar.add(self.train_progress_bar.clone());
        multi_bar.add(self.round_progress_bar.clone());
        // the bars are only drawn while someone joins the multi bar
        std::thread::spawn(move || multi_bar.join());

        self.train_progress_bar.enable_steady_tick(100);
        self.round_progress_bar.tick();
    }

    fn end_feedback(&mut self) {
        self.train_progress_bar.finish_at_current_pos();
        self.round_progress_bar.finish_at_current_pos();
    }

    fn reset_train_progress(&mut self, max_process: u64) {
        self.train_progress_bar.set_position(0);
        self.train_progress_bar.set_length(max_process);
    }

    fn reset_round_progress(&mut self, max_process: u64) {
        self.round_progress_bar.set_position(0);
        self.round_progress_bar.set_length(max_process);
    }

    fn hint_train_progress(&self, inc_process: u64) {
        self.train_progress_bar.inc(inc_process);
    }

    fn hint_round_progress(&self, inc_process: u64, mean_loss: f32) {
        self.round_progress_bar.inc(inc_process);
        self.round_progress_bar
            .set_message(format!("loss={:.5}", mean_loss));
    }

    fn println(&self, line: &str) {
        self.train_progress_bar.println(line);
    }
}

/// Directory the model parameters are stored in.
#[derive(Clone)]
pub(crate) struct OutputDir {
    out_dir: Arc<Path>,
}

impl OutputDir {
    pub const SUFFIX_FINAL: &'static str = "final";
    pub const SUFFIX_INITIAL: &'static str = "initial";

    pub(crate) fn new(out_dir: impl AsRef<Path>) -> Self {
        Self {
            out_dir: out_dir.as_ref().into(),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.out_dir
    }

    /// Saves the model parameters to `<out_dir>/cml_<suffix>.binparams`.
    pub(crate) fn save_model_parameters(
        &self,
        model: &Cml,
        suffix: &str,
    ) -> Result<(), StoringBinParamsFailed> {
        let file_path = self.out_dir.join(format!("cml_{}.binparams", suffix));
        model.store_to_file(file_path)
    }
}

/// Calculates the mean loss.
fn mean_loss(losses: &[f32]) -> f32 {
    if losses.is_empty() {
        0.
    } else {
        losses.iter().sum::<f32>() / losses.len() as f32
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};
    use reclearn::cml::CmlConfig;
    use tempfile::tempdir;
    use test_utils::assert_approx_eq;

    use super::*;

    fn small_model() -> Cml {
        let config = CmlConfig {
            embed_dim: 2,
            ..CmlConfig::default()
        };
        Cml::new(3, 4, None, config, &mut StdRng::seed_from_u64(8)).unwrap()
    }

    fn report(recall: f32) -> ValidationReport {
        ValidationReport {
            recall,
            nr_users: 3,
            ..ValidationReport::default()
        }
    }

    #[test]
    fn test_controller_dumps_every_n_rounds_and_stops() {
        let out_dir = tempdir().unwrap();
        let model = small_model();
        let mut controller = CliTrainingControllerBuilder {
            file_output: OutputDir::new(out_dir.path()),
            training_feedback: NoFeedback,
            dump_every: Some(2),
            patience: Some(1),
        }
        .build();
        let dump = |round: &str| out_dir.path().join(format!("cml_{}.binparams", round));

        controller.begin_of_training(4).unwrap();
        controller.evaluation_result(0, &report(0.5)).unwrap();
        controller.begin_of_round(0, 2).unwrap();
        controller.end_of_batch(&BatchLoss::default()).unwrap();
        let outcome = controller.end_of_round(0, 1.5, &model).unwrap();
        assert_eq!(outcome, RoundOutcome::Continue);
        assert!(!dump("0000").exists());

        controller.evaluation_result(1, &report(0.25)).unwrap();
        controller.begin_of_round(1, 2).unwrap();
        let outcome = controller.end_of_round(1, 0.5, &model).unwrap();
        assert_eq!(outcome, RoundOutcome::Stop);
        assert!(dump("0001").exists());

        let loaded = Cml::load_from_file(dump("0001"), None, model.config().clone()).unwrap();
        assert_approx_eq!(f32, loaded.user_embeddings(), model.user_embeddings());

        controller.end_of_training().unwrap();
        let summary = controller.training_result(model).unwrap();
        assert_eq!(summary.best_round, Some(0));
        assert_eq!(summary.reports, vec![report(0.5), report(0.25)]);
        assert_approx_eq!(f32, summary.round_losses, [1.5f32, 0.5]);
    }

    #[test]
    fn test_output_dir_names_files_by_suffix() {
        let out_dir = tempdir().unwrap();
        let output = OutputDir::new(out_dir.path());
        output
            .save_model_parameters(&small_model(), OutputDir::SUFFIX_FINAL)
            .unwrap();
        assert!(out_dir.path().join("cml_final.binparams").exists());
        assert_eq!(output.path(), out_dir.path());
    }

    #[test]
    fn test_mean_loss() {
        assert_approx_eq!(f32, mean_loss(&[0.5, 0.75, 0.25, 0.5]), 0.5);
        assert_approx_eq!(f32, mean_loss(&[]), 0.);
    }

    #[test]
    fn test_early_stopping_waits_for_patience() {
        let mut early_stopping = EarlyStopping::new(Some(2));
        early_stopping.observe(0, 0.1);
        early_stopping.observe(1, 0.3);
        assert!(!early_stopping.should_stop());
        early_stopping.observe(2, 0.3);
        assert!(!early_stopping.should_stop());
        early_stopping.observe(3, 0.2);
        assert!(early_stopping.should_stop());
        assert_eq!(early_stopping.best_round(), Some(1));
    }

    #[test]
    fn test_improvement_resets_patience() {
        let mut early_stopping = EarlyStopping::new(Some(1));
        early_stopping.observe(0, 0.1);
        early_stopping.observe(1, 0.05);
        assert!(early_stopping.should_stop());
        early_stopping.observe(2, 0.2);
        assert!(!early_stopping.should_stop());
        assert_eq!(early_stopping.best_round(), Some(2));
    }

    #[test]
    fn test_without_patience_never_stops() {
        let mut early_stopping = EarlyStopping::new(None);
        for round in 0..10 {
            early_stopping.observe(round, 0.);
        }
        assert!(!early_stopping.should_stop());
        assert_eq!(early_stopping.best_round(), Some(0));
    }
}
