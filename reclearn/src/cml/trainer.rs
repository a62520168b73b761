use std::error::Error as StdError;

use log::{debug, info, trace};
use rand::Rng;
use thiserror::Error;

use crate::{
    cml::{data::BatchLoss, model::Cml, optimizer::Optimizer},
    evaluation::{EvaluationError, EvaluationSettings, RankingEvaluator, ValidationReport},
    sampler::BatchSource,
};

/// Default number of mini-batches in one training round.
pub const DEFAULT_BATCHES_PER_ROUND: usize = 100;

/// Trainer allowing the training of CML models.
pub struct CmlTrainer<B, C, O, R>
where
    B: BatchSource,
    C: TrainingController,
    O: Optimizer,
    R: Rng,
{
    model: Cml,
    batch_source: B,
    evaluator: RankingEvaluator,
    controller: C,
    optimizer: O,
    rng: R,
}

impl<B, C, O, R> CmlTrainer<B, C, O, R>
where
    B: BatchSource,
    C: TrainingController,
    O: Optimizer,
    R: Rng,
{
    /// Creates a new `CmlTrainer` instance.
    ///
    /// The `rng` drives the dropout of the feature projector.
    pub fn new(
        model: Cml,
        batch_source: B,
        evaluator: RankingEvaluator,
        controller: C,
        optimizer: O,
        rng: R,
    ) -> Self {
        Self {
            model,
            batch_source,
            evaluator,
            controller,
            optimizer,
            rng,
        }
    }

    /// Trains for at most the given number of rounds.
    ///
    /// Each round is evaluated on the validation interactions before its
    /// batches are trained. After the last round, or once the controller
    /// requests a stop, the final model is evaluated once more.
    pub fn train(
        mut self,
        rounds: usize,
        batches_per_round: usize,
        settings: &EvaluationSettings,
    ) -> Result<C::Outcome, TrainingError<B::Error, C::Error>> {
        info!(
            "training for {} rounds of {} batches with {} pairs each",
            rounds,
            batches_per_round,
            self.batch_source.batch_size(),
        );
        self.controller
            .begin_of_training(rounds)
            .map_err(TrainingError::Control)?;

        for round in 0..rounds {
            self.evaluate(round, settings)?;

            self.controller
                .begin_of_round(round, batches_per_round)
                .map_err(TrainingError::Control)?;

            let mut summed_loss = 0.;
            for _ in 0..batches_per_round {
                summed_loss += self.train_next_batch()?.total();
            }
            let mean_loss = if batches_per_round > 0 {
                summed_loss / batches_per_round as f32
            } else {
                0.
            };
            info!("round {}: mean training loss {}", round, mean_loss);

            let outcome = self
                .controller
                .end_of_round(round, mean_loss, &self.model)
                .map_err(TrainingError::Control)?;
            if outcome == RoundOutcome::Stop {
                info!("stopping early after round {}", round);
                break;
            }
        }

        self.evaluate(rounds, settings)?;

        self.controller
            .end_of_training()
            .map_err(TrainingError::Control)?;
        self.controller
            .training_result(self.model)
            .map_err(TrainingError::Control)
    }

    /// Trains on the next batch and clips the embeddings afterwards.
    fn train_next_batch(&mut self) -> Result<BatchLoss, TrainingError<B::Error, C::Error>> {
        let CmlTrainer {
            model,
            batch_source,
            controller,
            optimizer,
            rng,
            ..
        } = self;

        let batch = batch_source.next_batch().map_err(TrainingError::Data)?;
        let (gradients, loss) = model.gradients_for_batch(&batch, rng);
        optimizer.apply_gradients(model, gradients);
        model.clip_embeddings();
        trace!(
            "batch loss {} with {} impostors",
            loss.total(),
            loss.nr_impostors
        );

        controller
            .end_of_batch(&loss)
            .map_err(TrainingError::Control)?;
        Ok(loss)
    }

    fn evaluate(
        &mut self,
        round: usize,
        settings: &EvaluationSettings,
    ) -> Result<(), TrainingError<B::Error, C::Error>> {
        let report = self
            .evaluator
            .evaluate(&self.model, settings)
            .map_err(TrainingError::Evaluation)?;
        debug!("validation before round {}: {:?}", round, report);

        self.controller
            .evaluation_result(round, &report)
            .map_err(TrainingError::Control)
    }
}

/// Whether training continues after a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoundOutcome {
    Continue,
    Stop,
}

/// A trait providing various callbacks used during training.
pub trait TrainingController {
    type Error: StdError + 'static;
    type Outcome;

    /// Called at the beginning of training.
    fn begin_of_training(&mut self, nr_rounds: usize) -> Result<(), Self::Error>;

    /// Called with the validation result before each round.
    ///
    /// It is called one more time after the last round, with `round` being
    /// the number of rounds which were asked for.
    fn evaluation_result(
        &mut self,
        round: usize,
        report: &ValidationReport,
    ) -> Result<(), Self::Error>;

    /// Called at the beginning of each round.
    fn begin_of_round(&mut self, round: usize, nr_batches: usize) -> Result<(), Self::Error>;

    /// Called after each trained batch.
    fn end_of_batch(&mut self, loss: &BatchLoss) -> Result<(), Self::Error>;

    /// Called at the end of each round with the mean loss of its batches.
    ///
    /// The passed in reference to `model` can be used to e.g. dump the
    /// intermediate embeddings every few rounds.
    fn end_of_round(
        &mut self,
        round: usize,
        mean_loss: f32,
        model: &Cml,
    ) -> Result<RoundOutcome, Self::Error>;

    /// Called after training finished.
    fn end_of_training(&mut self) -> Result<(), Self::Error>;

    /// Returns the result of the training.
    fn training_result(self, model: Cml) -> Result<Self::Outcome, Self::Error>;
}

/// An error which can occur during training.
///
/// This is either an error from the `BatchSource`, the `TrainingController`
/// or the validation.
#[derive(Error, Debug)]
pub enum TrainingError<DE, CE>
where
    DE: StdError + 'static,
    CE: StdError + 'static,
{
    #[error("Retrieving training batches failed: {0}")]
    Data(#[source] DE),
    #[error("Training controller produced an error: {0}")]
    Control(#[source] CE),
    #[error("Validation failed: {0}")]
    Evaluation(#[source] EvaluationError),
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        cml::{Adagrad, CmlConfig},
        data::InteractionMatrix,
        sampler::WarpSampler,
    };

    #[derive(Debug, PartialEq)]
    enum Event {
        BeginTraining(usize),
        Evaluation(usize),
        BeginRound(usize, usize),
        Batch,
        EndRound(usize),
        EndTraining,
    }

    /// Records all callbacks and stops after `stop_after` rounds.
    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
        reports: Vec<ValidationReport>,
        losses: Vec<f32>,
        stop_after: Option<usize>,
    }

    impl TrainingController for Recorder {
        type Error = Infallible;
        type Outcome = (Self, Cml);

        fn begin_of_training(&mut self, nr_rounds: usize) -> Result<(), Self::Error> {
            self.events.push(Event::BeginTraining(nr_rounds));
            Ok(())
        }

        fn evaluation_result(
            &mut self,
            round: usize,
            report: &ValidationReport,
        ) -> Result<(), Self::Error> {
            self.events.push(Event::Evaluation(round));
            self.reports.push(*report);
            Ok(())
        }

        fn begin_of_round(&mut self, round: usize, nr_batches: usize) -> Result<(), Self::Error> {
            self.events.push(Event::BeginRound(round, nr_batches));
            Ok(())
        }

        fn end_of_batch(&mut self, _loss: &BatchLoss) -> Result<(), Self::Error> {
            self.events.push(Event::Batch);
            Ok(())
        }

        fn end_of_round(
            &mut self,
            round: usize,
            mean_loss: f32,
            _model: &Cml,
        ) -> Result<RoundOutcome, Self::Error> {
            self.events.push(Event::EndRound(round));
            self.losses.push(mean_loss);
            if self.stop_after == Some(round + 1) {
                Ok(RoundOutcome::Stop)
            } else {
                Ok(RoundOutcome::Continue)
            }
        }

        fn end_of_training(&mut self) -> Result<(), Self::Error> {
            self.events.push(Event::EndTraining);
            Ok(())
        }

        fn training_result(self, model: Cml) -> Result<Self::Outcome, Self::Error> {
            Ok((self, model))
        }
    }

    /// Two groups of users with disjoint item preferences.
    fn interactions() -> (InteractionMatrix, InteractionMatrix) {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for user in 0..8 {
            let offset = if user < 4 { 0 } else { 6 };
            for item in 0..5 {
                train.push((user, offset + (item + user) % 6));
            }
            test.push((user, offset + (5 + user) % 6));
        }
        (
            InteractionMatrix::from_pairs(8, 12, train).unwrap(),
            InteractionMatrix::from_pairs(8, 12, test).unwrap(),
        )
    }

    fn trainer(
        stop_after: Option<usize>,
    ) -> CmlTrainer<WarpSampler<StdRng>, Recorder, Adagrad, StdRng> {
        let (train, test) = interactions();
        let config = CmlConfig {
            embed_dim: 4,
            margin: 0.5,
            ..CmlConfig::default()
        };
        let mut rng = StdRng::seed_from_u64(42);
        let model = Cml::new(8, 12, None, config.clone(), &mut rng).unwrap();
        let sampler = WarpSampler::new(&train, 8, 4, StdRng::seed_from_u64(1)).unwrap();
        let evaluator = RankingEvaluator::new(train, test).unwrap();
        let recorder = Recorder {
            stop_after,
            ..Recorder::default()
        };
        let optimizer = Adagrad::new(config.master_learning_rate);

        CmlTrainer::new(model, sampler, evaluator, recorder, optimizer, rng)
    }

    #[test]
    fn test_callback_order() {
        let settings = EvaluationSettings {
            k: 3,
            ndcg_k: 3,
            ..EvaluationSettings::default()
        };
        let (recorder, _) = trainer(None).train(2, 2, &settings).unwrap();

        assert_eq!(
            recorder.events,
            vec![
                Event::BeginTraining(2),
                Event::Evaluation(0),
                Event::BeginRound(0, 2),
                Event::Batch,
                Event::Batch,
                Event::EndRound(0),
                Event::Evaluation(1),
                Event::BeginRound(1, 2),
                Event::Batch,
                Event::Batch,
                Event::EndRound(1),
                Event::Evaluation(2),
                Event::EndTraining,
            ]
        );
        assert!(recorder.reports.iter().all(|report| report.nr_users == 8));
    }

    #[test]
    fn test_early_stop_still_evaluates() {
        let settings = EvaluationSettings::default();
        let (recorder, _) = trainer(Some(1)).train(5, 1, &settings).unwrap();

        assert_eq!(recorder.losses.len(), 1);
        assert_eq!(recorder.reports.len(), 2);
        assert_eq!(recorder.events.last(), Some(&Event::EndTraining));
        assert_eq!(
            recorder.events[recorder.events.len() - 2],
            Event::Evaluation(5)
        );
    }

    #[test]
    fn test_training_improves_validation() {
        let settings = EvaluationSettings {
            k: 3,
            ndcg_k: 3,
            ..EvaluationSettings::default()
        };
        let (recorder, model) = trainer(None).train(20, 10, &settings).unwrap();

        let first = recorder.reports.first().unwrap();
        let last = recorder.reports.last().unwrap();
        assert!(last.auc.unwrap() > first.auc.unwrap());
        assert!(last.auc.unwrap() > 0.7);

        let clip_norm = model.config().clip_norm;
        assert!(layer::utils::row_norms(&model.user_embeddings())
            .iter()
            .all(|&norm| norm <= clip_norm + 1e-5));
    }

    #[derive(Debug, Error)]
    #[error("no more batches")]
    struct Exhausted;

    struct EmptySource;

    impl BatchSource for EmptySource {
        type Error = Exhausted;

        fn batch_size(&self) -> usize {
            1
        }

        fn number_of_batches_per_pass(&self) -> usize {
            0
        }

        fn next_batch(&mut self) -> Result<crate::sampler::Batch, Self::Error> {
            Err(Exhausted)
        }
    }

    #[test]
    fn test_data_error_is_propagated() {
        let (train, test) = interactions();
        let mut rng = StdRng::seed_from_u64(0);
        let model = Cml::new(8, 12, None, CmlConfig::default(), &mut rng).unwrap();
        let evaluator = RankingEvaluator::new(train, test).unwrap();
        let trainer = CmlTrainer::new(
            model,
            EmptySource,
            evaluator,
            Recorder::default(),
            Adagrad::new(0.1),
            rng,
        );

        let result = trainer.train(1, 1, &EvaluationSettings::default());
        assert!(matches!(result, Err(TrainingError::Data(Exhausted))));
    }
}
