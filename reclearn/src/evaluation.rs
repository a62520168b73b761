use displaydoc::Display;
use log::debug;
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "multithreaded")]
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

use crate::{
    data::InteractionMatrix,
    metrics::{ndcg_at_k, precision_at_k, recall_at_k, roc_auc, top_k_unseen, DcgMethod},
    UserId,
};

/// Something which can score all items for a set of users.
pub trait ItemScorer {
    /// Returns the scores in the shape `(user_ids.len(), nr_items)`, higher is better.
    fn item_scores(&self, user_ids: &[UserId]) -> Array2<f32>;
}

/// Evaluation failure.
#[derive(Debug, Display, Error, PartialEq)]
pub enum EvaluationError {
    /// Training interactions of shape {train:?} don't match test interactions of shape {test:?}
    IncompatibleInteractions {
        train: (usize, usize),
        test: (usize, usize),
    },
    /// Scorer of shape {scorer:?} doesn't match interactions of shape {interactions:?}
    IncompatibleScorer {
        scorer: (usize, usize),
        interactions: (usize, usize),
    },
    /// User {0} has no test interactions
    NoTestItems(UserId),
    /// Expected scores of shape {expected:?}, got {got:?}
    UnexpectedScoreShape {
        expected: (usize, usize),
        got: (usize, usize),
    },
    /// A chunk size of 0 can't be used to score users
    ZeroChunkSize,
}

/// Settings for the ranking evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationSettings {
    /// Cut-off for recall and precision.
    pub k: usize,
    /// Cut-off for the NDCG.
    pub ndcg_k: usize,
    pub dcg_method: DcgMethod,
    /// Evaluate at most this many users, the ones with the smallest ids.
    pub max_users: Option<usize>,
    /// Number of users scored at once.
    pub chunk_size: usize,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            k: 50,
            ndcg_k: 50,
            dcg_method: DcgMethod::First,
            max_users: None,
            chunk_size: 300,
        }
    }
}

/// Metrics of a single user.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UserMetrics {
    pub recall: f32,
    pub precision: f32,
    pub ndcg: f32,
    /// `None` if the user's non-training items are all test items.
    pub auc: Option<f32>,
}

/// Mean metrics over all evaluated users.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub recall: f32,
    pub precision: f32,
    pub ndcg: f32,
    /// Mean over the users for which the AUC is defined.
    pub auc: Option<f32>,
    pub nr_users: usize,
}

impl ValidationReport {
    /// Averages the metrics of all users.
    pub fn mean_of(metrics: &[UserMetrics]) -> Self {
        let nr_users = metrics.len();
        if nr_users == 0 {
            return Self::default();
        }
        let mean = |metric: fn(&UserMetrics) -> f32| {
            metrics.iter().map(metric).sum::<f32>() / nr_users as f32
        };
        let aucs = metrics.iter().filter_map(|m| m.auc).collect::<Vec<_>>();
        let auc = (!aucs.is_empty()).then(|| aucs.iter().sum::<f32>() / aucs.len() as f32);

        Self {
            recall: mean(|m| m.recall),
            precision: mean(|m| m.precision),
            ndcg: mean(|m| m.ndcg),
            auc,
            nr_users,
        }
    }
}

/// Evaluates rankings against held out test interactions.
///
/// Items a user interacted with during training are never ranked and don't
/// take part in the AUC.
#[derive(Clone, Debug)]
pub struct RankingEvaluator {
    train: InteractionMatrix,
    test: InteractionMatrix,
}

impl RankingEvaluator {
    pub fn new(train: InteractionMatrix, test: InteractionMatrix) -> Result<Self, EvaluationError> {
        if train.shape() != test.shape() {
            return Err(EvaluationError::IncompatibleInteractions {
                train: train.shape(),
                test: test.shape(),
            });
        }
        Ok(Self { train, test })
    }

    /// Creates an evaluator which doesn't exclude any items.
    pub fn without_training_items(test: InteractionMatrix) -> Self {
        Self {
            train: InteractionMatrix::empty(test.num_users(), test.num_items()),
            test,
        }
    }

    pub fn train(&self) -> &InteractionMatrix {
        &self.train
    }

    pub fn test(&self) -> &InteractionMatrix {
        &self.test
    }

    /// Users which will be evaluated with the given settings.
    pub fn users_to_evaluate(&self, settings: &EvaluationSettings) -> Vec<UserId> {
        let mut users = self.test.active_users();
        if let Some(max_users) = settings.max_users {
            users.truncate(max_users);
        }
        users
    }

    /// Computes the metrics of one user given the scores of all items.
    pub fn evaluate_user(
        &self,
        user: UserId,
        scores: ArrayView1<f32>,
        settings: &EvaluationSettings,
    ) -> Result<UserMetrics, EvaluationError> {
        let relevant = self.test.items_of(user);
        if relevant.is_empty() {
            return Err(EvaluationError::NoTestItems(user));
        }
        if scores.len() != self.test.num_items() {
            return Err(EvaluationError::UnexpectedScoreShape {
                expected: (1, self.test.num_items()),
                got: (1, scores.len()),
            });
        }
        let excluded = self.train.items_of(user);

        let top = top_k_unseen(scores, settings.k.max(settings.ndcg_k), excluded);
        let top_k = &top[..settings.k.min(top.len())];

        let (unseen_scores, labels): (Vec<f32>, Vec<bool>) = scores
            .indexed_iter()
            .filter(|(item, _)| excluded.binary_search(item).is_err())
            .map(|(item, &score)| (score, relevant.binary_search(&item).is_ok()))
            .unzip();

        Ok(UserMetrics {
            recall: recall_at_k(top_k, relevant),
            precision: precision_at_k(top_k, relevant, settings.k),
            ndcg: ndcg_at_k(&top, relevant, settings.ndcg_k, settings.dcg_method),
            auc: roc_auc(&unseen_scores, &labels),
        })
    }

    /// Evaluates the given users, users without test interactions are skipped.
    pub fn evaluate_users(
        &self,
        scorer: &impl ItemScorer,
        users: &[UserId],
        settings: &EvaluationSettings,
    ) -> Result<ValidationReport, EvaluationError> {
        if settings.chunk_size == 0 {
            return Err(EvaluationError::ZeroChunkSize);
        }
        let users = users
            .iter()
            .copied()
            .filter(|&user| !self.test.items_of(user).is_empty())
            .collect::<Vec<_>>();

        let mut metrics = Vec::with_capacity(users.len());
        for chunk in users.chunks(settings.chunk_size) {
            let scores = scorer.item_scores(chunk);
            let expected = (chunk.len(), self.test.num_items());
            if scores.dim() != expected {
                return Err(EvaluationError::UnexpectedScoreShape {
                    expected,
                    got: scores.dim(),
                });
            }

            #[cfg(not(feature = "multithreaded"))]
            let rows = chunk.iter().enumerate();
            #[cfg(feature = "multithreaded")]
            let rows = chunk.into_par_iter().enumerate();

            let chunk_metrics = rows
                .map(|(row, &user)| self.evaluate_user(user, scores.row(row), settings))
                .collect::<Result<Vec<_>, _>>()?;
            metrics.extend(chunk_metrics);
        }
        debug!("evaluated {} users", metrics.len());

        Ok(ValidationReport::mean_of(&metrics))
    }

    /// Evaluates all users with test interactions, capped at `settings.max_users`.
    pub fn evaluate(
        &self,
        scorer: &impl ItemScorer,
        settings: &EvaluationSettings,
    ) -> Result<ValidationReport, EvaluationError> {
        let users = self.users_to_evaluate(settings);
        self.evaluate_users(scorer, &users, settings)
    }
}
