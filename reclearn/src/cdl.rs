//! Evaluation of pre-trained latent factor models.
//!
//! A user's score of an item is the dot product of their latent factors,
//! negative scores are clamped to zero.

use std::path::Path;

use displaydoc::Display;
use log::info;
use ndarray::{Array2, ArrayView2, Axis};
use rand::{seq::index::sample, Rng};
use thiserror::Error;

use crate::{
    data::InteractionMatrix,
    evaluation::{
        EvaluationError,
        EvaluationSettings,
        ItemScorer,
        RankingEvaluator,
        ValidationReport,
    },
    UserId,
};
use layer::{
    io::{BinParams, FailedToRetrieveParams, LoadingBinParamsFailed, StoringBinParamsFailed},
    utils::IncompatibleMatrices,
};

/// Default number of users sampled by [`evaluate_sampled()`].
pub const DEFAULT_SAMPLED_USERS: usize = 300;

/// Latent factor load failure.
#[derive(Debug, Display, Error)]
pub enum LoadingFactorsFailed {
    /// Failed to load bin params: {0}
    BinParams(#[from] LoadingBinParamsFailed),

    /// {0}
    FailedToRetrieveParams(#[from] FailedToRetrieveParams),

    /// {0}
    IncompatibleMatrices(#[from] IncompatibleMatrices),
}

/// Latent factors of users `U` and items `V`, scored by `U · Vᵀ`.
#[derive(Clone, Debug)]
pub struct LatentFactors {
    users: Array2<f32>,
    items: Array2<f32>,
}

impl LatentFactors {
    /// Creates the model, users and items must share the latent dimension.
    pub fn new(users: Array2<f32>, items: Array2<f32>) -> Result<Self, IncompatibleMatrices> {
        if users.ncols() != items.ncols() {
            return Err(IncompatibleMatrices::new(
                "users",
                users.raw_dim(),
                "items",
                items.raw_dim(),
                "user and item factors must have the same number of columns",
            ));
        }
        Ok(Self { users, items })
    }

    pub fn nr_users(&self) -> usize {
        self.users.nrows()
    }

    pub fn nr_items(&self) -> usize {
        self.items.nrows()
    }

    pub fn users(&self) -> ArrayView2<f32> {
        self.users.view()
    }

    pub fn items(&self) -> ArrayView2<f32> {
        self.items.view()
    }

    /// Scores all items for the given users.
    ///
    /// # Panics
    ///
    /// If a user id is out of bounds.
    pub fn item_scores(&self, user_ids: &[UserId]) -> Array2<f32> {
        let mut scores = self
            .users
            .select(Axis(0), user_ids)
            .dot(&self.items.t());
        scores.mapv_inplace(|score| score.max(0.));
        scores
    }

    pub fn store_params(&self) -> BinParams {
        let mut params = BinParams::default();
        params.insert("user_factors", self.users.clone());
        params.insert("item_factors", self.items.clone());
        params
    }

    pub fn store_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoringBinParamsFailed> {
        self.store_params().store_to_file(path)
    }

    pub fn load_params(mut params: BinParams) -> Result<Self, LoadingFactorsFailed> {
        let users = params.take("user_factors")?;
        let items = params.take("item_factors")?;
        Self::new(users, items).map_err(Into::into)
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, LoadingFactorsFailed> {
        Self::load_params(BinParams::load_from_file(path)?)
    }
}

impl ItemScorer for LatentFactors {
    fn item_scores(&self, user_ids: &[UserId]) -> Array2<f32> {
        LatentFactors::item_scores(self, user_ids)
    }
}

/// Evaluates the factors on a random sample of users.
///
/// At most `nr_users` distinct users are drawn, users without test
/// interactions are skipped afterwards. No items are excluded from the
/// rankings.
pub fn evaluate_sampled<R>(
    factors: &LatentFactors,
    test: InteractionMatrix,
    nr_users: usize,
    settings: &EvaluationSettings,
    rng: &mut R,
) -> Result<ValidationReport, EvaluationError>
where
    R: Rng + ?Sized,
{
    let scorer = (factors.nr_users(), factors.nr_items());
    if scorer != test.shape() {
        return Err(EvaluationError::IncompatibleScorer {
            scorer,
            interactions: test.shape(),
        });
    }

    let amount = nr_users.min(test.num_users());
    let users = sample(rng, test.num_users(), amount).into_vec();
    let report =
        RankingEvaluator::without_training_items(test).evaluate_users(factors, &users, settings)?;
    info!(
        "sampled {} users, {} with test interactions: {:?}",
        amount, report.nr_users, report
    );

    Ok(report)
}
