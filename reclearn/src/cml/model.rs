use std::path::Path;

use displaydoc::Display;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::Rng;
use thiserror::Error;

use crate::{
    cml::{
        data::{BatchLoss, GradientSet},
        projector::FeatureProjector,
        CmlConfig,
        InvalidConfig,
    },
    evaluation::ItemScorer,
    sampler::Batch,
    ItemId,
    UserId,
};
use layer::{
    dense::LoadingDenseFailed,
    initializer::normal_init,
    io::{
        BinParams,
        FailedToRetrieveParams,
        LoadingBinParamsFailed,
        StoringBinParamsFailed,
    },
    utils::{clip_rows_by_norm, mean_squared_row_distances, IncompatibleMatrices},
};

/// Creating a CML model failed.
#[derive(Debug, Display, Error)]
pub enum CreatingCmlFailed {
    /// {0}
    InvalidConfig(#[from] InvalidConfig),

    /// {0}
    IncompatibleMatrices(#[from] IncompatibleMatrices),
}

/// CML load failure.
#[derive(Debug, Display, Error)]
pub enum LoadingCmlFailed {
    /// Failed to load bin params: {0}
    BinParams(#[from] LoadingBinParamsFailed),

    /// Failed to load the feature projector: {0}
    Dense(#[from] LoadingDenseFailed),

    /// {0}
    FailedToRetrieveParams(#[from] FailedToRetrieveParams),

    /// {0}
    IncompatibleMatrices(#[from] IncompatibleMatrices),

    /// {0}
    InvalidConfig(#[from] InvalidConfig),

    /// BinParams contains additional parameters, model data is probably wrong: {params:?}
    LeftoverBinParams { params: Vec<String> },
}

/// A collaborative metric learning model.
///
/// Holds one embedding row per user and per item, the score of an item for a
/// user is the negative squared euclidean distance of their embeddings.
#[derive(Clone, Debug)]
pub struct Cml {
    config: CmlConfig,
    pub(super) user_embeddings: Array2<f32>,
    pub(super) item_embeddings: Array2<f32>,
    pub(super) projector: Option<FeatureProjector>,
}

impl Cml {
    /// Creates a model with random embeddings.
    ///
    /// Embeddings are drawn from `N(0, 1/√embed_dim)`. If item features of
    /// shape `(nr_items, nr_features)` are given, a feature projector is added
    /// and the item embeddings start at the projection of their features.
    pub fn new<R>(
        nr_users: usize,
        nr_items: usize,
        features: Option<Array2<f32>>,
        config: CmlConfig,
        rng: &mut R,
    ) -> Result<Self, CreatingCmlFailed>
    where
        R: Rng + ?Sized,
    {
        config.validate()?;

        let std_dev = 1. / (config.embed_dim as f32).sqrt();
        let user_embeddings = normal_init(rng, (nr_users, config.embed_dim), std_dev);
        let mut item_embeddings = normal_init(rng, (nr_items, config.embed_dim), std_dev);

        let projector = features
            .map(|features| {
                check_feature_rows(&features, nr_items)?;
                FeatureProjector::new(features, &config, rng)
            })
            .transpose()?;
        if let Some(projector) = &projector {
            item_embeddings = projector.project();
        }

        Ok(Self {
            config,
            user_embeddings,
            item_embeddings,
            projector,
        })
    }

    pub fn config(&self) -> &CmlConfig {
        &self.config
    }

    pub fn nr_users(&self) -> usize {
        self.user_embeddings.nrows()
    }

    pub fn nr_items(&self) -> usize {
        self.item_embeddings.nrows()
    }

    pub fn user_embeddings(&self) -> ArrayView2<f32> {
        self.user_embeddings.view()
    }

    pub fn item_embeddings(&self) -> ArrayView2<f32> {
        self.item_embeddings.view()
    }

    pub fn projector(&self) -> Option<&FeatureProjector> {
        self.projector.as_ref()
    }

    /// Scores all items for the given users.
    ///
    /// The score is `-Σ_k (u_k - v_k)²`, the shape `(user_ids.len(), nr_items)`.
    ///
    /// # Panics
    ///
    /// If a user id is out of bounds.
    pub fn item_scores(&self, user_ids: &[UserId]) -> Array2<f32> {
        let users = self.user_embeddings.select(Axis(0), user_ids);
        let user_norms = squared_row_norms(users.view());
        let item_norms = squared_row_norms(self.item_embeddings.view());

        // -‖u - v‖² = 2 u·v - ‖u‖² - ‖v‖²
        let mut scores = users.dot(&self.item_embeddings.t());
        scores *= 2.;
        scores -= &user_norms.insert_axis(Axis(1));
        scores -= &item_norms;
        // the expansion can cancel to slightly positive values
        scores.mapv_inplace(|score| if score > 0. { 0. } else { score });
        scores
    }

    /// Computes the losses of a batch without updating anything.
    ///
    /// Dropout of the feature projector is disabled.
    ///
    /// # Panics
    ///
    /// If a user or item id of the batch is out of bounds.
    pub fn loss(&self, batch: &Batch) -> BatchLoss {
        let (embedding_loss, nr_impostors) = self.embedding_loss(batch, None);
        let feature_loss = self
            .projector
            .as_ref()
            .map_or(0., |projector| self.feature_loss(projector.project().view()));

        BatchLoss {
            embedding_loss,
            feature_loss,
            nr_impostors,
        }
    }

    /// Computes the gradients of the batch losses.
    ///
    /// The embeddings receive the gradients of `embedding_loss + feature_loss`.
    /// Additionally the gradients of `feature_loss / nr_items` wrt. the item
    /// embeddings and the feature projector are returned. The returned losses
    /// are the ones before any update.
    ///
    /// # Panics
    ///
    /// If a user or item id of the batch is out of bounds.
    pub fn gradients_for_batch<R>(&self, batch: &Batch, rng: &mut R) -> (GradientSet, BatchLoss)
    where
        R: Rng + ?Sized,
    {
        let mut user_gradients = Array2::zeros(self.user_embeddings.raw_dim());
        let mut item_gradients = Array2::zeros(self.item_embeddings.raw_dim());
        let (embedding_loss, nr_impostors) =
            self.embedding_loss(batch, Some((&mut user_gradients, &mut item_gradients)));

        let (feature_loss, feature_item_embeddings, projector) = match &self.projector {
            Some(projector) => {
                let forward = projector.project_for_training(rng);
                let feature_loss = self.feature_loss(forward.projection.view());

                let difference = &self.item_embeddings - &forward.projection;
                let scale = self.config.feature_l2_reg * 2. / self.config.embed_dim as f32;
                item_gradients.scaled_add(scale, &difference);
                let feature_item_gradients = difference * (scale / self.nr_items() as f32);
                let partials_wrt_projection = -&feature_item_gradients;
                let projector_gradients =
                    projector.gradients(&forward, partials_wrt_projection.view());

                (
                    feature_loss,
                    Some(feature_item_gradients),
                    Some(projector_gradients),
                )
            }
            None => (0., None, None),
        };

        let gradients = GradientSet {
            user_embeddings: user_gradients,
            item_embeddings: item_gradients,
            feature_item_embeddings,
            projector,
        };
        let loss = BatchLoss {
            embedding_loss,
            feature_loss,
            nr_impostors,
        };
        (gradients, loss)
    }

    /// Returns the summed hinge loss and the number of impostors of the batch.
    ///
    /// If gradient buffers are given the gradients of the loss wrt. the user
    /// and item embeddings are added to them.
    fn embedding_loss(
        &self,
        batch: &Batch,
        mut gradients: Option<(&mut Array2<f32>, &mut Array2<f32>)>,
    ) -> (f32, usize) {
        let margin = self.config.margin;
        let scale = 2. / self.config.embed_dim as f32;
        let mut loss = 0.;
        let mut nr_impostors = 0;

        for (pair, (&user_id, &positive_id)) in batch
            .user_ids
            .iter()
            .zip(&batch.positive_item_ids)
            .enumerate()
        {
            let user = self.user_embeddings.row(user_id);
            let positive = self.item_embeddings.row(positive_id);
            let positive_distance = mean_squared_distance(user, positive);

            let mut closest_negative: Option<(ItemId, f32)> = None;
            for &negative_id in batch.negative_item_ids.row(pair) {
                let distance = mean_squared_distance(user, self.item_embeddings.row(negative_id));
                if positive_distance - distance + margin > 0. {
                    nr_impostors += 1;
                }
                if closest_negative.map_or(true, |(_, closest)| distance < closest) {
                    closest_negative = Some((negative_id, distance));
                }
            }
            let (negative_id, negative_distance) = match closest_negative {
                Some(closest) => closest,
                None => continue,
            };

            let hinge = positive_distance - negative_distance + margin;
            if hinge <= 0. {
                continue;
            }
            loss += hinge;

            if let Some((user_gradients, item_gradients)) = gradients.as_mut() {
                let negative = self.item_embeddings.row(negative_id);
                user_gradients
                    .row_mut(user_id)
                    .scaled_add(scale, &(&negative - &positive));
                item_gradients
                    .row_mut(positive_id)
                    .scaled_add(-scale, &(&user - &positive));
                item_gradients
                    .row_mut(negative_id)
                    .scaled_add(scale, &(&user - &negative));
            }
        }

        (loss, nr_impostors)
    }

    /// `feature_l2_reg · Σ_items mean_k (v - projection)²`
    fn feature_loss(&self, projection: ArrayView2<f32>) -> f32 {
        self.config.feature_l2_reg
            * mean_squared_row_distances(self.item_embeddings.view(), projection).sum()
    }

    /// Rescales all user and item embeddings to a norm of at most `clip_norm`.
    pub fn clip_embeddings(&mut self) {
        clip_rows_by_norm(&mut self.user_embeddings, self.config.clip_norm);
        clip_rows_by_norm(&mut self.item_embeddings, self.config.clip_norm);
    }

    /// Adds the gradients to the parameters.
    pub(super) fn add_gradients(&mut self, gradients: &GradientSet) {
        self.user_embeddings += &gradients.user_embeddings;
        self.item_embeddings += &gradients.item_embeddings;
        if let Some(feature_item_embeddings) = &gradients.feature_item_embeddings {
            self.item_embeddings += feature_item_embeddings;
        }
        if let (Some(projector), Some(gradients)) = (&mut self.projector, &gradients.projector) {
            projector.add_gradients(gradients);
        }
    }

    /// Stores the embeddings and the feature projector weights.
    ///
    /// The features themselves are input data and not stored.
    pub fn store_params(&self) -> BinParams {
        let mut params = BinParams::default();
        params.insert("user_embeddings", self.user_embeddings.clone());
        params.insert("item_embeddings", self.item_embeddings.clone());
        if let Some(projector) = &self.projector {
            projector.store_params(params.with_scope("feature_projector"));
        }
        params
    }

    pub fn store_to_file(&self, path: impl AsRef<Path>) -> Result<(), StoringBinParamsFailed> {
        self.store_params().store_to_file(path)
    }

    /// Restores a model stored with [`Cml::store_params()`].
    ///
    /// Features must be given if and only if the stored model has a feature projector.
    pub fn load_params(
        mut params: BinParams,
        features: Option<Array2<f32>>,
        config: CmlConfig,
    ) -> Result<Self, LoadingCmlFailed> {
        config.validate()?;

        let user_embeddings: Array2<f32> = params.take("user_embeddings")?;
        let item_embeddings: Array2<f32> = params.take("item_embeddings")?;
        for (name, embeddings) in [
            ("user_embeddings", &user_embeddings),
            ("item_embeddings", &item_embeddings),
        ] {
            if embeddings.ncols() != config.embed_dim {
                return Err(IncompatibleMatrices::new(
                    name,
                    embeddings.raw_dim(),
                    "config/embed_dim",
                    config.embed_dim,
                    "embeddings must have embed_dim columns",
                )
                .into());
            }
        }

        let projector = features
            .map(|features| {
                check_feature_rows(&features, item_embeddings.nrows())?;
                FeatureProjector::load(params.with_scope("feature_projector"), features, &config)
            })
            .transpose()?;

        if !params.is_empty() {
            return Err(LoadingCmlFailed::LeftoverBinParams {
                params: params.keys().map(Into::into).collect(),
            });
        }

        Ok(Self {
            config,
            user_embeddings,
            item_embeddings,
            projector,
        })
    }

    pub fn load_from_file(
        path: impl AsRef<Path>,
        features: Option<Array2<f32>>,
        config: CmlConfig,
    ) -> Result<Self, LoadingCmlFailed> {
        Self::load_params(BinParams::load_from_file(path)?, features, config)
    }
}

impl ItemScorer for Cml {
    fn item_scores(&self, user_ids: &[UserId]) -> Array2<f32> {
        Cml::item_scores(self, user_ids)
    }
}

fn check_feature_rows(features: &Array2<f32>, nr_items: usize) -> Result<(), IncompatibleMatrices> {
    if features.nrows() == nr_items {
        Ok(())
    } else {
        Err(IncompatibleMatrices::new(
            "features",
            features.raw_dim(),
            "item_embeddings",
            nr_items,
            "expected one row of features per item",
        ))
    }
}

fn mean_squared_distance(left: ArrayView1<f32>, right: ArrayView1<f32>) -> f32 {
    let sum = Zip::from(left)
        .and(right)
        .fold(0., |acc, &l, &r| acc + (l - r) * (l - r));
    sum / left.len() as f32
}

fn squared_row_norms(array: ArrayView2<f32>) -> Array1<f32> {
    array.map_axis(Axis(1), |row| row.dot(&row))
}
