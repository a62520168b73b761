use std::ops::MulAssign;

use ndarray::Array2;

use crate::cml::projector::ProjectorGradientSet;

/// Gradients for all parameters of a [`Cml`](super::Cml) model.
///
/// The embedding gradients are those of the total loss. With item features
/// the feature loss divided by the number of items is minimized as well, its
/// gradients wrt. the item embeddings and the projector weights are kept
/// apart so that they can be applied as a second optimization step.
#[derive(Clone, Debug)]
pub struct GradientSet {
    pub(super) user_embeddings: Array2<f32>,
    pub(super) item_embeddings: Array2<f32>,
    pub(super) feature_item_embeddings: Option<Array2<f32>>,
    pub(super) projector: Option<ProjectorGradientSet>,
}

impl GradientSet {
    pub fn user_embeddings(&self) -> &Array2<f32> {
        &self.user_embeddings
    }

    pub fn item_embeddings(&self) -> &Array2<f32> {
        &self.item_embeddings
    }

    /// Gradients of `feature_loss / nr_items` wrt. the item embeddings.
    pub fn feature_item_embeddings(&self) -> Option<&Array2<f32>> {
        self.feature_item_embeddings.as_ref()
    }

    pub fn projector(&self) -> Option<&ProjectorGradientSet> {
        self.projector.as_ref()
    }
}

impl MulAssign<f32> for GradientSet {
    fn mul_assign(&mut self, rhs: f32) {
        self.user_embeddings *= rhs;
        self.item_embeddings *= rhs;
        if let Some(feature_item_embeddings) = &mut self.feature_item_embeddings {
            *feature_item_embeddings *= rhs;
        }
        if let Some(projector) = &mut self.projector {
            *projector *= rhs;
        }
    }
}

/// The losses of one training batch.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchLoss {
    /// Sum of the hinge losses of all pairs.
    pub embedding_loss: f32,
    /// Weighted distance of all item embeddings to their feature projection.
    pub feature_loss: f32,
    /// Number of sampled negative items which violate the margin.
    pub nr_impostors: usize,
}

impl BatchLoss {
    pub fn total(&self) -> f32 {
        self.embedding_loss + self.feature_loss
    }
}
