use std::ops::MulAssign;

use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;

use crate::cml::{model::LoadingCmlFailed, CmlConfig};
use layer::{
    activation::{Linear, Relu},
    dense::{Dense, DenseGradientSet},
    dropout::Dropout,
    initializer::glorot_uniform_weights_init,
    io::BinParamsWithScope,
    utils::{clip_rows_by_norm, clip_rows_by_norm_backward, IncompatibleMatrices},
};

/// Maps the raw features of all items into the embedding space.
///
/// # Architecture
///
/// 0. Item features `(nr_items, nr_features)`
/// 1. Dense layer with `hidden_layer_dim` units, bias and reLu activation function
/// 2. Dropout with `dropout_rate` (only during training)
/// 3. Dense layer with `embed_dim` units, bias and linear activation function
/// 4. Scaling by `feature_projection_scaling_factor`
/// 5. Clipping of each row to a norm of at most `clip_norm`
#[derive(Clone, Debug)]
pub struct FeatureProjector {
    features: Array2<f32>,
    pub(super) hidden: Dense<Relu>,
    pub(super) output: Dense<Linear>,
    dropout: Dropout,
    scaling_factor: f32,
    clip_norm: f32,
}

/// Intermediate results of a training forward pass.
pub(super) struct ProjectionForBackprop {
    hidden_z: Array2<f32>,
    dropped_hidden: Array2<f32>,
    dropout_mask: Array2<f32>,
    unclipped: Array2<f32>,
    pub(super) projection: Array2<f32>,
}

/// Gradients for the weights of both dense layers of a [`FeatureProjector`].
#[derive(Clone, Debug)]
pub struct ProjectorGradientSet {
    pub(super) hidden: DenseGradientSet,
    pub(super) output: DenseGradientSet,
}

impl FeatureProjector {
    /// Creates a projector with Glorot-Uniform initialized weights and zero biases.
    pub fn new<R>(
        features: Array2<f32>,
        config: &CmlConfig,
        rng: &mut R,
    ) -> Result<Self, IncompatibleMatrices>
    where
        R: Rng + ?Sized,
    {
        let nr_features = features.ncols();
        let hidden = Dense::new(
            glorot_uniform_weights_init(rng, (nr_features, config.hidden_layer_dim)),
            Array1::zeros(config.hidden_layer_dim),
            Relu,
        )?;
        let output = Dense::new(
            glorot_uniform_weights_init(rng, (config.hidden_layer_dim, config.embed_dim)),
            Array1::zeros(config.embed_dim),
            Linear,
        )?;

        Ok(Self::from_layers(features, hidden, output, config))
    }

    fn from_layers(
        features: Array2<f32>,
        hidden: Dense<Relu>,
        output: Dense<Linear>,
        config: &CmlConfig,
    ) -> Self {
        Self {
            features,
            hidden,
            output,
            dropout: Dropout::new(config.dropout_rate),
            scaling_factor: config.feature_projection_scaling_factor,
            clip_norm: config.clip_norm,
        }
    }

    /// Loads the layer weights and checks them against the features and config.
    pub(super) fn load(
        mut params: BinParamsWithScope,
        features: Array2<f32>,
        config: &CmlConfig,
    ) -> Result<Self, LoadingCmlFailed> {
        let hidden = Dense::load(params.with_scope("hidden"), Relu)?;
        let hidden_out = hidden.check_in_out_shapes(features.raw_dim())?;
        let output = Dense::load(params.with_scope("output"), Linear)?;
        let output_out = output.check_in_out_shapes(hidden_out)?;

        if output_out[1] != config.embed_dim {
            return Err(IncompatibleMatrices::new(
                "feature_projector/output",
                output_out,
                "item_embeddings",
                (features.nrows(), config.embed_dim),
                "projection must have the embedding dimension",
            )
            .into());
        }
        if hidden.nr_units() != config.hidden_layer_dim {
            return Err(IncompatibleMatrices::new(
                "feature_projector/hidden",
                hidden_out,
                "config/hidden_layer_dim",
                config.hidden_layer_dim,
                "hidden layer size differs from the configuration",
            )
            .into());
        }

        Ok(Self::from_layers(features, hidden, output, config))
    }

    pub(super) fn store_params(&self, mut params: BinParamsWithScope) {
        self.hidden.store_params(params.with_scope("hidden"));
        self.output.store_params(params.with_scope("output"));
    }

    pub fn features(&self) -> ArrayView2<f32> {
        self.features.view()
    }

    pub fn nr_items(&self) -> usize {
        self.features.nrows()
    }

    /// Projects the features of all items, dropout is disabled.
    pub fn project(&self) -> Array2<f32> {
        let hidden = self.hidden.run(&self.features);
        let output = self.output.run(&hidden);
        self.scale_and_clip(output).1
    }

    /// Projects the features of all items with dropout.
    ///
    /// Keeps what is needed for [`Self::gradients()`].
    pub(super) fn project_for_training<R>(&self, rng: &mut R) -> ProjectionForBackprop
    where
        R: Rng + ?Sized,
    {
        let (hidden, hidden_z) = self.hidden.run_for_back_propagation(&self.features);
        let (dropped_hidden, dropout_mask) = self.dropout.run_training(rng, &hidden);
        let output = self.output.run(&dropped_hidden);
        let (unclipped, projection) = self.scale_and_clip(output);

        ProjectionForBackprop {
            hidden_z,
            dropped_hidden,
            dropout_mask,
            unclipped,
            projection,
        }
    }

    fn scale_and_clip(&self, mut output: Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        output *= self.scaling_factor;
        let mut clipped = output.clone();
        clip_rows_by_norm(&mut clipped, self.clip_norm);
        (output, clipped)
    }

    /// Back-propagates the partial derivatives of a cost wrt. the projection.
    pub(super) fn gradients(
        &self,
        forward: &ProjectionForBackprop,
        partials_wrt_projection: ArrayView2<f32>,
    ) -> ProjectorGradientSet {
        let partials_wrt_scaled = clip_rows_by_norm_backward(
            forward.unclipped.view(),
            partials_wrt_projection,
            self.clip_norm,
        );
        let partials_wrt_output = partials_wrt_scaled * self.scaling_factor;

        let output = self
            .output
            .gradients_from_partials_2d(forward.dropped_hidden.view(), partials_wrt_output.view());

        let mut partials_wrt_hidden_z = self.output.partials_wrt_inputs(partials_wrt_output.view());
        partials_wrt_hidden_z *= &forward.dropout_mask;
        partials_wrt_hidden_z *= &Relu::partial_derivatives_at(&forward.hidden_z);
        let hidden = self
            .hidden
            .gradients_from_partials_2d(self.features.view(), partials_wrt_hidden_z.view());

        ProjectorGradientSet { hidden, output }
    }

    pub(super) fn add_gradients(&mut self, gradients: &ProjectorGradientSet) {
        self.hidden.add_gradients(&gradients.hidden);
        self.output.add_gradients(&gradients.output);
    }
}

impl ProjectorGradientSet {
    pub fn hidden(&self) -> &DenseGradientSet {
        &self.hidden
    }

    pub fn output(&self) -> &DenseGradientSet {
        &self.output
    }
}

impl MulAssign<f32> for ProjectorGradientSet {
    fn mul_assign(&mut self, rhs: f32) {
        self.hidden *= rhs;
        self.output *= rhs;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array2};
    use rand::{rngs::StdRng, SeedableRng};
    use test_utils::assert_approx_eq;

    use super::*;
    use layer::{io::BinParams, utils::row_norms};

    fn config(dropout_rate: f32) -> CmlConfig {
        CmlConfig {
            embed_dim: 3,
            hidden_layer_dim: 4,
            dropout_rate,
            clip_norm: 0.6,
            feature_projection_scaling_factor: 0.5,
            ..CmlConfig::default()
        }
    }

    fn features() -> Array2<f32> {
        arr2(&[
            [1.0f32, 0., 2., 0.5, 0.],
            [0., 1., 1., 0., 3.],
            [0.2, 0.1, 0., 0., 0.],
        ])
    }

    #[test]
    fn test_projection_is_clipped() {
        let mut rng = StdRng::seed_from_u64(4);
        let projector = FeatureProjector::new(features(), &config(0.), &mut rng).unwrap();
        let projection = projector.project();
        assert_eq!(projection.shape(), &[3, 3]);
        assert!(row_norms(&projection).iter().all(|&norm| norm <= 0.6 + 1e-6));
    }

    #[test]
    fn test_training_projection_without_dropout_equals_inference() {
        let mut rng = StdRng::seed_from_u64(4);
        let projector = FeatureProjector::new(features(), &config(0.), &mut rng).unwrap();
        let forward = projector.project_for_training(&mut rng);
        assert_approx_eq!(f32, forward.projection, projector.project());
    }

    /// Cost used for the finite difference checks: `Σ (projection ⊙ target)`.
    fn cost(projection: &Array2<f32>, target: &Array2<f32>) -> f32 {
        (projection * target).sum()
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(17);
        let config = config(0.);
        let projector = FeatureProjector::new(features(), &config, &mut rng).unwrap();
        let target = arr2(&[[0.3f32, -1., 0.5], [1., 0.2, -0.4], [-0.7, 0.1, 0.9]]);

        let forward = projector.project_for_training(&mut rng);
        let gradients = projector.gradients(&forward, target.view());

        let epsilon = 1e-3;
        for (layer, (row, col)) in [(0, (1, 2)), (0, (4, 0)), (1, (2, 1)), (1, (0, 0))] {
            let mut plus = projector.clone();
            let mut minus = projector.clone();
            if layer == 0 {
                plus.hidden.parameters_mut().0[[row, col]] += epsilon;
                minus.hidden.parameters_mut().0[[row, col]] -= epsilon;
            } else {
                plus.output.parameters_mut().0[[row, col]] += epsilon;
                minus.output.parameters_mut().0[[row, col]] -= epsilon;
            }
            let numeric =
                (cost(&plus.project(), &target) - cost(&minus.project(), &target)) / (2. * epsilon);
            let analytic = if layer == 0 {
                gradients.hidden().weight_gradients()[[row, col]]
            } else {
                gradients.output().weight_gradients()[[row, col]]
            };
            assert_approx_eq!(f32, analytic, numeric, epsilon = 2e-2);
        }
    }

    #[test]
    fn test_dropped_units_get_no_gradient() {
        let mut rng = StdRng::seed_from_u64(5);
        let projector = FeatureProjector::new(features(), &config(0.5), &mut rng).unwrap();
        let forward = projector.project_for_training(&mut rng);
        let gradients = projector.gradients(&forward, Array2::ones((3, 3)).view());

        for unit in 0..4 {
            if forward.dropout_mask.column(unit).iter().all(|&m| m == 0.) {
                let hidden = gradients.hidden().weight_gradients();
                assert!(hidden.column(unit).iter().all(|&g| g == 0.));
                let output = gradients.output().weight_gradients();
                assert!(output.row(unit).iter().all(|&g| g == 0.));
            }
        }
    }

    #[test]
    fn test_store_and_load() {
        let mut rng = StdRng::seed_from_u64(8);
        let config = config(0.2);
        let projector = FeatureProjector::new(features(), &config, &mut rng).unwrap();
        let mut params = BinParams::default();
        projector.store_params(params.with_scope("feature_projector"));

        let loaded =
            FeatureProjector::load(params.with_scope("feature_projector"), features(), &config)
                .unwrap();
        assert!(params.is_empty());
        assert_approx_eq!(f32, loaded.project(), projector.project());

        let mut params = BinParams::default();
        projector.store_params(params.with_scope("feature_projector"));
        let other = CmlConfig {
            embed_dim: 4,
            ..config
        };
        let loaded =
            FeatureProjector::load(params.with_scope("feature_projector"), features(), &other);
        assert!(loaded.is_err());
    }
}
