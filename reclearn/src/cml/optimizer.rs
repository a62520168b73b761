use ndarray::{Ix1, Ix2};

use crate::cml::{
    data::GradientSet,
    model::Cml,
    projector::{FeatureProjector, ProjectorGradientSet},
};
use layer::{
    activation::ActivationFunction,
    dense::{Dense, DenseGradientSet},
    optim::{Adagrad as AdagradAccumulator, DEFAULT_INITIAL_ACCUMULATOR},
};

/// Optimizer which applies gradients in a specific way to the current CML model.
pub trait Optimizer {
    /// Runs the next optimization step by applying the given gradients on the given model.
    fn apply_gradients(&mut self, model: &mut Cml, gradients: GradientSet);
}

/// Stochastic Gradient Descent
#[derive(Clone)]
pub struct MiniBatchSgd {
    pub learning_rate: f32,
}

impl Optimizer for MiniBatchSgd {
    fn apply_gradients(&mut self, model: &mut Cml, mut gradients: GradientSet) {
        gradients *= -self.learning_rate;
        model.add_gradients(&gradients);
    }
}

/// Adagrad with one accumulator per parameter.
///
/// Minimizing the total loss and minimizing `feature_loss / nr_items` keep
/// separate state, matching two independent optimizers of the same learning
/// rate. With item features the item embeddings therefore take two steps per
/// batch. The state is created on the first step.
#[derive(Clone)]
pub struct Adagrad {
    learning_rate: f32,
    initial_accumulator: f32,
    state: Option<AdagradState>,
}

#[derive(Clone)]
struct AdagradState {
    users: AdagradAccumulator<Ix2>,
    items: AdagradAccumulator<Ix2>,
    feature_items: Option<AdagradAccumulator<Ix2>>,
    projector: Option<ProjectorState>,
}

#[derive(Clone)]
struct ProjectorState {
    hidden: DenseState,
    output: DenseState,
}

#[derive(Clone)]
struct DenseState {
    weights: AdagradAccumulator<Ix2>,
    bias: AdagradAccumulator<Ix1>,
}

impl Adagrad {
    pub fn new(learning_rate: f32) -> Self {
        Self::with_initial_accumulator(learning_rate, DEFAULT_INITIAL_ACCUMULATOR)
    }

    pub fn with_initial_accumulator(learning_rate: f32, initial_accumulator: f32) -> Self {
        Self {
            learning_rate,
            initial_accumulator,
            state: None,
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }
}

impl AdagradState {
    fn new(model: &Cml, initial: f32) -> Self {
        Self {
            users: AdagradAccumulator::new(model.user_embeddings.raw_dim(), initial),
            items: AdagradAccumulator::new(model.item_embeddings.raw_dim(), initial),
            feature_items: model
                .projector
                .as_ref()
                .map(|_| AdagradAccumulator::new(model.item_embeddings.raw_dim(), initial)),
            projector: model
                .projector
                .as_ref()
                .map(|projector| ProjectorState::new(projector, initial)),
        }
    }
}

impl ProjectorState {
    fn new(projector: &FeatureProjector, initial: f32) -> Self {
        Self {
            hidden: DenseState::new(&projector.hidden, initial),
            output: DenseState::new(&projector.output, initial),
        }
    }

    fn step(
        &mut self,
        projector: &mut FeatureProjector,
        gradients: &ProjectorGradientSet,
        lr: f32,
    ) {
        self.hidden.step(&mut projector.hidden, &gradients.hidden, lr);
        self.output.step(&mut projector.output, &gradients.output, lr);
    }
}

impl DenseState {
    fn new<AF>(dense: &Dense<AF>, initial: f32) -> Self
    where
        AF: ActivationFunction<f32>,
    {
        Self {
            weights: AdagradAccumulator::new(dense.weights().raw_dim(), initial),
            bias: AdagradAccumulator::new(dense.bias().raw_dim(), initial),
        }
    }

    fn step<AF>(&mut self, dense: &mut Dense<AF>, gradients: &DenseGradientSet, lr: f32)
    where
        AF: ActivationFunction<f32>,
    {
        let (weights, bias) = dense.parameters_mut();
        self.weights.step(weights, gradients.weight_gradients(), lr);
        self.bias.step(bias, gradients.bias_gradients(), lr);
    }
}

impl Optimizer for Adagrad {
    fn apply_gradients(&mut self, model: &mut Cml, gradients: GradientSet) {
        let lr = self.learning_rate;
        let initial = self.initial_accumulator;
        let state = self
            .state
            .get_or_insert_with(|| AdagradState::new(model, initial));

        state.users.step(&mut model.user_embeddings, &gradients.user_embeddings, lr);
        state.items.step(&mut model.item_embeddings, &gradients.item_embeddings, lr);
        if let (Some(state), Some(gradients)) = (
            &mut state.feature_items,
            &gradients.feature_item_embeddings,
        ) {
            state.step(&mut model.item_embeddings, gradients, lr);
        }
        if let (Some(state), Some(projector), Some(gradients)) = (
            &mut state.projector,
            &mut model.projector,
            &gradients.projector,
        ) {
            state.step(projector, gradients, lr);
        }
    }
}
