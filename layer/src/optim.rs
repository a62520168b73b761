use ndarray::{azip, Array, ArrayBase, Data, Dimension};

/// Default start value of the squared gradient accumulator.
pub const DEFAULT_INITIAL_ACCUMULATOR: f32 = 0.1;

/// Per-parameter state of an Adagrad optimizer.
///
/// Each step adds the squared gradients to the accumulator and then moves
/// every parameter by `-lr * g / √acc`.
#[derive(Clone, Debug)]
pub struct Adagrad<D: Dimension> {
    accumulator: Array<f32, D>,
}

impl<D: Dimension> Adagrad<D> {
    /// Creates a zero-step accumulator for parameters of the given shape.
    pub fn new(shape: D, initial_accumulator: f32) -> Self {
        Self {
            accumulator: Array::from_elem(shape, initial_accumulator),
        }
    }

    pub fn accumulator(&self) -> &Array<f32, D> {
        &self.accumulator
    }

    /// Applies one update step to `params`.
    ///
    /// # Panics
    ///
    /// If the shapes of `params`, `gradients` and the accumulator differ.
    pub fn step<S>(
        &mut self,
        params: &mut Array<f32, D>,
        gradients: &ArrayBase<S, D>,
        learning_rate: f32,
    ) where
        S: Data<Elem = f32>,
    {
        azip!((param in params, acc in &mut self.accumulator, &grad in gradients) {
            *acc += grad * grad;
            *param -= learning_rate * grad / acc.sqrt();
        });
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Ix1};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_first_step() {
        let mut params = arr1(&[1.0f32, -1., 0.5]);
        let mut adagrad = Adagrad::<Ix1>::new(params.raw_dim(), 0.1);
        adagrad.step(&mut params, &arr1(&[0.3f32, 0., -0.3]), 0.5);

        let scale = 0.5 * 0.3 / 0.19f32.sqrt();
        assert_approx_eq!(f32, params, [1. - scale, -1., 0.5 + scale], ulps = 4);
        assert_approx_eq!(f32, adagrad.accumulator(), [0.19f32, 0.1, 0.19], ulps = 4);
    }

    #[test]
    fn test_steps_shrink_with_accumulated_gradients() {
        let mut params = arr2(&[[0.0f32]]);
        let mut adagrad = Adagrad::new(params.raw_dim(), DEFAULT_INITIAL_ACCUMULATOR);
        let gradients = arr2(&[[1.0f32]]);

        adagrad.step(&mut params, &gradients, 1.);
        let first = -params[[0, 0]];
        adagrad.step(&mut params, &gradients, 1.);
        let second = -params[[0, 0]] - first;

        assert!(second < first);
        assert_approx_eq!(f32, first, 1. / 1.1f32.sqrt());
        assert_approx_eq!(f32, second, 1. / 2.1f32.sqrt(), ulps = 4);
    }
}
