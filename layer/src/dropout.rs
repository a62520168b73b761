use ndarray::{Array, ArrayBase, Data, Dimension, ShapeBuilder};
use rand::Rng;

/// Inverted dropout.
///
/// During training each element is zeroed with probability `rate` and the
/// remaining elements are scaled by `1 / (1 - rate)`, so that the expected
/// value of each element is unchanged. During inference this is the identity.
#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    /// Creates a new dropout layer.
    ///
    /// # Panics
    ///
    /// If `rate` is not in `[0, 1)`.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "dropout rate must be in [0, 1), got {}",
            rate
        );
        Self { rate }
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// Samples a mask of the given shape.
    ///
    /// The mask contains `0` for dropped elements and `1 / (1 - rate)` for kept ones.
    pub fn sample_mask<R, Sh, D>(&self, rng: &mut R, shape: Sh) -> Array<f32, D>
    where
        R: Rng + ?Sized,
        Sh: ShapeBuilder<Dim = D>,
        D: Dimension,
    {
        let keep_scale = 1. / (1. - self.rate);
        if self.rate == 0. {
            return Array::ones(shape);
        }
        Array::from_shape_simple_fn(shape, || {
            if rng.gen::<f32>() < self.rate {
                0.
            } else {
                keep_scale
            }
        })
    }

    /// Applies dropout in training mode and returns the output together with the used mask.
    ///
    /// The mask is needed for back-propagation, the partial derivatives wrt. the input
    /// are the partial derivatives wrt. the output multiplied with the mask.
    pub fn run_training<R, S, D>(
        &self,
        rng: &mut R,
        input: &ArrayBase<S, D>,
    ) -> (Array<f32, D>, Array<f32, D>)
    where
        R: Rng + ?Sized,
        S: Data<Elem = f32>,
        D: Dimension,
    {
        let mask = self.sample_mask(rng, input.raw_dim());
        (input * &mask, mask)
    }
}
