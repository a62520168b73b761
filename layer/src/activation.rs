use ndarray::{Array, ArrayBase, Data, DataMut, DataOwned, Dimension, NdFloat};

/// Trait representing a activation functions.
pub trait ActivationFunction<A> {
    /// Applies the activation function to given array.
    ///
    /// In most cases this will call `input.mapv_inplace` and
    /// apply some function element wise.
    fn apply_to<S, D>(&self, input: ArrayBase<S, D>) -> ArrayBase<S, D>
    where
        S: DataOwned<Elem = A> + DataMut<Elem = A>,
        D: Dimension;
}

/// reLu activation function.
#[derive(Clone, Copy, Debug)]
pub struct Relu;

impl<A> ActivationFunction<A> for Relu
where
    A: NdFloat,
{
    fn apply_to<S, D>(&self, mut input: ArrayBase<S, D>) -> ArrayBase<S, D>
    where
        S: DataOwned<Elem = A> + DataMut<Elem = A>,
        D: Dimension,
    {
        input.mapv_inplace(|v| A::max(A::zero(), v));
        input
    }
}

impl Relu {
    /// Returns the partial derivatives of reLu at the given pre-activation values.
    ///
    /// The derivative at exactly `0` is taken to be `0`.
    pub fn partial_derivatives_at<S, D>(input: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        input.mapv(|v| (v > 0.) as u8 as f32)
    }
}

/// Linear activation function.
///
/// Like common this is a identity function used
/// in cases where there no activation function is needed.
#[derive(Clone, Copy, Debug)]
pub struct Linear;

impl<A> ActivationFunction<A> for Linear {
    fn apply_to<S, D>(&self, input: ArrayBase<S, D>) -> ArrayBase<S, D>
    where
        S: DataOwned<Elem = A> + DataMut<Elem = A>,
        D: Dimension,
    {
        input
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr3};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_relu_activation_function_works() {
        let array = arr3(&[
            [[-1.0f32, 2.], [3.5, -4.0]],
            [[3.0, 2.4], [-3.0, -1.2]],
            [[-12.0, -2.0], [2.0, 12.0]],
        ]);
        let expected = arr3(&[
            [[0.0f32, 2.], [3.5, 0.0]],
            [[3.0, 2.4], [0.0, 0.0]],
            [[0.0, 0.0], [2.0, 12.0]],
        ]);
        let output = Relu.apply_to(array);
        assert_approx_eq!(f32, output, expected);
    }

    #[test]
    fn test_relu_derivatives() {
        let z = arr1(&[-0.5f32, 0., 0.25, 3.]);
        assert_approx_eq!(f32, Relu::partial_derivatives_at(&z), [0f32, 0., 1., 1.]);
    }

    #[test]
    fn test_linear_activation_function_works() {
        let array = arr3(&[[[-1.0f32, 2.], [3.5, -4.0]], [[3.0, 2.4], [-3.0, -1.2]]]);
        let expected = array.clone();
        let output = Linear.apply_to(array);
        assert_approx_eq!(f32, output, expected);
    }
}
