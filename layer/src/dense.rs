use std::ops::MulAssign;

use displaydoc::Display;
use ndarray::{
    linalg::Dot,
    Array,
    Array1,
    Array2,
    ArrayBase,
    ArrayView1,
    ArrayView2,
    Axis,
    Data,
    Dimension,
    RemoveAxis,
};
use thiserror::Error;

use crate::{
    activation::ActivationFunction,
    io::{BinParamsWithScope, FailedToRetrieveParams, UnexpectedNumberOfDimensions},
    utils::IncompatibleMatrices,
};

/// Failed to load the Dense layer
#[derive(Debug, Display, Error)]
#[prefix_enum_doc_attributes]
pub enum LoadingDenseFailed {
    /// {0}
    IncompatibleMatrices(#[from] IncompatibleMatrices),
    /// {0}
    DimensionMismatch(#[from] UnexpectedNumberOfDimensions),
    /// {0}
    FailedToRetrieveParams(#[from] FailedToRetrieveParams),
}

/// A dense feed forward network layer.
///
/// The weights have the shape `(nr_inputs, nr_units)`, the
/// bias the shape `(nr_units,)`.
#[derive(Clone, Debug)]
pub struct Dense<AF>
where
    AF: ActivationFunction<f32>,
{
    weights: Array2<f32>,
    bias: Array1<f32>,
    activation_function: AF,
}

impl<AF> Dense<AF>
where
    AF: ActivationFunction<f32>,
{
    pub fn new(
        weights: Array2<f32>,
        bias: Array1<f32>,
        activation_function: AF,
    ) -> Result<Self, IncompatibleMatrices> {
        if weights.shape()[1] == bias.shape()[0] {
            Ok(Self {
                weights,
                bias,
                activation_function,
            })
        } else {
            Err(IncompatibleMatrices::new(
                "Dense/weights",
                weights.raw_dim(),
                "Dense/bias",
                bias.raw_dim(),
                "expected weights[1] == bias[0] for broadcasting bias add",
            ))
        }
    }

    pub fn load(
        mut params: BinParamsWithScope,
        activation_function: AF,
    ) -> Result<Self, LoadingDenseFailed> {
        Self::new(
            params.take("weights")?,
            params.take("bias")?,
            activation_function,
        )
        .map_err(Into::into)
    }

    pub fn store_params(&self, mut params: BinParamsWithScope) {
        params.insert("weights", self.weights.clone());
        params.insert("bias", self.bias.clone());
    }

    pub fn weights(&self) -> ArrayView2<f32> {
        self.weights.view()
    }

    pub fn bias(&self) -> ArrayView1<f32> {
        self.bias.view()
    }

    /// Number of inputs the layer expects per row.
    pub fn nr_inputs(&self) -> usize {
        self.weights.nrows()
    }

    /// Number of units, i.e. outputs per row.
    pub fn nr_units(&self) -> usize {
        self.weights.ncols()
    }

    /// Mutable access to `(weights, bias)`, e.g. for optimizers keeping their own state.
    pub fn parameters_mut(&mut self) -> (&mut Array2<f32>, &mut Array1<f32>) {
        (&mut self.weights, &mut self.bias)
    }

    pub fn check_in_out_shapes<D>(&self, mut shape: D) -> Result<D, IncompatibleMatrices>
    where
        D: Dimension,
    {
        let ndim = shape.ndim();
        let name_left = "dense/input";
        let name_right = "dense/weights";
        let shape_right = self.weights.raw_dim();
        if let 1 | 2 = ndim {
            if shape[ndim - 1] == shape_right[0] {
                shape[ndim - 1] = shape_right[1];
                Ok(shape)
            } else {
                Err(IncompatibleMatrices::new(
                    name_left,
                    shape.into_dyn(),
                    name_right,
                    shape_right,
                    "input matrix can't be dot multipled with weight matrix",
                ))
            }
        } else {
            Err(IncompatibleMatrices::new(
                name_left,
                shape.into_dyn(),
                name_right,
                shape_right,
                "can only use dot product with 1- or 2-dimensional arrays",
            ))
        }
    }

    /// Applies the dense layer on the given inputs.
    pub fn run<S, D>(&self, input: &ArrayBase<S, D>) -> Array<f32, D>
    where
        S: Data<Elem = f32>,
        D: Dimension + RemoveAxis,
        ArrayBase<S, D>: Dot<Array2<f32>, Output = Array<f32, D>>,
    {
        self.run_for_back_propagation(input).0
    }

    /// Applies the dense layer and also returns the intermediate result
    /// (`z_out`) from before the activation function was applied.
    pub fn run_for_back_propagation<S, D>(
        &self,
        input: &ArrayBase<S, D>,
    ) -> (Array<f32, D>, Array<f32, D>)
    where
        S: Data<Elem = f32>,
        D: Dimension + RemoveAxis,
        ArrayBase<S, D>: Dot<Array2<f32>, Output = Array<f32, D>>,
    {
        let mut z_out = input.dot(&self.weights);
        z_out += &self.bias;
        let y_out = self.activation_function.apply_to(z_out.clone());

        (y_out, z_out)
    }

    /// Calculates the gradients of a dense layer for a batch of rows.
    ///
    /// `inputs` has the shape `(nr_rows, nr_inputs)` and `partials`, the partial
    /// derivatives of the cost wrt. the pre-activation outputs, the shape
    /// `(nr_rows, nr_units)`. As the weights are shared across rows the
    /// per-row gradients are summed up.
    pub fn gradients_from_partials_2d(
        &self,
        inputs: ArrayView2<f32>,
        partials: ArrayView2<f32>,
    ) -> DenseGradientSet {
        assert_eq!(inputs.shape()[1], self.nr_inputs());
        assert_eq!(partials.shape()[1], self.nr_units());
        assert_eq!(inputs.shape()[0], partials.shape()[0]);

        // Per row this is the outer product `s_i * p_j` (see the Jacobian of `x · W`),
        // summing it over all rows is exactly `inputsᵀ · partials`.
        let weight_gradients = inputs.t().dot(&partials);
        let bias_gradients = partials.sum_axis(Axis(0));

        DenseGradientSet {
            weight_gradients,
            bias_gradients,
        }
    }

    /// Back-propagates the partial derivatives wrt. the (pre-activation) outputs
    /// to partial derivatives wrt. the inputs of this layer.
    pub fn partials_wrt_inputs(&self, partials: ArrayView2<f32>) -> Array2<f32> {
        partials.dot(&self.weights.t())
    }

    /// Adds given gradients to the weight and bias matrices.
    pub fn add_gradients(&mut self, gradients: &DenseGradientSet) {
        self.weights += &gradients.weight_gradients;
        self.bias += &gradients.bias_gradients;
    }
}

/// A gradient set containing gradients for all parameters in a dense layer.
///
/// (Assuming the activation function has no parameters. It might still have
/// hyper-parameters.)
#[derive(Debug, Clone)]
pub struct DenseGradientSet {
    weight_gradients: Array2<f32>,
    bias_gradients: Array1<f32>,
}

impl DenseGradientSet {
    pub fn new(weight_gradients: Array2<f32>, bias_gradients: Array1<f32>) -> Self {
        Self {
            weight_gradients,
            bias_gradients,
        }
    }

    pub fn weight_gradients(&self) -> &Array2<f32> {
        &self.weight_gradients
    }

    pub fn bias_gradients(&self) -> &Array1<f32> {
        &self.bias_gradients
    }
}

impl MulAssign<f32> for DenseGradientSet {
    fn mul_assign(&mut self, rhs: f32) {
        self.weight_gradients *= rhs;
        self.bias_gradients *= rhs;
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2, Array1, Array2, IntoDimension};

    use crate::activation::{Linear, Relu};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_dense_matrix_for_2d_input() {
        // (features, units) = (3, 2)
        let weights = arr2(&[[1.0f32, 2.], [4., 8.], [3., 0.]]);
        // (units,) = (2,)
        let bias = arr1(&[0.5, 2.0]);
        let dense = Dense::new(weights, bias, Linear).unwrap();

        // (..., features) = (2, 3);
        let inputs = arr2(&[[10., 1., -10.], [0., 10., 0.]]);
        let expected = arr2(&[[-15.5, 30.], [40.5, 82.]]);
        let res = dense.run(&inputs);
        assert_approx_eq!(f32, res, expected);
    }

    #[test]
    fn test_activation_function_is_called() {
        let weights = arr2(&[[1.0f32, 2.], [4., 8.], [3., 0.]]);
        let bias = arr1(&[0.5, 2.0]);
        let dense = Dense::new(weights, bias, Relu).unwrap();

        let inputs = arr2(&[[10., 1., -10.], [0., 10., 0.]]);
        let (y_out, z_out) = dense.run_for_back_propagation(&inputs);

        assert_approx_eq!(f32, y_out, arr2(&[[0.0f32, 30.], [40.5, 82.]]));
        assert_approx_eq!(f32, z_out, arr2(&[[-15.5f32, 30.], [40.5, 82.]]));
    }

    #[test]
    fn test_dense_new_errors_if_shapes_do_not_match() {
        let weights = Array2::<f32>::ones((2, 3));
        let bias = Array1::ones((2,));
        assert!(Dense::new(weights, bias, Linear).is_err());
    }

    #[test]
    fn test_check_in_out_shape() {
        let weights = Array2::<f32>::ones((5, 4));
        let bias = Array1::<f32>::ones((4,));
        let dense = Dense::new(weights, bias, Linear).unwrap();

        let dim = [10, 5].into_dimension();
        let out_shape = dense.check_in_out_shapes(dim).unwrap();
        assert_eq!(out_shape, [10, 4].into_dimension());

        let dim = [1, 10, 5].into_dimension();
        dense.check_in_out_shapes(dim).unwrap_err();

        let dim = [10, 4].into_dimension();
        dense.check_in_out_shapes(dim).unwrap_err();
    }

    #[test]
    fn test_gradients_are_summed_over_rows() {
        let weights = arr2(&[[1.0f32, 2.], [4., 8.], [3., 0.]]);
        let bias = arr1(&[0.5, 2.0]);
        let dense = Dense::new(weights, bias, Linear).unwrap();

        let inputs = arr2(&[[1.0f32, 0., 2.], [0., 1., 0.]]);
        let partials = arr2(&[[1.0f32, -1.], [0.5, 2.]]);
        let gradients = dense.gradients_from_partials_2d(inputs.view(), partials.view());

        assert_approx_eq!(
            f32,
            gradients.weight_gradients(),
            arr2(&[[1.0f32, -1.], [0.5, 2.], [2., -2.]])
        );
        assert_approx_eq!(f32, gradients.bias_gradients(), arr1(&[1.5f32, 1.]));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        // cost = sum(x · W + b) so d cost / d z = 1 everywhere
        let weights = arr2(&[[0.5f32, -1.], [2., 0.25]]);
        let bias = arr1(&[0.1f32, -0.2]);
        let mut dense = Dense::new(weights, bias, Linear).unwrap();
        let inputs = arr2(&[[1.0f32, 2.], [-1., 0.5]]);
        let partials = Array2::ones((2, 2));

        let gradients = dense.gradients_from_partials_2d(inputs.view(), partials.view());
        let cost = |dense: &Dense<Linear>| dense.run(&inputs).sum();

        let before = cost(&dense);
        dense.parameters_mut().0[[1, 0]] += 0.01;
        let after = cost(&dense);
        assert_approx_eq!(
            f32,
            (after - before) / 0.01,
            gradients.weight_gradients()[[1, 0]],
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_partials_wrt_inputs() {
        let weights = arr2(&[[1.0f32, 2.], [4., 8.], [3., 0.]]);
        let dense = Dense::new(weights, Array1::zeros((2,)), Linear).unwrap();
        let partials = arr2(&[[1.0f32, 0.5]]);
        assert_approx_eq!(
            f32,
            dense.partials_wrt_inputs(partials.view()),
            arr2(&[[2.0f32, 8., 3.]])
        );
    }

    #[test]
    fn test_add_gradients() {
        let mut dense = Dense::new(Array2::zeros((2, 1)), Array1::zeros((1,)), Linear).unwrap();
        let mut gradients = DenseGradientSet::new(arr2(&[[1.0f32], [2.]]), arr1(&[3.0f32]));
        gradients *= 2.;
        dense.add_gradients(&gradients);
        assert_approx_eq!(f32, dense.weights(), arr2(&[[2.0f32], [4.]]));
        assert_approx_eq!(f32, dense.bias(), arr1(&[6.0f32]));
    }
}
