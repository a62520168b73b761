use ndarray::{Array2, Dimension, IntoDimension, Ix, Ix2};
use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

/// Normal Initializer
///
/// Values are sampled from `N(μ=0, σ=std_dev)` without truncation.
///
/// # Panics
///
/// If `std_dev` is negative or not finite.
pub fn normal_init<R>(rng: &mut R, dim: impl IntoDimension<Dim = Ix2>, std_dev: f32) -> Array2<f32>
where
    R: Rng + ?Sized,
{
    let dist = Normal::new(0., std_dev).unwrap();
    Array2::from_shape_simple_fn(dim.into_dimension(), || dist.sample(rng))
}

/// Glorot-Uniform Initializer
///
/// Weights for layer `j` are sampled from a uniform distribution over
/// `[-√(6/(n_j + o_j)); √(6/(n_j + o_j))]`.
///
/// Where `n_j` is the number of input units of this layer (rows of `W_j`)
/// and `o_j` the number of output units (columns of `W_j`).
///
/// Source:
///
/// - Website: https://proceedings.mlr.press/v9/glorot10a.html
/// - Pdf: https://proceedings.mlr.press/v9/glorot10a/glorot10a.pdf
pub fn glorot_uniform_weights_init<R>(
    rng: &mut R,
    dim: impl IntoDimension<Dim = Ix2>,
) -> Array2<f32>
where
    R: Rng + ?Sized,
{
    let dim = dim.into_dimension();
    let in_plus_out: Ix = dim.slice().iter().sum();

    // Avoids problems with by-0 division.
    if in_plus_out == 0 {
        return Array2::zeros(dim);
    }

    let limit = (6. / in_plus_out as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);

    Array2::from_shape_simple_fn(dim, || dist.sample(rng))
}
