use displaydoc::Display;
use ndarray::{
    Array1,
    Array2,
    ArrayBase,
    ArrayView2,
    Axis,
    Data,
    Dimension,
    IntoDimension,
    IxDyn,
    Zip,
};
use thiserror::Error;

/// Can't combine {name_left}({shape_left:?}) with {name_right}({shape_right:?}): {hint}
#[derive(Debug, Display, Error)]
pub struct IncompatibleMatrices {
    name_left: &'static str,
    shape_left: IxDyn,
    name_right: &'static str,
    shape_right: IxDyn,
    hint: &'static str,
}

impl IncompatibleMatrices {
    pub fn new(
        name_left: &'static str,
        shape_left: impl IntoDimension,
        name_right: &'static str,
        shape_right: impl IntoDimension,
        hint: &'static str,
    ) -> Self {
        Self {
            name_left,
            shape_left: shape_left.into_dimension().into_dyn(),
            name_right,
            shape_right: shape_right.into_dimension().into_dyn(),
            hint,
        }
    }
}

/// Computes the l2 norm of each row.
pub fn row_norms<S>(array: &ArrayBase<S, ndarray::Ix2>) -> Array1<f32>
where
    S: Data<Elem = f32>,
{
    array.map_axis(Axis(1), |row| row.dot(&row).sqrt())
}

/// Rescales every row which has a l2 norm larger then `clip_norm` to have exactly that norm.
///
/// Rows with a smaller norm are left unchanged, i.e. each row `t` becomes
/// `t * clip_norm / max(‖t‖, clip_norm)`.
pub fn clip_rows_by_norm(array: &mut Array2<f32>, clip_norm: f32) {
    for mut row in array.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > clip_norm {
            row *= clip_norm / norm;
        }
    }
}

/// Back-propagates partial derivatives through [`clip_rows_by_norm()`].
///
/// `unclipped` are the rows before clipping and `partials` the partial derivatives
/// of the cost wrt. the clipped rows. For an unclipped row the derivative is passed
/// through, for a clipped row `t` with norm `n` it's `c/n * (p - t * (t·p) / n²)`.
pub fn clip_rows_by_norm_backward(
    unclipped: ArrayView2<f32>,
    partials: ArrayView2<f32>,
    clip_norm: f32,
) -> Array2<f32> {
    debug_assert_eq!(unclipped.shape(), partials.shape());
    let mut out = partials.to_owned();
    Zip::from(out.rows_mut())
        .and(unclipped.rows())
        .for_each(|mut partial, row| {
            let norm_sq = row.dot(&row);
            let norm = norm_sq.sqrt();
            if norm > clip_norm {
                let projection = row.dot(&partial) / norm_sq;
                partial.zip_mut_with(&row, |p, &t| *p = clip_norm / norm * (*p - t * projection));
            }
        });
    out
}

/// Computes the mean squared difference between each row of `left` and `right`.
pub fn mean_squared_row_distances(left: ArrayView2<f32>, right: ArrayView2<f32>) -> Array1<f32> {
    debug_assert_eq!(left.shape(), right.shape());
    let diff = &left - &right;
    diff.mapv(|v| v * v).mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(left.nrows()))
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, arr2};
    use test_utils::assert_approx_eq;

    use super::*;

    #[test]
    fn test_incompatible_matrices_of_different_dimensionality() {
        let error = IncompatibleMatrices::new("weights", (3, 2), "bias", 4, "units differ");
        assert_eq!(error.shape_left.ndim(), 2);
        assert_eq!(error.shape_right.ndim(), 1);
        let message = error.to_string();
        assert!(message.starts_with("Can't combine weights("));
        assert!(message.ends_with("): units differ"));
    }

    #[test]
    fn test_row_norms() {
        let array = arr2(&[[3.0f32, 4.], [0., 0.], [1., 0.]]);
        assert_approx_eq!(f32, row_norms(&array), [5f32, 0., 1.]);
    }

    #[test]
    fn test_clip_rows_by_norm_only_touches_long_rows() {
        let mut array = arr2(&[[3.0f32, 4.], [0.3, 0.4], [0., -2.]]);
        clip_rows_by_norm(&mut array, 1.0);
        assert_approx_eq!(f32, array, arr2(&[[0.6f32, 0.8], [0.3, 0.4], [0., -1.]]));
    }

    #[test]
    fn test_clip_backward_passes_through_unclipped_rows() {
        let rows = arr2(&[[0.3f32, 0.4]]);
        let partials = arr2(&[[1.0f32, -2.]]);
        let res = clip_rows_by_norm_backward(rows.view(), partials.view(), 1.0);
        assert_approx_eq!(f32, res, partials);
    }

    #[test]
    fn test_clip_backward_removes_radial_component() {
        // a partial along the row direction doesn't change the clipped output
        let rows = arr2(&[[3.0f32, 4.]]);
        let partials = arr2(&[[0.6f32, 0.8]]);
        let res = clip_rows_by_norm_backward(rows.view(), partials.view(), 1.0);
        assert_approx_eq!(f32, res, arr2(&[[0.0f32, 0.]]), epsilon = 1e-6);

        // the tangential component is scaled by c/n
        let partials = arr2(&[[-0.8f32, 0.6]]);
        let res = clip_rows_by_norm_backward(rows.view(), partials.view(), 1.0);
        assert_approx_eq!(f32, res, arr2(&[[-0.16f32, 0.12]]), epsilon = 1e-6);
    }

    #[test]
    fn test_mean_squared_row_distances() {
        let left = arr2(&[[1.0f32, 2.], [0., 0.]]);
        let right = arr2(&[[1.0f32, 0.], [3., 1.]]);
        let res = mean_squared_row_distances(left.view(), right.view());
        assert_approx_eq!(f32, res, arr1(&[2.0f32, 5.]));
    }
}
