use ndarray::{ArrayBase, Data, Dimension, IntoDimension, Ix};

/// Asserts that two floating point "things" are approximately equal.
///
/// The first argument is the leaf type (`f32` or `f64`), the others can be
/// numbers, slices, arrays, vectors or ndarray arrays, also nested. Both sides
/// are walked in logical order and must have the same layout.
///
/// ```
/// use ndarray::arr2;
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(f32, 0.15039155, 0.1503916, ulps = 3);
/// assert_approx_eq!(f32, &[[1.0, 2.], [3., 4.]], arr2(&[[1.0, 2.], [3., 4.]]));
/// assert_approx_eq!(f64, vec![0.5, 0.25], [0.5, 0.26], epsilon = 0.02);
/// ```
///
/// `ulps` defaults to `2` and `epsilon` to `0`.
///
/// Two NaN values are treated as equal, the assertion checks for an expected
/// outcome and not for semantic float equality.
#[macro_export]
macro_rules! assert_approx_eq {
    ($t:ident, $left:expr, $right:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = 0., ulps = 2)
    };
    ($t:ident, $left:expr, $right:expr, ulps = $ulps:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = 0., ulps = $ulps)
    };
    ($t:ident, $left:expr, $right:expr, epsilon = $epsilon:expr $(,)?) => {
        $crate::assert_approx_eq!($t, $left, $right, epsilon = $epsilon, ulps = 2)
    };
    ($t:ident, $left:expr, $right:expr, epsilon = $epsilon:expr, ulps = $ulps:expr $(,)?) => {{
        let epsilon: $t = $epsilon;
        let ulps = $ulps;
        let left = $left;
        let right = $right;
        let mut left_iter = $crate::ApproxEqIter::<'_, $t>::flat_indexed(&left, Vec::new());
        let mut right_iter = $crate::ApproxEqIter::<'_, $t>::flat_indexed(&right, Vec::new());
        loop {
            match (left_iter.next(), right_iter.next()) {
                (Some((lidx, lv)), Some((ridx, rv))) => {
                    std::assert_eq!(
                        lidx, ridx,
                        "layout mismatch in logical order: {:?} != {:?}",
                        lidx, ridx
                    );
                    if !(lv.is_nan() && rv.is_nan()) {
                        std::assert!(
                            $crate::approx_eq!($t, lv, rv, ulps = ulps, epsilon = epsilon),
                            "approximated equal assertion failed (ulps={:?}, epsilon={:?}) at index {:?}: {:?} == {:?}",
                            ulps,
                            epsilon,
                            lidx,
                            lv,
                            rv,
                        );
                    }
                }
                (Some((idx, _)), None) => {
                    std::panic!("left input is longer, starting at index {:?}", idx);
                }
                (None, Some((idx, _))) => {
                    std::panic!("right input is longer, starting at index {:?}", idx);
                }
                (None, None) => break,
            }
        }
    }};
}

/// Flattened, indexed iteration used by [`assert_approx_eq!`].
///
/// Implemented on references so that containers can hand out borrowed leaves.
/// `L` is the leaf float type.
pub trait ApproxEqIter<'a, L>: Copy {
    /// Yields every leaf value with its index appended to `prefix`.
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a>;
}

macro_rules! impl_leaf {
    ($($float:ty),*) => {$(
        impl<'a> ApproxEqIter<'a, $float> for &'a $float {
            fn flat_indexed(
                self,
                prefix: Vec<Ix>,
            ) -> Box<dyn Iterator<Item = (Vec<Ix>, $float)> + 'a> {
                Box::new(std::iter::once((prefix, *self)))
            }
        }
    )*};
}

impl_leaf!(f32, f64);

impl<'a, L, T> ApproxEqIter<'a, L> for &'a &'a T
where
    &'a T: ApproxEqIter<'a, L>,
    T: 'a + ?Sized,
{
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a> {
        (*self).flat_indexed(prefix)
    }
}

impl<'a, L, T: 'a> ApproxEqIter<'a, L> for &'a [T]
where
    &'a T: ApproxEqIter<'a, L>,
    L: 'a,
{
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a> {
        Box::new(self.iter().enumerate().flat_map(move |(idx, el)| {
            let mut prefix = prefix.clone();
            prefix.push(idx);
            el.flat_indexed(prefix)
        }))
    }
}

impl<'a, L, T: 'a, const N: usize> ApproxEqIter<'a, L> for &'a [T; N]
where
    &'a T: ApproxEqIter<'a, L>,
    L: 'a,
{
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a> {
        self.as_ref().flat_indexed(prefix)
    }
}

impl<'a, L, T: 'a> ApproxEqIter<'a, L> for &'a Vec<T>
where
    &'a T: ApproxEqIter<'a, L>,
    L: 'a,
{
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a> {
        self.as_slice().flat_indexed(prefix)
    }
}

impl<'a, L, S, D> ApproxEqIter<'a, L> for &'a ArrayBase<S, D>
where
    S: Data<Elem = L>,
    L: Copy + 'a,
    D: Dimension,
{
    fn flat_indexed(self, prefix: Vec<Ix>) -> Box<dyn Iterator<Item = (Vec<Ix>, L)> + 'a> {
        Box::new(self.indexed_iter().map(move |(idx, el)| {
            let mut prefix = prefix.clone();
            prefix.extend(idx.into_dimension().as_array_view().iter());
            (prefix, *el)
        }))
    }
}
