//! Loading and storing of named `ndarray` parameters in a compact binary format.

use std::{
    collections::BTreeMap,
    convert::{TryFrom, TryInto},
    fs::File,
    io::{self, BufReader, BufWriter, Read, Write},
    path::Path,
};

use bincode::Options;
use displaydoc::Display;
use ndarray::{Array, ArrayBase, DataOwned, Dim, Dimension, IntoDimension, Ix, Ix1, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A flattened array in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlattenedArray<A> {
    shape: Vec<Ix>,
    /// The length of data is always equal to the product of all values in shape.
    data: Vec<A>,
}

impl<A, D> From<Array<A, D>> for FlattenedArray<A>
where
    A: Copy,
    D: Dimension,
{
    fn from(array: Array<A, D>) -> Self {
        let shape = array.shape().to_owned();
        let data = if array.is_standard_layout() {
            array.into_raw_vec()
        } else {
            array.iter().copied().collect()
        };

        FlattenedArray { shape, data }
    }
}

impl<'de, A> Deserialize<'de> for FlattenedArray<A>
where
    A: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        /// Helper to get a post deserialization invariant check.
        #[derive(Deserialize)]
        struct Helper<A> {
            shape: Vec<Ix>,
            data: Vec<A>,
        }

        let Helper { shape, data } = Helper::<A>::deserialize(deserializer)?;
        let expected = shape.iter().product::<usize>();
        if data.len() == expected {
            Ok(Self { shape, data })
        } else {
            Err(<D::Error as serde::de::Error>::custom(
                UnexpectedNumberOfDimensions {
                    got: data.len(),
                    expected,
                },
            ))
        }
    }
}

/// Unexpected number of dimensions: got={got}, expected={expected}
#[derive(Debug, Display, Error)]
pub struct UnexpectedNumberOfDimensions {
    got: usize,
    expected: usize,
}

/// Failed to retrieve parameters
#[derive(Debug, Display, Error)]
#[prefix_enum_doc_attributes]
pub enum FailedToRetrieveParams {
    /// {0}
    UnexpectedNumberOfDimensions(#[from] UnexpectedNumberOfDimensions),
    /// Missing parameters for {name}.
    MissingParameters { name: String },
}

impl<S, D> TryFrom<FlattenedArray<S::Elem>> for ArrayBase<S, D>
where
    D: Dimension + TryIntoDimension,
    S: DataOwned,
{
    type Error = UnexpectedNumberOfDimensions;

    fn try_from(array: FlattenedArray<S::Elem>) -> Result<Self, Self::Error> {
        let FlattenedArray { shape, data } = array;
        let dim = D::try_from(&shape)?;
        // The product of `shape` equals `data.len()`, which is checked on deserialization
        // and holds by construction otherwise, so reshaping can't fail.
        ArrayBase::<S, Ix1>::from(data)
            .into_shape(dim)
            .map_err(|_| UnexpectedNumberOfDimensions {
                got: shape.len(),
                expected: D::NDIM.unwrap_or_else(|| shape.len()),
            })
    }
}

/// Helper trait to create the various `Dim` instances from a slice.
///
/// `ndarray` only ships with conversions from `&[Ix]` to `IxDyn`.
pub trait TryIntoDimension: Sized {
    fn try_from(slice: &[Ix]) -> Result<Self, UnexpectedNumberOfDimensions>;
}

impl<const N: usize> TryIntoDimension for Dim<[Ix; N]>
where
    [Ix; N]: IntoDimension<Dim = Dim<[Ix; N]>>,
{
    fn try_from(slice: &[Ix]) -> Result<Self, UnexpectedNumberOfDimensions> {
        <[Ix; N]>::try_from(slice)
            .map(IntoDimension::into_dimension)
            .map_err(|_| UnexpectedNumberOfDimensions {
                got: slice.len(),
                expected: N,
            })
    }
}

impl TryIntoDimension for IxDyn {
    fn try_from(slice: &[Ix]) -> Result<Self, UnexpectedNumberOfDimensions> {
        Ok(slice.into_dimension())
    }
}

/// Failed to load bin params
#[derive(Debug, Display, Error)]
#[prefix_enum_doc_attributes]
pub enum LoadingBinParamsFailed {
    /// {0}
    Io(#[from] io::Error),
    /// {0}
    DeserializationFailed(#[from] bincode::Error),
}

/// Failed to store bin params
#[derive(Debug, Display, Error)]
#[prefix_enum_doc_attributes]
pub enum StoringBinParamsFailed {
    /// {0}
    Io(#[from] io::Error),
    /// {0}
    SerializationFailed(#[from] bincode::Error),
}

/// A named collection of `f32` arrays.
///
/// Names are flat strings, hierarchies are expressed with `/`
/// separated scopes (see [`BinParams::with_scope()`]).
#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BinParams {
    params: BTreeMap<String, FlattenedArray<f32>>,
}

impl BinParams {
    pub fn load_from_file(file: impl AsRef<Path>) -> Result<Self, LoadingBinParamsFailed> {
        let file = File::open(file)?;
        Self::load(BufReader::new(file))
    }

    pub fn load(source: impl Read) -> Result<Self, LoadingBinParamsFailed> {
        Self::setup_bincode()
            .deserialize_from(source)
            .map_err(Into::into)
    }

    pub fn store_to_file(&self, file: impl AsRef<Path>) -> Result<(), StoringBinParamsFailed> {
        let file = File::create(file)?;
        let mut writer = BufWriter::new(file);
        self.store(&mut writer)?;
        writer.flush().map_err(Into::into)
    }

    pub fn store(&self, sink: impl Write) -> Result<(), StoringBinParamsFailed> {
        Self::setup_bincode()
            .serialize_into(sink, self)
            .map_err(Into::into)
    }

    fn setup_bincode() -> impl Options {
        // we explicitly set some default options to
        // convey exactly which options we use.
        bincode::DefaultOptions::new()
            .with_little_endian()
            .with_fixint_encoding()
            .reject_trailing_bytes()
    }

    /// True if this instance is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// List the keys contained in this instance.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(|s| &**s)
    }

    pub fn take<A>(&mut self, name: &str) -> Result<A, FailedToRetrieveParams>
    where
        FlattenedArray<f32>: TryInto<A, Error = UnexpectedNumberOfDimensions>,
    {
        self.params
            .remove(name)
            .ok_or_else(|| FailedToRetrieveParams::MissingParameters {
                name: name.to_owned(),
            })?
            .try_into()
            .map_err(Into::into)
    }

    pub fn insert(&mut self, name: impl Into<String>, array: impl Into<FlattenedArray<f32>>) {
        self.params.insert(name.into(), array.into());
    }

    /// Creates a new `BinParamsWithScope` instance.
    ///
    /// The name prefix will be scope + '/'.
    pub fn with_scope<'b>(&'b mut self, scope: &str) -> BinParamsWithScope<'b> {
        BinParamsWithScope {
            params: self,
            prefix: scope.to_owned() + "/",
        }
    }
}

/// A wrapper embedding a prefix with the bin params.
pub struct BinParamsWithScope<'a> {
    params: &'a mut BinParams,
    prefix: String,
}

impl<'a> BinParamsWithScope<'a> {
    pub fn take<A>(&mut self, name: &str) -> Result<A, FailedToRetrieveParams>
    where
        FlattenedArray<f32>: TryInto<A, Error = UnexpectedNumberOfDimensions>,
    {
        let name = self.prefix.clone() + name;
        self.params.take(&name)
    }

    pub fn insert(&mut self, name: &str, array: impl Into<FlattenedArray<f32>>) {
        let name = self.prefix.clone() + name;
        self.params.insert(name, array);
    }

    /// Creates a nested scope.
    pub fn with_scope<'b>(&'b mut self, scope: &str) -> BinParamsWithScope<'b> {
        BinParamsWithScope {
            prefix: self.prefix.clone() + scope + "/",
            params: &mut *self.params,
        }
    }
}
