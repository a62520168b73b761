//! Loading of interaction lists and dense matrices from text files.

use std::{fs::File, io::Read, num::ParseFloatError, path::Path};

use anyhow::{Context, Error};
use csv::{ReaderBuilder, Trim};
use displaydoc::Display;
use log::debug;
use ndarray::Array2;
use reclearn::{data::InteractionMatrix, ItemId, UserId};
use thiserror::Error;

/// Reading a text file failed.
#[derive(Debug, Display, Error)]
pub(crate) enum TextDataError {
    /// Malformed csv: {0}
    Csv(#[from] csv::Error),
    /// Row {row} has {got} columns, expected {expected}
    RaggedMatrix {
        row: usize,
        expected: usize,
        got: usize,
    },
    /// Row {row} contains a value which is not a number: {source}
    NotANumber {
        row: usize,
        #[source]
        source: ParseFloatError,
    },
    /// The matrix has no values
    EmptyMatrix,
}

/// Reads `user,item` pairs, one per line and without a header.
pub(crate) fn read_pairs(source: impl Read) -> Result<Vec<(UserId, ItemId)>, TextDataError> {
    ReaderBuilder::new()
        .has_headers(false)
        .trim(Trim::All)
        .comment(Some(b'#'))
        .from_reader(source)
        .deserialize()
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

pub(crate) fn load_pairs(path: &Path) -> Result<Vec<(UserId, ItemId)>, Error> {
    let file = File::open(path).with_context(|| format!("Opening {} failed.", path.display()))?;
    let pairs = read_pairs(file).with_context(|| format!("Reading {} failed.", path.display()))?;
    debug!("loaded {} interactions from {}", pairs.len(), path.display());
    Ok(pairs)
}

/// Reads a dense matrix with one row per line.
///
/// Values are separated by `delimiter`, repeated delimiters count as one.
pub(crate) fn read_dense_matrix(
    source: impl Read,
    delimiter: u8,
) -> Result<Array2<f32>, TextDataError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .delimiter(delimiter)
        .from_reader(source);

    let mut nr_columns = None;
    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let start = values.len();
        for field in record.iter().filter(|field| !field.is_empty()) {
            let value = field
                .parse::<f32>()
                .map_err(|source| TextDataError::NotANumber { row, source })?;
            values.push(value);
        }
        let got = values.len() - start;
        if got == 0 {
            values.truncate(start);
            continue;
        }
        match nr_columns {
            None => nr_columns = Some(got),
            Some(expected) if expected != got => {
                return Err(TextDataError::RaggedMatrix { row, expected, got });
            }
            Some(_) => {}
        }
    }

    let nr_columns = nr_columns.ok_or(TextDataError::EmptyMatrix)?;
    let nr_rows = values.len() / nr_columns;
    Ok(Array2::from_shape_vec((nr_rows, nr_columns), values)
        .unwrap_or_else(|_| unreachable!("all rows have {} values", nr_columns)))
}

pub(crate) fn load_dense_matrix(path: &Path, delimiter: u8) -> Result<Array2<f32>, Error> {
    let file = File::open(path).with_context(|| format!("Opening {} failed.", path.display()))?;
    let matrix = read_dense_matrix(file, delimiter)
        .with_context(|| format!("Reading matrix {} failed.", path.display()))?;
    debug!("loaded matrix of shape {:?} from {}", matrix.dim(), path.display());
    Ok(matrix)
}

/// Shape of interaction matrices which can hold all given pairs.
///
/// Missing dimensions are inferred as the largest id plus one.
pub(crate) fn interactions_shape(
    pair_lists: &[&[(UserId, ItemId)]],
    num_users: Option<usize>,
    num_items: Option<usize>,
) -> (usize, usize) {
    let all_pairs = || pair_lists.iter().flat_map(|pairs| pairs.iter());
    let num_users = num_users
        .or_else(|| all_pairs().map(|&(user, _)| user + 1).max())
        .unwrap_or_default();
    let num_items = num_items
        .or_else(|| all_pairs().map(|&(_, item)| item + 1).max())
        .unwrap_or_default();
    (num_users, num_items)
}

/// Builds training and test interaction matrices of the same shape.
pub(crate) fn train_and_test_matrices(
    train: Vec<(UserId, ItemId)>,
    test: Vec<(UserId, ItemId)>,
    num_users: Option<usize>,
    num_items: Option<usize>,
) -> Result<(InteractionMatrix, InteractionMatrix), Error> {
    let (num_users, num_items) =
        interactions_shape(&[train.as_slice(), test.as_slice()], num_users, num_items);
    debug!("interaction matrices of shape ({}, {})", num_users, num_items);

    let train = InteractionMatrix::from_pairs(num_users, num_items, train)
        .context("Building the training interactions failed.")?;
    let test = InteractionMatrix::from_pairs(num_users, num_items, test)
        .context("Building the test interactions failed.")?;
    Ok((train, test))
}
