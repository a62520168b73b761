use std::{convert::Infallible, error::Error as StdError};

use displaydoc::Display;
use ndarray::Array2;
use rand::{seq::SliceRandom, Rng};
use rand_distr::{Distribution, Uniform};
use thiserror::Error;

use crate::{data::InteractionMatrix, ItemId, UserId};

/// Creating a sampler failed.
#[derive(Debug, Display, Error, PartialEq)]
pub enum SamplerError {
    /// The interaction matrix has no interactions to sample from
    NoInteractions,
    /// The batch size must be at least 1
    ZeroBatchSize,
    /// The batch size {batch_size} exceeds the number of interactions {nr_pairs}
    BatchSizeTooLarge { batch_size: usize, nr_pairs: usize },
    /// At least one negative item per interaction must be sampled
    NoNegatives,
}

/// A mini-batch of training triples.
///
/// Row `i` of all three fields belongs to the same (user, positive item) pair.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub user_ids: Vec<UserId>,
    pub positive_item_ids: Vec<ItemId>,
    /// Shape `(batch_size, nr_negatives)`.
    pub negative_item_ids: Array2<ItemId>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.user_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.user_ids.is_empty()
    }

    pub fn nr_negatives(&self) -> usize {
        self.negative_item_ids.ncols()
    }
}

/// A source of training batches for the CML trainer.
pub trait BatchSource {
    type Error: StdError + 'static + Send;

    /// Number of (user, positive item) pairs in each batch.
    fn batch_size(&self) -> usize;

    /// Number of batches until all training interactions were seen once.
    fn number_of_batches_per_pass(&self) -> usize;

    /// Returns the next batch.
    ///
    /// The stream of batches is endless.
    fn next_batch(&mut self) -> Result<Batch, Self::Error>;
}

/// Samples WARP style training batches from an interaction matrix.
///
/// Every pass over the data shuffles all interactions and hands them out in
/// batches of `batch_size`, a trailing incomplete batch is dropped. Each
/// interaction gets `nr_negatives` items drawn uniformly from all items,
/// the positives of the user are not excluded.
pub struct WarpSampler<R> {
    pairs: Vec<(UserId, ItemId)>,
    batch_size: usize,
    nr_negatives: usize,
    negative_items: Uniform<ItemId>,
    next_batch_in_pass: usize,
    rng: R,
}

impl<R> WarpSampler<R>
where
    R: Rng,
{
    pub fn new(
        matrix: &InteractionMatrix,
        batch_size: usize,
        nr_negatives: usize,
        rng: R,
    ) -> Result<Self, SamplerError> {
        let pairs = matrix.iter_pairs().collect::<Vec<_>>();
        if pairs.is_empty() {
            return Err(SamplerError::NoInteractions);
        }
        if batch_size == 0 {
            return Err(SamplerError::ZeroBatchSize);
        }
        if batch_size > pairs.len() {
            return Err(SamplerError::BatchSizeTooLarge {
                batch_size,
                nr_pairs: pairs.len(),
            });
        }
        if nr_negatives == 0 {
            return Err(SamplerError::NoNegatives);
        }

        Ok(Self {
            pairs,
            batch_size,
            nr_negatives,
            // non-empty pairs imply at least one item
            negative_items: Uniform::new(0, matrix.num_items()),
            next_batch_in_pass: 0,
            rng,
        })
    }

    pub fn nr_negatives(&self) -> usize {
        self.nr_negatives
    }

    /// Returns the next batch, starting a new shuffled pass when needed.
    pub fn sample(&mut self) -> Batch {
        if self.next_batch_in_pass == 0 {
            self.pairs.shuffle(&mut self.rng);
        }

        let start = self.next_batch_in_pass * self.batch_size;
        let (user_ids, positive_item_ids): (Vec<_>, Vec<_>) = self.pairs
            [start..start + self.batch_size]
            .iter()
            .copied()
            .unzip();
        let negative_items = &self.negative_items;
        let rng = &mut self.rng;
        let negative_item_ids =
            Array2::from_shape_simple_fn((self.batch_size, self.nr_negatives), || {
                negative_items.sample(rng)
            });

        self.next_batch_in_pass += 1;
        if self.next_batch_in_pass == self.number_of_batches_per_pass() {
            self.next_batch_in_pass = 0;
        }

        Batch {
            user_ids,
            positive_item_ids,
            negative_item_ids,
        }
    }
}

impl<R> BatchSource for WarpSampler<R>
where
    R: Rng,
{
    type Error = Infallible;

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn number_of_batches_per_pass(&self) -> usize {
        self.pairs.len() / self.batch_size
    }

    fn next_batch(&mut self) -> Result<Batch, Self::Error> {
        Ok(self.sample())
    }
}
