use displaydoc::Display;
use thiserror::Error;

use crate::{ItemId, UserId};

/// Building an interaction matrix failed.
#[derive(Debug, Display, Error, PartialEq)]
pub enum DataError {
    /// Interaction ({user}, {item}) is out of bounds for a {num_users}x{num_items} matrix
    OutOfBounds {
        user: UserId,
        item: ItemId,
        num_users: usize,
        num_items: usize,
    },
}

/// A sparse binary user x item matrix.
///
/// Stored in compressed row form: the items of user `u` are
/// `item_ids[user_pointers[u]..user_pointers[u + 1]]`, sorted ascending
/// and free of duplicates.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionMatrix {
    num_users: usize,
    num_items: usize,
    user_pointers: Vec<usize>,
    item_ids: Vec<ItemId>,
}

impl InteractionMatrix {
    /// Creates a matrix without any interactions.
    pub fn empty(num_users: usize, num_items: usize) -> Self {
        Self {
            num_users,
            num_items,
            user_pointers: vec![0; num_users + 1],
            item_ids: Vec::new(),
        }
    }

    /// Builds the matrix from `(user, item)` pairs.
    ///
    /// Duplicated pairs are merged.
    pub fn from_pairs(
        num_users: usize,
        num_items: usize,
        pairs: impl IntoIterator<Item = (UserId, ItemId)>,
    ) -> Result<Self, DataError> {
        let mut pairs = pairs
            .into_iter()
            .map(|(user, item)| {
                if user < num_users && item < num_items {
                    Ok((user, item))
                } else {
                    Err(DataError::OutOfBounds {
                        user,
                        item,
                        num_users,
                        num_items,
                    })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        pairs.sort_unstable();
        pairs.dedup();

        let mut user_pointers = vec![0; num_users + 1];
        let mut item_ids = Vec::with_capacity(pairs.len());
        for (user, item) in pairs {
            item_ids.push(item);
            user_pointers[user + 1] += 1;
        }
        for idx in 1..user_pointers.len() {
            user_pointers[idx] += user_pointers[idx - 1];
        }

        Ok(Self {
            num_users,
            num_items,
            user_pointers,
            item_ids,
        })
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.num_users, self.num_items)
    }

    /// Number of stored interactions.
    pub fn nnz(&self) -> usize {
        self.item_ids.len()
    }

    /// The sorted items the user interacted with.
    ///
    /// Users outside of the matrix have no items.
    pub fn items_of(&self, user: UserId) -> &[ItemId] {
        if user >= self.num_users {
            return &[];
        }
        &self.item_ids[self.user_pointers[user]..self.user_pointers[user + 1]]
    }

    pub fn contains(&self, user: UserId, item: ItemId) -> bool {
        self.items_of(user).binary_search(&item).is_ok()
    }

    /// Iterates over all `(user, item)` pairs, ordered by user and then item.
    pub fn iter_pairs(&self) -> impl Iterator<Item = (UserId, ItemId)> + '_ {
        (0..self.num_users)
            .flat_map(move |user| self.items_of(user).iter().map(move |&item| (user, item)))
    }

    /// Users with at least one interaction, ascending.
    pub fn active_users(&self) -> Vec<UserId> {
        self.user_pointers
            .windows(2)
            .enumerate()
            .filter_map(|(user, bounds)| (bounds[0] < bounds[1]).then(|| user))
            .collect()
    }
}
