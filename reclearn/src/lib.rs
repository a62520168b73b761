//! Collaborative recommendation learning.
//!
//! Provides a trainer for collaborative metric learning (CML) with an optional
//! item feature projector and an evaluator for pre-trained latent factor
//! models (CDL), both measured with the usual top-k ranking metrics.
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod cdl;
pub mod cml;
pub mod data;
pub mod evaluation;
pub mod metrics;
pub mod sampler;

/// Row index of a user in the interaction matrices and user embeddings.
pub type UserId = usize;

/// Row index of an item in the interaction matrices and item embeddings.
pub type ItemId = usize;
