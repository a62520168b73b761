//! AI model building blocks.
#![forbid(unsafe_op_in_unsafe_fn)]

pub mod activation;
pub mod dense;
pub mod dropout;
pub mod initializer;
pub mod io;
pub mod optim;
pub mod utils;
