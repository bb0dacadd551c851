#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Burn shard map.
//!
//! Runs functions over the named axes of a device mesh, one host thread per instance.
//! [`shard_map()`] maps functions over trees of arrays; [`filter_shard_map`] extends it to
//! arguments and results that mix arrays with arbitrary static values. [`nn::BatchNorm`]
//! keeps running statistics averaged over mapped axes.

extern crate alloc;

mod collective;
mod error;
mod filter;
mod shard_map;
mod tensor;

pub mod nn;
pub mod sharding;
pub mod tree;

pub use collective::ShardContext;
pub use error::*;
pub use filter::*;
pub use shard_map::*;
pub use tensor::*;
