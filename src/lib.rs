pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fs;
pub mod hasher;
pub mod http;
pub mod lookup;
pub mod pack;
pub mod scheduler;
pub mod shard;

#[cfg(test)]
mod tmpfs;

pub use dataset::{Dataset, DatasetCache};
pub use error::{Error, Result};
pub use hasher::Hasher;
pub use shard::{ShardReader, ShardWriter};
