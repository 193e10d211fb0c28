// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

/// Errors raised while configuring a sampler or building module snapshots.
///
/// The sampling path itself never fails: short walks, unresolved symbols and
/// truncation are all reported through the returned data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NixError(#[from] nix::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("failed to parse object file {path}: {source}")]
    ObjectParse {
        path: String,
        #[source]
        source: object::Error,
    },
    #[error("unwind depth {0} is outside of 1..={max}", max = crate::MAX_DEPTH)]
    InvalidDepth(usize),
    #[error("sample capacity {0} must be non-zero and within the unwind depth")]
    InvalidCapacity(usize),
    #[error("stack scan limit must be at least one word")]
    InvalidScanLimit,
}

pub type Result<T> = std::result::Result<T, Error>;
