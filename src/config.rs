// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use crate::unwind::Strategy;
use crate::{Error, Result, MAX_DEPTH};

/// Number of stack words the scanning strategy inspects before giving up.
pub const DEFAULT_SCAN_LIMIT: usize = 1024;

/// Frames kept per sample unless configured otherwise.
pub const DEFAULT_CAPACITY: usize = if MAX_DEPTH < 64 { MAX_DEPTH } else { 64 };

/// Settings shared by the unwinder and the sample builder. Supplied once,
/// when the [`Sampler`](crate::Sampler) is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    max_depth: usize,
    capacity: usize,
    strategy: Strategy,
    scan_limit: usize,
}

impl SamplerConfig {
    pub fn builder() -> SamplerConfigBuilder {
        SamplerConfigBuilder::default()
    }

    /// Depth ceiling of the walk.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Number of frames a sample holds. Walks deeper than this lose their
    /// innermost frames.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn scan_limit(&self) -> usize {
        self.scan_limit
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            max_depth: MAX_DEPTH,
            capacity: DEFAULT_CAPACITY,
            strategy: Strategy::default(),
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SamplerConfigBuilder {
    config: SamplerConfig,
}

impl SamplerConfigBuilder {
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.config.max_depth = max_depth;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn scan_limit(mut self, scan_limit: usize) -> Self {
        self.config.scan_limit = scan_limit;
        self
    }

    pub fn build(self) -> Result<SamplerConfig> {
        let config = self.config;
        if config.max_depth == 0 || config.max_depth > MAX_DEPTH {
            log::warn!("rejecting unwind depth {}", config.max_depth);
            return Err(Error::InvalidDepth(config.max_depth));
        }
        if config.capacity == 0 || config.capacity > config.max_depth {
            log::warn!(
                "rejecting sample capacity {} for depth {}",
                config.capacity,
                config.max_depth
            );
            return Err(Error::InvalidCapacity(config.capacity));
        }
        if config.scan_limit == 0 {
            log::warn!("rejecting empty stack scan limit");
            return Err(Error::InvalidScanLimit);
        }

        Ok(config)
    }
}
