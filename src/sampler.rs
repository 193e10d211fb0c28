// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::time::SystemTime;

use crate::addr_validate::{AddressValidator, ProcessValidator};
use crate::config::SamplerConfig;
use crate::modules::{registry, ModuleMap};
use crate::sample::Sample;
use crate::symbolicate::Symbolicator;
use crate::unwind::{RawUnwindState, ThreadContext, UnwindEngine};

/// Runs one sampling attempt: unwind, symbolicate, select.
///
/// # Signal safety
///
/// [`Sampler::sample_into`] and [`Sampler::sample_with`] only write into the
/// buffers they are given and only read the `ModuleMap` they are given, so
/// they may run inside a signal handler as long as the buffers and the
/// snapshot were obtained beforehand. [`Sampler::sample`] allocates.
///
/// Resolved frames share their module path with the snapshot, and dropping
/// the last reference to one frees it. A sample that still holds paths is
/// therefore never overwritten: the attempt is refused and the caller must
/// [`Sample::clear`] it on an ordinary thread first.
#[derive(Debug, Clone, Copy)]
pub struct Sampler {
    config: SamplerConfig,
    engine: UnwindEngine,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        Sampler {
            config,
            engine: UnwindEngine::from_config(&config),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Sample storage sized for this sampler's capacity.
    pub fn new_sample(&self) -> Sample {
        Sample::with_capacity(self.config.capacity())
    }

    /// Samples the live process, validating reads against real memory.
    ///
    /// Returns `false`, leaving `out` untouched, when `out` still holds
    /// resolved frames from an earlier attempt.
    pub fn sample_into(
        &self,
        modules: &ModuleMap,
        ctx: &ThreadContext,
        thread_id: u64,
        timestamp: SystemTime,
        scratch: &mut RawUnwindState,
        out: &mut Sample,
    ) -> bool {
        let validator = ProcessValidator::new(modules);
        self.sample_with(&validator, modules, ctx, thread_id, timestamp, scratch, out)
    }

    /// Same as [`Sampler::sample_into`] with a caller-chosen validator.
    ///
    /// Only the frames that survive selection are symbolicated; they are
    /// resolved straight into `out`. The frame count is bounded by the
    /// configured capacity and by `out`'s own capacity.
    #[allow(clippy::too_many_arguments)]
    pub fn sample_with<V: AddressValidator>(
        &self,
        validator: &V,
        modules: &ModuleMap,
        ctx: &ThreadContext,
        thread_id: u64,
        timestamp: SystemTime,
        scratch: &mut RawUnwindState,
        out: &mut Sample,
    ) -> bool {
        if !out.is_released() {
            return false;
        }

        self.engine
            .unwind_into(ctx, validator, self.config.max_depth(), scratch);

        let addrs = scratch.addresses();
        let selection = out.reset(thread_id, timestamp, addrs.len(), self.config.capacity());
        Symbolicator::new(modules).symbolicate_into(&addrs[selection.range], out.slots_mut());
        true
    }

    /// Allocating convenience for ordinary threads: loads the process-wide
    /// registry snapshot and returns a fresh sample.
    pub fn sample(&self, ctx: &ThreadContext, thread_id: u64, timestamp: SystemTime) -> Sample {
        let modules = registry().snapshot();
        let mut scratch = Box::new(RawUnwindState::new());
        let mut sample = self.new_sample();
        self.sample_into(&modules, ctx, thread_id, timestamp, &mut scratch, &mut sample);
        sample
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Sampler::new(SamplerConfig::default())
    }
}
