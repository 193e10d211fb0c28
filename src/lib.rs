// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Stack sampling core for native profilers and hang detectors.
//!
//! A sampling attempt runs three stages in order: the [`UnwindEngine`] walks
//! a thread's call stack into a [`RawUnwindState`], the [`Symbolicator`]
//! resolves every address against a [`ModuleMap`] snapshot, and the selector
//! in [`sample`] copies the frames into a fixed-capacity [`Sample`],
//! dropping leaf frames first when the stack is deeper than the sample.
//!
//! The `*_into` entry points write only into caller-supplied storage and
//! read the module registry through a lock-free snapshot, so they can run
//! inside a signal handler. The remaining helpers allocate and are meant for
//! ordinary threads.
//!
//! Everything a handler touches is prepared up front on the sampled thread,
//! including the stack bounds that stop the walk at the stack base:
//!
//! ```no_run
//! use std::time::SystemTime;
//!
//! use native_sampler::{registry, RawUnwindState, Sampler, StackBounds, ThreadContext};
//!
//! let sampler = Sampler::default();
//! let bounds = StackBounds::current_thread();
//! let modules = registry().snapshot();
//! let mut scratch = Box::new(RawUnwindState::new());
//! let mut sample = sampler.new_sample();
//!
//! // inside the SA_SIGINFO handler
//! # let ucontext: *mut std::ffi::c_void = std::ptr::null_mut();
//! if let Some(mut ctx) = unsafe { ThreadContext::from_ucontext(ucontext) } {
//!     if let Some(bounds) = bounds {
//!         ctx = ctx.with_stack(bounds);
//!     }
//!     sampler.sample_into(&modules, &ctx, 1, SystemTime::UNIX_EPOCH, &mut scratch, &mut sample);
//! }
//!
//! // back on an ordinary thread, once the sample has been consumed
//! sample.clear();
//! ```

/// Compile-time ceiling on unwound frames and sample capacity.
#[cfg(feature = "large-depth")]
pub const MAX_DEPTH: usize = 1024;

#[cfg(all(feature = "huge-depth", not(feature = "large-depth")))]
pub const MAX_DEPTH: usize = 4096;

#[cfg(not(any(feature = "large-depth", feature = "huge-depth")))]
pub const MAX_DEPTH: usize = 128;

mod addr_validate;
mod config;
mod error;
mod modules;
pub mod sample;
mod sampler;
mod symbolicate;
#[cfg(test)]
mod testing;
pub mod unwind;

pub use self::addr_validate::{validate, AddressValidator, ProcessValidator};
pub use self::config::{SamplerConfig, SamplerConfigBuilder, DEFAULT_CAPACITY, DEFAULT_SCAN_LIMIT};
pub use self::error::{Error, Result};
pub use self::modules::{registry, Module, ModuleMap, ModuleRegistry, SymbolTable};
pub use self::sample::{Sample, StackFrame};
pub use self::sampler::Sampler;
pub use self::symbolicate::Symbolicator;
pub use self::unwind::{RawUnwindState, StackBounds, Strategy, ThreadContext, UnwindEngine};
