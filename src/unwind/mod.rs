// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Stack walking.
//!
//! A walk never fails: it stops at the depth ceiling, at the first address
//! that does not validate, when the frame chain stops moving toward the
//! stack base, or at the stack base itself. Whatever was collected up to
//! that point is the result.

mod context;
mod frame_pointer;
mod stack_scan;

pub use self::context::{StackBounds, ThreadContext};
pub use self::frame_pointer::FramePointer;
pub use self::stack_scan::StackScan;

use crate::addr_validate::AddressValidator;
use crate::config::{SamplerConfig, DEFAULT_SCAN_LIMIT};
use crate::MAX_DEPTH;

/// One way of recovering return addresses from a thread context.
pub trait Walk {
    /// Calls `cb` with each instruction address, innermost first, until the
    /// walk ends or `cb` returns `false`. Every memory read goes through
    /// `validator`.
    fn walk<V, F>(&self, ctx: &ThreadContext, validator: &V, cb: F)
    where
        V: AddressValidator,
        F: FnMut(usize) -> bool;
}

/// Raw instruction addresses captured by one walk, innermost first.
///
/// Storage is inline and fixed at [`MAX_DEPTH`], so a state allocated ahead
/// of time can be refilled from a signal handler.
#[derive(Clone)]
pub struct RawUnwindState {
    addrs: [usize; MAX_DEPTH],
    count: usize,
}

impl RawUnwindState {
    pub const fn new() -> Self {
        RawUnwindState {
            addrs: [0; MAX_DEPTH],
            count: 0,
        }
    }

    /// Copies at most [`MAX_DEPTH`] addresses.
    pub fn from_addresses(addrs: &[usize]) -> Self {
        let mut state = RawUnwindState::new();
        for addr in addrs {
            if !state.push(*addr) {
                break;
            }
        }
        state
    }

    pub const fn capacity(&self) -> usize {
        MAX_DEPTH
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn addresses(&self) -> &[usize] {
        &self.addrs[..self.count]
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    fn push(&mut self, addr: usize) -> bool {
        if self.count < MAX_DEPTH {
            self.addrs[self.count] = addr;
            self.count += 1;
            true
        } else {
            false
        }
    }
}

impl Default for RawUnwindState {
    fn default() -> Self {
        RawUnwindState::new()
    }
}

impl std::fmt::Debug for RawUnwindState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawUnwindState")
            .field("count", &self.count)
            .field("addrs", &self.addresses())
            .finish()
    }
}

/// Which walk the [`UnwindEngine`] runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Strategy {
    FramePointer,
    StackScan,
    /// Walk frame pointers, and scan the stack instead when no caller could
    /// be recovered that way.
    #[default]
    FramePointerWithScanFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct UnwindEngine {
    strategy: Strategy,
    scan: StackScan,
}

impl UnwindEngine {
    pub fn new(strategy: Strategy, scan_limit: usize) -> Self {
        UnwindEngine {
            strategy,
            scan: StackScan { limit: scan_limit },
        }
    }

    pub fn from_config(config: &SamplerConfig) -> Self {
        UnwindEngine::new(config.strategy(), config.scan_limit())
    }

    /// Walks `ctx` into `state`, keeping at most `max_frames` addresses
    /// (never more than [`MAX_DEPTH`]). A context that fails validation up
    /// front leaves `state` empty.
    ///
    /// Does not allocate or lock as long as `validator` doesn't.
    pub fn unwind_into<V: AddressValidator>(
        &self,
        ctx: &ThreadContext,
        validator: &V,
        max_frames: usize,
        state: &mut RawUnwindState,
    ) {
        let max_frames = max_frames.min(MAX_DEPTH);

        match self.strategy {
            Strategy::FramePointer => collect(&FramePointer, ctx, validator, max_frames, state),
            Strategy::StackScan => collect(&self.scan, ctx, validator, max_frames, state),
            Strategy::FramePointerWithScanFallback => {
                collect(&FramePointer, ctx, validator, max_frames, state);
                if state.len() <= 1 {
                    collect(&self.scan, ctx, validator, max_frames, state);
                }
            }
        }
    }

    /// Allocating form of [`UnwindEngine::unwind_into`].
    pub fn unwind<V: AddressValidator>(
        &self,
        ctx: &ThreadContext,
        validator: &V,
        max_frames: usize,
    ) -> Box<RawUnwindState> {
        let mut state = Box::new(RawUnwindState::new());
        self.unwind_into(ctx, validator, max_frames, &mut state);
        state
    }
}

impl Default for UnwindEngine {
    fn default() -> Self {
        UnwindEngine::new(Strategy::default(), DEFAULT_SCAN_LIMIT)
    }
}

fn collect<W: Walk, V: AddressValidator>(
    walker: &W,
    ctx: &ThreadContext,
    validator: &V,
    max_frames: usize,
    state: &mut RawUnwindState,
) {
    state.clear();
    if max_frames == 0 {
        return;
    }

    walker.walk(ctx, validator, |addr| {
        state.push(addr) && state.len() < max_frames
    });
}
