// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

//! Synthetic address spaces for exercising the unwinder without touching
//! real thread state.

use std::collections::HashMap;
use std::mem::size_of;
use std::ops::Range;

use crate::addr_validate::AddressValidator;
use crate::unwind::ThreadContext;

pub const WORD: usize = size_of::<usize>();

/// Executable code lives here.
pub const CODE: Range<usize> = 0x1000_0000..0x1100_0000;
/// Lowest stack address used by [`FakeMemory::frame_chain`].
pub const STACK_LOW: usize = 0x2000_0000;

/// Innermost-first code addresses, `count` of them.
pub fn code_addresses(count: usize) -> Vec<usize> {
    (0..count).map(|i| CODE.start + 0x100 + i * 0x40).collect()
}

#[derive(Default)]
pub struct FakeMemory {
    words: HashMap<usize, usize>,
    executable: Vec<Range<usize>>,
}

impl FakeMemory {
    pub fn new() -> Self {
        FakeMemory {
            words: HashMap::new(),
            executable: vec![CODE],
        }
    }

    pub fn write(&mut self, addr: usize, value: usize) {
        self.words.insert(addr, value);
    }

    /// Lays out one frame record per caller so that a frame-pointer walk
    /// yields `frames` (innermost first). `frames[0]` becomes the program
    /// counter.
    pub fn frame_chain(&mut self, frames: &[usize]) -> ThreadContext {
        let record = |i: usize| STACK_LOW + 0x100 + i * 0x40;
        let callers = frames.len().saturating_sub(1);

        for i in 0..callers {
            let next = if i + 1 < callers { record(i + 1) } else { 0 };
            self.write(record(i), next);
            self.write(record(i) + WORD, frames[i + 1]);
        }
        if callers == 0 {
            // a lone frame still needs a readable, terminating record
            self.write(record(0), 0);
            self.write(record(0) + WORD, 0);
        }

        // zero-filled scratch space from sp up to the last record, so the
        // whole stack is readable
        let sp = STACK_LOW;
        for addr in (sp..record(callers.max(1))).step_by(WORD) {
            self.words.entry(addr).or_insert(0);
        }

        ThreadContext::new(frames.first().copied().unwrap_or(0), sp, record(0))
    }
}

impl AddressValidator for FakeMemory {
    fn is_readable(&self, addr: usize, len: usize) -> bool {
        if addr % WORD != 0 || len == 0 {
            return false;
        }
        (0..len.div_ceil(WORD)).all(|i| {
            addr.checked_add(i * WORD)
                .map_or(false, |word| self.words.contains_key(&word))
        })
    }

    fn is_executable(&self, addr: usize) -> bool {
        self.executable.iter().any(|range| range.contains(&addr))
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr % WORD != 0 {
            return None;
        }
        self.words.get(&addr).copied()
    }
}
