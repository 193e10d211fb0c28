// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Frame selection and the finished [`Sample`] record.

use std::fmt::{Display, Error as FmtError, Formatter};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::modules::ModuleMap;

/// One resolved stack entry. Only `address` is guaranteed; the rest is
/// filled in when the symbolicator finds a module and a symbol for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct StackFrame {
    pub address: usize,
    pub module_path: Option<Arc<Path>>,
    pub module_base: Option<usize>,
    pub symbol_address: Option<usize>,
}

impl StackFrame {
    /// A frame carrying only its address.
    pub fn unresolved(address: usize) -> Self {
        StackFrame {
            address,
            ..Default::default()
        }
    }

    /// Distance from the start of the containing symbol.
    pub fn symbol_offset(&self) -> Option<usize> {
        self.address.checked_sub(self.symbol_address?)
    }

    /// Distance from the module's load address.
    pub fn module_offset(&self) -> Option<usize> {
        self.address.checked_sub(self.module_base?)
    }
}

/// Which part of an innermost-first frame sequence survives truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub range: Range<usize>,
    pub dropped: usize,
}

/// Picks the frames to keep from `len` innermost-first frames.
///
/// When there are more frames than `capacity`, the root-ward ones are kept:
/// leaf frames differ between samples of the same logical call path far
/// more often, so dropping them groups samples better in a flamegraph.
pub fn select(len: usize, capacity: usize) -> Selection {
    let dropped = len.saturating_sub(capacity);

    Selection {
        range: dropped..len,
        dropped,
    }
}

/// A captured stack: innermost frame first, bounded by the capacity the
/// storage was created with.
#[derive(Debug, Clone)]
pub struct Sample {
    thread_id: u64,
    timestamp: SystemTime,
    frames: Box<[StackFrame]>,
    len: usize,
    dropped: usize,
}

impl Sample {
    /// Empty sample storage for `capacity` frames. Allocate it ahead of time
    /// and refill it with [`Sample::fill`] from restricted contexts.
    pub fn with_capacity(capacity: usize) -> Self {
        Sample {
            thread_id: 0,
            timestamp: SystemTime::UNIX_EPOCH,
            frames: vec![StackFrame::default(); capacity].into_boxed_slice(),
            len: 0,
            dropped: 0,
        }
    }

    /// Builds a sample from symbolicated frames, dropping innermost frames
    /// beyond `capacity`.
    pub fn build(
        frames: &[StackFrame],
        thread_id: u64,
        timestamp: SystemTime,
        capacity: usize,
    ) -> Self {
        let mut sample = Sample::with_capacity(capacity);
        sample.fill(frames, thread_id, timestamp);
        sample
    }

    /// Refills this storage in place. Never allocates.
    pub fn fill(&mut self, frames: &[StackFrame], thread_id: u64, timestamp: SystemTime) {
        let selection = self.reset(thread_id, timestamp, frames.len(), self.capacity());
        self.frames[..selection.range.len()].clone_from_slice(&frames[selection.range]);
    }

    /// Stamps the sample and sizes it for `len` candidate frames, keeping at
    /// most `capacity` of them (never more than the storage holds). The
    /// retained frames must then be written through [`Sample::slots_mut`].
    pub(crate) fn reset(
        &mut self,
        thread_id: u64,
        timestamp: SystemTime,
        len: usize,
        capacity: usize,
    ) -> Selection {
        let selection = select(len, capacity.min(self.capacity()));
        self.thread_id = thread_id;
        self.timestamp = timestamp;
        self.len = selection.range.len();
        self.dropped = selection.dropped;
        selection
    }

    pub(crate) fn slots_mut(&mut self) -> &mut [StackFrame] {
        &mut self.frames[..self.len]
    }

    /// Whether no slot holds a module path any more, so that overwriting the
    /// storage cannot drop the last reference to one. Only released storage
    /// may be refilled from a signal handler.
    pub fn is_released(&self) -> bool {
        self.frames.iter().all(|frame| frame.module_path.is_none())
    }

    /// Forgets the frames and releases their module paths. Call it on the
    /// consumer side, not from a sampling context.
    pub fn clear(&mut self) {
        self.frames.iter_mut().for_each(|frame| *frame = StackFrame::default());
        self.len = 0;
        self.dropped = 0;
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Innermost frames dropped to fit the capacity.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Renders the sample with symbol names looked up in `modules`.
    pub fn display<'a>(&'a self, modules: &'a ModuleMap) -> SampleDisplay<'a> {
        SampleDisplay {
            sample: self,
            modules,
        }
    }
}

pub struct SampleDisplay<'a> {
    sample: &'a Sample,
    modules: &'a ModuleMap,
}

impl Display for SampleDisplay<'_> {
    fn fmt(&self, f: &mut Formatter) -> Result<(), FmtError> {
        write!(f, "THREAD {}", self.sample.thread_id)?;
        if self.sample.truncated() {
            write!(f, " ({} frames dropped)", self.sample.dropped)?;
        }
        writeln!(f)?;

        for (index, frame) in self.sample.frames().iter().enumerate() {
            write!(f, "#{:<3} {:#018x}", index, frame.address)?;
            match self.modules.symbol_name(frame.address) {
                Some(name) => write!(f, " {}", name)?,
                None => write!(f, " Unknown")?,
            }
            if let Some(offset) = frame.symbol_offset() {
                write!(f, "+{:#x}", offset)?;
            }
            if let Some(path) = &frame.module_path {
                write!(f, " ({})", path.display())?;
            }
            writeln!(f)?;
        }

        Ok(())
    }
}
