// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::mem::size_of;

use super::{ThreadContext, Walk};
use crate::addr_validate::AddressValidator;

const WORD: usize = size_of::<usize>();

/// Heuristic walk for code built without frame pointers: every stack word
/// between the stack pointer and the stack base that points into executable
/// memory is taken as a return address.
///
/// Stale return addresses left on the stack show up as extra frames, so this
/// is only a fallback.
#[derive(Debug, Clone, Copy)]
pub struct StackScan {
    /// Maximum number of stack words inspected.
    pub limit: usize,
}

impl Walk for StackScan {
    fn walk<V, F>(&self, ctx: &ThreadContext, validator: &V, mut cb: F)
    where
        V: AddressValidator,
        F: FnMut(usize) -> bool,
    {
        let Some(mut addr) = ctx.sp.checked_add(WORD - 1).map(|sp| sp & !(WORD - 1)) else {
            return;
        };
        if !validator.is_executable(ctx.pc) || validator.read_word(addr).is_none() {
            return;
        }
        if !cb(ctx.pc) {
            return;
        }

        for _ in 0..self.limit {
            if let Some(stack) = ctx.stack {
                if !stack.contains(addr, WORD) {
                    break;
                }
            }

            let Some(word) = validator.read_word(addr) else {
                break;
            };
            if word != 0 && validator.is_executable(word) && !cb(word) {
                break;
            }

            match addr.checked_add(WORD) {
                Some(next) => addr = next,
                None => break,
            }
        }
    }
}
