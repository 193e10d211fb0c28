// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::mem::size_of;

use super::{ThreadContext, Walk};
use crate::addr_validate::AddressValidator;

const WORD: usize = size_of::<usize>();

/// Follows the chain of frame records `{saved frame pointer, return
/// address}` that x86_64 and aarch64 code keeps when built with frame
/// pointers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FramePointer;

impl Walk for FramePointer {
    fn walk<V, F>(&self, ctx: &ThreadContext, validator: &V, mut cb: F)
    where
        V: AddressValidator,
        F: FnMut(usize) -> bool,
    {
        if !validator.is_executable(ctx.pc) || !validator.is_readable(ctx.fp, 2 * WORD) {
            return;
        }
        if !cb(ctx.pc) {
            return;
        }

        // the caller of a leaf that has not stored a frame record yet is only
        // known through the link register
        let mut link =
            Some(ctx.lr).filter(|lr| *lr != 0 && *lr != ctx.pc && validator.is_executable(*lr));

        let mut frame_pointer = ctx.fp;
        loop {
            // a record below the stack pointer is dead, one beyond the stack
            // base belongs to nobody
            if frame_pointer < ctx.sp {
                break;
            }
            if let Some(stack) = ctx.stack {
                if !stack.contains(frame_pointer, 2 * WORD) {
                    break;
                }
            }

            let next_frame_pointer = validator.read_word(frame_pointer);
            let ret = frame_pointer
                .checked_add(WORD)
                .and_then(|slot| validator.read_word(slot));

            // once the record is stored, it repeats the link register
            if let Some(lr) = link.take() {
                if ret != Some(lr) && !cb(lr) {
                    return;
                }
            }

            let (Some(next_frame_pointer), Some(ret)) = (next_frame_pointer, ret) else {
                break;
            };
            if ret == 0 || !validator.is_executable(ret) {
                break;
            }
            if !cb(ret) {
                break;
            }

            // the frame pointer should always move toward the stack base
            if next_frame_pointer <= frame_pointer {
                break;
            }
            frame_pointer = next_frame_pointer;
        }

        if let Some(lr) = link {
            cb(lr);
        }
    }
}
