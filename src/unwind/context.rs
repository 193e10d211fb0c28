// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use libc::c_void;

/// Address range of a thread's stack. The stack grows toward `low`; `high`
/// is the base the unwinder must never walk past.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    pub low: usize,
    pub high: usize,
}

impl StackBounds {
    pub fn new(low: usize, high: usize) -> Self {
        StackBounds { low, high }
    }

    /// Whether `len` bytes at `addr` lie inside the stack.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        addr >= self.low && addr.checked_add(len).map_or(false, |end| end <= self.high)
    }

    /// Bounds of the calling thread's stack.
    ///
    /// This may allocate or read `/proc`, so capture it ahead of time on the
    /// thread that will later be sampled, never inside a signal handler.
    pub fn current_thread() -> Option<StackBounds> {
        current_thread_bounds()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_thread_bounds() -> Option<StackBounds> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut base: *mut c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let ret = libc::pthread_attr_getstack(&attr, &mut base, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if ret != 0 || base.is_null() {
            return None;
        }
        let low = base as usize;
        Some(StackBounds::new(low, low.checked_add(size)?))
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn current_thread_bounds() -> Option<StackBounds> {
    unsafe {
        let thread = libc::pthread_self();
        let high = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackBounds::new(high.checked_sub(size)?, high))
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios"
)))]
fn current_thread_bounds() -> Option<StackBounds> {
    None
}

/// Registers of a thread at the sampling point.
///
/// The capture trigger fills this in, usually from the `ucontext_t` handed to
/// a signal handler, and keeps it stable while the walk runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext {
    /// Program counter of the innermost frame.
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
    /// Link register on aarch64, zero where the target has none. A leaf
    /// function may return through it without ever storing a frame record.
    pub lr: usize,
    /// Stack base sentinel, when known.
    pub stack: Option<StackBounds>,
}

impl ThreadContext {
    pub fn new(pc: usize, sp: usize, fp: usize) -> Self {
        ThreadContext {
            pc,
            sp,
            fp,
            lr: 0,
            stack: None,
        }
    }

    pub fn with_link_register(mut self, lr: usize) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_stack(mut self, stack: StackBounds) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Reads the registers out of the `ucontext_t` passed to an `SA_SIGINFO`
    /// signal handler. Returns `None` for a null context or an unsupported
    /// target.
    ///
    /// The stack bounds are left unset since they cannot be looked up from a
    /// signal handler. Capture them beforehand with
    /// [`StackBounds::current_thread`] on the sampled thread and attach them
    /// with [`ThreadContext::with_stack`].
    ///
    /// # Safety
    ///
    /// `ucontext` must be null or point to a valid `ucontext_t`.
    pub unsafe fn from_ucontext(ucontext: *mut c_void) -> Option<ThreadContext> {
        if ucontext.is_null() {
            return None;
        }
        regs_from_ucontext(ucontext as *mut libc::ucontext_t)
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", any(target_os = "linux", target_os = "android")))] {
        unsafe fn regs_from_ucontext(ucontext: *mut libc::ucontext_t) -> Option<ThreadContext> {
            let regs = &(*ucontext).uc_mcontext.gregs;

            Some(ThreadContext::new(
                regs[libc::REG_RIP as usize] as usize,
                regs[libc::REG_RSP as usize] as usize,
                regs[libc::REG_RBP as usize] as usize,
            ))
        }
    } else if #[cfg(all(target_arch = "aarch64", any(target_os = "linux", target_os = "android")))] {
        unsafe fn regs_from_ucontext(ucontext: *mut libc::ucontext_t) -> Option<ThreadContext> {
            let mcontext = &(*ucontext).uc_mcontext;

            Some(
                ThreadContext::new(
                    mcontext.pc as usize,
                    mcontext.sp as usize,
                    mcontext.regs[29] as usize,
                )
                .with_link_register(mcontext.regs[30] as usize),
            )
        }
    } else if #[cfg(all(target_arch = "x86_64", target_os = "macos"))] {
        unsafe fn regs_from_ucontext(ucontext: *mut libc::ucontext_t) -> Option<ThreadContext> {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let thread_state = (*mcontext).__ss;

            Some(ThreadContext::new(
                thread_state.__rip as usize,
                thread_state.__rsp as usize,
                thread_state.__rbp as usize,
            ))
        }
    } else if #[cfg(all(target_arch = "aarch64", target_os = "macos"))] {
        unsafe fn regs_from_ucontext(ucontext: *mut libc::ucontext_t) -> Option<ThreadContext> {
            let mcontext = (*ucontext).uc_mcontext;
            if mcontext.is_null() {
                return None;
            }
            let thread_state = (*mcontext).__ss;

            Some(
                ThreadContext::new(
                    thread_state.__pc as usize,
                    thread_state.__sp as usize,
                    thread_state.__fp as usize,
                )
                .with_link_register(thread_state.__lr as usize),
            )
        }
    } else {
        unsafe fn regs_from_ucontext(_ucontext: *mut libc::ucontext_t) -> Option<ThreadContext> {
            None
        }
    }
}
