// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

use std::{cell::Cell, mem::size_of};

use nix::{
    errno::Errno,
    unistd::{close, read},
};

use crate::modules::ModuleMap;

const WORD: usize = size_of::<usize>();

/// Longest range a single probe may cover.
const MAX_CHECK_LENGTH: usize = 4 * WORD;

/// Answers whether an address may be dereferenced or recorded, without ever
/// faulting, allocating or blocking.
///
/// Every read the unwinder performs on the sampled thread's memory goes
/// through [`AddressValidator::read_word`].
pub trait AddressValidator {
    /// Whether `len` bytes starting at `addr` can be read.
    fn is_readable(&self, addr: usize, len: usize) -> bool;

    /// Whether `addr` lies in mapped, executable memory.
    fn is_executable(&self, addr: usize) -> bool;

    /// Reads one aligned machine word, or `None` if the read is not safe.
    fn read_word(&self, addr: usize) -> Option<usize>;
}

// A `Cell` rather than a `RefCell`: a signal handler may probe while the
// interrupted code on the same thread is halfway through `open_pipe`.
thread_local! {
    static MEM_VALIDATE_PIPE: Cell<[i32; 2]> = const { Cell::new([-1, -1]) };
}

#[inline]
#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_pipe() -> nix::Result<(i32, i32)> {
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;

    pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
}

#[inline]
#[cfg(any(target_os = "macos", target_os = "ios"))]
fn create_pipe() -> nix::Result<(i32, i32)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
    use nix::unistd::pipe;
    use std::os::unix::io::RawFd;

    fn set_flags(fd: RawFd) -> nix::Result<()> {
        let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
        flags |= FdFlag::FD_CLOEXEC;
        fcntl(fd, FcntlArg::F_SETFD(flags))?;
        let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        flags |= OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    let (read_fd, write_fd) = pipe()?;
    set_flags(read_fd)?;
    set_flags(write_fd)?;
    Ok((read_fd, write_fd))
}

fn open_pipe() -> nix::Result<()> {
    MEM_VALIDATE_PIPE
        .try_with(|pipes| {
            // unpublish the old pair before closing it
            let old = pipes.replace([-1, -1]);

            // ignore the result
            let _ = close(old[0]);
            let _ = close(old[1]);

            let (read_fd, write_fd) = create_pipe()?;
            pipes.set([read_fd, write_fd]);

            Ok(())
        })
        .unwrap_or(Err(Errno::EBADF))
}

/// Checks that `len` bytes at `addr` are readable by letting the kernel copy
/// them into a pipe. An unmapped range makes `write` fail with `EFAULT`
/// instead of faulting the process.
pub fn validate_range(addr: *const libc::c_void, len: usize) -> bool {
    if addr.is_null() || len == 0 || len > MAX_CHECK_LENGTH {
        return false;
    }
    if (addr as usize).checked_add(len).is_none() {
        return false;
    }

    // drain whatever the previous probe left in the pipe
    let valid_read = MEM_VALIDATE_PIPE
        .try_with(|pipes| {
            let pipes = pipes.get();
            loop {
                let mut buf = [0u8; MAX_CHECK_LENGTH];

                match read(pipes[0], &mut buf) {
                    Ok(bytes) => break bytes > 0,
                    Err(_err @ Errno::EINTR) => continue,
                    Err(_err @ Errno::EAGAIN) => break true,
                    Err(_) => break false,
                }
            }
        })
        .unwrap_or(false);

    if !valid_read && open_pipe().is_err() {
        return false;
    }

    MEM_VALIDATE_PIPE
        .try_with(|pipes| {
            let pipes = pipes.get();
            loop {
                let ret = unsafe { libc::write(pipes[1], addr, len) };
                if ret >= 0 {
                    break ret > 0;
                }

                match Errno::last() {
                    Errno::EINTR => continue,
                    _ => break false,
                }
            }
        })
        .unwrap_or(false)
}

/// Checks that the two words at `addr` are readable.
pub fn validate(addr: *const libc::c_void) -> bool {
    validate_range(addr, 2 * WORD)
}

/// Validator for the live process: readability is probed with [`validate`],
/// executability is looked up in one [`ModuleMap`] snapshot.
#[derive(Clone, Copy)]
pub struct ProcessValidator<'a> {
    modules: &'a ModuleMap,
}

impl<'a> ProcessValidator<'a> {
    pub fn new(modules: &'a ModuleMap) -> Self {
        ProcessValidator { modules }
    }
}

impl AddressValidator for ProcessValidator<'_> {
    fn is_readable(&self, addr: usize, len: usize) -> bool {
        validate_range(addr as *const libc::c_void, len)
    }

    fn is_executable(&self, addr: usize) -> bool {
        self.modules.is_executable(addr)
    }

    fn read_word(&self, addr: usize) -> Option<usize> {
        if addr % WORD != 0 || !self.is_readable(addr, WORD) {
            return None;
        }

        Some(unsafe { std::ptr::read_volatile(addr as *const usize) })
    }
}
