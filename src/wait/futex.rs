use core::ptr;
use core::sync::atomic::AtomicU32;

use crate::error::{Error, Result};

const WAIT: libc::c_int = libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG;
const WAKE: libc::c_int = libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG;
const REQUEUE: libc::c_int = libc::FUTEX_REQUEUE | libc::FUTEX_PRIVATE_FLAG;

#[inline]
fn word(addr: &AtomicU32) -> *mut u32 {
    addr as *const AtomicU32 as *mut u32
}

pub(crate) fn wait(addr: &AtomicU32, expected: u32) {
    // EAGAIN means the word no longer matched at insert time and EINTR is
    // a signal-driven release; callers re-check the word either way.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word(addr),
            WAIT,
            expected,
            ptr::null::<libc::timespec>(),
            ptr::null_mut::<u32>(),
            0u32,
        );
    }
}

pub(crate) fn wake(addr: &AtomicU32, count: u32) -> Result<usize> {
    let count = count.min(i32::MAX as u32) as libc::c_int;
    let woken = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word(addr),
            WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null_mut::<u32>(),
            0u32,
        )
    };
    if woken < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(Error::KernelFault(i64::from(errno)));
    }
    Ok(woken as usize)
}

pub(crate) fn requeue(src: &AtomicU32, wake: u32, dst: &AtomicU32, limit: u32) -> Result<usize> {
    // The requeue limit rides in the timeout argument slot.
    let limit = limit.min(i32::MAX as u32) as usize;
    let woken = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word(src),
            REQUEUE,
            wake.min(i32::MAX as u32) as libc::c_int,
            limit as *const libc::timespec,
            word(dst),
            0u32,
        )
    };
    if woken < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(Error::KernelFault(i64::from(errno)));
    }
    Ok(woken as usize)
}
