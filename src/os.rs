use crate::{*, error::*, util::*};
use std::{ptr, slice, sync::atomic::{AtomicU32, AtomicUsize, Ordering}};

// Linux api stuff: page size and lazily committed anonymous memory.

static SYSCONF_PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[allow(non_snake_case)]
pub fn sysconf_PAGE_SIZE() -> usize {
    let r = SYSCONF_PAGE_SIZE.load(Ordering::Relaxed);
    if r != 0 {
        return r;
    }
    let r = unsafe {libc::sysconf(libc::_SC_PAGE_SIZE)};
    let r = if r <= 0 {4096} else {r as usize};
    SYSCONF_PAGE_SIZE.store(r, Ordering::Relaxed);
    r
}

// A big range of virtual memory, readable and writable, initially zero.
// Physical pages are only committed when first written, so reserving hundreds of GiB is fine as long as most of it is never touched.
// MAP_NORESERVE keeps the kernel from refusing the mapping based on swap accounting (unless overcommit is disabled entirely).
pub struct Reservation {
    ptr: *mut u8,
    len: usize,
}
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    pub fn new(len: usize) -> Result<Self> {
        let page = sysconf_PAGE_SIZE();
        let len = (len.max(1) + page - 1) / page * page;
        let p = unsafe {libc::mmap(ptr::null_mut(), len, libc::PROT_READ | libc::PROT_WRITE, libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE, -1, 0)};
        if p == libc::MAP_FAILED {
            let e = std::io::Error::last_os_error();
            return err!(OutOfMemory, "failed to reserve {} of address space: {}", PrettySize(len), e);
        }
        Ok(Self {ptr: p as *mut u8, len})
    }

    pub fn len(&self) -> usize { self.len }

    // The mapping is zero-filled and suitably aligned, and zero is a valid AtomicU32.
    pub fn as_atomic_u32(&self) -> &[AtomicU32] {
        unsafe {slice::from_raw_parts(self.ptr as *const AtomicU32, self.len / 4)}
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let r = unsafe {libc::munmap(self.ptr as *mut libc::c_void, self.len)};
        if r != 0 {
            eprintln!("warning: munmap of {} failed: {}", PrettySize(self.len), std::io::Error::last_os_error());
        }
    }
}
