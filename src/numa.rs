//! NUMA binding and prefetch hints.
//!
//! Everything here is observable only as performance: binding failures
//! degrade to the default allocation policy, and prefetch is advisory.

use crate::config::NumaPolicy;

/// Binds `region` to the local NUMA node of the calling thread.
///
/// Uses `mbind(2)` with `MPOL_PREFERRED` and an empty nodemask, which asks
/// the kernel for allocate-local placement. Anything short of success is
/// reported (policy `On`) or quietly ignored (policy `Auto`).
pub fn bind_local(region: *const u8, len: usize, policy: NumaPolicy) {
    if policy == NumaPolicy::Off || len == 0 {
        return;
    }
    match bind_local_impl(region, len) {
        Ok(()) => log::debug!("bound {len} bytes to the local NUMA node"),
        Err(reason) => match policy {
            NumaPolicy::On => log::warn!("NUMA binding unavailable: {reason}"),
            _ => log::debug!("NUMA binding skipped: {reason}"),
        },
    }
}

#[cfg(target_os = "linux")]
fn bind_local_impl(region: *const u8, len: usize) -> Result<(), String> {
    const MPOL_PREFERRED: libc::c_long = 1;
    // Page-align the region start; mbind requires it.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let addr = region as usize & !(page - 1);
    let len = len + (region as usize - addr);
    let rc = unsafe {
        libc::syscall(
            libc::SYS_mbind,
            addr,
            len,
            MPOL_PREFERRED,
            std::ptr::null::<libc::c_ulong>(),
            0usize,
            0u32,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().to_string())
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_local_impl(_region: *const u8, _len: usize) -> Result<(), String> {
    Err("no NUMA support on this platform".into())
}

/// Issues a hardware read-prefetch hint for the cache line at `ptr`.
#[inline(always)]
pub fn prefetch_read<T>(ptr: *const T) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: prefetch is a hint; the address does not need to be valid.
    unsafe {
        std::arch::x86_64::_mm_prefetch(ptr as *const i8, std::arch::x86_64::_MM_HINT_T0);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = ptr;
}
