//!
//! @file protect.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Scoped read/write/execute access to a span of process memory.
//! @bug No known bugs.
//!

use crate::span::Span;

/// The OS denied a permission change over a span of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("protection change denied for {len} bytes at {addr:#x} (os error {code})")]
pub struct ProtectError {
    pub addr: usize,
    pub len: usize,
    pub code: u32
}

///
/// Holds a span of memory as read/write/execute.
///
/// The prior protection is captured on acquisition and restored when the
/// guard is dropped, which happens on every exit path of the bracketed
/// write, including unwinding.
///
pub struct ProtectionGuard {
    span: Span,
    prior: os::Protection
}

impl ProtectionGuard {
    ///
    /// Makes the given span read/write/execute until the guard is dropped.
    ///
    /// A failed acquisition leaves the span untouched.
    ///
    /// In order to use this function safely, the span must denote memory
    /// mapped in the current process.
    ///
    pub unsafe fn acquire(
        span: Span
    ) -> Result<Self, ProtectError> {
        let prior = os::acquire(span)?;
        Ok(Self { span, prior })
    }

    /// Gets the span this guard holds open.
    pub fn span(
        &self
    ) -> Span {
        self.span
    }
}

impl Drop for ProtectionGuard {
    fn drop(
        &mut self
    ) {
        unsafe {
            // SAFETY: The span was validly mapped when the guard was taken.
            os::release(self.span, self.prior);
        }
    }
}

///
/// Temporarily marks the given span read/write/execute, calls the given fn,
/// then restores the prior protection.
///
/// In order to use this function safely, the span must denote memory mapped
/// in the current process.
///
pub unsafe fn use_region(
    span: Span,
    func: impl FnOnce()
) -> Result<(), ProtectError> {
    let _guard = ProtectionGuard::acquire(span)?;
    func();
    Ok(())
}

///
/// Flushes the instruction cache over the given span.
///
/// Must be called after every mutation of bytes that may be executed, so
/// that no thread runs instructions it fetched before the write.
///
pub unsafe fn flush_instruction_cache(
    span: Span
) {
    os::flush_icache(span);
}

#[cfg(windows)]
mod os {
    use super::{ProtectError, Span};
    use core::ffi::c_void;

    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::System::Memory::{
        VirtualProtect, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS
    };
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    pub type Protection = PAGE_PROTECTION_FLAGS;

    /// Marks the span read/write/execute, returning the prior protection.
    pub unsafe fn acquire(
        span: Span
    ) -> Result<Protection, ProtectError> {
        let mut prior: Protection = 0;
        let ok = VirtualProtect(
            span.base() as *const c_void,
            span.len(),
            PAGE_EXECUTE_READWRITE,
            &mut prior
        );

        if ok == 0 {
            Err(ProtectError { addr: span.base(), len: span.len(), code: GetLastError() })
        } else {
            Ok(prior)
        }
    }

    /// Restores the protection captured by acquire().
    pub unsafe fn release(
        span: Span,
        prior: Protection
    ) {
        let mut old: Protection = 0;
        if VirtualProtect(span.base() as *const c_void, span.len(), prior, &mut old) == 0 {
            log::warn!("failed to restore protection over {}", span);
        }
    }

    pub unsafe fn flush_icache(
        span: Span
    ) {
        FlushInstructionCache(GetCurrentProcess(), span.base() as *const c_void, span.len());
    }
}

#[cfg(unix)]
mod os {
    use super::{ProtectError, Span};
    use core::ffi::c_void;

    pub type Protection = libc::c_int;

    /// Rounds the span out to the page boundaries mprotect requires.
    fn page_span(
        span: Span
    ) -> (usize, usize) {
        // SAFETY: Querying the page size has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let start = span.base() & !(page - 1);
        let end = (span.end() + page - 1) & !(page - 1);
        (start, end - start)
    }

    ///
    /// Reads the current protection of the mapping containing the address.
    ///
    /// Unlike VirtualProtect, mprotect does not report the protection it
    /// replaced, so the prior state comes from the kernel's mapping table.
    /// If it cannot be determined the span is assumed to be ordinary
    /// read/write data.
    ///
    fn current_protection(
        addr: usize
    ) -> Protection {
        #[cfg(target_os = "linux")]
        if let Ok(maps) = std::fs::read_to_string("/proc/self/maps") {
            for line in maps.lines() {
                let mut fields = line.split_whitespace();
                let range = fields.next().unwrap_or("");
                let perms = fields.next().unwrap_or("");

                let (lo, hi) = match range.split_once('-') {
                    Some(r) => r,
                    None => continue
                };
                let lo = usize::from_str_radix(lo, 16).unwrap_or(usize::MAX);
                let hi = usize::from_str_radix(hi, 16).unwrap_or(0);
                if !(lo <= addr && addr < hi) {
                    continue;
                }

                let mut prot = libc::PROT_NONE;
                for (flag, bit) in [(b'r', libc::PROT_READ),
                                    (b'w', libc::PROT_WRITE),
                                    (b'x', libc::PROT_EXEC)] {
                    if perms.as_bytes().contains(&flag) {
                        prot |= bit;
                    }
                }
                return prot;
            }
        }

        log::warn!("unknown prior protection at {:#x}; assuming read/write", addr);
        libc::PROT_READ | libc::PROT_WRITE
    }

    /// Marks the span read/write/execute, returning the prior protection.
    pub unsafe fn acquire(
        span: Span
    ) -> Result<Protection, ProtectError> {
        let prior = current_protection(span.base());

        let (start, len) = page_span(span);
        let prot = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        if libc::mprotect(start as *mut c_void, len, prot) != 0 {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32;
            Err(ProtectError { addr: span.base(), len: span.len(), code })
        } else {
            Ok(prior)
        }
    }

    /// Restores the protection captured by acquire().
    pub unsafe fn release(
        span: Span,
        prior: Protection
    ) {
        let (start, len) = page_span(span);
        if libc::mprotect(start as *mut c_void, len, prior) != 0 {
            log::warn!("failed to restore protection over {}", span);
        }
    }

    pub unsafe fn flush_icache(
        _span: Span
    ) {
        // x86 keeps instruction fetch coherent with data writes; there is
        // nothing to invalidate from user space.
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        compile_error!("no instruction cache flush for this architecture");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_round_trips_heap_memory() {
        let mut buf = vec![0u8; 64];
        let span = Span::new(buf.as_ptr() as usize, buf.len());

        unsafe {
            let guard = ProtectionGuard::acquire(span).unwrap();
            assert_eq!(guard.span(), span);
            std::ptr::write(buf.as_mut_ptr(), 0x90);
            drop(guard);
        }

        // The buffer stays usable after the prior protection is restored.
        assert_eq!(buf[0], 0x90);
        buf[1] = 0x91;
        assert_eq!(buf[1], 0x91);
    }

    #[test]
    fn use_region_runs_the_closure() {
        let buf = vec![0xaau8; 16];
        let span = Span::new(buf.as_ptr() as usize, buf.len());

        let mut seen = 0u8;
        unsafe {
            use_region(span, || seen = *span.as_ptr()).unwrap();
        }
        assert_eq!(seen, 0xaa);
    }
}
