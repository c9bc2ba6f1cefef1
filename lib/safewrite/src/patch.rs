//!
//! @file patch.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Reversible byte-range overwrites of process memory.
//! @bug No known bugs.
//!

use crate::protect::{flush_instruction_cache, ProtectError, ProtectionGuard};
use crate::span::Span;

/// Describes the ways a patch operation can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error(transparent)]
    Protect(#[from] ProtectError),

    #[error("patch has never been installed")]
    NotInstalled
}

///
/// Writes bytes to a location under the protection discipline.
///
/// The span is unprotected, written, reprotected, and flushed from the
/// instruction cache. A failed protection change writes nothing.
///
/// In order to use this function safely, the destination must be mapped in
/// the current process and no other thread may be executing through it.
///
pub unsafe fn write_protected(
    location: usize,
    bytes: &[u8]
) -> Result<(), ProtectError> {
    let span = Span::new(location, bytes.len());
    {
        let _guard = ProtectionGuard::acquire(span)?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), location as *mut u8, bytes.len());
    }
    flush_instruction_cache(span);
    Ok(())
}

///
/// An arbitrary byte-range overwrite that can be reverted exactly.
///
/// The patch owns the only copy of the bytes it displaced; uninstalling
/// writes them back. Installing again after an uninstall is a fresh install
/// and captures the bytes found at that time.
///
pub struct RawPatch {
    location: usize,
    data: Box<[u8]>,
    saved: Option<Box<[u8]>>
}

impl RawPatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self {
            location: 0,
            data: Vec::new().into_boxed_slice(),
            saved: None
        }
    }

    /// Checks whether the patch is currently applied.
    pub fn installed(
        &self
    ) -> bool {
        self.saved.is_some()
    }

    ///
    /// Captures the bytes at the given location, then overwrites them.
    ///
    /// A failed protection change captures nothing and writes nothing.
    ///
    /// In order to use this function safely, the destination range must be
    /// mapped in the current process, no other thread may execute through
    /// it during the write, and no other patch may target an overlapping
    /// range.
    ///
    pub unsafe fn install(
        &mut self,
        location: usize,
        data: &[u8]
    ) -> Result<(), ProtectError> {
        assert!(location != 0);
        assert!(!data.is_empty());
        assert!(!self.installed());

        let span = Span::new(location, data.len());
        let mut saved = vec![0u8; data.len()].into_boxed_slice();
        {
            let _guard = ProtectionGuard::acquire(span)?;
            std::ptr::copy_nonoverlapping(location as *const u8, saved.as_mut_ptr(), data.len());
            std::ptr::copy_nonoverlapping(data.as_ptr(), location as *mut u8, data.len());
        }
        flush_instruction_cache(span);

        log::debug!("patched {} bytes at {:#x}", data.len(), location);

        self.location = location;
        self.data = data.to_vec().into_boxed_slice();
        self.saved = Some(saved);
        Ok(())
    }

    ///
    /// Writes the displaced bytes back and clears the captured state.
    ///
    /// Calling this without a prior successful install is a no-op.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the patched range.
    ///
    pub unsafe fn uninstall(
        &mut self
    ) -> Result<(), ProtectError> {
        let saved = match self.saved.take() {
            Some(s) => s,
            None => return Ok(())
        };

        if let Err(e) = write_protected(self.location, &saved) {
            // Nothing was written; the patch is still in place.
            self.saved = Some(saved);
            return Err(e);
        }

        log::debug!("restored {} bytes at {:#x}", saved.len(), self.location);
        Ok(())
    }

    ///
    /// Checks that the installed patch bytes are still present.
    ///
    /// In order to use this function safely, the patched range must still
    /// be mapped in the current process.
    ///
    pub unsafe fn verify(
        &self
    ) -> Result<bool, PatchError> {
        if !self.installed() {
            return Err(PatchError::NotInstalled);
        }

        let span = Span::new(self.location, self.data.len());
        let mut intact = false;
        crate::protect::use_region(span, || {
            let code = std::slice::from_raw_parts(span.as_ptr(), span.len());
            intact = code == &*self.data;
        })?;
        Ok(intact)
    }

    ///
    /// Writes the replacement bytes again, re-running the most recent
    /// install.
    ///
    /// While installed this refreshes a region some external actor has
    /// clobbered, without touching the captured original bytes. After an
    /// uninstall it behaves as a fresh install. Before any install it is
    /// an error.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the patched range.
    ///
    pub unsafe fn reinstall(
        &mut self
    ) -> Result<(), PatchError> {
        if self.location == 0 {
            return Err(PatchError::NotInstalled);
        }

        if self.installed() {
            write_protected(self.location, &self.data)?;
        } else {
            let data = std::mem::take(&mut self.data);
            let res = self.install(self.location, &data);
            self.data = data;
            res?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_then_uninstall_restores_bytes() {
        let mut buf: Vec<u8> = (0..32).collect();
        let before = buf.clone();
        let loc = buf.as_mut_ptr() as usize + 8;

        let mut patch = RawPatch::new();
        unsafe {
            patch.install(loc, &[0xff, 0xfe, 0xfd]).unwrap();
            assert!(patch.installed());
            assert_eq!(&buf[8..11], &[0xff, 0xfe, 0xfd]);

            patch.uninstall().unwrap();
        }
        assert!(!patch.installed());
        assert_eq!(buf, before);
    }

    #[test]
    fn double_uninstall_is_a_noop() {
        let mut buf = vec![0x11u8; 16];
        let loc = buf.as_mut_ptr() as usize;

        let mut patch = RawPatch::new();
        unsafe {
            patch.install(loc, &[0x22, 0x22]).unwrap();
            patch.uninstall().unwrap();
            let snapshot = buf.clone();
            patch.uninstall().unwrap();
            assert_eq!(buf, snapshot);
        }
    }

    #[test]
    fn uninstall_without_install_is_a_noop() {
        let mut patch = RawPatch::new();
        unsafe {
            patch.uninstall().unwrap();
        }
        assert!(!patch.installed());
    }

    #[test]
    fn reinstall_recovers_a_clobbered_region() {
        let mut buf = vec![0xaau8; 8];
        let loc = buf.as_mut_ptr() as usize;

        let mut patch = RawPatch::new();
        unsafe {
            patch.install(loc, &[0x01, 0x02, 0x03]).unwrap();

            // An external actor tramples the patched bytes.
            buf[0] = 0x77;
            buf[1] = 0x77;

            patch.reinstall().unwrap();
            assert_eq!(&buf[..3], &[0x01, 0x02, 0x03]);

            // The displaced bytes were preserved across the clobber.
            patch.uninstall().unwrap();
            assert_eq!(buf, vec![0xaau8; 8]);
        }
    }

    #[test]
    fn reinstall_after_uninstall_is_a_fresh_install() {
        let mut buf = vec![0x55u8; 8];
        let loc = buf.as_mut_ptr() as usize;

        let mut patch = RawPatch::new();
        unsafe {
            patch.install(loc, &[0x0f]).unwrap();
            patch.uninstall().unwrap();

            buf[0] = 0x44;
            patch.reinstall().unwrap();
            assert_eq!(buf[0], 0x0f);

            patch.uninstall().unwrap();
            assert_eq!(buf[0], 0x44);
        }
    }

    #[test]
    fn reinstall_before_install_is_an_error() {
        let mut patch = RawPatch::new();
        let res = unsafe { patch.reinstall() };
        assert_eq!(res, Err(PatchError::NotInstalled));
    }
}
