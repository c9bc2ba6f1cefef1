//!
//! @file table.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Swaps one pointer-sized slot in an arbitrary indirection table.
//! @bug No known bugs.
//!
//! The table is treated as an opaque pointer array: a base address, an
//! index, and the platform pointer width locate the slot. The engine never
//! has static knowledge of the real table's shape, so this covers virtual
//! dispatch tables and import address tables alike.
//!
//! The swap is a single aligned atomic exchange. Threads dereferencing the
//! table concurrently observe either the old pointer or the new one, never
//! a torn value, so installation is safe while the table is live.
//!

use core::mem::size_of;
use core::sync::atomic::{AtomicUsize, Ordering};

use safewrite::{flush_instruction_cache, ProtectionGuard, Span};

use crate::error::HookError;

///
/// Atomically swaps a pointer-sized table slot and remembers what it held.
///
/// The hook owns the only copy of the displaced pointer; uninstalling
/// exchanges it back.
///
pub struct TableHook {
    slot: usize,
    target: usize,
    original: Option<usize>
}

impl TableHook {
    /// Creates an empty table hook.
    pub const fn new() -> Self {
        Self {
            slot: 0,
            target: 0,
            original: None
        }
    }

    /// Checks whether the hook is currently applied.
    pub fn installed(
        &self
    ) -> bool {
        self.original.is_some()
    }

    ///
    /// Gets the pointer the slot held before installation.
    ///
    /// Only available while the hook is installed; replacements use this to
    /// chain to the implementation they displaced.
    ///
    pub fn original(
        &self
    ) -> Option<usize> {
        self.original
    }

    ///
    /// Swaps the slot at table_base + index * pointer-size to the target.
    ///
    /// The slot must be pointer aligned; the exchange would otherwise tear
    /// under concurrent readers. A failed protection change swaps nothing.
    ///
    /// In order to use this function safely, the slot must be a mapped,
    /// pointer-sized location in the current process, and any concurrent
    /// reader must load it with a single aligned pointer-sized read.
    ///
    pub unsafe fn install(
        &mut self,
        table_base: usize,
        target: usize,
        index: usize
    ) -> Result<(), HookError> {
        assert!(table_base != 0);
        assert!(!self.installed());

        let slot = table_base + index * size_of::<usize>();
        if slot % size_of::<usize>() != 0 {
            return Err(HookError::MisalignedSlot(slot));
        }

        self.slot = slot;
        self.target = target;
        if let Err(e) = self.swap_in() {
            // Nothing was exchanged; forget the failed request entirely.
            self.slot = 0;
            self.target = 0;
            return Err(e);
        }

        log::debug!("table slot {:#x} swapped to {:#x}", slot, target);
        Ok(())
    }

    ///
    /// Exchanges the displaced pointer back into the slot and clears the
    /// captured state. A no-op if the hook is not installed.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the slot.
    ///
    pub unsafe fn uninstall(
        &mut self
    ) -> Result<(), HookError> {
        let original = match self.original.take() {
            Some(p) => p,
            None => return Ok(())
        };

        let span = Span::new(self.slot, size_of::<usize>());
        let guard = match ProtectionGuard::acquire(span) {
            Ok(g) => g,
            Err(e) => {
                // Nothing was exchanged; the hook is still in place.
                self.original = Some(original);
                return Err(e.into());
            }
        };

        // SAFETY: The slot is aligned and was validated at install.
        (*(self.slot as *const AtomicUsize)).swap(original, Ordering::SeqCst);
        drop(guard);
        flush_instruction_cache(span);
        Ok(())
    }

    ///
    /// Re-runs the most recent successful install.
    ///
    /// While installed this swaps the target back into a slot some external
    /// actor has re-pointed, keeping the originally captured pointer. After
    /// an uninstall it behaves as a fresh install. Before any install it is
    /// an error.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the slot.
    ///
    pub unsafe fn reinstall(
        &mut self
    ) -> Result<(), HookError> {
        if self.slot == 0 {
            return Err(HookError::NotInstalled);
        }

        if self.installed() {
            let span = Span::new(self.slot, size_of::<usize>());
            {
                let _guard = ProtectionGuard::acquire(span)?;
                // SAFETY: The slot is aligned and was validated at install.
                (*(self.slot as *const AtomicUsize)).swap(self.target, Ordering::SeqCst);
            }
            flush_instruction_cache(span);
            Ok(())
        } else {
            self.swap_in()
        }
    }

    ///
    /// Checks that the installed slot still holds the replacement pointer.
    ///
    /// In order to use this function safely, the slot must still be mapped
    /// in the current process.
    ///
    pub unsafe fn verify(
        &self
    ) -> Result<bool, HookError> {
        if !self.installed() {
            return Err(HookError::NotInstalled);
        }

        let span = Span::new(self.slot, size_of::<usize>());
        let mut intact = false;
        safewrite::use_region(span, || {
            intact = *(self.slot as *const usize) == self.target;
        })?;
        Ok(intact)
    }

    /// Exchanges the target into the slot, capturing the displaced pointer.
    unsafe fn swap_in(
        &mut self
    ) -> Result<(), HookError> {
        let span = Span::new(self.slot, size_of::<usize>());
        let previous;
        {
            let _guard = ProtectionGuard::acquire(span)?;
            // SAFETY: The slot is aligned and pointer sized.
            previous = (*(self.slot as *const AtomicUsize)).swap(self.target, Ordering::SeqCst);
        }

        // Slots hold data, not code, but the flush keeps every mutation in
        // this crate under one discipline.
        flush_instruction_cache(span);

        self.original = Some(previous);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swaps_the_indexed_slot() {
        let mut table: Vec<usize> = vec![0x1000, 0x2000, 0x3000, 0x4000];
        let base = table.as_mut_ptr() as usize;

        let mut hook = TableHook::new();
        unsafe { hook.install(base, 0xbeef, 2).unwrap(); }

        assert_eq!(table, vec![0x1000, 0x2000, 0xbeef, 0x4000]);
        assert_eq!(hook.original(), Some(0x3000));

        unsafe { hook.uninstall().unwrap(); }
        assert_eq!(table, vec![0x1000, 0x2000, 0x3000, 0x4000]);
        assert_eq!(hook.original(), None);
    }

    #[test]
    fn slot_address_uses_pointer_width() {
        let mut table: Vec<usize> = vec![0; 8];
        let base = table.as_mut_ptr() as usize;

        let mut hook = TableHook::new();
        unsafe { hook.install(base, 0x1234, 5).unwrap(); }

        // Index 5 lands exactly 5 pointers past the base.
        assert_eq!(table[5], 0x1234);
        assert!(table.iter().enumerate().all(|(i, v)| i == 5 || *v == 0));
    }

    #[test]
    fn misaligned_slot_is_rejected() {
        let mut table: Vec<usize> = vec![0; 2];
        let base = table.as_mut_ptr() as usize + 1;

        let mut hook = TableHook::new();
        let res = unsafe { hook.install(base, 0x1, 0) };
        assert_eq!(res, Err(HookError::MisalignedSlot(base)));
        assert!(!hook.installed());
    }

    #[test]
    fn double_uninstall_is_a_noop() {
        let mut table: Vec<usize> = vec![0xaaaa];
        let base = table.as_mut_ptr() as usize;

        let mut hook = TableHook::new();
        unsafe {
            hook.install(base, 0xbbbb, 0).unwrap();
            hook.uninstall().unwrap();
            hook.uninstall().unwrap();
        }
        assert_eq!(table[0], 0xaaaa);
    }

    #[test]
    fn reinstall_recovers_a_repointed_slot() {
        let mut table: Vec<usize> = vec![0x1111];
        let base = table.as_mut_ptr() as usize;

        let mut hook = TableHook::new();
        unsafe {
            hook.install(base, 0x2222, 0).unwrap();

            // An external actor re-points the slot.
            table[0] = 0x9999;

            hook.reinstall().unwrap();
            assert_eq!(table[0], 0x2222);
            assert_eq!(hook.original(), Some(0x1111));

            hook.uninstall().unwrap();
            assert_eq!(table[0], 0x1111);
        }
    }

    #[test]
    fn reinstall_before_install_is_an_error() {
        let mut hook = TableHook::new();
        assert_eq!(unsafe { hook.reinstall() }, Err(HookError::NotInstalled));
    }
}
