//!
//! @file resolved.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Hooks that locate their victim by (module, symbol) name.
//! @bug No known bugs.
//!
//! The API hook resolves an exported function and rewrites its first
//! instructions; the import hook resolves the bound import-table slot the
//! process calls through and swaps the pointer stored in it. A failed
//! resolution installs nothing.
//!

use crate::branch::BranchHook;
use crate::error::HookError;
use crate::table::TableHook;

/// Builds the error for a name that did not resolve.
fn unresolved(
    module: &str,
    symbol: &str
) -> HookError {
    HookError::Resolution {
        module: module.to_string(),
        symbol: symbol.to_string()
    }
}

///
/// Redirects an exported function to a replacement.
///
/// Resolution happens at install time; the hook itself is a branch hook at
/// the export's address.
///
pub struct ApiHook {
    inner: BranchHook
}

impl ApiHook {
    /// Creates an empty API hook.
    pub const fn new() -> Self {
        Self { inner: BranchHook::jump() }
    }

    /// Checks whether the hook is currently applied.
    pub fn installed(
        &self
    ) -> bool {
        self.inner.installed()
    }

    ///
    /// Resolves (module, symbol) through the export table and installs a
    /// jump hook at the resolved address.
    ///
    /// Fails with no side effects if the module is not loaded or the export
    /// is absent.
    ///
    /// In order to use this function safely, the conditions of
    /// BranchHook::install() must hold for the resolved address, and the
    /// replacement must match the export's signature and calling
    /// convention.
    ///
    pub unsafe fn install(
        &mut self,
        module: &str,
        symbol: &str,
        target: usize
    ) -> Result<(), HookError> {
        let addr = modinfo::export_address(module, symbol)
            .ok_or_else(|| unresolved(module, symbol))?;

        log::debug!("{}!{} resolved to {:#x}", module, symbol, addr);
        self.inner.install(addr, target)
    }

    /// Restores the export's original instructions. See BranchHook.
    pub unsafe fn uninstall(
        &mut self
    ) -> Result<(), HookError> {
        self.inner.uninstall()
    }

    /// Re-runs the most recent successful install. See BranchHook.
    pub unsafe fn reinstall(
        &mut self
    ) -> Result<(), HookError> {
        self.inner.reinstall()
    }
}

///
/// Redirects an imported function by swapping its import-table slot.
///
/// The swap lands in the bound thunk array, the one the loader resolved and
/// the process calls through.
///
pub struct ImportHook {
    inner: TableHook
}

impl ImportHook {
    /// Creates an empty import hook.
    pub const fn new() -> Self {
        Self { inner: TableHook::new() }
    }

    /// Checks whether the hook is currently applied.
    pub fn installed(
        &self
    ) -> bool {
        self.inner.installed()
    }

    ///
    /// Resolves the bound import slot for (module, symbol) in the primary
    /// image and swaps the replacement into it.
    ///
    /// Fails with no side effects if the image does not import the name
    /// from the module.
    ///
    /// In order to use this function safely, the replacement must match the
    /// import's signature and calling convention.
    ///
    pub unsafe fn install(
        &mut self,
        module: &str,
        symbol: &str,
        target: usize
    ) -> Result<(), HookError> {
        let slot = modinfo::import_slot(module, symbol)
            .ok_or_else(|| unresolved(module, symbol))?;

        log::debug!("{}!{} import slot at {:#x}", module, symbol, slot);
        self.inner.install(slot, target, 0)
    }

    /// Gets the original imported address, while installed.
    pub fn original(
        &self
    ) -> Option<usize> {
        self.inner.original()
    }

    /// Swaps the original imported address back. See TableHook.
    pub unsafe fn uninstall(
        &mut self
    ) -> Result<(), HookError> {
        self.inner.uninstall()
    }

    /// Re-runs the most recent successful install. See TableHook.
    pub unsafe fn reinstall(
        &mut self
    ) -> Result<(), HookError> {
        self.inner.reinstall()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_export_fails_without_side_effects() {
        let mut hook = ApiHook::new();
        let res = unsafe { hook.install("kernel32.dll", "NotARealExport", 0x1000) };
        assert!(matches!(res, Err(HookError::Resolution { .. })));
        assert!(!hook.installed());
    }

    #[test]
    fn absent_import_fails_without_side_effects() {
        let mut hook = ImportHook::new();
        let res = unsafe { hook.install("x.dll", "Foo", 0x1000) };
        assert!(matches!(res, Err(HookError::Resolution { .. })));
        assert!(!hook.installed());
        assert_eq!(hook.original(), None);
    }
}
