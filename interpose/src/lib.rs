//!
//! @file lib.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Runtime binary patching and function interception engine.
//! @bug No known bugs.
//!
//! A consumer locates code or data in the running process with fuzzy byte
//! signatures, then redirects control flow or data pointers at the located
//! addresses to its own replacements:
//!
//!   1. compile a [`Pattern`] from its textual signature,
//!   2. scan a range (usually [`ModuleDescriptor::current()`]'s code span),
//!   3. derive a target address, table slot, or import name,
//!   4. install one of the hook strategies,
//!   5. later, uninstall to restore original behavior exactly.
//!
//! Steps can be batched through [`HookSet`], which resolves every signature
//! before installing anything. All mutations route through the protection
//! discipline in `safewrite`.
//!

mod set;

pub use sigscan::{Pattern, PatternError};
pub use safewrite::{
    flush_instruction_cache, use_region, write_protected, PatchError, ProtectError,
    ProtectionGuard, RawPatch, Span
};
pub use hooks::{BranchHook, HookError, Register, TableHook, BRANCH_PATCH_SIZE};
#[cfg(windows)]
pub use hooks::{ApiHook, ImportHook};
pub use modinfo::ModuleDescriptor;
#[cfg(windows)]
pub use modinfo::{export_address, import_slot};
pub use readywait::{wait_for, CancelToken, WaitOutcome};
#[cfg(windows)]
pub use readywait::window_exists;

pub use set::{ApplyError, HookRequest, HookSet};
