//!
//! @file error.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Failure conditions shared by the hook strategies.
//! @bug No known bugs.
//!

use safewrite::ProtectError;

/// Describes the ways a hook install/uninstall can fail.
///
/// Every variant is local and recoverable; a failed operation leaves no
/// partial state behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    #[error(transparent)]
    Protect(#[from] ProtectError),

    #[error("hook has never been installed")]
    NotInstalled,

    #[error("table slot at {0:#x} is not pointer aligned")]
    MisalignedSlot(usize),

    #[error("could not resolve `{symbol}' in `{module}'")]
    Resolution {
        module: String,
        symbol: String
    }
}
