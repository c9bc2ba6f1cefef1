//!
//! @file set.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Batch resolution and installation of signature-located hooks.
//! @bug No known bugs.
//!
//! A consumer declares every interception it wants as a request, then
//! applies them in one pass. Resolution is all-or-nothing: each enabled
//! request's signature is located and reported first, and nothing at all is
//! installed unless every one of them resolved. This keeps a half-patched
//! process from ever existing, at the cost of refusing to run with a binary
//! whose code has drifted from the signatures.
//!

use hooks::{BranchHook, HookError, TableHook};
use safewrite::{RawPatch, Span};
use sigscan::Pattern;

/// Describes the ways a batch apply can fail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("could not locate {failed} of {total} signatures")]
    MissingSignatures {
        failed: usize,
        total: usize
    },

    #[error(transparent)]
    Hook(#[from] HookError)
}

/// The mutation a request performs at its resolved address.
enum Action {
    Jump { target: usize },
    Call { target: usize },
    Patch { bytes: Box<[u8]> },
    TableSlot { target: usize, index: usize }
}

///
/// One requested interception: a name for reporting, a signature locating
/// the site, and the action to take there.
///
pub struct HookRequest {
    name: String,
    pattern: Pattern,
    offset: usize,
    enabled: fn() -> bool,
    action: Action
}

impl HookRequest {
    /// Requests a jump-redirect at the address the signature matches.
    pub fn jump(
        name: &str,
        pattern: Pattern,
        target: usize
    ) -> Self {
        Self::new(name, pattern, Action::Jump { target })
    }

    /// Requests a call-redirect at the address the signature matches.
    pub fn call(
        name: &str,
        pattern: Pattern,
        target: usize
    ) -> Self {
        Self::new(name, pattern, Action::Call { target })
    }

    /// Requests a raw byte overwrite at the address the signature matches.
    pub fn patch(
        name: &str,
        pattern: Pattern,
        bytes: &[u8]
    ) -> Self {
        Self::new(name, pattern, Action::Patch { bytes: bytes.to_vec().into_boxed_slice() })
    }

    /// Requests a pointer swap in the table the signature matches, at the
    /// given slot index.
    pub fn table_slot(
        name: &str,
        pattern: Pattern,
        target: usize,
        index: usize
    ) -> Self {
        Self::new(name, pattern, Action::TableSlot { target, index })
    }

    /// Offsets the action site from the signature match by the given
    /// number of bytes.
    pub fn at_offset(
        mut self,
        offset: usize
    ) -> Self {
        self.offset = offset;
        self
    }

    /// Gates the request on a predicate, evaluated at apply time.
    /// Disabled requests are skipped, not failed.
    pub fn enabled_if(
        mut self,
        enabled: fn() -> bool
    ) -> Self {
        self.enabled = enabled;
        self
    }

    fn new(
        name: &str,
        pattern: Pattern,
        action: Action
    ) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            offset: 0,
            enabled: || true,
            action
        }
    }
}

/// An installed hook together with its reporting name.
enum Installed {
    Branch(String, BranchHook),
    Raw(String, RawPatch),
    Table(String, TableHook)
}

///
/// The set of hooks installed by one apply() call.
///
/// The set owns its hooks. Dropping it leaves them installed (the usual
/// arrangement for a long-lived host process); unwind() removes them in
/// reverse install order.
///
pub struct HookSet(Vec<Installed>);

impl HookSet {
    ///
    /// Resolves every enabled request against the given range, then
    /// installs them.
    ///
    /// Each request is reported through the log as it resolves. If any
    /// enabled signature fails to locate, nothing is installed. If an
    /// install fails partway, the hooks already installed are unwound
    /// before the error is returned.
    ///
    /// In order to use this function safely, the span must be mapped,
    /// readable memory, and the conditions of each underlying hook's
    /// install() must hold for its resolved address.
    ///
    pub unsafe fn apply(
        span: Span,
        requests: Vec<HookRequest>
    ) -> Result<Self, ApplyError> {
        log::info!(
            "--------------------- interpose {} ---------------------",
            env!("CARGO_PKG_VERSION")
        );

        // Locate everything before touching anything.
        let data = std::slice::from_raw_parts(span.as_ptr(), span.len());
        let mut resolved = Vec::new();
        let mut fails = 0;
        let mut total = 0;

        for req in requests {
            if !(req.enabled)() {
                log::info!("[SKIPPED] {} is disabled", req.name);
                continue;
            }

            total += 1;
            match req.pattern.find(data) {
                Some(off) => {
                    log::info!("[SUCCESS] {} is at offset {:#x}", req.name, off);
                    let addr = span.base() + off + req.offset;
                    resolved.push((req, addr));
                },
                None => {
                    log::info!("[FAILURE] {} did not match the code signature!", req.name);
                    fails += 1;
                }
            }
        }

        if fails > 0 {
            log::info!("[FAILURE] Could not locate every signature!");
            return Err(ApplyError::MissingSignatures { failed: fails, total });
        }

        // Install, unwinding whatever made it in if anything fails.
        let mut set = Self(Vec::new());
        for (req, addr) in resolved {
            if let Err(e) = set.install_one(req, addr) {
                set.unwind();
                return Err(e.into());
            }
        }

        log::info!("[SUCCESS] Applied {} hooks.", set.0.len());
        Ok(set)
    }

    /// Gets the number of hooks the set holds.
    pub fn len(
        &self
    ) -> usize {
        self.0.len()
    }

    /// Checks if the set holds no hooks.
    pub fn is_empty(
        &self
    ) -> bool {
        self.0.is_empty()
    }

    ///
    /// Checks that every hook in the set is still intact, reporting any
    /// that some other actor has clobbered.
    ///
    /// In order to use this function safely, every hooked range must still
    /// be mapped in the current process.
    ///
    pub unsafe fn verify(
        &self
    ) -> bool {
        let mut intact = true;
        for hook in self.0.iter() {
            let (name, ok) = match hook {
                Installed::Branch(name, h) => (name, h.verify().unwrap_or(false)),
                Installed::Raw(name, h) => (name, h.verify().unwrap_or(false)),
                Installed::Table(name, h) => (name, h.verify().unwrap_or(false))
            };

            if !ok {
                log::error!("[ERROR] Hook {} has been clobbered!", name);
                intact = false;
            }
        }
        intact
    }

    ///
    /// Uninstalls every hook in the set, in reverse install order.
    ///
    /// In order to use this function safely, the conditions of each
    /// underlying hook's uninstall() must hold.
    ///
    pub unsafe fn unwind(
        &mut self
    ) {
        while let Some(hook) = self.0.pop() {
            let (name, res) = match hook {
                Installed::Branch(name, mut h) => (name, h.uninstall().err().map(|e| e.to_string())),
                Installed::Raw(name, mut h) => (name, h.uninstall().err().map(|e| e.to_string())),
                Installed::Table(name, mut h) => (name, h.uninstall().err().map(|e| e.to_string()))
            };

            match res {
                None => log::info!("[SUCCESS] Removed hook {}", name),
                Some(e) => log::warn!("[FAILURE] Could not remove hook {}: {}", name, e)
            }
        }
    }

    unsafe fn install_one(
        &mut self,
        req: HookRequest,
        addr: usize
    ) -> Result<(), HookError> {
        match req.action {
            Action::Jump { target } => {
                let mut hook = BranchHook::jump();
                hook.install(addr, target)?;
                self.0.push(Installed::Branch(req.name, hook));
            },
            Action::Call { target } => {
                let mut hook = BranchHook::call();
                hook.install(addr, target)?;
                self.0.push(Installed::Branch(req.name, hook));
            },
            Action::Patch { bytes } => {
                let mut patch = RawPatch::new();
                patch.install(addr, &bytes).map_err(HookError::Protect)?;
                self.0.push(Installed::Raw(req.name, patch));
            },
            Action::TableSlot { target, index } => {
                let mut hook = TableHook::new();
                hook.install(addr, target, index)?;
                self.0.push(Installed::Table(req.name, hook));
            }
        }

        Ok(())
    }
}
