//!
//! @file lib.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Describes the running process's primary module.
//! @bug No known bugs.
//!
//! The descriptor is read once from the process's own image headers and is
//! treated as immutable for the process lifetime; the primary module never
//! reloads. It provides the default search space for signature scans and the
//! anchor for export/import name resolution. No other process is ever
//! inspected.
//!

use std::path::{Path, PathBuf};

use safewrite::Span;

#[cfg(windows)]
mod names;

#[cfg(windows)]
pub use names::{export_address, import_slot};

///
/// Describes a loaded image's address range and originating file.
///
/// The code range runs from the image base to the end of the code section
/// reported by the image headers.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleDescriptor {
    base: usize,
    code_end: usize,
    path: PathBuf
}

impl ModuleDescriptor {
    /// Creates a descriptor from already-known values.
    pub fn from_parts(
        base: usize,
        code_end: usize,
        path: PathBuf
    ) -> Self {
        assert!(base != 0);
        assert!(code_end > base);
        Self { base, code_end, path }
    }

    ///
    /// Gets the descriptor of the process's primary module.
    ///
    /// The image headers are walked on the first call; later calls return
    /// the cached result.
    ///
    #[cfg(windows)]
    pub fn current() -> &'static Self {
        static CURRENT: once_cell::sync::OnceCell<ModuleDescriptor> = once_cell::sync::OnceCell::new();
        CURRENT.get_or_init(|| {
            // SAFETY: The primary module is mapped for the process lifetime.
            let this = unsafe { names::read_current_module() };
            log::info!("primary module {} at {:#x}", this.path.display(), this.base);
            this
        })
    }

    /// Gets the module base address.
    pub fn base(
        &self
    ) -> usize {
        self.base
    }

    /// Gets the first address past the module's code.
    pub fn code_end(
        &self
    ) -> usize {
        self.code_end
    }

    /// Gets the size of the module's code, in bytes.
    pub fn code_size(
        &self
    ) -> usize {
        self.code_end - self.base
    }

    /// Gets the module's originating file path.
    pub fn path(
        &self
    ) -> &Path {
        &self.path
    }

    /// Gets the module's code range, for use as a scan space.
    pub fn code_span(
        &self
    ) -> Span {
        Span::new(self.base, self.code_size())
    }
}

impl std::fmt::Display for ModuleDescriptor {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{} {}", self.path.display(), self.code_span())
    }
}
