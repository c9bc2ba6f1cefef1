//!
//! @file branch.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Redirects execution at a code address with a branch overwrite.
//! @bug No known bugs.
//!
//! On 32-bit targets the patch is a five byte relative jump or call; the
//! displacement is computed modulo 2^32, so any address reaches any other.
//! On 64-bit targets no relative form can reach an arbitrary address, so the
//! patch loads the absolute target into a scratch register and branches
//! through it, occupying twelve bytes.
//!
//! The write is a plain multi-byte store, not an atomic operation. A thread
//! executing through the patched range concurrently with install/uninstall
//! can fetch a torn instruction stream; the safety contracts below make
//! freedom from such execution a caller obligation.
//!

use core::mem::size_of;

use safewrite::{flush_instruction_cache, use_region, write_protected, ProtectionGuard, Span};

use crate::error::HookError;

/// The byte length of the region a branch hook overwrites.
#[cfg(target_pointer_width = "32")]
pub const BRANCH_PATCH_SIZE: usize = 5;
#[cfg(target_pointer_width = "64")]
pub const BRANCH_PATCH_SIZE: usize = 12;

/// Encodes a x86-64 +rq register index.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7
}

/// Encodes the addressing mode of an instruction chunk, or its opcode.
#[allow(dead_code)]
enum Encoding {
    CallRelative,
    JumpRelative,
    CallReg(Register),
    JumpReg(Register),
    MoveImmQReg(Register),
    RelativeD(usize),
    AbsoluteQ(u64)
}

/// Distinguishes the two branch flavors a hook can write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BranchKind {
    Jump,
    Call
}

/// An assembled branch patch, ready to be written to its address.
struct EncodedBranch {
    addr: usize,
    buf: [u8; BRANCH_PATCH_SIZE],
    len: usize
}

impl EncodedBranch {
    /// Assembles a patch for the given address from the given encoding.
    fn assemble(
        addr: usize,
        chunks: &[Encoding]
    ) -> Self {
        let mut this = Self {
            addr,
            buf: [0; BRANCH_PATCH_SIZE],
            len: 0
        };

        for chunk in chunks.iter() {
            match chunk {
                Encoding::CallRelative => this.append(&[0xe8]),
                Encoding::JumpRelative => this.append(&[0xe9]),
                Encoding::CallReg(reg) => this.append(&[0xff, 0xd0 + (*reg as u8)]),
                Encoding::JumpReg(reg) => this.append(&[0xff, 0xe0 + (*reg as u8)]),
                Encoding::MoveImmQReg(reg) => this.append(&[0x48, 0xb8 + (*reg as u8)]),
                Encoding::RelativeD(target) => {
                    // Displacement is relative to the end of the rel32 field.
                    let rel = target.wrapping_sub(this.addr + this.len + size_of::<u32>()) as u32;
                    this.append(&rel.to_le_bytes());
                },
                Encoding::AbsoluteQ(q) => this.append(&q.to_le_bytes())
            }
        }

        assert!(this.len == BRANCH_PATCH_SIZE);
        return this;
    }

    /// Appends the given bytes to the patch buffer.
    fn append(
        &mut self,
        s: &[u8]
    ) {
        self.buf.split_at_mut(self.len).1.split_at_mut(s.len()).0.copy_from_slice(s);
        self.len += s.len();
    }

    /// Checks whether the patch is present at its address, byte-for-byte.
    unsafe fn verify(
        &self
    ) -> Result<bool, HookError> {
        let mut intact = false;
        use_region(Span::new(self.addr, self.len), || {
            let code = std::slice::from_raw_parts(self.addr as *const u8, self.len);
            intact = code == self.buf.split_at(self.len).0;
        })?;
        Ok(intact)
    }
}

/// Builds the branch patch for this platform's pointer width.
fn encode(
    kind: BranchKind,
    addr: usize,
    target: usize,
    clobber: Register
) -> EncodedBranch {
    #[cfg(target_pointer_width = "32")]
    {
        let _ = clobber;
        EncodedBranch::assemble(addr, &[
            match kind {
                BranchKind::Jump => Encoding::JumpRelative,
                BranchKind::Call => Encoding::CallRelative
            },
            Encoding::RelativeD(target)
        ])
    }

    #[cfg(target_pointer_width = "64")]
    {
        EncodedBranch::assemble(addr, &[
            Encoding::MoveImmQReg(clobber),
            Encoding::AbsoluteQ(target as u64),
            match kind {
                BranchKind::Jump => Encoding::JumpReg(clobber),
                BranchKind::Call => Encoding::CallReg(clobber)
            }
        ])
    }
}

///
/// Redirects execution at a code address to a replacement address.
///
/// The hook owns the only copy of the bytes it displaced; uninstalling
/// writes them back exactly. The jump flavor abandons the original function
/// body, while the call flavor pushes a return address before transferring.
///
pub struct BranchHook {
    kind: BranchKind,
    clobber: Register,
    location: usize,
    target: usize,
    saved: Option<[u8; BRANCH_PATCH_SIZE]>
}

impl BranchHook {
    /// Creates an empty jump-redirect hook.
    pub const fn jump() -> Self {
        Self::with_clobber(BranchKind::Jump, Register::Rax)
    }

    /// Creates an empty call-redirect hook.
    pub const fn call() -> Self {
        Self::with_clobber(BranchKind::Call, Register::Rax)
    }

    /// Creates an empty jump-redirect hook that clobbers the given register.
    /// The register is meaningful only for the wide (64-bit) encoding.
    pub const fn jump_clobbering(
        reg: Register
    ) -> Self {
        Self::with_clobber(BranchKind::Jump, reg)
    }

    /// Creates an empty call-redirect hook that clobbers the given register.
    pub const fn call_clobbering(
        reg: Register
    ) -> Self {
        Self::with_clobber(BranchKind::Call, reg)
    }

    const fn with_clobber(
        kind: BranchKind,
        clobber: Register
    ) -> Self {
        Self {
            kind,
            clobber,
            location: 0,
            target: 0,
            saved: None
        }
    }

    /// Checks whether the hook is currently applied.
    pub fn installed(
        &self
    ) -> bool {
        self.saved.is_some()
    }

    ///
    /// Overwrites the instructions at the given location so control
    /// unconditionally transfers to the given target.
    ///
    /// The displaced bytes are captured first; a failed protection change
    /// captures and writes nothing.
    ///
    /// In order to use this function safely, the patched range must be
    /// mapped code in the current process, no other thread may execute
    /// through it during the write (the store is not atomic), and the
    /// replacement must honor the calling convention of the code it
    /// supersedes.
    ///
    pub unsafe fn install(
        &mut self,
        location: usize,
        target: usize
    ) -> Result<(), HookError> {
        assert!(location != 0);
        assert!(!self.installed());

        let patch = encode(self.kind, location, target, self.clobber);
        let span = Span::new(location, BRANCH_PATCH_SIZE);

        let mut saved = [0u8; BRANCH_PATCH_SIZE];
        {
            let _guard = ProtectionGuard::acquire(span)?;
            std::ptr::copy_nonoverlapping(
                location as *const u8,
                saved.as_mut_ptr(),
                BRANCH_PATCH_SIZE
            );
            std::ptr::copy_nonoverlapping(
                patch.buf.as_ptr(),
                location as *mut u8,
                BRANCH_PATCH_SIZE
            );
        }
        flush_instruction_cache(span);

        log::debug!(
            "{:?} hook installed at {:#x}, redirecting to {:#x}",
            self.kind,
            location,
            target
        );

        self.location = location;
        self.target = target;
        self.saved = Some(saved);
        Ok(())
    }

    ///
    /// Restores the displaced instruction bytes and clears the captured
    /// state. A no-op if the hook is not installed.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the patched range.
    ///
    pub unsafe fn uninstall(
        &mut self
    ) -> Result<(), HookError> {
        let saved = match self.saved.take() {
            Some(s) => s,
            None => return Ok(())
        };

        if let Err(e) = write_protected(self.location, &saved) {
            // Nothing was written; the hook is still in place.
            self.saved = Some(saved);
            return Err(e.into());
        }

        Ok(())
    }

    ///
    /// Re-runs the most recent successful install.
    ///
    /// While installed this rewrites the branch over a region some external
    /// actor has clobbered, preserving the captured original bytes. After an
    /// uninstall it behaves as a fresh install. Before any install it is an
    /// error.
    ///
    /// In order to use this function safely, the same conditions as
    /// install() must hold for the patched range.
    ///
    pub unsafe fn reinstall(
        &mut self
    ) -> Result<(), HookError> {
        if self.location == 0 {
            return Err(HookError::NotInstalled);
        }

        if self.installed() {
            let patch = encode(self.kind, self.location, self.target, self.clobber);
            write_protected(self.location, patch.buf.split_at(patch.len).0)?;
            Ok(())
        } else {
            self.install(self.location, self.target)
        }
    }

    ///
    /// Checks that the installed branch is still present at its location.
    ///
    /// In order to use this function safely, the patched range must still be
    /// mapped in the current process.
    ///
    pub unsafe fn verify(
        &self
    ) -> Result<bool, HookError> {
        if !self.installed() {
            return Err(HookError::NotInstalled);
        }

        encode(self.kind, self.location, self.target, self.clobber).verify()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An aligned, padded code buffer for hooks to chew on.
    fn code_buf() -> Vec<u8> {
        vec![0x90u8; 2 * BRANCH_PATCH_SIZE]
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn wide_jump_encoding() {
        let mut buf = code_buf();
        let loc = buf.as_mut_ptr() as usize;
        let target = 0x1122_3344_5566_7788usize;

        let mut hook = BranchHook::jump();
        unsafe { hook.install(loc, target).unwrap(); }

        // mov rax, imm64; jmp rax
        assert_eq!(&buf[0..2], &[0x48, 0xb8]);
        assert_eq!(&buf[2..10], &target.to_le_bytes());
        assert_eq!(&buf[10..12], &[0xff, 0xe0]);
        assert_eq!(buf[12], 0x90);

        unsafe { hook.uninstall().unwrap(); }
        assert_eq!(buf, code_buf());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn wide_call_encoding_with_clobber() {
        let mut buf = code_buf();
        let loc = buf.as_mut_ptr() as usize;
        let target = 0xdead_beef_usize;

        let mut hook = BranchHook::call_clobbering(Register::Rcx);
        unsafe { hook.install(loc, target).unwrap(); }

        // mov rcx, imm64; call rcx
        assert_eq!(&buf[0..2], &[0x48, 0xb9]);
        assert_eq!(&buf[2..10], &target.to_le_bytes());
        assert_eq!(&buf[10..12], &[0xff, 0xd1]);
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn narrow_jump_encoding() {
        let mut buf = code_buf();
        let loc = buf.as_mut_ptr() as usize;
        let target = loc.wrapping_add(0x100);

        let mut hook = BranchHook::jump();
        unsafe { hook.install(loc, target).unwrap(); }

        assert_eq!(buf[0], 0xe9);
        let rel = target.wrapping_sub(loc + 5) as u32;
        assert_eq!(&buf[1..5], &rel.to_le_bytes());
    }

    #[cfg(target_pointer_width = "32")]
    #[test]
    fn narrow_call_encoding_backward_target() {
        let mut buf = code_buf();
        let loc = buf.as_mut_ptr() as usize;
        let target = loc.wrapping_sub(0x40);

        let mut hook = BranchHook::call();
        unsafe { hook.install(loc, target).unwrap(); }

        assert_eq!(buf[0], 0xe8);
        let rel = target.wrapping_sub(loc + 5) as u32;
        assert_eq!(&buf[1..5], &rel.to_le_bytes());
    }

    #[test]
    fn uninstall_restores_and_is_idempotent() {
        let mut buf: Vec<u8> = (0..BRANCH_PATCH_SIZE as u8 + 4).collect();
        let before = buf.clone();
        let loc = buf.as_mut_ptr() as usize;

        let mut hook = BranchHook::jump();
        unsafe {
            hook.install(loc, 0x4000).unwrap();
            assert_ne!(buf, before);

            hook.uninstall().unwrap();
            assert_eq!(buf, before);

            hook.uninstall().unwrap();
            assert_eq!(buf, before);
        }
        assert!(!hook.installed());
    }

    #[test]
    fn verify_detects_clobbering() {
        let mut buf = code_buf();
        let loc = buf.as_mut_ptr() as usize;

        let mut hook = BranchHook::call();
        unsafe {
            hook.install(loc, 0x5000).unwrap();
            assert!(hook.verify().unwrap());

            buf[1] ^= 0xff;
            assert!(!hook.verify().unwrap());

            hook.reinstall().unwrap();
            assert!(hook.verify().unwrap());
        }
    }

    #[test]
    fn reinstall_preserves_original_bytes() {
        let mut buf: Vec<u8> = (0x40..0x40 + 2 * BRANCH_PATCH_SIZE as u8).collect();
        let before = buf.clone();
        let loc = buf.as_mut_ptr() as usize;

        let mut hook = BranchHook::jump();
        unsafe {
            hook.install(loc, 0x6000).unwrap();

            // External clobber of the patched region.
            for b in buf.iter_mut().take(BRANCH_PATCH_SIZE) {
                *b = 0xcc;
            }

            hook.reinstall().unwrap();
            hook.uninstall().unwrap();
        }
        assert_eq!(buf, before);
    }

    #[test]
    fn reinstall_before_install_is_an_error() {
        let mut hook = BranchHook::jump();
        assert_eq!(unsafe { hook.reinstall() }, Err(HookError::NotInstalled));
    }
}
