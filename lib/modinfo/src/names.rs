//!
//! @file names.rs
//! @author Andrew Spaulding (Kasplat)
//! @brief Resolves functions by name through the export and import tables.
//! @bug No known bugs.
//!
//! Name comparisons are case-insensitive and full-length. A query must match
//! the complete import name; a query that is merely a prefix of a longer
//! name does not resolve.
//!

use core::ffi::c_char;
use core::mem::size_of;
use std::ffi::CStr;
use std::ffi::CString;
use std::path::PathBuf;

use windows_sys::Win32::System::LibraryLoader::{
    GetModuleFileNameA, GetModuleHandleA, GetProcAddress
};
use windows_sys::Win32::System::SystemServices::{IMAGE_DOS_HEADER, IMAGE_IMPORT_DESCRIPTOR};
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_DIRECTORY_ENTRY_IMPORT;

use crate::ModuleDescriptor;

#[cfg(target_pointer_width = "64")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS64 as ImageNtHeaders;
#[cfg(target_pointer_width = "32")]
use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS32 as ImageNtHeaders;

/// Marks a thunk entry as an ordinal import, which carries no name.
#[cfg(target_pointer_width = "64")]
const ORDINAL_FLAG: usize = 1 << 63;
#[cfg(target_pointer_width = "32")]
const ORDINAL_FLAG: usize = 1 << 31;

/// Reads the primary module's descriptor out of its image headers.
pub (in crate) unsafe fn read_current_module() -> ModuleDescriptor {
    let base = GetModuleHandleA(core::ptr::null()) as usize;
    assert!(base != 0);

    let dos = base as *const IMAGE_DOS_HEADER;
    let nt = (base + (*dos).e_lfanew as usize) as *const ImageNtHeaders;
    let code_end = base + (*nt).OptionalHeader.SizeOfCode as usize;

    let mut buf = [0u8; 2048];
    let len = GetModuleFileNameA(0, buf.as_mut_ptr(), buf.len() as u32) as usize;
    let path = PathBuf::from(String::from_utf8_lossy(buf.split_at(len).0).into_owned());

    ModuleDescriptor::from_parts(base, code_end, path)
}

///
/// Resolves the address of a function exported by a loaded module.
///
/// Returns None if the module is not loaded or does not export the name.
///
pub fn export_address(
    module: &str,
    symbol: &str
) -> Option<usize> {
    let module = CString::new(module).ok()?;
    let symbol = CString::new(symbol).ok()?;

    unsafe {
        // SAFETY: Both names are valid, null terminated, C strings.
        let handle = GetModuleHandleA(module.as_ptr() as *const u8);
        if handle == 0 {
            return None;
        }

        GetProcAddress(handle, symbol.as_ptr() as *const u8).map(|f| f as usize)
    }
}

///
/// Locates the bound import-table slot the loader patched for the given
/// (module, import) pair in the process's primary image.
///
/// The returned address is the slot the process actually calls through;
/// swapping the pointer stored there intercepts every such call. Returns
/// None if the primary image does not import the name from the module.
///
pub fn import_slot(
    module: &str,
    symbol: &str
) -> Option<usize> {
    unsafe {
        // SAFETY: The primary module's image is mapped for the process
        //         lifetime, and its header offsets come from the loader.
        find_import_slot(ModuleDescriptor::current().base(), module, symbol)
    }
}

unsafe fn find_import_slot(
    base: usize,
    module: &str,
    symbol: &str
) -> Option<usize> {
    let dos = base as *const IMAGE_DOS_HEADER;
    let nt = (base + (*dos).e_lfanew as usize) as *const ImageNtHeaders;

    let dir = &(*nt).OptionalHeader.DataDirectory[IMAGE_DIRECTORY_ENTRY_IMPORT as usize];
    if dir.VirtualAddress == 0 {
        return None;
    }

    let mut desc = (base + dir.VirtualAddress as usize) as *const IMAGE_IMPORT_DESCRIPTOR;
    while (*desc).FirstThunk != 0 {
        let dll = cstr_bytes(base + (*desc).Name as usize);
        if dll.eq_ignore_ascii_case(module.as_bytes()) {
            //
            // The name table describes the imports; the bound thunk array
            // (FirstThunk) holds the pointers the loader resolved and is
            // where a swap must land. Some linkers omit the separate name
            // table, in which case the bound array doubles as it.
            //
            let names = (*desc).Anonymous.OriginalFirstThunk;
            let names = if names != 0 { names } else { (*desc).FirstThunk };

            let mut entry = (base + names as usize) as *const usize;
            let mut index = 0usize;
            while *entry != 0 {
                if *entry & ORDINAL_FLAG == 0 {
                    // The entry points at a hint word followed by the name.
                    let name = cstr_bytes(base + (*entry & !ORDINAL_FLAG) + 2);
                    if name.eq_ignore_ascii_case(symbol.as_bytes()) {
                        return Some(
                            base + (*desc).FirstThunk as usize + index * size_of::<usize>()
                        );
                    }
                }

                entry = entry.add(1);
                index += 1;
            }

            // The module matched but the import is absent; no other
            // descriptor can satisfy the query.
            return None;
        }

        desc = desc.add(1);
    }

    None
}

/// Reads the bytes of a null terminated string at the given address.
unsafe fn cstr_bytes(
    addr: usize
) -> &'static [u8] {
    CStr::from_ptr(addr as *const c_char).to_bytes()
}
