use super::NativeLookup;
use super::elf::ElfImage;
use crate::maps;
use log::trace;
use mockgps_common::ext::ResultExt;
use std::ffi::CString;

mod system {
    use std::ffi::{c_char, c_int, c_void};

    pub const RTLD_NOW: c_int = 0x2;
    pub const RTLD_NOLOAD: c_int = 0x4;

    unsafe extern "C" {
        pub fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void;
        pub fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
        pub fn dlclose(handle: *mut c_void) -> c_int;
    }
}

/// Resolves against the libraries of the running process: the dynamic
/// linker first, then the symbol tables of the mapped file for symbols the
/// linker does not export.
#[derive(Debug, Default, Copy, Clone)]
pub struct ProcessLookup;

impl ProcessLookup {
    fn dlsym(library: &str, symbol: &str) -> Option<usize> {
        let library = CString::new(library).ok()?;
        let symbol = CString::new(symbol).ok()?;

        unsafe {
            let handle = system::dlopen(library.as_ptr(), system::RTLD_NOW | system::RTLD_NOLOAD);
            if handle.is_null() {
                return None;
            }

            let address = system::dlsym(handle, symbol.as_ptr());
            system::dlclose(handle);

            (!address.is_null()).then_some(address as usize)
        }
    }

    fn from_symbol_table(library: &str, symbol: &str) -> Option<usize> {
        let mapped = maps::find_library(library).ok_or_warn().flatten()?;
        let offset = ElfImage::open(&mapped.path)
            .and_then(|image| image.find_offset(symbol))
            .ok_or_warn()
            .flatten()?;

        Some(mapped.base + offset)
    }
}

impl NativeLookup for ProcessLookup {
    fn is_loaded(&self, library: &str) -> bool {
        maps::find_library(library).ok_or_warn().flatten().is_some()
    }

    fn lookup(&self, library: &str, symbol: &str) -> Option<usize> {
        if let Some(address) = Self::dlsym(library, symbol) {
            trace!("{library}!{symbol} via dlsym: {address:#x}");
            return Some(address);
        }

        let address = Self::from_symbol_table(library, symbol)?;
        trace!("{library}!{symbol} via symbol table: {address:#x}");

        Some(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libc_name() -> &'static str {
        if maps::find_library("libc.so.6").unwrap().is_some() {
            "libc.so.6"
        } else {
            "libc.so"
        }
    }

    #[test]
    fn dlsym_and_symbol_table_agree() {
        let libc = libc_name();

        let linked = ProcessLookup::dlsym(libc, "getpid").unwrap();
        let parsed = ProcessLookup::from_symbol_table(libc, "getpid").unwrap();

        assert_eq!(linked, parsed);
    }

    #[test]
    fn unloaded_library_is_not_found() {
        let lookup = ProcessLookup;

        assert!(!lookup.is_loaded("libmockgps-missing.so"));
        assert_eq!(lookup.lookup("libmockgps-missing.so", "getpid"), None);
        assert!(lookup.is_loaded(libc_name()));
    }
}
