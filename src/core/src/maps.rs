use crate::error::Result;
use nix::sys::mman::ProtFlags;
use procfs::process::{MMPermissions, MMapPath, MemoryMap, Process};
use std::path::PathBuf;

/// The span of consecutive mappings covering an address range, with the
/// protection every one of them grants.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub prot: ProtFlags,
}

impl Region {
    pub fn readable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_READ)
    }

    pub fn writable(&self) -> bool {
        self.prot.contains(ProtFlags::PROT_WRITE)
    }
}

/// A shared object mapped into this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedLibrary {
    pub path: PathBuf,
    pub base: usize,
}

fn snapshot() -> Result<Vec<MemoryMap>> {
    let maps = Process::myself()
        .and_then(|process| process.maps())
        .map_err(|err| std::io::Error::other(err.to_string()))?;

    let mut maps: Vec<_> = maps.into_iter().collect();
    maps.sort_by_key(|map| map.address.0);

    Ok(maps)
}

fn prot_of(perms: MMPermissions) -> ProtFlags {
    let mut prot = ProtFlags::PROT_NONE;

    if perms.contains(MMPermissions::READ) {
        prot |= ProtFlags::PROT_READ;
    }
    if perms.contains(MMPermissions::WRITE) {
        prot |= ProtFlags::PROT_WRITE;
    }
    if perms.contains(MMPermissions::EXECUTE) {
        prot |= ProtFlags::PROT_EXEC;
    }

    prot
}

/// Looks up `[addr, addr + len)`. `None` when any byte of it is unmapped.
pub fn region_of(addr: usize, len: usize) -> Result<Option<Region>> {
    Ok(covering(&snapshot()?, addr, len))
}

fn covering(maps: &[MemoryMap], addr: usize, len: usize) -> Option<Region> {
    let end = addr.checked_add(len.max(1))?;
    let mut cursor = addr;
    let mut region: Option<Region> = None;

    for map in maps {
        let (start, stop) = (map.address.0 as usize, map.address.1 as usize);

        if stop <= cursor {
            continue;
        }
        if start > cursor {
            return None;
        }

        let prot = prot_of(map.perms);
        region = Some(match region {
            None => Region { start, end: stop, prot },
            Some(region) => Region {
                end: stop,
                prot: region.prot & prot,
                ..region
            },
        });

        if stop >= end {
            return region;
        }
        cursor = stop;
    }

    None
}

fn matches_library(path: &std::path::Path, library: &str) -> bool {
    if library.starts_with('/') {
        return path == std::path::Path::new(library);
    }

    path.file_name().is_some_and(|name| name == library)
}

/// Finds a loaded library by basename or absolute path. The base is the
/// start of its zero-offset mapping.
pub fn find_library(library: &str) -> Result<Option<MappedLibrary>> {
    Ok(snapshot()?.into_iter().find_map(|map| match map.pathname {
        MMapPath::Path(path) if map.offset == 0 && matches_library(&path, library) => {
            Some(MappedLibrary {
                path,
                base: map.address.0 as usize,
            })
        }
        _ => None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_is_readable_and_writable() {
        let value = Box::new(0u64);
        let addr = &*value as *const u64 as usize;

        let region = region_of(addr, 8).unwrap().expect("heap must be mapped");
        assert!(region.readable());
        assert!(region.writable());
        assert!(region.start <= addr && addr + 8 <= region.end);
    }

    #[test]
    fn code_is_not_writable() {
        let addr = heap_is_readable_and_writable as fn() as usize;

        let region = region_of(addr, 4).unwrap().expect("text must be mapped");
        assert!(region.prot.contains(ProtFlags::PROT_EXEC));
        assert!(!region.writable());
    }

    #[test]
    fn null_page_is_unmapped() {
        assert_eq!(region_of(0x10, 8).unwrap(), None);
    }

    #[test]
    fn finds_libc() {
        let libc = find_library("libc.so.6")
            .unwrap()
            .or(find_library("libc.so").unwrap())
            .expect("libc is always mapped");

        assert_ne!(libc.base, 0);
        assert!(find_library("libdefinitely-not-loaded.so").unwrap().is_none());
    }
}
