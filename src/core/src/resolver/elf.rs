use crate::error::{Error, Result};
use mockgps_common::ext::ResultExt;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol};
use std::fs;
use std::path::Path;

/// Symbol tables of an ELF file on disk, including the xz-compressed
/// `.gnu_debugdata` section Android ships in place of a full `.symtab`.
pub struct ElfImage {
    data: Vec<u8>,
}

impl ElfImage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_data(fs::read(path)?))
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    fn parse(&self) -> Result<object::File<'_>> {
        object::File::parse(self.data.as_slice()).map_err(|err| Error::resolution("elf image", err))
    }

    /// Lowest virtual address of a loadable segment, i.e. what the load base
    /// of the mapping corresponds to.
    pub fn load_bias(&self) -> Result<u64> {
        Ok(self
            .parse()?
            .segments()
            .map(|segment| segment.address())
            .min()
            .unwrap_or(0))
    }

    /// Virtual address of the first defined symbol named `name`.
    pub fn find(&self, name: &str) -> Result<Option<u64>> {
        let file = self.parse()?;

        let found = file
            .dynamic_symbols()
            .chain(file.symbols())
            .find(|sym| sym.is_definition() && sym.address() != 0 && sym.name().is_ok_and(|it| it == name))
            .map(|sym| sym.address());

        if found.is_some() {
            return Ok(found);
        }

        Ok(self.debug_data(&file).and_then(|image| image.find(name).ok_or_warn().flatten()))
    }

    /// Address relative to the load base, ready to add to the mapping start.
    pub fn find_offset(&self, name: &str) -> Result<Option<usize>> {
        let bias = self.load_bias()?;
        Ok(self.find(name)?.map(|addr| addr.saturating_sub(bias) as usize))
    }

    fn debug_data(&self, file: &object::File<'_>) -> Option<ElfImage> {
        let mut data = file
            .section_by_name(".gnu_debugdata")
            .and_then(|section| section.data().ok_or_warn())?;

        let mut decompressed = Vec::new();
        lzma_rs::xz_decompress(&mut data, &mut decompressed).ok_or_warn()?;

        Some(ElfImage::from_data(decompressed))
    }
}
