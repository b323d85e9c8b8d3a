use object::{BinaryFormat, Object, ObjectSection, ObjectSymbol, SectionIndex, SymbolKind};

use crate::types::PERCPU_SECTION;
use crate::{btf_error, BtfResult};

/// One symbol-table entry, with the name borrowed from the EO's data.
#[derive(Debug, Clone)]
pub struct SymInfo<'d> {
    pub name: &'d str,
    pub value: u64,
    pub size: u64,
    pub kind: SymbolKind,
    pub section_index: usize,
}

/// Read-side view of the EO: symbol table, section data and the per-CPU
/// section coordinates the encoder needs.
pub struct ElfReader<'d> {
    obj: object::File<'d>,
    endian: scroll::Endian,
    percpu_shndx: usize,
    percpu_base_addr: u64,
}

impl<'d> ElfReader<'d> {
    pub fn parse(data: &'d [u8]) -> BtfResult<ElfReader<'d>> {
        let obj = object::File::parse(data)?;
        if obj.format() != BinaryFormat::Elf {
            return btf_error("Object file is not ELF".to_string());
        }
        let endian = if obj.is_little_endian() {
            scroll::LE
        } else {
            scroll::BE
        };
        let (percpu_shndx, percpu_base_addr) = match obj.section_by_name(PERCPU_SECTION) {
            Some(sec) => (sec.index().0, sec.address()),
            None => (0, 0),
        };
        Ok(ElfReader {
            obj: obj,
            endian: endian,
            percpu_shndx: percpu_shndx,
            percpu_base_addr: percpu_base_addr,
        })
    }

    pub fn endian(&self) -> scroll::Endian {
        self.endian
    }

    pub fn object(&self) -> &object::File<'d> {
        &self.obj
    }

    pub fn has_symtab(&self) -> bool {
        self.obj.symbols().next().is_some()
    }

    /// Section index of `.data..percpu`, or 0 when the EO has none.
    pub fn percpu_shndx(&self) -> usize {
        self.percpu_shndx
    }

    pub fn percpu_base_addr(&self) -> u64 {
        self.percpu_base_addr
    }

    pub fn symtab(&self) -> impl Iterator<Item = SymInfo<'d>> + '_ {
        self.obj.symbols().filter_map(|sym| {
            let name = sym.name().ok()?;
            Some(SymInfo {
                name: name,
                value: sym.address(),
                size: sym.size(),
                kind: sym.kind(),
                section_index: sym.section_index().map(|i| i.0).unwrap_or(0),
            })
        })
    }

    /// Load address and raw contents of the section at `index`.
    pub fn section(&self, index: usize) -> BtfResult<(u64, &'d [u8])> {
        let sec = self
            .obj
            .section_by_index(SectionIndex(index))
            .map_err(|e| format!("Failed to get section({}) header: {}", index, e))?;
        let data = sec
            .data()
            .map_err(|e| format!("Failed to get section({}) data: {}", index, e))?;
        Ok((sec.address(), data))
    }
}
