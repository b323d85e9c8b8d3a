use object::SymbolKind;
use scroll::Pread;

use crate::elf::{ElfReader, SymInfo};
use crate::{btf_error, BtfResult};

/// Static bound on collected per-CPU variables.
pub const MAX_PERCPU_VARS: usize = 4096;

/// Same limit as the kernel's KSYM_NAME_LEN.
pub const MAX_NAME_LEN: usize = 128;

const FUNCTIONS_FLOOR: usize = 1000;

#[derive(Debug, Clone)]
pub struct ElfFunction<'d> {
    pub name: &'d str,
    pub addr: u64,
    pub generated: bool,
}

#[derive(Debug, Clone)]
pub struct PercpuVar<'d> {
    pub addr: u64,
    pub size: u32,
    pub name: &'d str,
}

/// Values of the linker-script symbols that delimit the ftrace mcount-loc
/// table and the init sections, plus the section holding the table. The
/// ftrace filter only runs when all six are present.
#[derive(Debug, Default)]
pub struct FuncBoundaries {
    pub mcount_start: u64,
    pub mcount_stop: u64,
    pub init_begin: u64,
    pub init_end: u64,
    pub init_bpf_begin: u64,
    pub init_bpf_end: u64,
    pub mcount_sec_idx: usize,
}

impl FuncBoundaries {
    pub fn is_complete(&self) -> bool {
        self.mcount_start != 0
            && self.mcount_stop != 0
            && self.init_begin != 0
            && self.init_end != 0
            && self.init_bpf_begin != 0
            && self.init_bpf_end != 0
    }
}

fn name_char_ok(c: char, first: bool) -> bool {
    if c == '_' || c == '.' {
        return true;
    }
    if first {
        c.is_ascii_alphabetic()
    } else {
        c.is_ascii_alphanumeric()
    }
}

/// Check whether the given name is valid in vmlinux btf.
pub fn btf_name_valid(name: &str) -> bool {
    if name.len() >= MAX_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if name_char_ok(c, true) => {}
        _ => return false,
    }
    chars.all(|c| name_char_ok(c, false))
}

pub fn dump_invalid_symbol(msg: &str, sym: &str, verbose: bool, force: bool) {
    if force {
        if verbose {
            eprintln!("PAHOLE: Warning: {}, ignored (sym: '{}').", msg, sym);
        }
        return;
    }
    eprintln!("PAHOLE: Error: {} (sym: '{}').", msg, sym);
    eprintln!("PAHOLE: Error: Use '--btf_encode_force' to ignore such symbols and force emit the btf.");
}

/// One pass over the EO's symbol table: function candidates, per-CPU
/// variables and the boundary symbols, all collected together.
pub struct SymbolIndex<'d> {
    pub functions: Vec<ElfFunction<'d>>,
    pub percpu_vars: Vec<PercpuVar<'d>>,
    pub boundaries: FuncBoundaries,
}

impl<'d> SymbolIndex<'d> {
    pub fn collect(
        elf: &ElfReader<'d>,
        collect_percpu_vars: bool,
        force: bool,
        verbose: bool,
    ) -> BtfResult<SymbolIndex<'d>> {
        let mut index = SymbolIndex {
            functions: Vec::with_capacity(FUNCTIONS_FLOOR),
            percpu_vars: Vec::new(),
            boundaries: FuncBoundaries::default(),
        };

        for sym in elf.symtab() {
            if collect_percpu_vars {
                index.collect_percpu_var(elf, &sym, force, verbose)?;
            }
            index.collect_function(&sym);
            index.collect_boundary(&sym);
        }

        if collect_percpu_vars {
            index.percpu_vars.sort_by_key(|v| v.addr);
            if verbose {
                println!("Found {} per-CPU variables!", index.percpu_vars.len());
            }
        }

        if !index.functions.is_empty() && index.boundaries.is_complete() {
            index.functions.sort_by(|a, b| a.name.cmp(b.name));
            filter_functions(&mut index.functions, &index.boundaries, elf)
                .map_err(|e| format!("Failed to filter dwarf functions: {}", e))?;
            if verbose {
                println!("Found {} functions!", index.functions.len());
            }
        } else {
            if verbose {
                println!("vmlinux not detected, falling back to dwarf data");
            }
            index.functions = Vec::new();
        }

        Ok(index)
    }

    fn collect_function(&mut self, sym: &SymInfo<'d>) {
        if sym.kind != SymbolKind::Text {
            return;
        }
        if sym.value == 0 {
            return;
        }
        self.functions.push(ElfFunction {
            name: sym.name,
            addr: sym.value,
            generated: false,
        });
    }

    fn collect_percpu_var(
        &mut self,
        elf: &ElfReader<'d>,
        sym: &SymInfo<'d>,
        force: bool,
        verbose: bool,
    ) -> BtfResult<()> {
        // a symbol's shndx decides whether it's a per-CPU variable
        if elf.percpu_shndx() == 0 || sym.section_index != elf.percpu_shndx() {
            return Ok(());
        }
        if sym.kind != SymbolKind::Data {
            return Ok(());
        }
        // Only symbols with allocated space in the per-CPU section matter;
        // zero values cover addressable markers and unique-id labels, zero
        // sizes cover section-anchor symbols.
        if sym.value == 0 {
            return Ok(());
        }
        if sym.size == 0 {
            return Ok(());
        }
        if !btf_name_valid(sym.name) {
            dump_invalid_symbol(
                "Found symbol of invalid name when encoding btf",
                sym.name,
                verbose,
                force,
            );
            if force {
                return Ok(());
            }
            return btf_error(format!("Invalid per-CPU symbol name: '{}'", sym.name));
        }
        if verbose {
            println!("Found per-CPU symbol '{}' at address 0x{:x}", sym.name, sym.value);
        }
        if self.percpu_vars.len() == MAX_PERCPU_VARS {
            return btf_error(format!(
                "Reached the limit of per-CPU variables: {}",
                MAX_PERCPU_VARS
            ));
        }
        self.percpu_vars.push(PercpuVar {
            addr: sym.value,
            size: sym.size as u32,
            name: sym.name,
        });
        Ok(())
    }

    fn collect_boundary(&mut self, sym: &SymInfo<'d>) {
        let fl = &mut self.boundaries;
        if fl.mcount_start == 0 && sym.name == "__start_mcount_loc" {
            fl.mcount_start = sym.value;
            fl.mcount_sec_idx = sym.section_index;
        }
        if fl.mcount_stop == 0 && sym.name == "__stop_mcount_loc" {
            fl.mcount_stop = sym.value;
        }
        if fl.init_begin == 0 && sym.name == "__init_begin" {
            fl.init_begin = sym.value;
        }
        if fl.init_end == 0 && sym.name == "__init_end" {
            fl.init_end = sym.value;
        }
        if fl.init_bpf_begin == 0 && sym.name == "__init_bpf_preserve_type_begin" {
            fl.init_bpf_begin = sym.value;
        }
        if fl.init_bpf_end == 0 && sym.name == "__init_bpf_preserve_type_end" {
            fl.init_bpf_end = sym.value;
        }
    }

    pub fn percpu_var_by_addr(&self, addr: u64) -> Option<&PercpuVar<'d>> {
        self.percpu_vars
            .binary_search_by_key(&addr, |v| v.addr)
            .ok()
            .map(|i| &self.percpu_vars[i])
    }

    /// Marks `name` generated and reports whether a FUNC record should be
    /// emitted for it; each admitted name fires exactly once per EO.
    pub fn should_generate_function(&mut self, name: &str) -> bool {
        match self.functions.binary_search_by(|f| f.name.cmp(name)) {
            Ok(i) => {
                if self.functions[i].generated {
                    false
                } else {
                    self.functions[i].generated = true;
                    true
                }
            }
            Err(_) => false,
        }
    }
}

fn is_init(fl: &FuncBoundaries, addr: u64) -> bool {
    addr >= fl.init_begin && addr < fl.init_end
}

fn is_bpf_init(fl: &FuncBoundaries, addr: u64) -> bool {
    addr >= fl.init_bpf_begin && addr < fl.init_bpf_end
}

/// Intersects the candidates with the ftrace mcount-loc table, dropping
/// init-section functions unless they sit in the bpf preserve-type range.
/// The pass is linear over the name-sorted array, so survivors keep their
/// order.
fn filter_functions(
    functions: &mut Vec<ElfFunction>,
    fl: &FuncBoundaries,
    elf: &ElfReader,
) -> BtfResult<()> {
    let (sh_addr, data) = elf.section(fl.mcount_sec_idx)?;

    let offset = (fl.mcount_start - sh_addr) as usize;
    let count = ((fl.mcount_stop - fl.mcount_start) / 8) as usize;

    let mut addrs = Vec::with_capacity(count);
    for i in 0..count {
        addrs.push(data.pread_with::<u64>(offset + i * 8, elf.endian())?);
    }
    addrs.sort_unstable();

    functions.retain(|func| {
        // Do not enable .init section functions,
        // but keep .init.bpf.preserve_type functions.
        if is_init(fl, func.addr) && !is_bpf_init(fl, func.addr) {
            return false;
        }
        // Make sure the function is within ftrace addresses.
        addrs.binary_search(&func.addr).is_ok()
    });
    Ok(())
}
