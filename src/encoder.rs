//! The DWARF-to-BTF encoding pipeline for one EO: per-CU type emission with
//! the id-drift check, function selection (ftrace-filtered or
//! declaration-based), per-CPU variable reconciliation against the symbol
//! table, and final image production.

use crate::builder::BtfBuilder;
use crate::elf::ElfReader;
use crate::graph::{CompositeKind, Cu, LocalId, Param, RefKind, Type, VarScope};
use crate::symbols::SymbolIndex;
use crate::types::*;
use crate::{btf_error, BtfResult};

pub const ARRAY_INDEX_TYPE_NAME: &str = "__ARRAY_SIZE_TYPE__";

#[derive(Debug, Clone, Default)]
pub struct EncoderConfig {
    pub verbose: bool,
    pub force: bool,
    pub skip_encoding_vars: bool,
}

#[derive(Debug, Copy, Clone, PartialEq)]
enum SessionState {
    Idle,
    Active,
    Closed,
}

/// Per-EO encoding state. Created once per object file, fed every CU of
/// that file in order, then consumed by `finalize` which yields the BTF
/// image bytes; errors close the session without producing any bytes.
pub struct EncoderSession<'d> {
    state: SessionState,
    filename: String,
    cfg: EncoderConfig,
    builder: BtfBuilder,
    symbols: SymbolIndex<'d>,
    percpu_shndx: usize,
    percpu_base_addr: u64,
    array_index_id: u32,
    has_index_type: bool,
    need_index_type: bool,
}

impl<'d> EncoderSession<'d> {
    pub fn new(
        elf: &ElfReader<'d>,
        filename: &str,
        cfg: EncoderConfig,
        base: Option<&Btf>,
    ) -> BtfResult<EncoderSession<'d>> {
        let base_nr = base.map(|b| b.type_cnt() - 1).unwrap_or(0);
        let symbols = SymbolIndex::collect(elf, !cfg.skip_encoding_vars, cfg.force, cfg.verbose)?;
        if cfg.verbose {
            println!("File {}:", filename);
        }
        Ok(EncoderSession {
            state: SessionState::Idle,
            filename: filename.to_owned(),
            builder: BtfBuilder::with_base(elf.endian(), base_nr),
            symbols: symbols,
            percpu_shndx: elf.percpu_shndx(),
            percpu_base_addr: elf.percpu_base_addr(),
            cfg: cfg,
            array_index_id: 0,
            has_index_type: false,
            need_index_type: false,
        })
    }

    /// Encode one CU's types, functions and per-CPU variables.
    pub fn encode_cu(&mut self, cu: &Cu) -> BtfResult<()> {
        match self.state {
            SessionState::Closed => {
                return btf_error("Session already finalized".to_string());
            }
            SessionState::Idle => {
                self.state = SessionState::Active;
            }
            SessionState::Active => {}
        }
        if cu.filename != self.filename {
            return btf_error(format!(
                "CU from '{}' fed to a session encoding '{}'",
                cu.filename, self.filename
            ));
        }

        let type_id_off = self.builder.type_cnt();

        if !self.has_index_type {
            // BTF arrays need an index type id; borrow the CU's own "int"
            // when it has one, otherwise reserve the id right after the
            // CU's dense table for a synthetic stand-in.
            match cu.find_base_type("int") {
                Some(id) => {
                    self.has_index_type = true;
                    self.array_index_id = type_id_off + id;
                }
                None => {
                    self.array_index_id = type_id_off + cu.dense_table_len();
                }
            }
        }

        for (core_id, t) in cu.iter_types() {
            let btf_type_id = self.encode_type(cu, t, type_id_off)?;
            if btf_type_id != core_id + type_id_off {
                return btf_error(format!(
                    "{} id drift, core_id: {}, btf_type_id: {}, type_id_off: {}",
                    t.kind_name(),
                    core_id,
                    btf_type_id,
                    type_id_off
                ));
            }
        }

        if self.need_index_type && !self.has_index_type {
            self.builder
                .add_int(ARRAY_INDEX_TYPE_NAME, 32, BtfIntEncoding::None)?;
            self.has_index_type = true;
        }

        self.encode_functions(cu, type_id_off)?;

        if !self.cfg.skip_encoding_vars {
            self.encode_percpu_vars(cu, type_id_off)?;
        }
        Ok(())
    }

    /// Emit the pending synthetic index type and the per-CPU DATASEC, then
    /// serialize the table. Consuming `self` makes the single-use contract
    /// part of the signature.
    pub fn finalize(mut self) -> BtfResult<Vec<u8>> {
        if self.state == SessionState::Closed {
            return btf_error("Session already finalized".to_string());
        }
        self.state = SessionState::Closed;

        if self.need_index_type && !self.has_index_type {
            self.builder
                .add_int(ARRAY_INDEX_TYPE_NAME, 32, BtfIntEncoding::None)?;
            self.has_index_type = true;
        }
        if self.builder.percpu_secinfo_cnt() != 0 {
            self.builder.add_datasec(PERCPU_SECTION)?;
        }
        self.builder.encode()
    }

    fn encode_type(&mut self, cu: &Cu, t: &Type, type_id_off: u32) -> BtfResult<u32> {
        match t {
            Type::Base {
                name,
                bits,
                encoding,
            } => self
                .builder
                .add_int(cu.string(*name).unwrap_or(""), *bits, *encoding),
            Type::Ref { kind, type_ref } => {
                let btf_kind = match kind {
                    RefKind::Pointer => BTF_KIND_PTR,
                    RefKind::Const => BTF_KIND_CONST,
                    RefKind::Volatile => BTF_KIND_VOLATILE,
                    RefKind::Restrict => BTF_KIND_RESTRICT,
                };
                self.builder
                    .add_ref_type(btf_kind, remap(*type_ref, type_id_off), None, false)
            }
            Type::Typedef { name, type_ref } => self.builder.add_ref_type(
                BTF_KIND_TYPEDEF,
                remap(*type_ref, type_id_off),
                cu.string(*name),
                false,
            ),
            Type::Composite {
                kind,
                name,
                size,
                declaration,
                members,
            } => {
                let is_union = *kind == CompositeKind::Union;
                if *declaration {
                    return self
                        .builder
                        .add_ref_type(BTF_KIND_FWD, 0, cu.string(*name), is_union);
                }
                let btf_kind = if is_union {
                    BTF_KIND_UNION
                } else {
                    BTF_KIND_STRUCT
                };
                let type_id =
                    self.builder
                        .add_struct(btf_kind, cu.string(*name).unwrap_or(""), *size)?;
                for m in members {
                    // Bit offsets come from the loader in DWARF's recommended
                    // addressing scheme, which matches what BTF wants.
                    self.builder.add_member(
                        cu.string(m.name).unwrap_or(""),
                        type_id_off + m.type_ref,
                        m.bit_offset,
                        m.bitfield_size,
                    )?;
                }
                Ok(type_id)
            }
            Type::Array { elem, dims } => {
                // TODO: encode one dimension at a time
                self.need_index_type = true;
                let nelems = dims.iter().product();
                self.builder
                    .add_array(remap(*elem, type_id_off), self.array_index_id, nelems)
            }
            Type::Enum {
                name,
                size,
                enumerators,
            } => {
                let type_id = self
                    .builder
                    .add_enum(cu.string(*name).unwrap_or(""), *size)?;
                for e in enumerators {
                    self.builder
                        .add_enum_val(cu.string(e.name).unwrap_or(""), e.value)?;
                }
                Ok(type_id)
            }
            Type::FuncProto { ret, params } => {
                self.encode_func_proto(cu, *ret, params, type_id_off)
            }
            Type::Unsupported { tag } => btf_error(format!("Unsupported {}", tag)),
        }
    }

    fn encode_func_proto(
        &mut self,
        cu: &Cu,
        ret: LocalId,
        params: &[Param],
        type_id_off: u32,
    ) -> BtfResult<u32> {
        let mut btf_params = Vec::with_capacity(params.len());
        for p in params {
            btf_params.push(BtfFuncParam {
                name: cu.string(p.name).unwrap_or("").to_owned(),
                type_id: remap(p.type_ref, type_id_off),
            });
        }
        self.builder.add_func_proto(remap(ret, type_id_off), btf_params)
    }

    fn encode_functions(&mut self, cu: &Cu, type_id_off: u32) -> BtfResult<()> {
        for func in &cu.functions {
            let name = cu.string(func.name).unwrap_or("");
            // A non-empty candidate list means the boundary symbols were all
            // found and the ftrace location filter applies; without it the
            // DWARF declaration criterion decides.
            if !self.symbols.functions.is_empty() {
                if !func.params.iter().all(|p| cu.string(p.name).is_some()) {
                    continue;
                }
                if !self.symbols.should_generate_function(name) {
                    continue;
                }
            } else if func.declaration || !func.external {
                continue;
            }

            let proto_id = self.encode_func_proto(cu, func.ret, &func.params, type_id_off)?;
            self.builder
                .add_ref_type(BTF_KIND_FUNC, proto_id, Some(name), false)
                .map_err(|e| format!("Failed to encode function '{}': {}", name, e))?;
        }
        Ok(())
    }

    fn encode_percpu_vars(&mut self, cu: &Cu, type_id_off: u32) -> BtfResult<()> {
        if self.percpu_shndx == 0 {
            return Ok(());
        }
        if self.cfg.verbose {
            println!("search cu '{}' for percpu global variables.", cu.name);
        }

        for var in &cu.variables {
            if var.declaration && var.spec.is_none() {
                continue;
            }
            // per-CPU variables live in global scope
            if var.scope != VarScope::Global && var.spec.is_none() {
                continue;
            }

            // the address sits on the defining DIE, the type on the
            // specification, so grab it before following the link
            let addr = var.addr;
            let var = match var.spec {
                Some(i) => &cu.variables[i],
                None => var,
            };

            let (size, name) = match self.symbols.percpu_var_by_addr(addr) {
                Some(p) => (p.size, p.name),
                None => continue, // not a per-CPU variable
            };

            if var.type_ref == 0 {
                eprintln!(
                    "PAHOLE: Error: found variable '{}' in CU '{}' that has void type",
                    name, cu.name
                );
                if self.cfg.force {
                    continue;
                }
                return btf_error(format!("Variable '{}' has void type", name));
            }

            let type_id = var.type_ref + type_id_off;
            let linkage = if var.external {
                BtfVarKind::GlobalAlloc
            } else {
                BtfVarKind::Static
            };

            if self.cfg.verbose {
                println!(
                    "Variable '{}' from CU '{}' at address 0x{:x} encoded",
                    name, cu.name, addr
                );
            }

            let var_id = self
                .builder
                .add_var(name, type_id, linkage)
                .map_err(|e| {
                    format!(
                        "Failed to encode variable '{}' at addr 0x{:x}: {}",
                        name, addr, e
                    )
                })?;
            let offset = (addr - self.percpu_base_addr) as u32;
            self.builder.add_var_secinfo(var_id, offset, size);
        }
        Ok(())
    }
}

fn remap(local: LocalId, type_id_off: u32) -> u32 {
    // type 0 stands for void and never moves
    if local == 0 {
        0
    } else {
        local + type_id_off
    }
}
