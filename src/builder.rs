use std::collections::HashMap;
use std::mem::size_of;

use scroll::Pwrite;

use crate::types::*;
use crate::{btf_error, BtfResult};

const BTF_MAX_VLEN: usize = 0xffff;

/// Accumulates BTF type records for one EO and serializes them into the
/// on-disk image (header + type section + string section). Type ids are
/// handed out in insertion order, continuing after `base_nr` slots already
/// occupied by a base BTF.
#[derive(Debug)]
pub struct BtfBuilder {
    endian: scroll::Endian,
    base_nr: u32,
    types: Vec<BtfType>,
    percpu_secinfo: Vec<BtfDatasecVar>,
}

impl BtfBuilder {
    pub fn new(endian: scroll::Endian) -> BtfBuilder {
        BtfBuilder::with_base(endian, 0)
    }

    pub fn with_base(endian: scroll::Endian, base_nr: u32) -> BtfBuilder {
        BtfBuilder {
            endian: endian,
            base_nr: base_nr,
            types: Vec::new(),
            percpu_secinfo: Vec::new(),
        }
    }

    /// Current number of types in the table, base BTF included.
    pub fn type_cnt(&self) -> u32 {
        self.base_nr + self.types.len() as u32
    }

    pub fn types(&self) -> &[BtfType] {
        &self.types
    }

    fn push(&mut self, t: BtfType) -> u32 {
        self.types.push(t);
        self.type_cnt()
    }

    pub fn add_int(&mut self, name: &str, bits: u32, encoding: BtfIntEncoding) -> BtfResult<u32> {
        if bits == 0 || bits > 128 {
            return btf_error(format!("Invalid int bit size: {}", bits));
        }
        Ok(self.push(BtfType::Int(BtfInt {
            name: name.to_owned(),
            bits: bits,
            offset: 0,
            encoding: encoding,
        })))
    }

    /// Single-reference kinds: PTR, CONST, VOLATILE, RESTRICT, TYPEDEF,
    /// FWD and FUNC all share the same record shape.
    pub fn add_ref_type(
        &mut self,
        kind: u32,
        type_id: u32,
        name: Option<&str>,
        is_union: bool,
    ) -> BtfResult<u32> {
        let name = name.unwrap_or("").to_owned();
        let t = match kind {
            BTF_KIND_PTR => BtfType::Ptr(BtfPtr { type_id: type_id }),
            BTF_KIND_CONST => BtfType::Const(BtfConst { type_id: type_id }),
            BTF_KIND_VOLATILE => BtfType::Volatile(BtfVolatile { type_id: type_id }),
            BTF_KIND_RESTRICT => BtfType::Restrict(BtfRestrict { type_id: type_id }),
            BTF_KIND_TYPEDEF => BtfType::Typedef(BtfTypedef {
                name: name,
                type_id: type_id,
            }),
            BTF_KIND_FWD => BtfType::Fwd(BtfFwd {
                name: name,
                kind: if is_union {
                    BtfFwdKind::Union
                } else {
                    BtfFwdKind::Struct
                },
            }),
            BTF_KIND_FUNC => BtfType::Func(BtfFunc {
                name: name,
                proto_type_id: type_id,
            }),
            _ => return btf_error(format!("Invalid ref kind: {}", kind)),
        };
        Ok(self.push(t))
    }

    pub fn add_struct(&mut self, kind: u32, name: &str, sz: u32) -> BtfResult<u32> {
        let comp = BtfComposite {
            is_struct: kind == BTF_KIND_STRUCT,
            name: name.to_owned(),
            sz: sz,
            members: Vec::new(),
        };
        let t = match kind {
            BTF_KIND_STRUCT => BtfType::Struct(comp),
            BTF_KIND_UNION => BtfType::Union(comp),
            _ => return btf_error(format!("Invalid composite kind: {}", kind)),
        };
        Ok(self.push(t))
    }

    /// Appends a member to the most recently added struct or union.
    pub fn add_member(
        &mut self,
        name: &str,
        type_id: u32,
        bit_offset: u32,
        bit_size: u8,
    ) -> BtfResult<()> {
        let comp = match self.types.last_mut() {
            Some(BtfType::Struct(c)) | Some(BtfType::Union(c)) => c,
            _ => return btf_error("add_member without a preceding struct/union".to_string()),
        };
        if comp.members.len() == BTF_MAX_VLEN {
            return btf_error(format!("Too many members in '{}'", comp.name));
        }
        comp.members.push(BtfMember {
            name: name.to_owned(),
            type_id: type_id,
            bit_offset: bit_offset,
            bit_size: bit_size,
        });
        Ok(())
    }

    pub fn add_enum(&mut self, name: &str, sz: u32) -> BtfResult<u32> {
        Ok(self.push(BtfType::Enum(BtfEnum {
            name: name.to_owned(),
            sz: sz,
            values: Vec::new(),
        })))
    }

    /// Appends an enumerator to the most recently added enum.
    pub fn add_enum_val(&mut self, name: &str, value: i32) -> BtfResult<()> {
        let e = match self.types.last_mut() {
            Some(BtfType::Enum(e)) => e,
            _ => return btf_error("add_enum_val without a preceding enum".to_string()),
        };
        if e.values.len() == BTF_MAX_VLEN {
            return btf_error(format!("Too many enumerators in '{}'", e.name));
        }
        e.values.push(BtfEnumValue {
            name: name.to_owned(),
            value: value,
        });
        Ok(())
    }

    pub fn add_array(&mut self, val_type_id: u32, idx_type_id: u32, nelems: u32) -> BtfResult<u32> {
        Ok(self.push(BtfType::Array(BtfArray {
            nelems: nelems,
            idx_type_id: idx_type_id,
            val_type_id: val_type_id,
        })))
    }

    pub fn add_func_proto(
        &mut self,
        res_type_id: u32,
        params: Vec<BtfFuncParam>,
    ) -> BtfResult<u32> {
        if params.len() > BTF_MAX_VLEN {
            return btf_error(format!("Too many params: {}", params.len()));
        }
        Ok(self.push(BtfType::FuncProto(BtfFuncProto {
            res_type_id: res_type_id,
            params: params,
        })))
    }

    pub fn add_var(&mut self, name: &str, type_id: u32, kind: BtfVarKind) -> BtfResult<u32> {
        Ok(self.push(BtfType::Var(BtfVar {
            name: name.to_owned(),
            type_id: type_id,
            kind: kind,
        })))
    }

    /// Queues a section-info entry for the deferred per-CPU DATASEC.
    pub fn add_var_secinfo(&mut self, type_id: u32, offset: u32, size: u32) {
        self.percpu_secinfo.push(BtfDatasecVar {
            type_id: type_id,
            offset: offset,
            sz: size,
        });
    }

    pub fn percpu_secinfo_cnt(&self) -> usize {
        self.percpu_secinfo.len()
    }

    /// Turns the queued section-info entries into one DATASEC record.
    pub fn add_datasec(&mut self, name: &str) -> BtfResult<u32> {
        if self.percpu_secinfo.is_empty() {
            return btf_error("add_datasec with no queued section infos".to_string());
        }
        let vars = std::mem::replace(&mut self.percpu_secinfo, Vec::new());
        Ok(self.push(BtfType::Datasec(BtfDatasec {
            name: name.to_owned(),
            sz: 0,
            vars: vars,
        })))
    }

    /// Serializes the accumulated table into a raw BTF image.
    pub fn encode(&self) -> BtfResult<Vec<u8>> {
        let mut strs = Strings::new();
        let type_len: usize = self.types.iter().map(type_size).sum();
        let mut buf = vec![0u8; type_len];
        let mut off: usize = 0;
        for t in &self.types {
            off = self.encode_type(t, &mut buf, off, &mut strs)?;
        }

        let hdr = btf_header {
            magic: BTF_MAGIC,
            version: BTF_VERSION,
            flags: 0,
            hdr_len: size_of::<btf_header>() as u32,
            type_off: 0,
            type_len: type_len as u32,
            str_off: type_len as u32,
            str_len: strs.buf.len() as u32,
        };
        let mut out = vec![0u8; size_of::<btf_header>()];
        out.pwrite_with(hdr, 0, self.endian)?;
        out.extend_from_slice(&buf);
        out.extend_from_slice(&strs.buf);
        Ok(out)
    }

    fn encode_type(
        &self,
        t: &BtfType,
        buf: &mut [u8],
        mut off: usize,
        strs: &mut Strings,
    ) -> BtfResult<usize> {
        let common = match t {
            BtfType::Void => return btf_error("Void is never emitted".to_string()),
            BtfType::Int(i) => btf_type {
                name_off: strs.intern(&i.name),
                info: type_info(BTF_KIND_INT, 0, false),
                type_id: (i.bits + 7) / 8,
            },
            BtfType::Ptr(p) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_PTR, 0, false),
                type_id: p.type_id,
            },
            BtfType::Const(c) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_CONST, 0, false),
                type_id: c.type_id,
            },
            BtfType::Volatile(v) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_VOLATILE, 0, false),
                type_id: v.type_id,
            },
            BtfType::Restrict(r) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_RESTRICT, 0, false),
                type_id: r.type_id,
            },
            BtfType::Typedef(td) => btf_type {
                name_off: strs.intern(&td.name),
                info: type_info(BTF_KIND_TYPEDEF, 0, false),
                type_id: td.type_id,
            },
            BtfType::Fwd(fwd) => btf_type {
                name_off: strs.intern(&fwd.name),
                info: type_info(BTF_KIND_FWD, 0, fwd.kind == BtfFwdKind::Union),
                type_id: 0,
            },
            BtfType::Array(_) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_ARRAY, 0, false),
                type_id: 0,
            },
            BtfType::Struct(c) | BtfType::Union(c) => {
                let kind = if c.is_struct {
                    BTF_KIND_STRUCT
                } else {
                    BTF_KIND_UNION
                };
                let bitfields = c.members.iter().any(|m| m.bit_size != 0);
                btf_type {
                    name_off: strs.intern(&c.name),
                    info: type_info(kind, c.members.len() as u32, bitfields),
                    type_id: c.sz,
                }
            }
            BtfType::Enum(e) => btf_type {
                name_off: strs.intern(&e.name),
                info: type_info(BTF_KIND_ENUM, e.values.len() as u32, false),
                type_id: e.sz,
            },
            BtfType::Func(fun) => btf_type {
                name_off: strs.intern(&fun.name),
                info: type_info(BTF_KIND_FUNC, 0, false),
                type_id: fun.proto_type_id,
            },
            BtfType::FuncProto(p) => btf_type {
                name_off: 0,
                info: type_info(BTF_KIND_FUNC_PROTO, p.params.len() as u32, false),
                type_id: p.res_type_id,
            },
            BtfType::Var(v) => btf_type {
                name_off: strs.intern(&v.name),
                info: type_info(BTF_KIND_VAR, 0, false),
                type_id: v.type_id,
            },
            BtfType::Datasec(d) => btf_type {
                name_off: strs.intern(&d.name),
                info: type_info(BTF_KIND_DATASEC, d.vars.len() as u32, false),
                type_id: d.sz,
            },
        };
        buf.pwrite_with(common, off, self.endian)?;
        off += size_of::<btf_type>();

        match t {
            BtfType::Int(i) => {
                let enc = match i.encoding {
                    BtfIntEncoding::None => 0,
                    BtfIntEncoding::Signed => BTF_INT_SIGNED,
                    BtfIntEncoding::Char => BTF_INT_CHAR,
                    BtfIntEncoding::Bool => BTF_INT_BOOL,
                };
                let word = (enc << 24) | ((i.offset & 0xff) << 16) | (i.bits & 0xff);
                buf.pwrite_with(word, off, self.endian)?;
                off += size_of::<u32>();
            }
            BtfType::Array(a) => {
                buf.pwrite_with(
                    btf_array {
                        val_type_id: a.val_type_id,
                        idx_type_id: a.idx_type_id,
                        nelems: a.nelems,
                    },
                    off,
                    self.endian,
                )?;
                off += size_of::<btf_array>();
            }
            BtfType::Struct(c) | BtfType::Union(c) => {
                let bitfields = c.members.iter().any(|m| m.bit_size != 0);
                for m in &c.members {
                    let offset = if bitfields {
                        ((m.bit_size as u32) << 24) | (m.bit_offset & 0xffffff)
                    } else {
                        m.bit_offset
                    };
                    buf.pwrite_with(
                        btf_member {
                            name_off: strs.intern(&m.name),
                            type_id: m.type_id,
                            offset: offset,
                        },
                        off,
                        self.endian,
                    )?;
                    off += size_of::<btf_member>();
                }
            }
            BtfType::Enum(e) => {
                for v in &e.values {
                    buf.pwrite_with(
                        btf_enum {
                            name_off: strs.intern(&v.name),
                            val: v.value,
                        },
                        off,
                        self.endian,
                    )?;
                    off += size_of::<btf_enum>();
                }
            }
            BtfType::FuncProto(p) => {
                for param in &p.params {
                    buf.pwrite_with(
                        btf_param {
                            name_off: strs.intern(&param.name),
                            type_id: param.type_id,
                        },
                        off,
                        self.endian,
                    )?;
                    off += size_of::<btf_param>();
                }
            }
            BtfType::Var(v) => {
                let linkage = match v.kind {
                    BtfVarKind::Static => BTF_VAR_STATIC,
                    BtfVarKind::GlobalAlloc => BTF_VAR_GLOBAL_ALLOCATED,
                };
                buf.pwrite_with(linkage, off, self.endian)?;
                off += size_of::<u32>();
            }
            BtfType::Datasec(d) => {
                for v in &d.vars {
                    buf.pwrite_with(
                        btf_datasec_var {
                            type_id: v.type_id,
                            offset: v.offset,
                            size: v.sz,
                        },
                        off,
                        self.endian,
                    )?;
                    off += size_of::<btf_datasec_var>();
                }
            }
            _ => {}
        }
        Ok(off)
    }
}

fn type_info(kind: u32, vlen: u32, kind_flag: bool) -> u32 {
    ((kind_flag as u32) << 31) | (kind << 24) | (vlen & 0xffff)
}

struct Strings {
    buf: Vec<u8>,
    index: HashMap<String, u32>,
}

impl Strings {
    fn new() -> Strings {
        Strings {
            buf: vec![0],
            index: HashMap::new(),
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&off) = self.index.get(s) {
            return off;
        }
        let off = self.buf.len() as u32;
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        self.index.insert(s.to_owned(), off);
        off
    }
}
