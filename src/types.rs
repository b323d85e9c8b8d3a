use std::fmt;
use std::mem::size_of;

use object::{Object, ObjectSection};
use scroll::Pread;
use scroll_derive::{IOread, IOwrite, Pread as DerivePread, Pwrite, SizeWith};

use crate::{btf_error, BtfError, BtfResult};

pub const BTF_ELF_SEC: &str = ".BTF";
pub const PERCPU_SECTION: &str = ".data..percpu";

pub const BTF_MAGIC: u16 = 0xeB9F;
pub const BTF_VERSION: u8 = 1;

pub const BTF_KIND_UNKN: u32 = 0;
pub const BTF_KIND_INT: u32 = 1;
pub const BTF_KIND_PTR: u32 = 2;
pub const BTF_KIND_ARRAY: u32 = 3;
pub const BTF_KIND_STRUCT: u32 = 4;
pub const BTF_KIND_UNION: u32 = 5;
pub const BTF_KIND_ENUM: u32 = 6;
pub const BTF_KIND_FWD: u32 = 7;
pub const BTF_KIND_TYPEDEF: u32 = 8;
pub const BTF_KIND_VOLATILE: u32 = 9;
pub const BTF_KIND_CONST: u32 = 10;
pub const BTF_KIND_RESTRICT: u32 = 11;
pub const BTF_KIND_FUNC: u32 = 12;
pub const BTF_KIND_FUNC_PROTO: u32 = 13;
pub const BTF_KIND_VAR: u32 = 14;
pub const BTF_KIND_DATASEC: u32 = 15;
pub const BTF_KIND_MAX: u32 = 15;
pub const NR_BTF_KINDS: u32 = BTF_KIND_MAX + 1;

pub const BTF_INT_SIGNED: u32 = 0b001;
pub const BTF_INT_CHAR: u32 = 0b010;
pub const BTF_INT_BOOL: u32 = 0b100;

pub const BTF_VAR_STATIC: u32 = 0;
pub const BTF_VAR_GLOBAL_ALLOCATED: u32 = 1;

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_header {
    pub magic: u16,
    pub version: u8,
    pub flags: u8,
    pub hdr_len: u32,
    pub type_off: u32,
    pub type_len: u32,
    pub str_off: u32,
    pub str_len: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_type {
    pub name_off: u32,
    pub info: u32,
    pub type_id: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_enum {
    pub name_off: u32,
    pub val: i32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_array {
    pub val_type_id: u32,
    pub idx_type_id: u32,
    pub nelems: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_member {
    pub name_off: u32,
    pub type_id: u32,
    pub offset: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_param {
    pub name_off: u32,
    pub type_id: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, DerivePread, Pwrite, IOread, IOwrite, SizeWith)]
pub struct btf_datasec_var {
    pub type_id: u32,
    pub offset: u32,
    pub size: u32,
}

const EMPTY: &'static str = "";
const ANON_NAME: &'static str = "<anon>";

fn disp_name(s: &str) -> &str {
    if s == "" {
        ANON_NAME
    } else {
        s
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BtfIntEncoding {
    None,
    Signed,
    Char,
    Bool,
}

impl fmt::Display for BtfIntEncoding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BtfIntEncoding::None => write!(f, "none"),
            BtfIntEncoding::Signed => write!(f, "signed"),
            BtfIntEncoding::Char => write!(f, "char"),
            BtfIntEncoding::Bool => write!(f, "bool"),
        }
    }
}

#[derive(Debug)]
pub struct BtfInt {
    pub name: String,
    pub bits: u32,
    pub offset: u32,
    pub encoding: BtfIntEncoding,
}

impl fmt::Display for BtfInt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' bits:{} off:{}",
            "INT",
            disp_name(&self.name),
            self.bits,
            self.offset
        )?;
        match self.encoding {
            BtfIntEncoding::None => (),
            _ => write!(f, " enc:{}", self.encoding)?,
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct BtfPtr {
    pub type_id: u32,
}

impl fmt::Display for BtfPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}> --> [{}]", "PTR", self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfArray {
    pub nelems: u32,
    pub idx_type_id: u32,
    pub val_type_id: u32,
}

impl fmt::Display for BtfArray {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> n:{} idx-->[{}] val-->[{}]",
            "ARRAY", self.nelems, self.idx_type_id, self.val_type_id
        )
    }
}

#[derive(Debug)]
pub struct BtfMember {
    pub name: String,
    pub type_id: u32,
    pub bit_offset: u32,
    pub bit_size: u8,
}

impl fmt::Display for BtfMember {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}' off:{}", disp_name(&self.name), self.bit_offset)?;
        if self.bit_size != 0 {
            write!(f, " sz:{}", self.bit_size)?;
        }
        write!(f, " --> [{}]", self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfComposite {
    pub is_struct: bool,
    pub name: String,
    pub sz: u32,
    pub members: Vec<BtfMember>,
}

impl fmt::Display for BtfComposite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' sz:{} n:{}",
            if self.is_struct { "STRUCT" } else { "UNION" },
            disp_name(&self.name),
            self.sz,
            self.members.len()
        )?;
        for i in 0..self.members.len() {
            write!(f, "\n\t#{:02} {}", i, self.members[i])?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct BtfEnumValue {
    pub name: String,
    pub value: i32,
}

impl fmt::Display for BtfEnumValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} = {}", disp_name(&self.name), self.value)
    }
}

#[derive(Debug)]
pub struct BtfEnum {
    pub name: String,
    pub sz: u32,
    pub values: Vec<BtfEnumValue>,
}

impl fmt::Display for BtfEnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' sz:{} n:{}",
            "ENUM",
            disp_name(&self.name),
            self.sz,
            self.values.len()
        )?;
        for i in 0..self.values.len() {
            write!(f, "\n\t#{:02} {}", i, self.values[i])?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BtfFwdKind {
    Struct,
    Union,
}

impl fmt::Display for BtfFwdKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BtfFwdKind::Struct => write!(f, "struct"),
            BtfFwdKind::Union => write!(f, "union"),
        }
    }
}

#[derive(Debug)]
pub struct BtfFwd {
    pub name: String,
    pub kind: BtfFwdKind,
}

impl fmt::Display for BtfFwd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' kind:{}",
            "FWD",
            disp_name(&self.name),
            self.kind
        )
    }
}

#[derive(Debug)]
pub struct BtfTypedef {
    pub name: String,
    pub type_id: u32,
}

impl fmt::Display for BtfTypedef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' --> [{}]",
            "TYPEDEF",
            disp_name(&self.name),
            self.type_id
        )
    }
}

#[derive(Debug)]
pub struct BtfVolatile {
    pub type_id: u32,
}

impl fmt::Display for BtfVolatile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}> --> [{}]", "VOLATILE", self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfConst {
    pub type_id: u32,
}

impl fmt::Display for BtfConst {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}> --> [{}]", "CONST", self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfRestrict {
    pub type_id: u32,
}

impl fmt::Display for BtfRestrict {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<{}> --> [{}]", "RESTRICT", self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfFunc {
    pub name: String,
    pub proto_type_id: u32,
}

impl fmt::Display for BtfFunc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' --> [{}]",
            "FUNC",
            disp_name(&self.name),
            self.proto_type_id
        )
    }
}

#[derive(Debug)]
pub struct BtfFuncParam {
    pub name: String,
    pub type_id: u32,
}

impl fmt::Display for BtfFuncParam {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "'{}' --> [{}]", disp_name(&self.name), self.type_id)
    }
}

#[derive(Debug)]
pub struct BtfFuncProto {
    pub res_type_id: u32,
    pub params: Vec<BtfFuncParam>,
}

impl fmt::Display for BtfFuncProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> r-->[{}] n:{}",
            "FUNC_PROTO",
            self.res_type_id,
            self.params.len()
        )?;
        for i in 0..self.params.len() {
            write!(f, "\n\t#{:02} {}", i, self.params[i])?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BtfVarKind {
    Static,
    GlobalAlloc,
}

impl fmt::Display for BtfVarKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BtfVarKind::Static => write!(f, "static"),
            BtfVarKind::GlobalAlloc => write!(f, "global-alloc"),
        }
    }
}

#[derive(Debug)]
pub struct BtfVar {
    pub name: String,
    pub type_id: u32,
    pub kind: BtfVarKind,
}

impl fmt::Display for BtfVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' kind:{} --> [{}]",
            "VAR",
            disp_name(&self.name),
            self.kind,
            self.type_id
        )
    }
}

#[derive(Debug)]
pub struct BtfDatasecVar {
    pub type_id: u32,
    pub offset: u32,
    pub sz: u32,
}

impl fmt::Display for BtfDatasecVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "off:{} sz:{} --> [{}]",
            self.offset, self.sz, self.type_id
        )
    }
}

#[derive(Debug)]
pub struct BtfDatasec {
    pub name: String,
    pub sz: u32,
    pub vars: Vec<BtfDatasecVar>,
}

impl fmt::Display for BtfDatasec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<{}> '{}' sz:{} n:{}",
            "DATASEC",
            disp_name(&self.name),
            self.sz,
            self.vars.len()
        )?;
        for i in 0..self.vars.len() {
            write!(f, "\n\t#{:02} {}", i, self.vars[i])?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum BtfType {
    Void,
    Int(BtfInt),
    Ptr(BtfPtr),
    Array(BtfArray),
    Struct(BtfComposite),
    Union(BtfComposite),
    Enum(BtfEnum),
    Fwd(BtfFwd),
    Typedef(BtfTypedef),
    Volatile(BtfVolatile),
    Const(BtfConst),
    Restrict(BtfRestrict),
    Func(BtfFunc),
    FuncProto(BtfFuncProto),
    Var(BtfVar),
    Datasec(BtfDatasec),
}

impl fmt::Display for BtfType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BtfType::Void => write!(f, "<{}>", "VOID"),
            BtfType::Int(t) => t.fmt(f),
            BtfType::Ptr(t) => t.fmt(f),
            BtfType::Array(t) => t.fmt(f),
            BtfType::Struct(t) => t.fmt(f),
            BtfType::Union(t) => t.fmt(f),
            BtfType::Enum(t) => t.fmt(f),
            BtfType::Fwd(t) => t.fmt(f),
            BtfType::Typedef(t) => t.fmt(f),
            BtfType::Volatile(t) => t.fmt(f),
            BtfType::Const(t) => t.fmt(f),
            BtfType::Restrict(t) => t.fmt(f),
            BtfType::Func(t) => t.fmt(f),
            BtfType::FuncProto(t) => t.fmt(f),
            BtfType::Var(t) => t.fmt(f),
            BtfType::Datasec(t) => t.fmt(f),
        }
    }
}

impl BtfType {
    pub fn name(&self) -> &str {
        match self {
            BtfType::Void => EMPTY,
            BtfType::Int(t) => &t.name,
            BtfType::Ptr(_) => EMPTY,
            BtfType::Array(_) => EMPTY,
            BtfType::Struct(t) => &t.name,
            BtfType::Union(t) => &t.name,
            BtfType::Enum(t) => &t.name,
            BtfType::Fwd(t) => &t.name,
            BtfType::Typedef(t) => &t.name,
            BtfType::Volatile(_) => EMPTY,
            BtfType::Const(_) => EMPTY,
            BtfType::Restrict(_) => EMPTY,
            BtfType::Func(t) => &t.name,
            BtfType::FuncProto(_) => EMPTY,
            BtfType::Var(t) => &t.name,
            BtfType::Datasec(t) => &t.name,
        }
    }
}

/// Byte size of a type record in the on-disk type section.
pub fn type_size(t: &BtfType) -> usize {
    let common = size_of::<btf_type>();
    match t {
        BtfType::Void => 0,
        BtfType::Ptr(_)
        | BtfType::Fwd(_)
        | BtfType::Typedef(_)
        | BtfType::Volatile(_)
        | BtfType::Const(_)
        | BtfType::Restrict(_)
        | BtfType::Func(_) => common,
        BtfType::Int(_) | BtfType::Var(_) => common + size_of::<u32>(),
        BtfType::Array(_) => common + size_of::<btf_array>(),
        BtfType::Struct(t) => common + t.members.len() * size_of::<btf_member>(),
        BtfType::Union(t) => common + t.members.len() * size_of::<btf_member>(),
        BtfType::Enum(t) => common + t.values.len() * size_of::<btf_enum>(),
        BtfType::FuncProto(t) => common + t.params.len() * size_of::<btf_param>(),
        BtfType::Datasec(t) => common + t.vars.len() * size_of::<btf_datasec_var>(),
    }
}

/// A parsed BTF type table. Used for loading a base BTF to continue
/// numbering from and for verifying encoder output.
#[derive(Debug)]
pub struct Btf {
    endian: scroll::Endian,
    types: Vec<BtfType>,
}

impl Btf {
    pub fn types(&self) -> &[BtfType] {
        &self.types
    }

    pub fn type_by_id(&self, type_id: u32) -> &BtfType {
        &self.types[type_id as usize]
    }

    /// Number of table slots, including the implicit void slot 0.
    pub fn type_cnt(&self) -> u32 {
        self.types.len() as u32
    }

    /// Parse a raw BTF image (header + type section + string section).
    pub fn parse(data: &[u8]) -> BtfResult<Btf> {
        if data.len() < size_of::<btf_header>() {
            return btf_error(format!("BTF image too short: {} bytes", data.len()));
        }
        // The magic is endian-sensitive, so probing it little-endian first
        // tells us which byte order the image was produced in.
        let endian = if data.pread_with::<u16>(0, scroll::LE)? == BTF_MAGIC {
            scroll::LE
        } else {
            scroll::BE
        };
        let hdr = data.pread_with::<btf_header>(0, endian)?;
        if hdr.magic != BTF_MAGIC {
            return btf_error(format!("Invalid BTF magic: {}", hdr.magic));
        }
        if hdr.version != BTF_VERSION {
            return btf_error(format!(
                "Unsupported BTF version: {}, expect: {}",
                hdr.version, BTF_VERSION
            ));
        }

        let type_off = (hdr.hdr_len + hdr.type_off) as usize;
        let type_end = type_off + hdr.type_len as usize;
        let str_off = (hdr.hdr_len + hdr.str_off) as usize;
        let str_end = str_off + hdr.str_len as usize;
        if type_end > data.len() || str_end > data.len() {
            return btf_error(format!(
                "BTF sections out of bounds: type {}..{}, str {}..{}, image {}",
                type_off,
                type_end,
                str_off,
                str_end,
                data.len()
            ));
        }
        let type_data = &data[type_off..type_end];
        let str_data = &data[str_off..str_end];

        let mut btf = Btf {
            endian: endian,
            types: vec![BtfType::Void],
        };
        let mut off: usize = 0;
        while off < hdr.type_len as usize {
            let t = btf.load_type(&type_data[off..], str_data)?;
            off += type_size(&t);
            btf.types.push(t);
        }
        Ok(btf)
    }

    /// Parse the `.BTF` section of an already-compiled EO.
    pub fn from_elf_data(data: &[u8]) -> BtfResult<Btf> {
        let elf = object::File::parse(data)?;
        let btf_section = elf
            .section_by_name(BTF_ELF_SEC)
            .ok_or_else(|| Box::new(BtfError::new("No .BTF section found!")))?;
        Btf::parse(btf_section.data()?)
    }

    fn load_type(&self, data: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let t = data.pread_with::<btf_type>(0, self.endian)?;
        let extra = &data[size_of::<btf_type>()..];
        let kind = Btf::get_kind(t.info);
        match kind {
            BTF_KIND_INT => self.load_int(&t, extra, strs),
            BTF_KIND_PTR => Ok(BtfType::Ptr(BtfPtr { type_id: t.type_id })),
            BTF_KIND_ARRAY => self.load_array(extra),
            BTF_KIND_STRUCT => self.load_composite(&t, extra, strs, true),
            BTF_KIND_UNION => self.load_composite(&t, extra, strs, false),
            BTF_KIND_ENUM => self.load_enum(&t, extra, strs),
            BTF_KIND_FWD => Ok(BtfType::Fwd(BtfFwd {
                name: Btf::get_btf_str(strs, t.name_off)?,
                kind: if Btf::get_kind_flag(t.info) {
                    BtfFwdKind::Union
                } else {
                    BtfFwdKind::Struct
                },
            })),
            BTF_KIND_TYPEDEF => Ok(BtfType::Typedef(BtfTypedef {
                name: Btf::get_btf_str(strs, t.name_off)?,
                type_id: t.type_id,
            })),
            BTF_KIND_VOLATILE => Ok(BtfType::Volatile(BtfVolatile { type_id: t.type_id })),
            BTF_KIND_CONST => Ok(BtfType::Const(BtfConst { type_id: t.type_id })),
            BTF_KIND_RESTRICT => Ok(BtfType::Restrict(BtfRestrict { type_id: t.type_id })),
            BTF_KIND_FUNC => Ok(BtfType::Func(BtfFunc {
                name: Btf::get_btf_str(strs, t.name_off)?,
                proto_type_id: t.type_id,
            })),
            BTF_KIND_FUNC_PROTO => self.load_func_proto(&t, extra, strs),
            BTF_KIND_VAR => self.load_var(&t, extra, strs),
            BTF_KIND_DATASEC => self.load_datasec(&t, extra, strs),
            _ => btf_error(format!("Unknown BTF kind: {}", kind)),
        }
    }

    fn load_int(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let info = extra.pread_with::<u32>(0, self.endian)?;
        let enc = (info >> 24) & 0xf;
        let off = (info >> 16) & 0xff;
        let bits = info & 0xff;
        Ok(BtfType::Int(BtfInt {
            name: Btf::get_btf_str(strs, t.name_off)?,
            bits: bits,
            offset: off,
            encoding: match enc {
                0 => BtfIntEncoding::None,
                BTF_INT_SIGNED => BtfIntEncoding::Signed,
                BTF_INT_CHAR => BtfIntEncoding::Char,
                BTF_INT_BOOL => BtfIntEncoding::Bool,
                _ => {
                    return btf_error(format!("Unknown BTF int encoding: {}", enc));
                }
            },
        }))
    }

    fn load_array(&self, extra: &[u8]) -> BtfResult<BtfType> {
        let info = extra.pread_with::<btf_array>(0, self.endian)?;
        Ok(BtfType::Array(BtfArray {
            nelems: info.nelems,
            idx_type_id: info.idx_type_id,
            val_type_id: info.val_type_id,
        }))
    }

    fn load_composite(
        &self,
        t: &btf_type,
        extra: &[u8],
        strs: &[u8],
        is_struct: bool,
    ) -> BtfResult<BtfType> {
        let comp = BtfComposite {
            is_struct: is_struct,
            name: Btf::get_btf_str(strs, t.name_off)?,
            sz: t.type_id, // it's a type/size union in C
            members: self.load_members(t, extra, strs)?,
        };
        Ok(if is_struct {
            BtfType::Struct(comp)
        } else {
            BtfType::Union(comp)
        })
    }

    fn load_members(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<Vec<BtfMember>> {
        let mut res = Vec::new();
        let mut off: usize = 0;
        let bits = Btf::get_kind_flag(t.info);

        for _ in 0..Btf::get_vlen(t.info) {
            let m = extra.pread_with::<btf_member>(off, self.endian)?;
            res.push(BtfMember {
                name: Btf::get_btf_str(strs, m.name_off)?,
                type_id: m.type_id,
                bit_size: if bits { (m.offset >> 24) as u8 } else { 0 },
                bit_offset: if bits { m.offset & 0xffffff } else { m.offset },
            });
            off += size_of::<btf_member>();
        }
        Ok(res)
    }

    fn load_enum(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let mut vals = Vec::new();
        let mut off: usize = 0;

        for _ in 0..Btf::get_vlen(t.info) {
            let v = extra.pread_with::<btf_enum>(off, self.endian)?;
            vals.push(BtfEnumValue {
                name: Btf::get_btf_str(strs, v.name_off)?,
                value: v.val,
            });
            off += size_of::<btf_enum>();
        }
        Ok(BtfType::Enum(BtfEnum {
            name: Btf::get_btf_str(strs, t.name_off)?,
            sz: t.type_id, // it's a type/size union in C
            values: vals,
        }))
    }

    fn load_func_proto(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let mut params = Vec::new();
        let mut off: usize = 0;

        for _ in 0..Btf::get_vlen(t.info) {
            let p = extra.pread_with::<btf_param>(off, self.endian)?;
            params.push(BtfFuncParam {
                name: Btf::get_btf_str(strs, p.name_off)?,
                type_id: p.type_id,
            });
            off += size_of::<btf_param>();
        }
        Ok(BtfType::FuncProto(BtfFuncProto {
            res_type_id: t.type_id,
            params: params,
        }))
    }

    fn load_var(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let kind = extra.pread_with::<u32>(0, self.endian)?;
        Ok(BtfType::Var(BtfVar {
            name: Btf::get_btf_str(strs, t.name_off)?,
            type_id: t.type_id,
            kind: match kind {
                BTF_VAR_STATIC => BtfVarKind::Static,
                BTF_VAR_GLOBAL_ALLOCATED => BtfVarKind::GlobalAlloc,
                _ => {
                    return btf_error(format!("Unknown BTF var kind: {}", kind));
                }
            },
        }))
    }

    fn load_datasec(&self, t: &btf_type, extra: &[u8], strs: &[u8]) -> BtfResult<BtfType> {
        let mut vars = Vec::new();
        let mut off: usize = 0;

        for _ in 0..Btf::get_vlen(t.info) {
            let v = extra.pread_with::<btf_datasec_var>(off, self.endian)?;
            vars.push(BtfDatasecVar {
                type_id: v.type_id,
                offset: v.offset,
                sz: v.size,
            });
            off += size_of::<btf_datasec_var>();
        }
        Ok(BtfType::Datasec(BtfDatasec {
            name: Btf::get_btf_str(strs, t.name_off)?,
            sz: t.type_id, // it's a type/size union in C
            vars: vars,
        }))
    }

    fn get_btf_str(strs: &[u8], off: u32) -> BtfResult<String> {
        let off = off as usize;
        if off >= strs.len() {
            return btf_error(format!("String offset {} out of bounds", off));
        }
        let end = match strs[off..].iter().position(|&b| b == 0) {
            Some(pos) => off + pos,
            None => return btf_error(format!("Unterminated string at offset {}", off)),
        };
        Ok(std::str::from_utf8(&strs[off..end])?.to_owned())
    }

    fn get_vlen(info: u32) -> u32 {
        info & 0xffff
    }

    fn get_kind(info: u32) -> u32 {
        (info >> 24) & 0xf
    }

    fn get_kind_flag(info: u32) -> bool {
        (info >> 31) == 1
    }
}
