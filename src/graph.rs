//! Normalized per-CU type graph, the encoder's input. A DWARF loader (or a
//! test) fills one `Cu` per compilation unit: a dense type table whose local
//! ids start at 1 (0 is void), plus the unit's functions and variables.
//! Names are interned per CU and resolved through string handles, so the
//! encoder only materializes a name while emitting the record that needs it.

use crate::types::BtfIntEncoding;

/// CU-local type id; 0 refers to void.
pub type LocalId = u32;

/// Interned string handle; 0 resolves to no name.
pub type StrHandle = u32;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum RefKind {
    Pointer,
    Const,
    Volatile,
    Restrict,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum CompositeKind {
    Struct,
    Union,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum VarScope {
    Global,
    Local,
}

#[derive(Debug)]
pub struct Member {
    pub name: StrHandle,
    pub type_ref: LocalId,
    pub bit_offset: u32,
    pub bitfield_size: u8,
}

#[derive(Debug)]
pub struct Enumerator {
    pub name: StrHandle,
    pub value: i32,
}

#[derive(Debug)]
pub struct Param {
    pub name: StrHandle,
    pub type_ref: LocalId,
}

/// The closed set of type shapes the encoder understands. Anything else a
/// loader runs into lands in `Unsupported` and fails encoding with a
/// diagnostic naming the offending tag.
#[derive(Debug)]
pub enum Type {
    Base {
        name: StrHandle,
        bits: u32,
        encoding: BtfIntEncoding,
    },
    Ref {
        kind: RefKind,
        type_ref: LocalId,
    },
    Typedef {
        name: StrHandle,
        type_ref: LocalId,
    },
    Composite {
        kind: CompositeKind,
        name: StrHandle,
        size: u32,
        declaration: bool,
        members: Vec<Member>,
    },
    Array {
        elem: LocalId,
        dims: Vec<u32>,
    },
    Enum {
        name: StrHandle,
        size: u32,
        enumerators: Vec<Enumerator>,
    },
    FuncProto {
        ret: LocalId,
        params: Vec<Param>,
    },
    Unsupported {
        tag: String,
    },
}

impl Type {
    pub fn kind_name(&self) -> &str {
        match self {
            Type::Base { .. } => "base_type",
            Type::Ref {
                kind: RefKind::Pointer,
                ..
            } => "pointer_type",
            Type::Ref {
                kind: RefKind::Const,
                ..
            } => "const_type",
            Type::Ref {
                kind: RefKind::Volatile,
                ..
            } => "volatile_type",
            Type::Ref {
                kind: RefKind::Restrict,
                ..
            } => "restrict_type",
            Type::Typedef { .. } => "typedef",
            Type::Composite {
                kind: CompositeKind::Struct,
                ..
            } => "structure_type",
            Type::Composite {
                kind: CompositeKind::Union,
                ..
            } => "union_type",
            Type::Array { .. } => "array_type",
            Type::Enum { .. } => "enumeration_type",
            Type::FuncProto { .. } => "subroutine_type",
            Type::Unsupported { tag } => tag,
        }
    }
}

#[derive(Debug)]
pub struct Function {
    pub name: StrHandle,
    pub declaration: bool,
    pub external: bool,
    pub ret: LocalId,
    pub params: Vec<Param>,
}

#[derive(Debug)]
pub struct Variable {
    pub name: StrHandle,
    pub scope: VarScope,
    pub declaration: bool,
    pub external: bool,
    /// Link-time address; lives on the defining DIE even when type and
    /// linkage live on a specification.
    pub addr: u64,
    pub type_ref: LocalId,
    /// Index of the specification variable within the same CU, if any.
    pub spec: Option<usize>,
}

#[derive(Debug)]
pub struct Cu {
    pub filename: String,
    pub name: String,
    types: Vec<(LocalId, Type)>,
    pub functions: Vec<Function>,
    pub variables: Vec<Variable>,
    strings: Vec<String>,
}

impl Cu {
    pub fn new(filename: &str, name: &str) -> Cu {
        Cu {
            filename: filename.to_owned(),
            name: name.to_owned(),
            types: Vec::new(),
            functions: Vec::new(),
            variables: Vec::new(),
            strings: Vec::new(),
        }
    }

    pub fn intern(&mut self, s: &str) -> StrHandle {
        self.strings.push(s.to_owned());
        self.strings.len() as StrHandle
    }

    pub fn string(&self, handle: StrHandle) -> Option<&str> {
        if handle == 0 {
            None
        } else {
            self.strings.get(handle as usize - 1).map(|s| s.as_str())
        }
    }

    /// Adds a type under the next dense local id and returns that id.
    pub fn push_type(&mut self, t: Type) -> LocalId {
        let id = self.types.len() as LocalId + 1;
        self.types.push((id, t));
        id
    }

    /// Adds a type under an id chosen by the loader. The encoder checks the
    /// claimed ids against its own numbering, so a loader that skews its
    /// sequence is caught instead of silently corrupting references.
    pub fn push_type_with_id(&mut self, id: LocalId, t: Type) {
        self.types.push((id, t));
    }

    pub fn type_cnt(&self) -> u32 {
        self.types.len() as u32
    }

    /// Dense table size as the loader sees it, void slot included.
    pub fn dense_table_len(&self) -> u32 {
        self.types.len() as u32 + 1
    }

    pub fn iter_types(&self) -> impl Iterator<Item = (LocalId, &Type)> {
        self.types.iter().map(|(id, t)| (*id, t))
    }

    pub fn find_base_type(&self, name: &str) -> Option<LocalId> {
        for (id, t) in self.iter_types() {
            if let Type::Base { name: h, .. } = t {
                if self.string(*h) == Some(name) {
                    return Some(id);
                }
            }
        }
        None
    }
}
