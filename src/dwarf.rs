//! DWARF loader: walks the EO's debug info with gimli and produces one
//! normalized `graph::Cu` per compilation unit. Type DIEs get dense local
//! ids in DFS order; the encoder re-checks that numbering while emitting.

use std::collections::HashMap;

use gimli::{AttributeValue, RunTimeEndian, UnitOffset};
use object::{Object, ObjectSection};

use crate::graph::{
    CompositeKind, Cu, Enumerator, Function, LocalId, Member, Param, RefKind, Type, VarScope,
    Variable,
};
use crate::types::BtfIntEncoding;
use crate::BtfResult;

type Reader<'d> = gimli::EndianSlice<'d, RunTimeEndian>;
type Die<'a, 'u, 'd> = gimli::DebuggingInformationEntry<'a, 'u, Reader<'d>>;

/// Load every compilation unit of `obj` into a normalized type graph.
/// `filename` is recorded on each CU so the encoder can pin its session to
/// one EO.
pub fn load_cus<'d>(obj: &object::File<'d>, filename: &str) -> BtfResult<Vec<Cu>> {
    let endian = if obj.is_little_endian() {
        RunTimeEndian::Little
    } else {
        RunTimeEndian::Big
    };
    let dwarf = gimli::Dwarf::load(|id| -> Result<Reader<'d>, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|sec| sec.data().ok())
            .unwrap_or(&[]);
        Ok(gimli::EndianSlice::new(data, endian))
    })?;

    let mut cus = Vec::new();
    let mut iter = dwarf.units();
    while let Some(header) = iter.next()? {
        let unit = dwarf.unit(header)?;
        cus.push(load_unit(&dwarf, &unit, filename)?);
    }
    Ok(cus)
}

fn is_type_tag(tag: gimli::DwTag) -> bool {
    match tag {
        gimli::DW_TAG_base_type
        | gimli::DW_TAG_pointer_type
        | gimli::DW_TAG_const_type
        | gimli::DW_TAG_volatile_type
        | gimli::DW_TAG_restrict_type
        | gimli::DW_TAG_typedef
        | gimli::DW_TAG_structure_type
        | gimli::DW_TAG_class_type
        | gimli::DW_TAG_union_type
        | gimli::DW_TAG_array_type
        | gimli::DW_TAG_enumeration_type
        | gimli::DW_TAG_subroutine_type => true,
        // keep a slot for type shapes BTF has no counterpart for, so a
        // reference to one is caught as an explicit encoding failure
        gimli::DW_TAG_atomic_type
        | gimli::DW_TAG_reference_type
        | gimli::DW_TAG_rvalue_reference_type
        | gimli::DW_TAG_ptr_to_member_type
        | gimli::DW_TAG_unspecified_type => true,
        _ => false,
    }
}

fn load_unit<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    filename: &str,
) -> BtfResult<Cu> {
    let unit_name = unit
        .name
        .as_ref()
        .and_then(|r| r.to_string().ok())
        .unwrap_or("");
    let mut cu = Cu::new(filename, unit_name);

    // First walk: hand out dense local ids to type DIEs and remember where
    // the unit's functions and variables sit.
    let mut type_offsets: Vec<UnitOffset> = Vec::new();
    let mut type_ids: HashMap<UnitOffset, LocalId> = HashMap::new();
    let mut func_offsets: Vec<UnitOffset> = Vec::new();
    let mut var_offsets: Vec<(UnitOffset, bool)> = Vec::new();
    {
        let mut entries = unit.entries();
        let mut depth: isize = 0;
        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            let tag = entry.tag();
            if is_type_tag(tag) {
                let id = type_offsets.len() as LocalId + 1;
                type_ids.insert(entry.offset(), id);
                type_offsets.push(entry.offset());
            } else if tag == gimli::DW_TAG_subprogram && depth == 1 {
                func_offsets.push(entry.offset());
            } else if tag == gimli::DW_TAG_variable {
                var_offsets.push((entry.offset(), depth == 1));
            }
        }
    }

    for off in &type_offsets {
        let t = load_type(dwarf, unit, *off, &type_ids, &mut cu)?;
        cu.push_type(t);
    }

    for off in &func_offsets {
        if let Some(f) = load_function(dwarf, unit, *off, &type_ids, &mut cu)? {
            cu.functions.push(f);
        }
    }

    let mut var_indices: HashMap<UnitOffset, usize> = HashMap::new();
    let mut spec_offsets: Vec<Option<UnitOffset>> = Vec::new();
    for (off, global) in &var_offsets {
        let (var, spec) = load_variable(dwarf, unit, *off, &type_ids, *global, &mut cu)?;
        var_indices.insert(*off, cu.variables.len());
        cu.variables.push(var);
        spec_offsets.push(spec);
    }
    for (i, spec) in spec_offsets.into_iter().enumerate() {
        if let Some(off) = spec {
            cu.variables[i].spec = var_indices.get(&off).copied();
        }
    }

    Ok(cu)
}

fn die_name<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    entry: &Die<'_, '_, 'd>,
) -> Option<String> {
    let val = entry.attr_value(gimli::DW_AT_name).ok()??;
    let r = dwarf.attr_string(unit, val).ok()?;
    r.to_string().ok().map(|s| s.to_owned())
}

fn die_name_handle<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    entry: &Die<'_, '_, 'd>,
    cu: &mut Cu,
) -> u32 {
    match die_name(dwarf, unit, entry) {
        Some(name) => cu.intern(&name),
        None => 0,
    }
}

fn die_flag(entry: &Die, at: gimli::DwAt) -> BtfResult<bool> {
    Ok(match entry.attr_value(at)? {
        Some(AttributeValue::Flag(f)) => f,
        Some(_) => true,
        None => false,
    })
}

fn die_udata(entry: &Die, at: gimli::DwAt) -> BtfResult<Option<u64>> {
    Ok(entry.attr_value(at)?.and_then(|v| v.udata_value()))
}

fn die_type_ref(entry: &Die, type_ids: &HashMap<UnitOffset, LocalId>) -> BtfResult<LocalId> {
    // references out of the supported set (or out of the unit) decay to void
    Ok(match entry.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(off)) => type_ids.get(&off).copied().unwrap_or(0),
        _ => 0,
    })
}

fn die_addr<'d>(unit: &gimli::Unit<Reader<'d>>, entry: &Die<'_, '_, 'd>) -> BtfResult<u64> {
    if let Some(AttributeValue::Exprloc(expr)) = entry.attr_value(gimli::DW_AT_location)? {
        let mut ops = expr.operations(unit.encoding());
        while let Some(op) = ops.next()? {
            if let gimli::read::Operation::Address { address } = op {
                return Ok(address);
            }
        }
    }
    Ok(0)
}

fn load_type<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    offset: UnitOffset,
    type_ids: &HashMap<UnitOffset, LocalId>,
    cu: &mut Cu,
) -> BtfResult<Type> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let tag = root.entry().tag();
    let name = die_name_handle(dwarf, unit, root.entry(), cu);
    let type_ref = die_type_ref(root.entry(), type_ids)?;

    match tag {
        gimli::DW_TAG_base_type => {
            let bits = match die_udata(root.entry(), gimli::DW_AT_bit_size)? {
                Some(b) => b as u32,
                None => die_udata(root.entry(), gimli::DW_AT_byte_size)?.unwrap_or(0) as u32 * 8,
            };
            let encoding = match root.entry().attr_value(gimli::DW_AT_encoding)? {
                Some(AttributeValue::Encoding(ate)) => match ate {
                    gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => BtfIntEncoding::Signed,
                    gimli::DW_ATE_boolean => BtfIntEncoding::Bool,
                    _ => BtfIntEncoding::None,
                },
                _ => BtfIntEncoding::None,
            };
            Ok(Type::Base {
                name: name,
                bits: bits,
                encoding: encoding,
            })
        }
        gimli::DW_TAG_pointer_type => Ok(Type::Ref {
            kind: RefKind::Pointer,
            type_ref: type_ref,
        }),
        gimli::DW_TAG_const_type => Ok(Type::Ref {
            kind: RefKind::Const,
            type_ref: type_ref,
        }),
        gimli::DW_TAG_volatile_type => Ok(Type::Ref {
            kind: RefKind::Volatile,
            type_ref: type_ref,
        }),
        gimli::DW_TAG_restrict_type => Ok(Type::Ref {
            kind: RefKind::Restrict,
            type_ref: type_ref,
        }),
        gimli::DW_TAG_typedef => Ok(Type::Typedef {
            name: name,
            type_ref: type_ref,
        }),
        gimli::DW_TAG_structure_type | gimli::DW_TAG_class_type | gimli::DW_TAG_union_type => {
            let kind = if tag == gimli::DW_TAG_union_type {
                CompositeKind::Union
            } else {
                CompositeKind::Struct
            };
            let size = die_udata(root.entry(), gimli::DW_AT_byte_size)?.unwrap_or(0) as u32;
            let declaration = die_flag(root.entry(), gimli::DW_AT_declaration)?;
            let mut members = Vec::new();
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let entry = child.entry();
                if entry.tag() != gimli::DW_TAG_member {
                    continue;
                }
                let bit_offset = match die_udata(entry, gimli::DW_AT_data_bit_offset)? {
                    Some(b) => b as u32,
                    None => {
                        die_udata(entry, gimli::DW_AT_data_member_location)?.unwrap_or(0) as u32 * 8
                    }
                };
                let bitfield_size = die_udata(entry, gimli::DW_AT_bit_size)?.unwrap_or(0) as u8;
                members.push(Member {
                    name: die_name_handle(dwarf, unit, entry, cu),
                    type_ref: die_type_ref(entry, type_ids)?,
                    bit_offset: bit_offset,
                    bitfield_size: bitfield_size,
                });
            }
            Ok(Type::Composite {
                kind: kind,
                name: name,
                size: size,
                declaration: declaration,
                members: members,
            })
        }
        gimli::DW_TAG_array_type => {
            let mut dims = Vec::new();
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let entry = child.entry();
                if entry.tag() != gimli::DW_TAG_subrange_type {
                    continue;
                }
                let n = match die_udata(entry, gimli::DW_AT_count)? {
                    Some(n) => n,
                    None => match entry.attr_value(gimli::DW_AT_upper_bound)? {
                        Some(v) => match v.udata_value().or_else(|| {
                            v.sdata_value().and_then(|s| {
                                if s >= 0 {
                                    Some(s as u64)
                                } else {
                                    None
                                }
                            })
                        }) {
                            Some(ub) => ub + 1,
                            None => 0,
                        },
                        None => 0,
                    },
                };
                dims.push(n as u32);
            }
            Ok(Type::Array {
                elem: type_ref,
                dims: dims,
            })
        }
        gimli::DW_TAG_enumeration_type => {
            let size = die_udata(root.entry(), gimli::DW_AT_byte_size)?.unwrap_or(0) as u32;
            let mut enumerators = Vec::new();
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let entry = child.entry();
                if entry.tag() != gimli::DW_TAG_enumerator {
                    continue;
                }
                let value = match entry.attr_value(gimli::DW_AT_const_value)? {
                    Some(v) => v
                        .sdata_value()
                        .or_else(|| v.udata_value().map(|u| u as i64))
                        .unwrap_or(0) as i32,
                    None => 0,
                };
                enumerators.push(Enumerator {
                    name: die_name_handle(dwarf, unit, entry, cu),
                    value: value,
                });
            }
            Ok(Type::Enum {
                name: name,
                size: size,
                enumerators: enumerators,
            })
        }
        gimli::DW_TAG_subroutine_type => {
            let params = load_params(dwarf, unit, root, type_ids, cu)?;
            Ok(Type::FuncProto {
                ret: type_ref,
                params: params,
            })
        }
        _ => Ok(Type::Unsupported {
            tag: tag.to_string(),
        }),
    }
}

fn load_params<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    node: gimli::EntriesTreeNode<'_, '_, '_, Reader<'d>>,
    type_ids: &HashMap<UnitOffset, LocalId>,
    cu: &mut Cu,
) -> BtfResult<Vec<Param>> {
    let mut params = Vec::new();
    let mut children = node.children();
    while let Some(child) = children.next()? {
        let entry = child.entry();
        match entry.tag() {
            gimli::DW_TAG_formal_parameter => {
                params.push(Param {
                    name: die_name_handle(dwarf, unit, entry, cu),
                    type_ref: die_type_ref(entry, type_ids)?,
                });
            }
            // varargs become an anonymous void parameter
            gimli::DW_TAG_unspecified_parameters => {
                params.push(Param {
                    name: 0,
                    type_ref: 0,
                });
            }
            _ => {}
        }
    }
    Ok(params)
}

fn load_function<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    offset: UnitOffset,
    type_ids: &HashMap<UnitOffset, LocalId>,
    cu: &mut Cu,
) -> BtfResult<Option<Function>> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let name = die_name_handle(dwarf, unit, root.entry(), cu);
    if name == 0 {
        // concrete out-of-line instances carry their identity through an
        // abstract origin; those never pass the selection rules anyway
        return Ok(None);
    }
    let declaration = die_flag(root.entry(), gimli::DW_AT_declaration)?;
    let external = die_flag(root.entry(), gimli::DW_AT_external)?;
    let ret = die_type_ref(root.entry(), type_ids)?;
    let params = load_params(dwarf, unit, root, type_ids, cu)?;
    Ok(Some(Function {
        name: name,
        declaration: declaration,
        external: external,
        ret: ret,
        params: params,
    }))
}

fn load_variable<'d>(
    dwarf: &gimli::Dwarf<Reader<'d>>,
    unit: &gimli::Unit<Reader<'d>>,
    offset: UnitOffset,
    type_ids: &HashMap<UnitOffset, LocalId>,
    global: bool,
    cu: &mut Cu,
) -> BtfResult<(Variable, Option<UnitOffset>)> {
    let mut tree = unit.entries_tree(Some(offset))?;
    let root = tree.root()?;
    let entry = root.entry();
    let spec = match entry.attr_value(gimli::DW_AT_specification)? {
        Some(AttributeValue::UnitRef(off)) => Some(off),
        _ => None,
    };
    let var = Variable {
        name: die_name_handle(dwarf, unit, entry, cu),
        scope: if global {
            VarScope::Global
        } else {
            VarScope::Local
        },
        declaration: die_flag(entry, gimli::DW_AT_declaration)?,
        external: die_flag(entry, gimli::DW_AT_external)?,
        addr: die_addr(unit, entry)?,
        type_ref: die_type_ref(entry, type_ids)?,
        spec: None,
    };
    Ok((var, spec))
}
