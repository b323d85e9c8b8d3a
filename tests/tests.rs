use object::write::{Object as ElfBuilder, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use btfenc::elf::ElfReader;
use btfenc::encoder::{EncoderConfig, EncoderSession};
use btfenc::graph::{CompositeKind, Cu, Function, Member, Param, Type, Variable, VarScope};
use btfenc::symbols::{btf_name_valid, SymbolIndex};
use btfenc::types::{Btf, BtfIntEncoding, BtfType, BtfVarKind};

#[derive(Default)]
struct ElfSpec {
    funcs: Vec<(&'static str, u64)>,
    percpu: Vec<(&'static str, u64, u64)>,
    mcount: Option<McountSpec>,
}

struct McountSpec {
    start: u64,
    addrs: Vec<u64>,
    init: (u64, u64),
    bpf_init: (u64, u64),
}

fn build_elf(spec: &ElfSpec) -> Vec<u8> {
    let mut obj = ElfBuilder::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

    let text = obj.add_section(vec![], b".text".to_vec(), SectionKind::Text);
    obj.set_section_data(text, vec![0u8; 16], 16);
    for (name, addr) in &spec.funcs {
        obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: *addr,
            size: 8,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(text),
            flags: SymbolFlags::None,
        });
    }

    if !spec.percpu.is_empty() {
        let percpu = obj.add_section(vec![], b".data..percpu".to_vec(), SectionKind::Data);
        obj.set_section_data(percpu, vec![0u8; 0x2000], 8);
        for (name, addr, size) in &spec.percpu {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: *addr,
                size: *size,
                kind: SymbolKind::Data,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(percpu),
                flags: SymbolFlags::None,
            });
        }
    }

    if let Some(mc) = &spec.mcount {
        let sec = obj.add_section(vec![], b"__mcount_loc".to_vec(), SectionKind::Data);
        // written sections land at address 0, so the boundary symbol value
        // doubles as the table's byte offset within the section
        let mut data = vec![0u8; mc.start as usize];
        for addr in &mc.addrs {
            data.extend_from_slice(&addr.to_le_bytes());
        }
        obj.set_section_data(sec, data, 8);

        let stop = mc.start + mc.addrs.len() as u64 * 8;
        let bounds = [
            ("__start_mcount_loc", mc.start),
            ("__stop_mcount_loc", stop),
            ("__init_begin", mc.init.0),
            ("__init_end", mc.init.1),
            ("__init_bpf_preserve_type_begin", mc.bpf_init.0),
            ("__init_bpf_preserve_type_end", mc.bpf_init.1),
        ];
        for (name, value) in bounds.iter() {
            obj.add_symbol(Symbol {
                name: name.as_bytes().to_vec(),
                value: *value,
                size: 0,
                kind: SymbolKind::Data,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(sec),
                flags: SymbolFlags::None,
            });
        }
    }

    obj.write().unwrap()
}

fn encode_cus(elf_data: &[u8], cus: &[Cu], cfg: EncoderConfig) -> Vec<u8> {
    let elf = ElfReader::parse(elf_data).unwrap();
    let mut session = EncoderSession::new(&elf, "sample.o", cfg, None).unwrap();
    for cu in cus {
        session.encode_cu(cu).unwrap();
    }
    session.finalize().unwrap()
}

fn int_cu() -> Cu {
    let mut cu = Cu::new("sample.o", "sample.c");
    let name = cu.intern("int");
    cu.push_type(Type::Base {
        name: name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    cu
}

#[test]
fn encodes_minimal_base_type() {
    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[int_cu()], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 2);
    match btf.type_by_id(1) {
        BtfType::Int(t) => {
            assert_eq!(t.name, "int");
            assert_eq!(t.bits, 32);
            assert_eq!(t.encoding, BtfIntEncoding::Signed);
        }
        t => panic!("expected INT, got {}", t),
    }
}

#[test]
fn encodes_qualified_pointer_chain() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    let const_id = cu.push_type(Type::Ref {
        kind: btfenc::graph::RefKind::Const,
        type_ref: int_id,
    });
    cu.push_type(Type::Ref {
        kind: btfenc::graph::RefKind::Pointer,
        type_ref: const_id,
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 4);
    match btf.type_by_id(2) {
        BtfType::Const(t) => assert_eq!(t.type_id, 1),
        t => panic!("expected CONST, got {}", t),
    }
    match btf.type_by_id(3) {
        BtfType::Ptr(t) => assert_eq!(t.type_id, 2),
        t => panic!("expected PTR, got {}", t),
    }
}

#[test]
fn array_without_int_gets_synthetic_index_type() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let name = cu.intern("char");
    let char_id = cu.push_type(Type::Base {
        name: name,
        bits: 8,
        encoding: BtfIntEncoding::Signed,
    });
    cu.push_type(Type::Array {
        elem: char_id,
        dims: vec![4],
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 4);
    match btf.type_by_id(2) {
        BtfType::Array(t) => {
            assert_eq!(t.val_type_id, 1);
            assert_eq!(t.nelems, 4);
            assert_eq!(t.idx_type_id, 3);
        }
        t => panic!("expected ARRAY, got {}", t),
    }
    match btf.type_by_id(3) {
        BtfType::Int(t) => {
            assert_eq!(t.name, "__ARRAY_SIZE_TYPE__");
            assert_eq!(t.bits, 32);
        }
        t => panic!("expected synthetic INT, got {}", t),
    }
}

#[test]
fn synthetic_index_type_is_emitted_once() {
    let mut cu1 = Cu::new("sample.o", "a.c");
    let name = cu1.intern("char");
    let char_id = cu1.push_type(Type::Base {
        name: name,
        bits: 8,
        encoding: BtfIntEncoding::Signed,
    });
    cu1.push_type(Type::Array {
        elem: char_id,
        dims: vec![2, 3],
    });

    let mut cu2 = Cu::new("sample.o", "b.c");
    let name = cu2.intern("short");
    let short_id = cu2.push_type(Type::Base {
        name: name,
        bits: 16,
        encoding: BtfIntEncoding::Signed,
    });
    cu2.push_type(Type::Array {
        elem: short_id,
        dims: vec![5],
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu1, cu2], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let synthetics: Vec<_> = btf
        .types()
        .iter()
        .filter(|t| t.name() == "__ARRAY_SIZE_TYPE__")
        .collect();
    assert_eq!(synthetics.len(), 1);
    // flattened multi-dimensional array, with the index id reserved right
    // after the first CU's dense table
    match btf.type_by_id(2) {
        BtfType::Array(t) => {
            assert_eq!(t.nelems, 6);
            assert_eq!(t.idx_type_id, 3);
        }
        t => panic!("expected ARRAY, got {}", t),
    }
    match btf.type_by_id(3) {
        BtfType::Int(t) => assert_eq!(t.name, "__ARRAY_SIZE_TYPE__"),
        t => panic!("expected synthetic INT, got {}", t),
    }
    // second CU's types follow the synthetic one
    match btf.type_by_id(5) {
        BtfType::Array(t) => {
            assert_eq!(t.nelems, 5);
            assert_eq!(t.val_type_id, 4);
            assert_eq!(t.idx_type_id, 3);
        }
        t => panic!("expected ARRAY, got {}", t),
    }
}

#[test]
fn struct_members_and_enum_round_trip() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let int_name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: int_name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    let s_name = cu.intern("pair");
    let a_name = cu.intern("a");
    let b_name = cu.intern("b");
    cu.push_type(Type::Composite {
        kind: CompositeKind::Struct,
        name: s_name,
        size: 8,
        declaration: false,
        members: vec![
            Member {
                name: a_name,
                type_ref: int_id,
                bit_offset: 0,
                bitfield_size: 0,
            },
            Member {
                name: b_name,
                type_ref: int_id,
                bit_offset: 32,
                bitfield_size: 0,
            },
        ],
    });
    let e_name = cu.intern("state");
    let on = cu.intern("ON");
    let off = cu.intern("OFF");
    cu.push_type(Type::Enum {
        name: e_name,
        size: 4,
        enumerators: vec![
            btfenc::graph::Enumerator { name: on, value: 1 },
            btfenc::graph::Enumerator {
                name: off,
                value: 0,
            },
        ],
    });
    let fwd_name = cu.intern("opaque");
    cu.push_type(Type::Composite {
        kind: CompositeKind::Union,
        name: fwd_name,
        size: 0,
        declaration: true,
        members: vec![],
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    match btf.type_by_id(2) {
        BtfType::Struct(t) => {
            assert_eq!(t.name, "pair");
            assert_eq!(t.sz, 8);
            assert_eq!(t.members.len(), 2);
            assert_eq!(t.members[0].name, "a");
            assert_eq!(t.members[0].type_id, 1);
            assert_eq!(t.members[1].bit_offset, 32);
        }
        t => panic!("expected STRUCT, got {}", t),
    }
    match btf.type_by_id(3) {
        BtfType::Enum(t) => {
            assert_eq!(t.name, "state");
            assert_eq!(t.values.len(), 2);
            assert_eq!(t.values[0].name, "ON");
            assert_eq!(t.values[0].value, 1);
        }
        t => panic!("expected ENUM, got {}", t),
    }
    match btf.type_by_id(4) {
        BtfType::Fwd(t) => {
            assert_eq!(t.name, "opaque");
            assert_eq!(t.kind, btfenc::types::BtfFwdKind::Union);
        }
        t => panic!("expected FWD, got {}", t),
    }
}

#[test]
fn empty_cu_leaves_table_unchanged() {
    let elf_data = build_elf(&ElfSpec::default());
    let cu = Cu::new("sample.o", "empty.c");
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 1); // nothing but the void slot
}

#[test]
fn detects_loader_id_drift() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let a = cu.intern("int");
    let b = cu.intern("char");
    let c = cu.intern("short");
    cu.push_type_with_id(
        1,
        Type::Base {
            name: a,
            bits: 32,
            encoding: BtfIntEncoding::Signed,
        },
    );
    cu.push_type_with_id(
        3,
        Type::Base {
            name: b,
            bits: 8,
            encoding: BtfIntEncoding::Signed,
        },
    );
    cu.push_type_with_id(
        2,
        Type::Base {
            name: c,
            bits: 16,
            encoding: BtfIntEncoding::Signed,
        },
    );

    let elf_data = build_elf(&ElfSpec::default());
    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session =
        EncoderSession::new(&elf, "sample.o", EncoderConfig::default(), None).unwrap();
    let err = session.encode_cu(&cu).unwrap_err();
    assert!(err.to_string().contains("id drift"), "got: {}", err);
}

#[test]
fn unsupported_tag_is_fatal_with_diagnostic() {
    let mut cu = Cu::new("sample.o", "sample.c");
    cu.push_type(Type::Unsupported {
        tag: "DW_TAG_atomic_type".to_string(),
    });

    let elf_data = build_elf(&ElfSpec::default());
    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session =
        EncoderSession::new(&elf, "sample.o", EncoderConfig::default(), None).unwrap();
    let err = session.encode_cu(&cu).unwrap_err();
    assert!(err.to_string().contains("DW_TAG_atomic_type"), "got: {}", err);
}

#[test]
fn ftrace_filter_selects_traced_non_init_functions() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("foo", 0x100), ("bar", 0x200), ("baz", 0x300)],
        percpu: vec![],
        mcount: Some(McountSpec {
            start: 0x40,
            addrs: vec![0x300, 0x100],
            init: (0x150, 0x250),
            bpf_init: (0x1000, 0x1008),
        }),
    });
    let elf = ElfReader::parse(&elf_data).unwrap();
    let index = SymbolIndex::collect(&elf, false, false, false).unwrap();

    let kept: Vec<&str> = index.functions.iter().map(|f| f.name).collect();
    assert_eq!(kept, vec!["baz", "foo"]); // name-sorted, bar dropped
}

#[test]
fn ftrace_filter_keeps_bpf_preserve_type_init_functions() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("early_fn", 0x180), ("late_fn", 0x300)],
        percpu: vec![],
        mcount: Some(McountSpec {
            start: 0x40,
            addrs: vec![0x180, 0x300],
            init: (0x100, 0x200),
            bpf_init: (0x180, 0x190),
        }),
    });
    let elf = ElfReader::parse(&elf_data).unwrap();
    let index = SymbolIndex::collect(&elf, false, false, false).unwrap();

    let kept: Vec<&str> = index.functions.iter().map(|f| f.name).collect();
    assert_eq!(kept, vec!["early_fn", "late_fn"]);
}

#[test]
fn missing_boundary_symbols_disable_the_filter() {
    // no mcount/init symbols at all: candidates are discarded and the
    // encoder falls back to the DWARF declaration criterion
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("foo", 0x100)],
        percpu: vec![],
        mcount: None,
    });
    let elf = ElfReader::parse(&elf_data).unwrap();
    let index = SymbolIndex::collect(&elf, false, false, false).unwrap();
    assert!(index.functions.is_empty());
}

#[test]
fn emits_funcs_for_filtered_function_set() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let int_name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: int_name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    for fname in ["foo", "bar", "baz"].iter() {
        let name = cu.intern(fname);
        let pname = cu.intern("x");
        cu.functions.push(Function {
            name: name,
            declaration: false,
            external: true,
            ret: int_id,
            params: vec![Param {
                name: pname,
                type_ref: int_id,
            }],
        });
    }

    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("foo", 0x100), ("bar", 0x200), ("baz", 0x300)],
        percpu: vec![],
        mcount: Some(McountSpec {
            start: 0x40,
            addrs: vec![0x300, 0x100],
            init: (0x150, 0x250),
            bpf_init: (0x1000, 0x1008),
        }),
    });
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let funcs: Vec<&str> = btf
        .types()
        .iter()
        .filter_map(|t| match t {
            BtfType::Func(f) => Some(f.name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(funcs, vec!["foo", "baz"]); // bar is not in the mcount table

    // each FUNC points at a FUNC_PROTO with the named parameter
    for t in btf.types() {
        if let BtfType::Func(f) = t {
            match btf.type_by_id(f.proto_type_id) {
                BtfType::FuncProto(p) => {
                    assert_eq!(p.res_type_id, 1);
                    assert_eq!(p.params.len(), 1);
                    assert_eq!(p.params[0].name, "x");
                }
                t => panic!("expected FUNC_PROTO, got {}", t),
            }
        }
    }
}

#[test]
fn filtered_function_is_emitted_once_across_cus() {
    let make_cu = |unit: &str| {
        let mut cu = Cu::new("sample.o", unit);
        let name = cu.intern("foo");
        cu.functions.push(Function {
            name: name,
            declaration: false,
            external: true,
            ret: 0,
            params: vec![],
        });
        cu
    };

    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("foo", 0x100)],
        percpu: vec![],
        mcount: Some(McountSpec {
            start: 0x40,
            addrs: vec![0x100],
            init: (0x150, 0x250),
            bpf_init: (0x1000, 0x1008),
        }),
    });
    let image = encode_cus(
        &elf_data,
        &[make_cu("a.c"), make_cu("b.c")],
        EncoderConfig::default(),
    );

    let btf = Btf::parse(&image).unwrap();
    let funcs = btf
        .types()
        .iter()
        .filter(|t| matches!(t, BtfType::Func(_)))
        .count();
    assert_eq!(funcs, 1);
}

#[test]
fn function_with_unnamed_param_is_skipped_under_filtering() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let name = cu.intern("foo");
    cu.functions.push(Function {
        name: name,
        declaration: false,
        external: true,
        ret: 0,
        params: vec![Param {
            name: 0,
            type_ref: 0,
        }],
    });

    let elf_data = build_elf(&ElfSpec {
        funcs: vec![("foo", 0x100)],
        percpu: vec![],
        mcount: Some(McountSpec {
            start: 0x40,
            addrs: vec![0x100],
            init: (0x150, 0x250),
            bpf_init: (0x1000, 0x1008),
        }),
    });
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert!(btf.types().iter().all(|t| !matches!(t, BtfType::Func(_))));
}

#[test]
fn fallback_selection_uses_declaration_criterion() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let ext = cu.intern("exported");
    cu.functions.push(Function {
        name: ext,
        declaration: false,
        external: true,
        ret: 0,
        params: vec![],
    });
    let stat = cu.intern("local_helper");
    cu.functions.push(Function {
        name: stat,
        declaration: false,
        external: false,
        ret: 0,
        params: vec![],
    });
    let decl = cu.intern("only_declared");
    cu.functions.push(Function {
        name: decl,
        declaration: true,
        external: true,
        ret: 0,
        params: vec![],
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let funcs: Vec<&str> = btf
        .types()
        .iter()
        .filter_map(|t| match t {
            BtfType::Func(f) => Some(f.name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(funcs, vec!["exported"]);
}

fn percpu_cu() -> Cu {
    let mut cu = Cu::new("sample.o", "sample.c");
    let int_name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: int_name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    let var_name = cu.intern("cpu_x");
    cu.variables.push(Variable {
        name: var_name,
        scope: VarScope::Global,
        declaration: false,
        external: true,
        addr: 0x1040,
        type_ref: int_id,
        spec: None,
    });
    cu
}

#[test]
fn encodes_percpu_variable_with_datasec() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_x", 0x1040, 8)],
        mcount: None,
    });
    let image = encode_cus(&elf_data, &[percpu_cu()], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let mut var_id = 0;
    for (i, t) in btf.types().iter().enumerate() {
        if let BtfType::Var(v) = t {
            assert_eq!(v.name, "cpu_x");
            assert_eq!(v.type_id, 1);
            assert_eq!(v.kind, BtfVarKind::GlobalAlloc);
            var_id = i as u32;
        }
    }
    assert!(var_id != 0, "no VAR was emitted");

    match btf.types().last().unwrap() {
        BtfType::Datasec(d) => {
            assert_eq!(d.name, ".data..percpu");
            assert_eq!(d.vars.len(), 1);
            assert_eq!(d.vars[0].type_id, var_id);
            // the written section sits at address 0, so the offset is the
            // symbol address itself
            assert_eq!(d.vars[0].offset, 0x1040);
            assert_eq!(d.vars[0].sz, 8);
        }
        t => panic!("expected DATASEC, got {}", t),
    }
}

#[test]
fn percpu_variable_not_in_symtab_is_skipped() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_other", 0x2000, 8)],
        mcount: None,
    });
    let image = encode_cus(&elf_data, &[percpu_cu()], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    assert!(btf.types().iter().all(|t| !matches!(t, BtfType::Var(_))));
    assert!(btf.types().iter().all(|t| !matches!(t, BtfType::Datasec(_))));
}

#[test]
fn void_typed_percpu_variable_is_fatal_unless_forced() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let var_name = cu.intern("cpu_x");
    cu.variables.push(Variable {
        name: var_name,
        scope: VarScope::Global,
        declaration: false,
        external: true,
        addr: 0x1040,
        type_ref: 0,
        spec: None,
    });

    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_x", 0x1040, 8)],
        mcount: None,
    });

    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session =
        EncoderSession::new(&elf, "sample.o", EncoderConfig::default(), None).unwrap();
    assert!(session.encode_cu(&cu).is_err());

    let forced = EncoderConfig {
        force: true,
        ..EncoderConfig::default()
    };
    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session = EncoderSession::new(&elf, "sample.o", forced, None).unwrap();
    session.encode_cu(&cu).unwrap();
    let image = session.finalize().unwrap();
    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 1);
}

#[test]
fn percpu_variable_address_is_taken_before_following_spec() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let int_name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: int_name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    // declaration carries the type, definition carries the address
    let decl_name = cu.intern("cpu_x");
    cu.variables.push(Variable {
        name: decl_name,
        scope: VarScope::Global,
        declaration: true,
        external: true,
        addr: 0,
        type_ref: int_id,
        spec: None,
    });
    cu.variables.push(Variable {
        name: 0,
        scope: VarScope::Local,
        declaration: false,
        external: false,
        addr: 0x1040,
        type_ref: 0,
        spec: Some(0),
    });

    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_x", 0x1040, 4)],
        mcount: None,
    });
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let vars: Vec<_> = btf
        .types()
        .iter()
        .filter_map(|t| match t {
            BtfType::Var(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(vars.len(), 1);
    assert_eq!(vars[0].name, "cpu_x");
    assert_eq!(vars[0].type_id, 1);
    assert_eq!(vars[0].kind, BtfVarKind::GlobalAlloc);
}

#[test]
fn zero_sized_percpu_symbols_are_skipped() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("anchor", 0x1000, 0), ("cpu_x", 0x1040, 8)],
        mcount: None,
    });
    let elf = ElfReader::parse(&elf_data).unwrap();
    let index = SymbolIndex::collect(&elf, true, false, false).unwrap();
    assert_eq!(index.percpu_vars.len(), 1);
    assert_eq!(index.percpu_vars[0].name, "cpu_x");
}

#[test]
fn invalid_percpu_symbol_name_is_fatal_unless_forced() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu$bad", 0x1040, 8)],
        mcount: None,
    });
    let elf = ElfReader::parse(&elf_data).unwrap();
    assert!(SymbolIndex::collect(&elf, true, false, false).is_err());

    let index = SymbolIndex::collect(&elf, true, true, false).unwrap();
    assert!(index.percpu_vars.is_empty());
}

#[test]
fn skip_encoding_vars_bypasses_percpu_encoding() {
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_x", 0x1040, 8)],
        mcount: None,
    });
    let cfg = EncoderConfig {
        skip_encoding_vars: true,
        ..EncoderConfig::default()
    };
    let image = encode_cus(&elf_data, &[percpu_cu()], cfg);

    let btf = Btf::parse(&image).unwrap();
    assert!(btf.types().iter().all(|t| !matches!(t, BtfType::Var(_))));
}

#[test]
fn base_btf_continues_type_numbering() {
    let mut base_builder = btfenc::builder::BtfBuilder::new(scroll::LE);
    base_builder
        .add_int("long", 64, BtfIntEncoding::Signed)
        .unwrap();
    base_builder
        .add_int("char", 8, BtfIntEncoding::Signed)
        .unwrap();
    let base_image = base_builder.encode().unwrap();
    let base = Btf::parse(&base_image).unwrap();
    assert_eq!(base.type_cnt(), 3);

    let elf_data = build_elf(&ElfSpec::default());
    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session =
        EncoderSession::new(&elf, "sample.o", EncoderConfig::default(), Some(&base)).unwrap();
    session.encode_cu(&int_cu()).unwrap();
    let image = session.finalize().unwrap();

    // the split image holds only the continuation types
    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 2);
    match btf.type_by_id(1) {
        BtfType::Int(t) => assert_eq!(t.name, "int"),
        t => panic!("expected INT, got {}", t),
    }
}

#[test]
fn double_encode_is_byte_identical() {
    let build = || {
        let mut cu = percpu_cu();
        let name = cu.intern("exported");
        cu.functions.push(Function {
            name: name,
            declaration: false,
            external: true,
            ret: 0,
            params: vec![],
        });
        cu
    };
    let elf_data = build_elf(&ElfSpec {
        funcs: vec![],
        percpu: vec![("cpu_x", 0x1040, 8)],
        mcount: None,
    });
    let first = encode_cus(&elf_data, &[build()], EncoderConfig::default());
    let second = encode_cus(&elf_data, &[build()], EncoderConfig::default());
    assert_eq!(first, second);
}

#[test]
fn emitted_references_stay_within_the_table() {
    let mut cu = Cu::new("sample.o", "sample.c");
    let int_name = cu.intern("int");
    let int_id = cu.push_type(Type::Base {
        name: int_name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    let ptr_id = cu.push_type(Type::Ref {
        kind: btfenc::graph::RefKind::Pointer,
        type_ref: int_id,
    });
    let s_name = cu.intern("node");
    let next_name = cu.intern("next");
    cu.push_type(Type::Composite {
        kind: CompositeKind::Struct,
        name: s_name,
        size: 8,
        declaration: false,
        members: vec![Member {
            name: next_name,
            type_ref: ptr_id,
            bit_offset: 0,
            bitfield_size: 0,
        }],
    });

    let elf_data = build_elf(&ElfSpec::default());
    let image = encode_cus(&elf_data, &[cu], EncoderConfig::default());

    let btf = Btf::parse(&image).unwrap();
    let max_id = btf.type_cnt() - 1;
    for t in btf.types() {
        let refs: Vec<u32> = match t {
            BtfType::Ptr(p) => vec![p.type_id],
            BtfType::Struct(c) | BtfType::Union(c) => {
                c.members.iter().map(|m| m.type_id).collect()
            }
            BtfType::Array(a) => vec![a.val_type_id, a.idx_type_id],
            BtfType::Typedef(td) => vec![td.type_id],
            BtfType::Func(f) => vec![f.proto_type_id],
            BtfType::FuncProto(p) => {
                let mut r = vec![p.res_type_id];
                r.extend(p.params.iter().map(|p| p.type_id));
                r
            }
            BtfType::Var(v) => vec![v.type_id],
            _ => vec![],
        };
        for r in refs {
            assert!(r <= max_id, "reference {} beyond table max {}", r, max_id);
        }
    }
}

#[test]
fn session_rejects_cu_from_another_object() {
    let elf_data = build_elf(&ElfSpec::default());
    let elf = ElfReader::parse(&elf_data).unwrap();
    let mut session =
        EncoderSession::new(&elf, "sample.o", EncoderConfig::default(), None).unwrap();
    session.encode_cu(&int_cu()).unwrap();

    let mut other = Cu::new("other.o", "other.c");
    let name = other.intern("int");
    other.push_type(Type::Base {
        name: name,
        bits: 32,
        encoding: BtfIntEncoding::Signed,
    });
    assert!(session.encode_cu(&other).is_err());
}

#[test]
fn name_validity_follows_the_kernel_rule() {
    assert!(btf_name_valid("cpu_x"));
    assert!(btf_name_valid("_private"));
    assert!(btf_name_valid(".hidden"));
    assert!(btf_name_valid("x86_64.cfg"));
    assert!(!btf_name_valid(""));
    assert!(!btf_name_valid("9lives"));
    assert!(!btf_name_valid("has space"));
    assert!(!btf_name_valid("dollar$ign"));
    let long = "a".repeat(200);
    assert!(!btf_name_valid(&long));
}

#[test]
fn builder_rejects_member_without_composite() {
    let mut builder = btfenc::builder::BtfBuilder::new(scroll::LE);
    builder.add_int("int", 32, BtfIntEncoding::Signed).unwrap();
    assert!(builder.add_member("stray", 1, 0, 0).is_err());
}

#[test]
fn cli_encodes_object_without_dwarf_to_empty_btf() {
    let tempdir = tempfile::tempdir().unwrap();
    let input = tempdir.path().join("sample.o");
    let output = tempdir.path().join("sample.btf");
    std::fs::write(&input, build_elf(&ElfSpec::default())).unwrap();

    let status = std::process::Command::new(env!("CARGO_BIN_EXE_btfenc"))
        .arg(&input)
        .arg("-o")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());

    let image = std::fs::read(&output).unwrap();
    let btf = Btf::parse(&image).unwrap();
    assert_eq!(btf.type_cnt(), 1);
}
