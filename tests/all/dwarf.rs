use std::collections::HashMap;

use gimli::write::{
    Address, AttributeValue, DwarfUnit, EndianVec, LineProgram, LineString, Sections,
};
use gimli::{Encoding, Format, LineEncoding, LittleEndian};

use guestprof::DwarfSymbolizer;

/// Synthesizes the `.debug_*` sections of a module with:
///
/// * `f`: a plain subprogram at `0x100..0x120` with line rows at
///   `0x108`, `0x110`, and `0x118` (lines 10, 11, 12);
/// * `h`: a subprogram at `0x200..0x240` (line 20) into which `f` and
///   then `mylib::g` were inlined, recorded as two inlined-subroutine
///   children whose abstract origins are range-less subprogram
///   definitions.
pub fn build_debug_sections() -> HashMap<&'static str, Vec<u8>> {
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 4,
        address_size: 4,
    };
    let mut dwarf = DwarfUnit::new(encoding);

    dwarf.unit.line_program = LineProgram::new(
        encoding,
        LineEncoding::default(),
        LineString::String(b"/src".to_vec()),
        LineString::String(b"main.rs".to_vec()),
        None,
    );
    let dir = dwarf
        .unit
        .line_program
        .add_directory(LineString::String(b"/src".to_vec()));
    let file_id =
        dwarf
            .unit
            .line_program
            .add_file(LineString::String(b"main.rs".to_vec()), dir, None);

    // Rows for f. The first row is deliberately above the function's
    // entry so lookups below it resolve to nothing.
    dwarf.unit.line_program.begin_sequence(Some(Address::Constant(0x100)));
    for (offset, line) in [(0x8u64, 10u64), (0x10, 11), (0x18, 12)] {
        let row = dwarf.unit.line_program.row();
        row.address_offset = offset;
        row.file = file_id;
        row.line = line;
        row.column = 3;
        dwarf.unit.line_program.generate_row();
    }
    dwarf.unit.line_program.end_sequence(0x20);

    // Rows for h.
    dwarf.unit.line_program.begin_sequence(Some(Address::Constant(0x200)));
    let row = dwarf.unit.line_program.row();
    row.address_offset = 0;
    row.file = file_id;
    row.line = 20;
    row.column = 5;
    dwarf.unit.line_program.generate_row();
    dwarf.unit.line_program.end_sequence(0x40);

    let root = dwarf.unit.root();

    let f = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let entry = dwarf.unit.get_mut(f);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"f".to_vec()));
    entry.set(
        gimli::DW_AT_low_pc,
        AttributeValue::Address(Address::Constant(0x100)),
    );
    entry.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x20));

    // Definitions that only exist inlined: no ranges of their own.
    let f_def = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let entry = dwarf.unit.get_mut(f_def);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"f".to_vec()));
    entry.set(
        gimli::DW_AT_linkage_name,
        AttributeValue::String(b"_ZN1fE".to_vec()),
    );

    let ns = dwarf.unit.add(root, gimli::DW_TAG_namespace);
    let entry = dwarf.unit.get_mut(ns);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"mylib".to_vec()));
    let g_def = dwarf.unit.add(ns, gimli::DW_TAG_subprogram);
    let entry = dwarf.unit.get_mut(g_def);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"g".to_vec()));

    let h = dwarf.unit.add(root, gimli::DW_TAG_subprogram);
    let entry = dwarf.unit.get_mut(h);
    entry.set(gimli::DW_AT_name, AttributeValue::String(b"h".to_vec()));
    entry.set(
        gimli::DW_AT_low_pc,
        AttributeValue::Address(Address::Constant(0x200)),
    );
    entry.set(gimli::DW_AT_high_pc, AttributeValue::Udata(0x40));

    // Innermost inlined function first, matching how the inline chain
    // is reported.
    let inl_f = dwarf.unit.add(h, gimli::DW_TAG_inlined_subroutine);
    let entry = dwarf.unit.get_mut(inl_f);
    entry.set(gimli::DW_AT_abstract_origin, AttributeValue::UnitRef(f_def));
    entry.set(
        gimli::DW_AT_call_file,
        AttributeValue::FileIndex(Some(file_id)),
    );
    entry.set(gimli::DW_AT_call_line, AttributeValue::Udata(31));
    entry.set(gimli::DW_AT_call_column, AttributeValue::Udata(9));

    let inl_g = dwarf.unit.add(h, gimli::DW_TAG_inlined_subroutine);
    let entry = dwarf.unit.get_mut(inl_g);
    entry.set(gimli::DW_AT_abstract_origin, AttributeValue::UnitRef(g_def));
    entry.set(
        gimli::DW_AT_call_file,
        AttributeValue::FileIndex(Some(file_id)),
    );
    entry.set(gimli::DW_AT_call_line, AttributeValue::Udata(21));
    entry.set(gimli::DW_AT_call_column, AttributeValue::Udata(7));

    let mut sections = Sections::new(EndianVec::new(LittleEndian));
    dwarf.write(&mut sections).unwrap();

    let mut out = HashMap::new();
    sections
        .for_each(|id, data| {
            out.insert(id.name(), data.slice().to_vec());
            Ok::<(), gimli::Error>(())
        })
        .unwrap();
    out
}

pub fn symbolizer<'a>(sections: &'a HashMap<&'static str, Vec<u8>>) -> DwarfSymbolizer<'a> {
    let list: Vec<(&str, &[u8])> = sections
        .iter()
        .map(|(&name, data)| (name, data.as_slice()))
        .collect();
    DwarfSymbolizer::from_custom_sections(&list).unwrap()
}

#[test]
fn construction_requires_every_debug_section() {
    let sections = build_debug_sections();
    for missing in [
        ".debug_info",
        ".debug_line",
        ".debug_str",
        ".debug_abbrev",
        ".debug_ranges",
    ] {
        let list: Vec<(&str, &[u8])> = sections
            .iter()
            .filter(|(&name, _)| name != missing)
            .map(|(&name, data)| (name, data.as_slice()))
            .collect();
        let err = DwarfSymbolizer::from_custom_sections(&list).unwrap_err();
        assert!(
            err.to_string().contains(missing),
            "error for {missing} was: {err}"
        );
    }
}

#[test]
fn resolves_exact_line_addresses() {
    let sections = build_debug_sections();
    let symbols = symbolizer(&sections);

    let locations = symbols.lookup(0x108);
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].human_name, "f");
    assert_eq!(locations[0].file, "/src/main.rs");
    assert_eq!(locations[0].line, 10);
    assert_eq!(locations[0].column, 3);
    assert!(!locations[0].inlined);
}

#[test]
fn falls_back_to_the_predecessor_line() {
    let sections = build_debug_sections();
    let symbols = symbolizer(&sections);

    // 0x112 is between the rows at 0x110 and 0x118.
    let locations = symbols.lookup(0x112);
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].line, 11);
}

#[test]
fn pcs_below_all_line_addresses_resolve_to_nothing() {
    let sections = build_debug_sections();
    let symbols = symbolizer(&sections);

    // Inside f's range but before its first row.
    assert!(symbols.lookup(0x104).is_empty());
    // Outside any subprogram range.
    assert!(symbols.lookup(0x500).is_empty());
    assert!(symbols.lookup(0).is_empty());
}

#[test]
fn expands_inlined_call_chains() {
    let sections = build_debug_sections();
    let symbols = symbolizer(&sections);

    let locations = symbols.lookup(0x200);
    assert_eq!(locations.len(), 3);

    // Innermost real frame: h's own source line.
    assert_eq!(locations[0].human_name, "h");
    assert_eq!(locations[0].line, 20);
    assert!(locations[0].inlined);

    // Then the inlined callers, outermost last: g's call site, then
    // f's.
    assert_eq!(locations[1].human_name, "mylib:g");
    assert_eq!(locations[1].line, 21);
    assert_eq!(locations[1].column, 7);
    assert!(locations[1].inlined);

    assert_eq!(locations[2].human_name, "f");
    assert_eq!(locations[2].stable_name, "_ZN1fE");
    assert_eq!(locations[2].line, 31);
    assert!(!locations[2].inlined);

    // Exactly one frame carries inlined = false.
    assert_eq!(locations.iter().filter(|l| !l.inlined).count(), 1);
}

#[test]
fn rangeless_subprograms_never_win_a_pc_search() {
    let sections = build_debug_sections();
    let symbols = symbolizer(&sections);

    // f_def and g_def sit under the sentinel range; no PC matches
    // them, including ones far past every real function.
    for pc in [0x121, 0x1000, u64::MAX - 1] {
        let locations = symbols.lookup(pc);
        assert!(locations.is_empty(), "pc {pc:#x} matched {locations:?}");
    }
}
