use wasm_encoder::{
    CodeSection, ConstExpr, CustomSection, DataSection, EntityType, Function, FunctionSection,
    ImportSection, Instruction, MemorySection, MemoryType, Module, NameMap, NameSection,
    TypeSection,
};

use guestprof::{custom_sections, ModuleSections};

fn test_module() -> Vec<u8> {
    let mut module = Module::new();

    let mut types = TypeSection::new();
    types.function([], []);
    module.section(&types);

    let mut imports = ImportSection::new();
    imports.import("env", "host_call", EntityType::Function(0));
    module.section(&imports);

    let mut functions = FunctionSection::new();
    functions.function(0);
    module.section(&functions);

    let mut memory = MemorySection::new();
    memory.memory(MemoryType {
        minimum: 1,
        maximum: None,
        memory64: false,
        shared: false,
    });
    module.section(&memory);

    // A custom section before the data section must not be mistaken
    // for the trailing "name" section.
    module.section(&CustomSection {
        name: "name".into(),
        data: b"decoy".as_slice().into(),
    });

    let mut code = CodeSection::new();
    let mut f = Function::new([]);
    f.instruction(&Instruction::End);
    code.function(&f);
    module.section(&code);

    let mut data = DataSection::new();
    data.active(0, &ConstExpr::i32_const(1024), [1u8, 2, 3, 4]);
    module.section(&data);

    let mut names = NameSection::new();
    let mut funcs = NameMap::new();
    funcs.append(1, "f");
    names.functions(&funcs);
    module.section(&names);

    module.finish()
}

#[test]
fn locates_sections_with_absolute_offsets() {
    let wasm = test_module();
    let sections = ModuleSections::parse(&wasm);

    for (label, section) in [
        ("imports", sections.imports),
        ("code", sections.code),
        ("data", sections.data),
        ("name", sections.name),
    ] {
        let section = section.unwrap_or_else(|| panic!("{label} section missing"));
        let offset = section.offset as usize;
        assert_eq!(
            &wasm[offset..offset + section.data.len()],
            section.data,
            "{label} span does not match its absolute offset"
        );
    }

    // The import payload declares one entry.
    assert_eq!(sections.imports.unwrap().data[0], 1);
    // The data payload declares one segment.
    assert_eq!(sections.data.unwrap().data[0], 1);
}

#[test]
fn name_section_is_only_recognized_after_data() {
    let wasm = test_module();
    let sections = ModuleSections::parse(&wasm);

    // The decoy custom section before the data section carries the
    // payload "decoy"; the real name section starts with the function
    // names subsection id.
    let name = sections.name.unwrap();
    assert_ne!(name.data, b"decoy");
    assert_eq!(name.data[0], 1);
}

#[test]
fn truncated_module_degrades_to_missing_spans() {
    let wasm = test_module();

    // Cut inside the code section header.
    let sections = ModuleSections::parse(&wasm[..20]);
    assert!(sections.code.is_none());
    assert!(sections.name.is_none());

    // Not even a full magic+version.
    let sections = ModuleSections::parse(&wasm[..4]);
    assert!(sections.imports.is_none());
    assert!(sections.data.is_none());
}

#[test]
fn custom_sections_are_listed_by_name() {
    let wasm = test_module();
    let customs = custom_sections(&wasm);

    let names: Vec<&str> = customs.iter().map(|&(name, _)| name).collect();
    assert_eq!(names, ["name", "name"]);
    assert_eq!(customs[0].1, b"decoy");
}
