//! Fuzz the module section locator on arbitrary bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Locating sections must degrade gracefully on any input, valid
    // module or not.
    let sections = guestprof::ModuleSections::parse(data);
    let _ = guestprof::custom_sections(data);

    if let (Some(code), Some(imports)) = (sections.code, sections.imports) {
        let _ = guestprof::CodeMap::build(code, sections.name, Some(imports));
    }
});
