//! Locating the byte spans of a module's sections.
//!
//! The host runtime compiles the module for us but does not expose the
//! raw import, code, and data section payloads, and symbolizing a
//! Go-compiled guest needs them together with their absolute offsets
//! inside the binary. This module walks the top-level section records
//! directly. It is a deliberately weak parser: it assumes the module
//! already passed the host runtime's validation, and any truncation
//! simply leaves the affected span unset so callers can degrade.

use crate::reader::Reader;

/// A raw section payload and the absolute offset of its first byte
/// inside the module binary (after the section id and size).
#[derive(Clone, Copy, Debug)]
pub struct Section<'a> {
    /// Offset of `data[0]` from the start of the module binary.
    pub offset: u64,
    /// The section payload.
    pub data: &'a [u8],
}

/// The section spans a profiler needs from a module binary.
///
/// A span is `None` when the section is absent or the module was
/// truncated before it.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleSections<'a> {
    /// The import section payload.
    pub imports: Option<Section<'a>>,
    /// The code section payload.
    pub code: Option<Section<'a>>,
    /// The data section payload.
    pub data: Option<Section<'a>>,
    /// The payload of the `"name"` custom section, after its name
    /// vector.
    pub name: Option<Section<'a>>,
}

const CUSTOM_SECTION_ID: u8 = 0;
const IMPORT_SECTION_ID: u8 = 2;
const CODE_SECTION_ID: u8 = 10;
const DATA_SECTION_ID: u8 = 11;

impl<'a> ModuleSections<'a> {
    /// Locates the import, code, data, and `"name"` sections of
    /// `wasm`.
    ///
    /// Module order is fixed (import before code before data, with the
    /// `"name"` custom section trailing), so the `"name"` section is
    /// only recognized once the data section has been seen; custom
    /// sections appearing earlier (such as DWARF ones) are skipped
    /// here and surfaced by [`custom_sections`] instead.
    pub fn parse(wasm: &'a [u8]) -> ModuleSections<'a> {
        let mut sections = ModuleSections::default();
        let _ = sections.parse_inner(wasm);
        sections
    }

    fn parse_inner(&mut self, wasm: &'a [u8]) -> crate::error::Result<()> {
        let mut r = Reader::new(wasm);
        // Magic and version.
        r.skip(8)?;

        while !r.is_empty() {
            let id = r.read_u8()?;
            let length = r.read_uleb128()? as usize;
            let offset = r.offset() as u64;
            let payload = r.read_bytes(length)?;

            match id {
                IMPORT_SECTION_ID => self.imports = Some(Section { offset, data: payload }),
                CODE_SECTION_ID => self.code = Some(Section { offset, data: payload }),
                DATA_SECTION_ID => self.data = Some(Section { offset, data: payload }),
                CUSTOM_SECTION_ID if self.data.is_some() => {
                    let mut c = Reader::new(payload);
                    let name = c.read_name()?;
                    if name == "name" {
                        let consumed = c.offset();
                        self.name = Some(Section {
                            offset: offset + consumed as u64,
                            data: &payload[consumed..],
                        });
                        return Ok(());
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// Lists the `(name, payload)` of every custom section in `wasm`.
///
/// This feeds the DWARF symbolizer (`.debug_*` sections). Parse errors
/// end the listing early rather than failing: a module with a mangled
/// tail still yields the sections seen before it.
pub fn custom_sections(wasm: &[u8]) -> Vec<(&str, &[u8])> {
    let mut out = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(wasm) {
        match payload {
            Ok(wasmparser::Payload::CustomSection(s)) => out.push((s.name(), s.data())),
            Ok(_) => {}
            Err(err) => {
                log::warn!("stopping custom section scan: {err}");
                break;
            }
        }
    }
    out
}
