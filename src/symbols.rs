//! The symbolizer surface shared by every guest toolchain.

use std::sync::Arc;

use crate::codemap::CodeMap;
use crate::dwarf::DwarfSymbolizer;
use crate::listener::FunctionInfo;
use crate::pclntab::PclnTable;

/// A symbolized program point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    /// Source file path, or empty when unknown.
    pub file: String,
    /// 1-based source line, 0 when unknown.
    pub line: i64,
    /// 1-based source column, 0 when unknown.
    pub column: i64,
    /// Whether this frame was inlined into its caller.
    pub inlined: bool,
    /// The program counter this location was resolved from.
    pub pc: u64,
    /// Demangled, namespace-qualified name.
    pub human_name: String,
    /// Linkage name when present, otherwise equal to `human_name`.
    pub stable_name: String,
}

/// Resolves program counters to chains of source locations.
///
/// The two working variants share one capability: given a function and
/// a PC, return the address the lookup matched and an inner-first list
/// of locations (the tail entries are progressively outer inlined
/// callers). The `None` variant handles modules without usable debug
/// information by resolving nothing; the profile builder then falls
/// back to the function's declared name.
pub enum Symbolizer<'a> {
    /// DWARF debug sections embedded in the module.
    Dwarf(DwarfSymbolizer<'a>),
    /// The Go runtime's line table recovered from the data section.
    Go(GoSymbolizer),
    /// No debug information.
    None,
}

impl Symbolizer<'_> {
    /// Resolves `pc`, observed while executing `func`, to source
    /// locations. An empty list means the PC could not be resolved.
    pub fn locations(&self, func: &FunctionInfo, pc: u64) -> (u64, Vec<Location>) {
        match self {
            Symbolizer::Dwarf(dwarf) => (pc, dwarf.lookup(pc)),
            Symbolizer::Go(go) => go.locations(func, pc),
            Symbolizer::None => (0, Vec::new()),
        }
    }
}

/// Symbolizer for Go-compiled guests.
///
/// PCs are resolved through the reconstructed runtime line table. A PC
/// that is not already in the guest runtime's `PC_F << 16 | PC_B`
/// encoding is treated as a code-section offset and translated through
/// the code map first.
pub struct GoSymbolizer {
    codemap: Arc<CodeMap>,
    table: PclnTable,
}

impl GoSymbolizer {
    /// Builds the symbolizer from the module's code map and decoded
    /// line table.
    pub fn new(codemap: Arc<CodeMap>, table: PclnTable) -> GoSymbolizer {
        GoSymbolizer { codemap, table }
    }

    /// The decoded line table.
    pub fn table(&self) -> &PclnTable {
        &self.table
    }

    /// The module's code map.
    pub fn codemap(&self) -> &Arc<CodeMap> {
        &self.codemap
    }

    fn locations(&self, _func: &FunctionInfo, pc: u64) -> (u64, Vec<Location>) {
        let pc = if self.codemap.func_index_for_pc(pc).is_some() {
            Some(pc)
        } else {
            self.codemap.pc_for_source_offset(pc)
        };
        let Some(pc) = pc else {
            return (0, Vec::new());
        };

        let Some((file, line, name)) = self.table.pc_to_line(pc) else {
            return (0, Vec::new());
        };
        let location = Location {
            file,
            line,
            column: 0,
            inlined: false,
            pc,
            stable_name: name.clone(),
            human_name: name,
        };
        (pc, vec![location])
    }
}
