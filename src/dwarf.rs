//! Symbolizing program counters through the module's DWARF sections.
//!
//! Construction walks every compile unit once and records each
//! subprogram with its PC ranges, its namespace, and the
//! inlined-subroutine entries nested directly inside it. Lookups then
//! match a PC against the range index, decode the owning unit's line
//! program (cached per unit), and expand the inlined-call chain by
//! following abstract-origin references back to each function's
//! defining entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gimli::{AttributeValue, EndianSlice, LittleEndian, UnitOffset};

use crate::error::{Error, Result};
use crate::symbols::Location;

type Slice<'a> = EndianSlice<'a, LittleEndian>;

type PcRange = (u64, u64);

/// Range attached to subprograms that declare none: such entries are
/// only ever reached as abstract origins of inlined frames, never by
/// PC lookup.
const SENTINEL_RANGE: PcRange = (u64::MAX, u64::MAX);

/// One function definition found in `.debug_info`.
#[derive(Debug)]
struct Subprogram {
    /// Index of the owning unit.
    unit: usize,
    /// Offset of the subprogram's DIE within that unit.
    offset: UnitOffset,
    /// Direct `DW_TAG_inlined_subroutine` children, in declaration
    /// order.
    inlines: Vec<UnitOffset>,
    /// Enclosing namespaces rendered as `"A:B:"`.
    namespace: String,
}

#[derive(Debug)]
struct SubprogramRange {
    range: PcRange,
    subprogram: usize,
}

/// Fully decoded line rows of one unit, sorted by address.
#[derive(Debug)]
struct UnitLines {
    rows: Vec<LineRow>,
    /// File paths indexed the way the unit's line program indexes
    /// them.
    files: Vec<Arc<str>>,
}

#[derive(Clone, Debug)]
struct LineRow {
    address: u64,
    file: u64,
    line: i64,
    column: i64,
}

/// Symbolizer over the `.debug_*` custom sections of a module.
#[derive(Debug)]
pub struct DwarfSymbolizer<'a> {
    dwarf: gimli::Dwarf<Slice<'a>>,
    units: Vec<gimli::Unit<Slice<'a>>>,
    subprograms: Vec<Subprogram>,
    index: Vec<SubprogramRange>,
    /// Subprogram lookup by `(unit, DIE offset)`, used when resolving
    /// the namespace of an abstract origin.
    by_offset: HashMap<(usize, usize), usize>,
    /// Per-unit line rows, decoded on first use.
    lines: Mutex<HashMap<usize, Arc<UnitLines>>>,
}

const REQUIRED_SECTIONS: [&str; 5] = [
    ".debug_info",
    ".debug_line",
    ".debug_str",
    ".debug_abbrev",
    ".debug_ranges",
];

impl<'a> DwarfSymbolizer<'a> {
    /// Builds the symbolizer from the module's custom sections.
    ///
    /// Each of `.debug_info`, `.debug_line`, `.debug_str`,
    /// `.debug_abbrev`, and `.debug_ranges` must be present; the first
    /// one missing is named in the error so callers can report why
    /// symbolization degraded.
    pub fn from_custom_sections(sections: &[(&'a str, &'a [u8])]) -> Result<DwarfSymbolizer<'a>> {
        let find = |name: &str| {
            sections
                .iter()
                .find(|(n, _)| *n == name)
                .map(|&(_, data)| data)
        };
        for name in REQUIRED_SECTIONS {
            if find(name).is_none() {
                return Err(Error::MissingSection(name));
            }
        }

        let dwarf = gimli::Dwarf::load(|id| -> std::result::Result<Slice<'a>, gimli::Error> {
            Ok(EndianSlice::new(
                find(id.name()).unwrap_or(&[]),
                LittleEndian,
            ))
        })?;

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            units.push(dwarf.unit(header)?);
        }

        let mut builder = IndexBuilder {
            dwarf: &dwarf,
            subprograms: Vec::new(),
            index: Vec::new(),
        };
        for (unit_idx, unit) in units.iter().enumerate() {
            builder.parse_unit(unit_idx, unit)?;
        }
        let IndexBuilder {
            subprograms, index, ..
        } = builder;

        let by_offset = subprograms
            .iter()
            .enumerate()
            .map(|(i, s)| ((s.unit, s.offset.0), i))
            .collect();

        Ok(DwarfSymbolizer {
            dwarf,
            units,
            subprograms,
            index,
            by_offset,
            lines: Mutex::new(HashMap::new()),
        })
    }

    /// Resolves `pc` to its chain of source locations: index 0 is the
    /// innermost real frame, later entries are progressively outer
    /// inlined callers. Empty when the PC is unknown to the debug
    /// info.
    pub fn lookup(&self, pc: u64) -> Vec<Location> {
        let Some(spgm) = self
            .index
            .iter()
            .find(|sr| sr.range.0 <= pc && pc <= sr.range.1)
            .map(|sr| &self.subprograms[sr.subprogram])
        else {
            return Vec::new();
        };

        let Some(lines) = self.unit_lines(spgm.unit) else {
            return Vec::new();
        };

        // Find the greatest line address <= pc. DWARF allows a PC to
        // be covered by the closest preceding row, so fall back to the
        // predecessor when there is no exact match.
        let i = lines.rows.partition_point(|r| r.address < pc);
        let row = if i < lines.rows.len() && lines.rows[i].address == pc {
            &lines.rows[i]
        } else if i == lines.rows.len() || i == 0 {
            return Vec::new();
        } else {
            &lines.rows[i - 1]
        };

        let (human, stable) =
            self.names_for_entry(spgm.unit, spgm.offset, Some(spgm.namespace.as_str()));

        let mut locations = Vec::with_capacity(1 + spgm.inlines.len());
        locations.push(Location {
            file: lines
                .files
                .get(row.file as usize)
                .map(|f| f.to_string())
                .unwrap_or_default(),
            line: row.line,
            column: row.column,
            inlined: !spgm.inlines.is_empty(),
            pc,
            human_name: human,
            stable_name: stable,
        });

        for (i, &inline_offset) in spgm.inlines.iter().enumerate().rev() {
            let Some(call) = self.inline_call_site(spgm.unit, inline_offset, &lines) else {
                break;
            };
            let (human, stable) = self.names_for_entry(spgm.unit, inline_offset, None);
            locations.push(Location {
                file: call.0,
                line: call.1,
                column: call.2,
                inlined: i != 0,
                pc,
                human_name: human,
                stable_name: stable,
            });
        }

        locations
    }

    /// The DIE at `offset` within `unit`.
    fn die_at<'u>(
        &self,
        unit: &'u gimli::Unit<Slice<'a>>,
        offset: UnitOffset,
    ) -> Option<gimli::DebuggingInformationEntry<'u, 'u, Slice<'a>>> {
        unit.header.entry(&unit.abbreviations, offset).ok()
    }

    /// `(file, line, column)` of the call site recorded on an
    /// inlined-subroutine entry. `None` when the call file is missing
    /// or out of range, which ends the inline expansion.
    fn inline_call_site(
        &self,
        unit_idx: usize,
        offset: UnitOffset,
        lines: &UnitLines,
    ) -> Option<(String, i64, i64)> {
        let unit = &self.units[unit_idx];
        let entry = self.die_at(unit, offset)?;

        let file = attr_udata(entry.attr_value(gimli::DW_AT_call_file).ok()??)?;
        if file as usize >= lines.files.len() {
            return None;
        }
        let line = entry
            .attr_value(gimli::DW_AT_call_line)
            .ok()
            .flatten()
            .and_then(attr_udata)
            .unwrap_or(0) as i64;
        let column = entry
            .attr_value(gimli::DW_AT_call_column)
            .ok()
            .flatten()
            .and_then(attr_udata)
            .unwrap_or(0) as i64;

        Some((lines.files[file as usize].to_string(), line, column))
    }

    /// Human and stable names for the entry at `offset`, following
    /// `DW_AT_abstract_origin` references until the defining entry.
    ///
    /// `namespace` short-circuits the subprogram-table search when the
    /// caller already knows which subprogram the entry is.
    fn names_for_entry(
        &self,
        unit_idx: usize,
        offset: UnitOffset,
        namespace: Option<&str>,
    ) -> (String, String) {
        let (unit_idx, offset) = self.resolve_abstract_origin(unit_idx, offset);
        let unit = &self.units[unit_idx];

        let ns = namespace
            .or_else(|| {
                self.by_offset
                    .get(&(unit_idx, offset.0))
                    .map(|&i| self.subprograms[i].namespace.as_str())
            })
            .unwrap_or("");

        let Some(entry) = self.die_at(unit, offset) else {
            return (String::new(), String::new());
        };

        let name = self
            .attr_str(unit, &entry, gimli::DW_AT_name)
            .unwrap_or_default();
        let human = format!("{ns}{name}");
        let stable = self
            .attr_str(unit, &entry, gimli::DW_AT_linkage_name)
            .unwrap_or_else(|| human.clone());

        (human, stable)
    }

    /// Follows the abstract-origin chain from `(unit, offset)` to its
    /// terminal entry. Chains may cross compile units; entries are
    /// identified by section offset and the walk is bounded, so
    /// malformed cyclic chains cannot loop.
    fn resolve_abstract_origin(
        &self,
        mut unit_idx: usize,
        mut offset: UnitOffset,
    ) -> (usize, UnitOffset) {
        for _ in 0..64 {
            let unit = &self.units[unit_idx];
            let Some(entry) = self.die_at(unit, offset) else {
                return (unit_idx, offset);
            };
            match entry.attr_value(gimli::DW_AT_abstract_origin) {
                Ok(Some(AttributeValue::UnitRef(next))) => offset = next,
                Ok(Some(AttributeValue::DebugInfoRef(section_offset))) => {
                    let Some((idx, next)) = self.locate_unit(section_offset) else {
                        return (unit_idx, offset);
                    };
                    unit_idx = idx;
                    offset = next;
                }
                _ => return (unit_idx, offset),
            }
        }
        (unit_idx, offset)
    }

    /// Finds the unit containing an absolute `.debug_info` offset.
    fn locate_unit(&self, offset: gimli::DebugInfoOffset) -> Option<(usize, UnitOffset)> {
        self.units.iter().enumerate().find_map(|(i, unit)| {
            offset
                .to_unit_offset(&unit.header)
                .map(|unit_offset| (i, unit_offset))
        })
    }

    fn attr_str(
        &self,
        unit: &gimli::Unit<Slice<'a>>,
        entry: &gimli::DebuggingInformationEntry<'_, '_, Slice<'a>>,
        attr: gimli::DwAt,
    ) -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let s = self.dwarf.attr_string(unit, value).ok()?;
        Some(s.to_string_lossy().into_owned())
    }

    /// Decoded line rows for a unit, built on first use.
    fn unit_lines(&self, unit_idx: usize) -> Option<Arc<UnitLines>> {
        if let Some(cached) = self.lines.lock().unwrap().get(&unit_idx) {
            return Some(cached.clone());
        }

        let unit = &self.units[unit_idx];
        let program = unit.line_program.clone()?;
        let lines = match self.decode_line_program(unit, program) {
            Ok(lines) => Arc::new(lines),
            Err(err) => {
                log::warn!("failed to decode line program: {err}");
                return None;
            }
        };

        self.lines
            .lock()
            .unwrap()
            .entry(unit_idx)
            .or_insert(lines.clone());
        Some(lines)
    }

    fn decode_line_program(
        &self,
        unit: &gimli::Unit<Slice<'a>>,
        program: gimli::IncompleteLineProgram<Slice<'a>>,
    ) -> Result<UnitLines> {
        let header = program.header().clone();

        // File indexing is 1-based before DWARF 5, so slot 0 stays
        // empty there.
        let file_count = header.file_names().len() as u64;
        let table_len = if header.version() >= 5 {
            file_count
        } else {
            file_count + 1
        };
        let mut files = Vec::with_capacity(table_len as usize);
        for idx in 0..table_len {
            files.push(match header.file(idx) {
                Some(entry) => self.render_file(unit, &header, entry),
                None => Arc::from(""),
            });
        }

        let mut rows = Vec::new();
        let mut iter = program.rows();
        while let Some((_, row)) = iter.next_row()? {
            if row.end_sequence() {
                continue;
            }
            rows.push(LineRow {
                address: row.address(),
                file: row.file_index(),
                line: row.line().map(|l| l.get() as i64).unwrap_or(0),
                column: match row.column() {
                    gimli::ColumnType::LeftEdge => 0,
                    gimli::ColumnType::Column(c) => c.get() as i64,
                },
            });
        }
        rows.sort_by_key(|r| r.address);

        Ok(UnitLines { rows, files })
    }

    fn render_file(
        &self,
        unit: &gimli::Unit<Slice<'a>>,
        header: &gimli::LineProgramHeader<Slice<'a>>,
        entry: &gimli::FileEntry<Slice<'a>>,
    ) -> Arc<str> {
        let name = self
            .dwarf
            .attr_string(unit, entry.path_name())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.starts_with('/') {
            return Arc::from(name);
        }

        let dir = entry
            .directory(header)
            .and_then(|d| self.dwarf.attr_string(unit, d).ok())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if dir.is_empty() {
            Arc::from(name)
        } else {
            Arc::from(format!("{dir}/{name}"))
        }
    }
}

fn attr_udata(value: AttributeValue<Slice<'_>>) -> Option<u64> {
    match value {
        AttributeValue::FileIndex(i) => Some(i),
        other => other.udata_value(),
    }
}

/// Depth-first walk over every unit collecting subprograms.
struct IndexBuilder<'d, 'a> {
    dwarf: &'d gimli::Dwarf<Slice<'a>>,
    subprograms: Vec<Subprogram>,
    index: Vec<SubprogramRange>,
}

impl<'d, 'a> IndexBuilder<'d, 'a> {
    fn parse_unit(&mut self, unit_idx: usize, unit: &gimli::Unit<Slice<'a>>) -> Result<()> {
        let mut tree = unit.entries_tree(None)?;
        let root = tree.root()?;
        self.walk(unit_idx, unit, root, "")?;
        Ok(())
    }

    fn walk(
        &mut self,
        unit_idx: usize,
        unit: &gimli::Unit<Slice<'a>>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Slice<'a>>,
        ns: &str,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            match child.entry().tag() {
                gimli::DW_TAG_subprogram => {
                    self.parse_subprogram(unit_idx, unit, child, ns)?;
                }
                gimli::DW_TAG_namespace => {
                    let name = child
                        .entry()
                        .attr_value(gimli::DW_AT_name)
                        .ok()
                        .flatten()
                        .and_then(|v| self.dwarf.attr_string(unit, v).ok())
                        .map(|s| s.to_string_lossy().into_owned());
                    let ns = match name {
                        Some(name) => format!("{ns}{name}:"),
                        None => ns.to_string(),
                    };
                    self.walk(unit_idx, unit, child, &ns)?;
                }
                _ => self.walk(unit_idx, unit, child, ns)?,
            }
        }
        Ok(())
    }

    fn parse_subprogram(
        &mut self,
        unit_idx: usize,
        unit: &gimli::Unit<Slice<'a>>,
        node: gimli::EntriesTreeNode<'_, '_, '_, Slice<'a>>,
        ns: &str,
    ) -> Result<()> {
        let offset = node.entry().offset();

        let mut ranges = Vec::new();
        match self.dwarf.die_ranges(unit, node.entry()) {
            Ok(mut iter) => {
                while let Some(range) = iter.next()? {
                    ranges.push((range.begin, range.end));
                }
            }
            Err(err) => {
                log::warn!("failed to read subprogram ranges: {err}");
                return Ok(());
            }
        }

        // Children of inlined entries describe the variables captured
        // by inlining; only the inlined subroutines themselves matter
        // here.
        let mut inlines = Vec::new();
        let mut children = node.children();
        while let Some(child) = children.next()? {
            if child.entry().tag() == gimli::DW_TAG_inlined_subroutine {
                inlines.push(child.entry().offset());
            }
        }

        if ranges.is_empty() {
            // A subprogram with no range of its own is usually one
            // that only exists inlined elsewhere; it must stay in the
            // collection because abstract origins resolve through it,
            // but under a range no PC search can win.
            ranges.push(SENTINEL_RANGE);
        }

        let subprogram = self.subprograms.len();
        self.subprograms.push(Subprogram {
            unit: unit_idx,
            offset,
            inlines,
            namespace: ns.to_string(),
        });
        for range in ranges {
            self.index.push(SubprogramRange { range, subprogram });
        }
        Ok(())
    }
}
