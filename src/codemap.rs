//! Recovering the structure the Go linker gives to WebAssembly
//! function bodies.
//!
//! Go-compiled modules drive every function through a single jump
//! table: the body opens a ladder of `block`s, dispatches on local 0
//! with `br_table`, and reserves its stack frame with an
//! `i32.const N; i32.sub; local.tee 1; global.set 0` prologue. The
//! runtime's program counters encode `(function, block)` as
//! `PC_F << 16 | PC_B`, so recovering the block layout and frame size
//! of each function is what lets us translate between host-visible
//! PCs, code-section offsets, and the guest's own notion of a PC.

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::sections::Section;

/// The bias the linker adds to function indices when forming `PC_F`.
pub const FUNC_VALUE_OFFSET: u64 = 0x1000;

/// Unwinding and dispatch structure of a single function body.
///
/// `start` and `end` are offsets from the beginning of the code
/// section payload. A body whose prologue does not match the expected
/// pattern yields an entry with empty `jumps`/`blocks` and a zero
/// frame size: such functions are skipped by the unwinder rather than
/// unwound incorrectly.
#[derive(Clone, Debug, Default)]
pub struct FuncMap {
    /// Function id in the module index space (imports included).
    pub id: u32,
    /// Name from the module's name section, or empty.
    pub name: String,
    /// Offset of the body (size prefix excluded) in the code section.
    pub start: u64,
    /// Offset one past the body's last byte.
    pub end: u64,
    /// Bytes the prologue reserves on the guest stack.
    pub frame_size: u32,
    /// `jumps[pc_b]` is the block index the dispatch table selects.
    pub jumps: Vec<u32>,
    /// Byte ranges of the jump-table blocks, in source order,
    /// relative to the code section payload.
    pub blocks: Vec<(u64, u64)>,
}

/// Index from program counters to function structure for one module.
#[derive(Clone, Debug)]
pub struct CodeMap {
    imports: u32,
    fnmaps: Vec<FuncMap>,
}

impl CodeMap {
    /// Builds the code map from the module's code, name, and import
    /// section payloads.
    pub fn build(
        code: Section<'_>,
        name: Option<Section<'_>>,
        imports: Option<Section<'_>>,
    ) -> Result<CodeMap> {
        let imports = match imports {
            Some(s) => function_imports_count(s.data)?,
            None => 0,
        };
        let names = match name {
            Some(s) => function_names(s.data).unwrap_or_default(),
            None => Vec::new(),
        };

        let mut r = Reader::new(code.data);
        let count = r.read_uleb128()?;
        let mut fnmaps = Vec::with_capacity(count as usize);

        for i in 0..count as u32 {
            let size = r.read_uleb128()? as usize;
            let start = r.offset() as u64;
            let body = r.read_bytes(size)?;

            let id = imports + i;
            let mut fm = parse_fn_body(body, start)?;
            fm.id = id;
            // The name map is sorted by increasing function index.
            fm.name = names
                .binary_search_by_key(&id, |&(idx, _)| idx)
                .map(|pos| names[pos].1.clone())
                .unwrap_or_default();
            fm.start = start;
            fm.end = r.offset() as u64;
            fnmaps.push(fm);
        }

        Ok(CodeMap { imports, fnmaps })
    }

    /// Number of imported functions in the module.
    pub fn imports(&self) -> u32 {
        self.imports
    }

    /// The per-function maps, indexed by code-section function index.
    pub fn func_maps(&self) -> &[FuncMap] {
        &self.fnmaps
    }

    /// The PC at the entry of the function with the given id (module
    /// index space, imports included): `PC_B` is zero.
    pub fn pc_for_id(&self, id: u32) -> u64 {
        (FUNC_VALUE_OFFSET + u64::from(id) - u64::from(self.imports)) << 16
    }

    /// Code-section function index encoded in `pc`, if it maps to a
    /// function of this module.
    pub fn func_index_for_pc(&self, pc: u64) -> Option<usize> {
        let idx = (pc >> 16).checked_sub(FUNC_VALUE_OFFSET)? as usize;
        (idx < self.fnmaps.len()).then_some(idx)
    }

    /// The function map covering `pc`.
    pub fn func_for_pc(&self, pc: u64) -> Option<&FuncMap> {
        self.func_index_for_pc(pc).map(|i| &self.fnmaps[i])
    }

    /// Frame size of the function covering `pc`.
    pub fn frame_size_for_pc(&self, pc: u64) -> Option<u32> {
        self.func_for_pc(pc).map(|f| f.frame_size)
    }

    /// Translates a code-section byte offset into the PC the guest
    /// runtime would use for that point: the containing function's
    /// `PC_F` joined with the `PC_B` whose dispatch-table entry selects
    /// the containing block.
    pub fn pc_for_source_offset(&self, offset: u64) -> Option<u64> {
        let f = self
            .fnmaps
            .iter()
            .find(|f| f.start <= offset && offset < f.end)?;
        let pc_f = self.pc_for_id(f.id);

        let block = f
            .blocks
            .iter()
            .position(|&(lo, hi)| lo <= offset && offset < hi);
        let Some(block) = block else {
            log::warn!("offset {offset:#x} matched function {} but no block", f.id);
            return None;
        };

        // Any PC_B not present in the dispatch table falls through to
        // the default target past the last block.
        let pc_b = f
            .jumps
            .iter()
            .position(|&b| b as usize == block)
            .unwrap_or(f.blocks.len()) as u64;

        Some(pc_f | pc_b)
    }
}

/// Counts the function entries of the import section payload.
fn function_imports_count(imports: &[u8]) -> Result<u32> {
    let mut r = Reader::new(imports);
    let count = r.read_uleb128()?;
    let mut functions = 0;

    for _ in 0..count {
        let module_len = r.read_uleb128()? as usize;
        r.skip(module_len)?;
        let name_len = r.read_uleb128()? as usize;
        r.skip(name_len)?;

        match r.read_u8()? {
            0x00 => {
                // Function: type index.
                r.read_uleb128()?;
                functions += 1;
            }
            0x01 => {
                // Table: reftype then limits.
                r.read_u8()?;
                skip_limits(&mut r)?;
            }
            0x02 => skip_limits(&mut r)?,
            0x03 => {
                // Global: valtype and mutability.
                r.skip(2)?;
            }
            kind => return Err(Error::UnknownOpcode(kind)),
        }
    }
    Ok(functions)
}

fn skip_limits(r: &mut Reader<'_>) -> Result<()> {
    let has_max = r.read_u8()? == 1;
    r.read_uleb128()?;
    if has_max {
        r.read_uleb128()?;
    }
    Ok(())
}

/// Decodes the function-names subsection (id 1) of the name section
/// payload into `(function id, name)` pairs, in increasing id order.
fn function_names(name: &[u8]) -> Result<Vec<(u32, String)>> {
    const FUNCTION_NAMES_SUBSECTION: u8 = 1;

    let mut r = Reader::new(name);
    while !r.is_empty() {
        let id = r.read_u8()?;
        let size = r.read_uleb128()? as usize;
        let payload = r.read_bytes(size)?;
        if id != FUNCTION_NAMES_SUBSECTION {
            continue;
        }

        let mut s = Reader::new(payload);
        let count = s.read_uleb128()?;
        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let idx = s.read_uleb128()? as u32;
            let name = s.read_name()?.into_owned();
            names.push((idx, name));
        }
        return Ok(names);
    }
    Ok(Vec::new())
}

/// Parses one function body far enough to recover its jump-table
/// blocks and frame size. `start` is the body's offset in the code
/// section payload.
fn parse_fn_body(body: &[u8], start: u64) -> Result<FuncMap> {
    let mut fm = FuncMap::default();

    // Minimum bytes for a frame prologue plus a one-entry jump table.
    if body.len() < 6 {
        return Ok(fm);
    }

    let mut r = Reader::new(body);

    // Locals preamble: count of (count, valtype) runs.
    let locals = r.read_uleb128()?;
    for _ in 0..locals {
        r.read_uleb128()?;
        r.read_u8()?;
    }

    // global.get 0; local.set 1
    if r.remaining() < 4 || r.read_bytes(4)? != [0x23, 0x00, 0x21, 0x01] {
        return Ok(fm);
    }

    let mut b = &body[r.offset()..];
    let mut offset = r.offset() as u64;
    let mut depth = 0usize;

    // Ladder of blocks followed by the br_table dispatch.
    loop {
        if b.len() < 3 {
            return Ok(FuncMap::default());
        }
        if b[0] == 0x02 && b[1] == 0x40 {
            depth += 1;
            b = &b[2..];
            offset += 2;
            continue;
        }
        if b[0] == 0x03 && b[1] == 0x40 {
            // A loop restarts the ladder.
            depth = 0;
            b = &b[2..];
            offset += 2;
            continue;
        }
        if b[0] == 0x20 && b[1] == 0x00 && b[2] == 0x0E {
            // local.get 0; br_table
            if depth == 0 {
                return Ok(FuncMap::default());
            }
            fm.blocks = vec![(0, 0); depth];
            b = &b[3..];
            offset += 3;

            let mut t = Reader::new(b);
            let targets = t.read_uleb128()?;
            fm.jumps = Vec::with_capacity(targets as usize);
            for _ in 0..targets {
                let target = t.read_uleb128()? as u32;
                if target as usize >= fm.blocks.len() {
                    log::warn!("jump table entry points past block ladder");
                }
                fm.jumps.push(target);
            }
            // Default target.
            t.read_uleb128()?;

            if t.read_u8()? != 0x0B {
                return Ok(FuncMap::default());
            }
            let consumed = t.offset();
            b = &b[consumed..];
            offset += consumed as u64;
            break;
        }
        return Ok(FuncMap::default());
    }

    // The innermost block starts right after its `end`.
    let nblocks = fm.blocks.len();
    fm.blocks[nblocks - depth].0 = start + offset;

    // Frame size: find `local.tee 1` in this block and backtrack over
    // `i32.sub` and the `i32.const` operand to read the constant.
    if let Some(tee) = find_in_block(&[0x22, 0x01], b)? {
        let mut i = tee;
        i = i.saturating_sub(3); // i32.sub plus the operand's last byte
        while i > 0 && b[i] != 0x41 {
            if b[i] & 0x80 == 0 {
                log::warn!("expected only continuation bytes before i32.const");
                return Ok(FuncMap::default());
            }
            i -= 1;
        }
        if b[i] != 0x41 {
            log::warn!("frame prologue without i32.const");
            return Ok(FuncMap::default());
        }
        i += 1;
        let mut c = Reader::new(&b[i..]);
        fm.frame_size = c.read_sleb128(32)? as u32;
        i += c.offset();
        b = &b[i..];
        offset += i as u64;
    }

    // Close the ladder, recording each block's end.
    while depth > 0 {
        let Some(end) = find_in_block(&[0x0B], b)? else {
            return Err(Error::Truncated { offset: offset as usize });
        };
        b = &b[end + 1..];
        offset += end as u64 + 1;

        fm.blocks[nblocks - depth].1 = start + offset;
        depth -= 1;
        if depth > 0 {
            fm.blocks[nblocks - depth].0 = start + offset;
        }
    }

    Ok(fm)
}

/// Index of the first occurrence of `needle` in the current block of
/// `hay`, ignoring the contents of nested blocks. `None` if the block
/// ends first.
fn find_in_block(needle: &[u8], hay: &[u8]) -> Result<Option<usize>> {
    let mut i = 0;
    while i + needle.len() <= hay.len() {
        let b = &hay[i..];
        if b.starts_with(needle) {
            return Ok(Some(i));
        }
        if b[0] == 0x0B {
            break;
        }
        i += instr_len(b)?;
    }
    Ok(None)
}

/// Byte length of the instruction at the start of `b`, descending into
/// nested `block`/`loop`/`if` expressions so they count as one unit.
fn instr_len(b: &[u8]) -> Result<usize> {
    if b.is_empty() {
        return Ok(0);
    }
    let op = b[0];

    // Numeric operators: the whole range carries no immediate.
    if (0x45..=0xC4).contains(&op) {
        return Ok(1);
    }

    let mut r = Reader::new(&b[1..]);
    match op {
        // No immediate.
        0x00 | 0x01 | 0x0F | 0xD1 | 0x1A | 0x1B => {}

        // block / loop: blocktype then a nested expression.
        0x02 | 0x03 => {
            r.read_sleb128(33)?;
            let n = expr_len(&b[1 + r.offset()..])?;
            return Ok(1 + r.offset() + n);
        }
        // if: blocktype, then an expression that may carry an `else`.
        0x04 => {
            r.read_sleb128(33)?;
            let n = if_len(&b[1 + r.offset()..])?;
            return Ok(1 + r.offset() + n);
        }

        // One u32 immediate.
        0x0C | 0x0D | 0x10 | 0xD2 | 0x20 | 0x21 | 0x22 | 0x23 | 0x24 | 0x25 | 0x26 => {
            r.read_uleb128()?;
        }

        // i32.const / i64.const / f32.const / f64.const
        0x41 => {
            r.read_sleb128(32)?;
        }
        0x42 => {
            r.read_sleb128(64)?;
        }
        0x43 => r.skip(4)?,
        0x44 => r.skip(8)?,

        // br_table: target vector plus default.
        0x0E => {
            let count = r.read_uleb128()?;
            for _ in 0..count {
                r.read_uleb128()?;
            }
            r.read_uleb128()?;
        }

        // call_indirect and every load/store: two u32 immediates.
        0x11 | 0x28..=0x3E => {
            r.read_uleb128()?;
            r.read_uleb128()?;
        }

        // ref.null: one heap type byte.
        0xD0 => r.skip(1)?,

        // select with a value-type vector.
        0x1C => {
            let count = r.read_uleb128()? as usize;
            r.skip(count)?;
        }

        // Miscellaneous prefix: u32 sub-opcode, then one u32 operand,
        // except memory.copy (10) is encoded as sub-opcodes 12/14 pairs.
        0xFC => {
            let sub = r.read_uleb128()?;
            match sub {
                12 | 14 => {
                    r.read_uleb128()?;
                    r.read_uleb128()?;
                }
                _ => {
                    r.read_uleb128()?;
                }
            }
        }

        op => return Err(Error::UnknownOpcode(op)),
    }
    Ok(1 + r.offset())
}

/// Length of a nested expression up to and including its `end`.
fn expr_len(b: &[u8]) -> Result<usize> {
    let mut i = 0;
    while i < b.len() {
        if b[i] == 0x0B {
            return Ok(i + 1);
        }
        i += instr_len(&b[i..])?;
    }
    Ok(i)
}

/// Like [`expr_len`], but tolerates the `else` marker of an `if`.
fn if_len(b: &[u8]) -> Result<usize> {
    let mut i = 0;
    while i < b.len() {
        if b[i] == 0x05 {
            i += 1;
            continue;
        }
        if b[i] == 0x0B {
            return Ok(i + 1);
        }
        i += instr_len(&b[i..])?;
    }
    Ok(i)
}
