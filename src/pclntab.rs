//! Reassembling and decoding the Go runtime's line table.
//!
//! A Go-compiled module embeds its `pclntab` in the data section,
//! scattered across several segments. None of that is addressable
//! until the segments are replayed into a contiguous image at their
//! declared virtual addresses, which is what [`pclntab_from_data`]
//! does: locate the table by its magic bytes, then drain segments into
//! a [`Vmem`] until the header and function table are covered.
//! [`PclnTable`] then decodes functions, files, and lines out of the
//! flat image.
//!
//! Only the Go 1.20 layout is supported: 6-byte magic
//! `F1 FF FF FF 00 00`, 64-bit pointers.

use crate::error::{Error, Result};
use crate::reader::Reader;
use crate::sections::Section;

/// Magic bytes opening the supported line-table version, little
/// endian.
pub const PCLNTAB_MAGIC: [u8; 6] = [0xF1, 0xFF, 0xFF, 0xFF, 0x00, 0x00];

/// Iterator over the segments of a data section payload.
///
/// Only mode 0 segments (active, memory 0, constant `i32.const`
/// offset) are supported; anything else is a fatal decode error.
pub struct DataIterator<'a> {
    bytes: &'a [u8],
    /// Remaining segment count.
    remaining: u64,
    /// Offset of the unread bytes within the data section payload.
    offset: usize,
}

impl<'a> DataIterator<'a> {
    /// Prepares an iterator over a well-formed data section payload.
    pub fn new(data: &'a [u8]) -> Result<DataIterator<'a>> {
        let mut r = Reader::new(data);
        let remaining = r.read_uleb128()?;
        let offset = r.offset();
        Ok(DataIterator {
            bytes: &data[offset..],
            remaining,
            offset,
        })
    }

    /// The bytes of the next segment and its virtual address, or
    /// `None` when all segments have been read.
    pub fn next_segment(&mut self) -> Result<Option<(i64, &'a [u8])>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let mut r = Reader::new(self.bytes);

        let mode = r.read_uleb128()?;
        if mode != 0 {
            return Err(Error::UnsupportedSegment(mode));
        }
        // i32.const <vaddr> end
        if r.read_u8()? != 0x41 {
            return Err(Error::MalformedPclntab("segment offset is not i32.const"));
        }
        let vaddr = r.read_sleb128(64)?;
        if r.read_u8()? != 0x0B {
            return Err(Error::MalformedPclntab("unterminated segment offset"));
        }

        let len = r.read_uleb128()? as usize;
        let seg = r.read_bytes(len)?;

        let consumed = r.offset();
        self.bytes = &self.bytes[consumed..];
        self.offset += consumed;
        self.remaining -= 1;

        Ok(Some((vaddr, seg)))
    }

    /// Skips segments until reaching the one containing the byte at
    /// `target` (an offset within the data section payload), and
    /// returns the virtual address of that byte together with the rest
    /// of its segment.
    pub fn skip_to_data_offset(&mut self, target: usize) -> Result<(i64, &'a [u8])> {
        if target < self.offset {
            return Err(Error::MalformedPclntab("data offset already passed"));
        }
        if target >= self.offset + self.bytes.len() {
            return Err(Error::MalformedPclntab("data offset past section end"));
        }

        while self.offset <= target {
            let Some((vaddr, seg)) = self.next_segment()? else {
                break;
            };
            if self.offset < target {
                continue;
            }
            let skipped = self.offset - target;
            if skipped > seg.len() {
                // The offset points into the segment's own header
                // bytes, not its payload.
                return Err(Error::MalformedPclntab("data offset inside segment header"));
            }
            let within = seg.len() - skipped;
            let vaddr = vaddr
                .checked_add(within as i64)
                .ok_or(Error::MalformedPclntab("segment address overflows"))?;
            return Ok((vaddr, &seg[within..]));
        }

        Err(Error::MalformedPclntab("data offset not covered by a segment"))
    }
}

/// Virtual memory rebuilt from data segments.
///
/// Segments append in strictly increasing virtual-address order, with
/// any gap zero filled. Reads past the loaded length report a fault so
/// the caller can drain further segments and retry.
pub struct Vmem {
    /// Virtual address of `buf[0]`.
    start: i64,
    buf: Vec<u8>,
}

impl Vmem {
    /// An image beginning at virtual address `start`.
    pub fn new(start: i64) -> Vmem {
        Vmem { start, buf: Vec::new() }
    }

    /// Whether the byte at `offset` (relative to `start`) is loaded.
    pub fn has(&self, offset: usize) -> bool {
        offset < self.buf.len()
    }

    /// The reconstructed image.
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the image.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buf
    }

    /// Appends `bytes` so that they occupy virtual addresses starting
    /// at `addr`, zero-filling any gap since the previous append.
    pub fn copy_at_address(&mut self, addr: i64, bytes: &[u8]) -> Result<()> {
        let end = self
            .start
            .checked_add(self.buf.len() as i64)
            .ok_or(Error::MalformedPclntab("segment address overflows"))?;
        if addr < end {
            return Err(Error::MalformedPclntab("segment address already mapped"));
        }
        let gap = (addr - end) as usize;
        self.buf.reserve(gap + bytes.len());
        self.buf.resize(self.buf.len() + gap, 0);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Header word `word` of a line table whose magic sits at the
    /// start of the image: an 8-byte little-endian integer at offset
    /// `8 + word * 8`. `None` reports a fault: the word is not loaded
    /// yet.
    pub fn pclntab_word(&self, word: usize) -> Option<u64> {
        let s = 8 + word * 8;
        if self.buf.len() < s + 8 {
            return None;
        }
        let mut r = Reader::new(&self.buf[s..]);
        r.read_u64_le().ok()
    }
}

/// Rebuilds the full line-table image from the segments of the data
/// section.
///
/// Returns `Ok(None)` when the magic is absent, which means the module
/// was not produced by the supported toolchain and the caller should
/// fall back to DWARF symbolization.
pub fn pclntab_from_data(data: Section<'_>) -> Result<Option<Vec<u8>>> {
    let Some(magic_offset) = data
        .data
        .windows(PCLNTAB_MAGIC.len())
        .position(|w| w == PCLNTAB_MAGIC)
    else {
        return Ok(None);
    };

    let mut segments = DataIterator::new(data.data)?;
    let (vaddr, seg) = segments.skip_to_data_offset(magic_offset)?;

    if !seg.starts_with(&PCLNTAB_MAGIC) {
        return Err(Error::MalformedPclntab("segment does not start with magic"));
    }
    if seg.len() < 8 {
        return Err(Error::MalformedPclntab("segment too short for header"));
    }
    let ptrsize = seg[7];
    if ptrsize != 8 {
        return Err(Error::UnsupportedPtrSize(ptrsize));
    }

    let mut vm = Vmem::new(vaddr);
    vm.copy_at_address(vaddr, seg)?;

    let mut drain_one = |vm: &mut Vmem| -> Result<()> {
        match segments.next_segment()? {
            Some((vaddr, seg)) => vm.copy_at_address(vaddr, seg),
            None => Err(Error::MalformedPclntab("ran out of segments")),
        }
    };

    let mut read_word = |vm: &mut Vmem, word: usize| -> Result<u64> {
        loop {
            if let Some(x) = vm.pclntab_word(word) {
                return Ok(x);
            }
            drain_one(vm)?;
        }
    };

    let nfunctab = read_word(&mut vm, 0)?;
    let nfiletab = read_word(&mut vm, 1)?;
    let pcstart = read_word(&mut vm, 2)?;
    let funcnametab = read_word(&mut vm, 3)?;
    let cutab = read_word(&mut vm, 4)?;
    let filetab = read_word(&mut vm, 5)?;
    let pctab = read_word(&mut vm, 6)?;
    let functab = read_word(&mut vm, 7)?;

    log::debug!(
        "pclntab header: nfunctab={nfunctab} nfiletab={nfiletab} pcstart={pcstart:#x} \
         funcnametab={funcnametab:#x} cutab={cutab:#x} filetab={filetab:#x} \
         pctab={pctab:#x} functab={functab:#x}"
    );

    // The function table is (2 * nfunctab + 1) u32 entries; everything
    // beyond it (names, cutab, filetab, pctab, funcdata) cannot be
    // bounded without a full decode, so once the function table is
    // covered the remaining segments are drained wholesale.
    let end = nfunctab
        .checked_mul(2)
        .and_then(|n| n.checked_add(1))
        .and_then(|n| n.checked_mul(4))
        .and_then(|size| functab.checked_add(size))
        .and_then(|end| usize::try_from(end).ok())
        .ok_or(Error::MalformedPclntab("function table size overflows"))?;
    while !vm.has(end) {
        drain_one(&mut vm)?;
    }
    while let Some((vaddr, seg)) = segments.next_segment()? {
        vm.copy_at_address(vaddr, seg)?;
    }

    if !vm.buffer().starts_with(&PCLNTAB_MAGIC) {
        return Err(Error::MalformedPclntab("image does not start with magic"));
    }
    if vm.buffer().len() < end {
        return Err(Error::MalformedPclntab("image ends before function table"));
    }

    Ok(Some(vm.into_buffer()))
}

/// Decoder over a reconstructed line-table image.
///
/// Follows the Go 1.20 layout: a function table of
/// `(entry offset, func offset)` u32 pairs closed by a final end
/// offset, per-function records pointing into the name and pc-value
/// tables, and varint-delta encoded pc-value streams for files and
/// lines.
pub struct PclnTable {
    data: Vec<u8>,
    quantum: u8,
    nfunctab: u32,
    pcstart: u64,
    funcnametab: usize,
    cutab: usize,
    filetab: usize,
    pctab: usize,
    funcdata: usize,
    functab: usize,
}

/// The fields of a per-function record the profiler consumes.
#[derive(Clone, Copy, Debug)]
struct FuncRecord {
    entry_off: u32,
    name_off: u32,
    pcfile: u32,
    pcln: u32,
    cu_offset: u32,
}

impl PclnTable {
    /// Decodes the header of a reconstructed image.
    pub fn parse(data: Vec<u8>) -> Result<PclnTable> {
        if !data.starts_with(&PCLNTAB_MAGIC) {
            return Err(Error::MalformedPclntab("bad magic"));
        }
        if data.len() < 8 + 8 * 8 {
            return Err(Error::MalformedPclntab("image too short for header"));
        }
        let quantum = data[6];
        let ptrsize = data[7];
        if ptrsize != 8 {
            return Err(Error::UnsupportedPtrSize(ptrsize));
        }

        let word = |k: usize| -> u64 {
            let s = 8 + k * 8;
            u64::from_le_bytes(data[s..s + 8].try_into().unwrap())
        };

        let table = PclnTable {
            quantum,
            nfunctab: word(0) as u32,
            pcstart: word(2),
            funcnametab: word(3) as usize,
            cutab: word(4) as usize,
            filetab: word(5) as usize,
            pctab: word(6) as usize,
            funcdata: word(7) as usize,
            functab: word(7) as usize,
            data,
        };

        let functab_end = table.functab + (table.nfunctab as usize * 2 + 1) * 4;
        if table.data.len() < functab_end {
            return Err(Error::MalformedPclntab("image ends before function table"));
        }
        Ok(table)
    }

    /// Number of functions in the table.
    pub fn func_count(&self) -> usize {
        self.nfunctab as usize
    }

    fn u32_at(&self, offset: usize) -> Option<u32> {
        let b = self.data.get(offset..offset + 4)?;
        Some(u32::from_le_bytes(b.try_into().unwrap()))
    }

    /// `(entry offset, func offset)` of function table entry `i`; for
    /// `i == nfunctab` only the closing entry offset is meaningful.
    fn functab_entry(&self, i: usize) -> Option<(u32, u32)> {
        let base = self.functab + i * 8;
        let entry = self.u32_at(base)?;
        let func = self.u32_at(base + 4).unwrap_or(0);
        Some((entry, func))
    }

    /// Index of the function covering `pc`, by binary search over the
    /// function table.
    pub fn func_index_for_pc(&self, pc: u64) -> Option<usize> {
        let off = u32::try_from(pc.checked_sub(self.pcstart)?).ok()?;
        let n = self.nfunctab as usize;
        let (first, _) = self.functab_entry(0)?;
        let (end, _) = self.functab_entry(n)?;
        if off < first || off >= end {
            return None;
        }

        let mut lo = 0;
        let mut hi = n;
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            let (entry, _) = self.functab_entry(mid)?;
            if entry <= off {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some(lo)
    }

    fn func_record(&self, idx: usize) -> Option<FuncRecord> {
        if idx >= self.nfunctab as usize {
            return None;
        }
        let (_, func_off) = self.functab_entry(idx)?;
        let base = self.funcdata + func_off as usize;
        Some(FuncRecord {
            entry_off: self.u32_at(base)?,
            name_off: self.u32_at(base + 4)?,
            pcfile: self.u32_at(base + 20)?,
            pcln: self.u32_at(base + 24)?,
            cu_offset: self.u32_at(base + 32)?,
        })
    }

    fn cstring(&self, offset: usize) -> Option<&str> {
        let tail = self.data.get(offset..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Name of function `idx`.
    pub fn func_name(&self, idx: usize) -> Option<&str> {
        let rec = self.func_record(idx)?;
        self.cstring(self.funcnametab + rec.name_off as usize)
    }

    /// Resolves `pc` to `(file, line, function name)`.
    pub fn pc_to_line(&self, pc: u64) -> Option<(String, i64, String)> {
        let idx = self.func_index_for_pc(pc)?;
        let rec = self.func_record(idx)?;
        let entry = self.pcstart + u64::from(rec.entry_off);

        let name = self
            .cstring(self.funcnametab + rec.name_off as usize)?
            .to_owned();

        let line = i64::from(self.pcvalue(rec.pcln, entry, pc)?);
        let fileno = self.pcvalue(rec.pcfile, entry, pc)?;
        if fileno < 0 || rec.cu_offset == u32::MAX {
            return None;
        }
        let file_off = self.u32_at(self.cutab + (rec.cu_offset as usize + fileno as usize) * 4)?;
        let file = self.cstring(self.filetab + file_off as usize)?.to_owned();

        Some((file, line, name))
    }

    /// Runs the pc-value state machine of the stream at `off` in the
    /// pc table: alternating zigzag value deltas and quantum-scaled pc
    /// deltas, starting from value -1 at the function entry.
    fn pcvalue(&self, off: u32, entry: u64, target: u64) -> Option<i32> {
        let mut p = self.data.get(self.pctab + off as usize..)?;
        let mut val: i32 = -1;
        let mut pc = entry;
        let mut first = true;

        loop {
            let (uvdelta, n) = read_uvarint(p)?;
            if uvdelta == 0 && !first {
                return None;
            }
            p = &p[n..];
            let uvdelta = uvdelta as u32;
            let vdelta = if uvdelta & 1 != 0 {
                !(uvdelta >> 1)
            } else {
                uvdelta >> 1
            } as i32;

            let (pcdelta, n) = read_uvarint(p)?;
            p = &p[n..];

            pc = pc.checked_add(pcdelta.checked_mul(u64::from(self.quantum))?)?;
            val = val.wrapping_add(vdelta);
            first = false;

            if target < pc {
                return Some(val);
            }
        }
    }
}

fn read_uvarint(b: &[u8]) -> Option<(u64, usize)> {
    let mut r = Reader::new(b);
    let v = r.read_uleb128().ok()?;
    Some((v, r.offset()))
}
