use guestprof::{pclntab_from_data, PclnTable, Section, PCLNTAB_MAGIC};

/// One function of a synthesized line table.
pub struct TableFunc {
    pub name: &'static str,
    /// Offset of the function entry from `pcstart`.
    pub entry_off: u32,
    /// Offset one past the function's last pc.
    pub end_off: u32,
    pub file: &'static str,
    pub line: i64,
}

/// Builds a Go 1.20 line-table image for `funcs`, with `pcstart` as
/// the text base. Functions must be given in increasing entry order.
pub fn build_pclntab(pcstart: u64, funcs: &[TableFunc]) -> Vec<u8> {
    const HEADER: usize = 8 + 8 * 8;

    // Tables are laid out header, names, cutab, filetab, pctab,
    // functab+funcdata, mirroring the linker's order.
    let mut funcnametab = Vec::new();
    let mut name_offs = Vec::new();
    for f in funcs {
        name_offs.push(funcnametab.len() as u32);
        funcnametab.extend_from_slice(f.name.as_bytes());
        funcnametab.push(0);
    }

    let mut filetab = Vec::new();
    let mut cutab = Vec::new();
    let mut cu_offs = Vec::new();
    for f in funcs {
        // One compilation unit per function, each with one file.
        cu_offs.push((cutab.len() / 4) as u32);
        cutab.extend_from_slice(&(filetab.len() as u32).to_le_bytes());
        filetab.extend_from_slice(f.file.as_bytes());
        filetab.push(0);
    }

    let mut pctab = Vec::new();
    let mut pcln_offs = Vec::new();
    let mut pcfile_offs = Vec::new();
    for f in funcs {
        let extent = f.end_off - f.entry_off;
        // Line stream: value starts at -1; one step to the line, with
        // the pc delta covering the whole function, then a terminator.
        pcln_offs.push(pctab.len() as u32);
        write_uvarint(zigzag(f.line + 1), &mut pctab);
        write_uvarint(u64::from(extent), &mut pctab);
        pctab.push(0);
        // File stream: file number 0 of the function's cu.
        pcfile_offs.push(pctab.len() as u32);
        write_uvarint(zigzag(1), &mut pctab);
        write_uvarint(u64::from(extent), &mut pctab);
        pctab.push(0);
    }

    let funcnametab_off = HEADER;
    let cutab_off = funcnametab_off + funcnametab.len();
    let filetab_off = cutab_off + cutab.len();
    let pctab_off = filetab_off + filetab.len();
    let functab_off = pctab_off + pctab.len();

    // The function table is (entry, funcoff) u32 pairs closed by the
    // final end offset; _func records follow it, addressed relative to
    // the table base.
    let functab_len = (funcs.len() * 2 + 1) * 4;
    let mut functab = Vec::new();
    let mut funcdata = Vec::new();
    for (i, f) in funcs.iter().enumerate() {
        functab.extend_from_slice(&f.entry_off.to_le_bytes());
        functab.extend_from_slice(&((functab_len + funcdata.len()) as u32).to_le_bytes());
        funcdata.extend_from_slice(&func_record(
            f.entry_off,
            name_offs[i],
            pcfile_offs[i],
            pcln_offs[i],
            cu_offs[i],
        ));
    }
    functab.extend_from_slice(&funcs.last().unwrap().end_off.to_le_bytes());

    let mut image = Vec::new();
    image.extend_from_slice(&PCLNTAB_MAGIC);
    image.push(1); // quantum
    image.push(8); // ptrsize
    for word in [
        funcs.len() as u64,
        funcs.len() as u64, // nfiletab
        pcstart,
        funcnametab_off as u64,
        cutab_off as u64,
        filetab_off as u64,
        pctab_off as u64,
        functab_off as u64,
    ] {
        image.extend_from_slice(&word.to_le_bytes());
    }
    image.extend_from_slice(&funcnametab);
    image.extend_from_slice(&cutab);
    image.extend_from_slice(&filetab);
    image.extend_from_slice(&pctab);
    image.extend_from_slice(&functab);
    image.extend_from_slice(&funcdata);
    image
}

/// A Go 1.20 `_func` record with only the fields the decoder reads.
fn func_record(entry_off: u32, name_off: u32, pcfile: u32, pcln: u32, cu_offset: u32) -> [u8; 44] {
    let mut rec = [0u8; 44];
    rec[0..4].copy_from_slice(&entry_off.to_le_bytes());
    rec[4..8].copy_from_slice(&name_off.to_le_bytes());
    rec[20..24].copy_from_slice(&pcfile.to_le_bytes());
    rec[24..28].copy_from_slice(&pcln.to_le_bytes());
    rec[32..36].copy_from_slice(&cu_offset.to_le_bytes());
    rec
}

fn zigzag(delta: i64) -> u64 {
    let delta = delta as i32 as u32;
    u64::from(if (delta as i32) < 0 {
        !delta << 1 | 1
    } else {
        delta << 1
    })
}

fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Wraps chunks of bytes into a data section payload of mode-0
/// segments at the given virtual addresses.
pub fn data_section(segments: &[(i32, &[u8])]) -> Vec<u8> {
    let mut payload = Vec::new();
    write_uvarint(segments.len() as u64, &mut payload);
    for &(vaddr, bytes) in segments {
        payload.push(0x00); // mode 0
        payload.push(0x41); // i32.const
        write_svarint(i64::from(vaddr), &mut payload);
        payload.push(0x0B); // end
        write_uvarint(bytes.len() as u64, &mut payload);
        payload.extend_from_slice(bytes);
    }
    payload
}

fn write_svarint(mut value: i64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

const PCSTART: u64 = 0x1000_0000;

fn sample_funcs() -> Vec<TableFunc> {
    vec![
        TableFunc {
            name: "main.main",
            entry_off: 0,
            end_off: 0x20,
            file: "/src/main.go",
            line: 10,
        },
        TableFunc {
            name: "main.compute",
            entry_off: 0x20,
            end_off: 0x50,
            file: "/src/compute.go",
            line: 42,
        },
    ]
}

#[test]
fn decodes_functions_files_and_lines() {
    let image = build_pclntab(PCSTART, &sample_funcs());
    let table = PclnTable::parse(image).unwrap();

    assert_eq!(table.func_count(), 2);
    assert_eq!(table.func_name(0), Some("main.main"));
    assert_eq!(table.func_name(1), Some("main.compute"));

    let (file, line, name) = table.pc_to_line(PCSTART + 5).unwrap();
    assert_eq!((file.as_str(), line, name.as_str()), ("/src/main.go", 10, "main.main"));

    let (file, line, name) = table.pc_to_line(PCSTART + 0x21).unwrap();
    assert_eq!(
        (file.as_str(), line, name.as_str()),
        ("/src/compute.go", 42, "main.compute")
    );
}

#[test]
fn pcs_outside_the_table_resolve_to_nothing() {
    let image = build_pclntab(PCSTART, &sample_funcs());
    let table = PclnTable::parse(image).unwrap();

    assert!(table.func_index_for_pc(PCSTART - 1).is_none());
    assert!(table.func_index_for_pc(PCSTART + 0x50).is_none());
    assert!(table.pc_to_line(0).is_none());
}

#[test]
fn reassembles_the_image_from_scattered_segments() {
    let image = build_pclntab(PCSTART, &sample_funcs());

    // An unrelated leading segment, then the image split so that the
    // header words and the function table each require draining more
    // segments.
    let unrelated = [0xAAu8; 16];
    let payload = data_section(&[
        (0x100, &unrelated),
        (0x1000, &image[..40]),
        (0x1000 + 40, &image[40..100]),
        (0x1000 + 100, &image[100..]),
    ]);

    let rebuilt = pclntab_from_data(Section {
        offset: 0,
        data: &payload,
    })
    .unwrap()
    .expect("magic should be found");

    assert_eq!(rebuilt, image);

    let table = PclnTable::parse(rebuilt).unwrap();
    assert_eq!(table.func_name(1), Some("main.compute"));
}

#[test]
fn modules_without_the_magic_fall_back() {
    let payload = data_section(&[(0x100, &[1, 2, 3, 4])]);
    let rebuilt = pclntab_from_data(Section {
        offset: 0,
        data: &payload,
    })
    .unwrap();
    assert!(rebuilt.is_none());
}

#[test]
fn zero_filled_gaps_between_segments_are_preserved() {
    let image = build_pclntab(PCSTART, &sample_funcs());

    // A hole between the two halves: the reconstructed image gets
    // zeroes there, so everything past the hole shifts.
    let payload = data_section(&[(0x1000, &image[..64]), (0x1000 + 80, &image[64..])]);

    let rebuilt = pclntab_from_data(Section {
        offset: 0,
        data: &payload,
    })
    .unwrap()
    .expect("magic should be found");
    assert_eq!(&rebuilt[..64], &image[..64]);
    assert_eq!(&rebuilt[64..80], &[0u8; 16]);
    assert_eq!(&rebuilt[80..], &image[64..]);
}
