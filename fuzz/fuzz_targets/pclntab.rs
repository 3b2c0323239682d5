//! Fuzz line-table reassembly and decoding with arbitrary segments.

#![no_main]

use libfuzzer_sys::{
    arbitrary::{self, Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug)]
struct FuzzInput {
    segments: Vec<(u32, Vec<u8>)>,
    pcs: Vec<u64>,
}

impl<'a> Arbitrary<'a> for FuzzInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let count = u.int_in_range(0..=8)?;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            // Keep virtual addresses small so reconstruction gaps stay
            // affordable.
            let vaddr = u.int_in_range(0..=1 << 20)?;
            let len = u.int_in_range(0..=4096)?;
            segments.push((vaddr, u.bytes(len)?.to_vec()));
        }
        let pcs = u.arbitrary()?;
        Ok(FuzzInput { segments, pcs })
    }
}

fuzz_target!(|input: FuzzInput| {
    let mut payload = Vec::new();
    write_uleb(input.segments.len() as u64, &mut payload);
    for (vaddr, bytes) in &input.segments {
        payload.push(0x00);
        payload.push(0x41);
        write_sleb(i64::from(*vaddr), &mut payload);
        payload.push(0x0B);
        write_uleb(bytes.len() as u64, &mut payload);
        payload.extend_from_slice(bytes);
    }

    let section = guestprof::Section {
        offset: 0,
        data: &payload,
    };
    let Ok(Some(image)) = guestprof::pclntab_from_data(section) else {
        return;
    };
    let Ok(table) = guestprof::PclnTable::parse(image) else {
        return;
    };
    for &pc in &input.pcs {
        let _ = table.func_index_for_pc(pc);
        let _ = table.pc_to_line(pc);
    }
});

fn write_uleb(mut value: u64, out: &mut Vec<u8>) {
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

fn write_sleb(mut value: i64, out: &mut Vec<u8>) {
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
