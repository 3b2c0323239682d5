//! Fuzz the function-body parser with arbitrary bodies.

#![no_main]

use libfuzzer_sys::{
    arbitrary::{self, Arbitrary, Unstructured},
    fuzz_target,
};

#[derive(Debug)]
struct FuzzInput {
    bodies: Vec<Vec<u8>>,
}

impl<'a> Arbitrary<'a> for FuzzInput {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        // Bound body count and size so deeply nested block expressions
        // cannot exhaust the stack through recursion.
        let count = u.int_in_range(0..=8)?;
        let mut bodies = Vec::with_capacity(count);
        for _ in 0..count {
            let len = u.int_in_range(0..=4096)?;
            bodies.push(u.bytes(len)?.to_vec());
        }
        Ok(FuzzInput { bodies })
    }
}

fuzz_target!(|input: FuzzInput| {
    let mut code = Vec::new();
    write_uleb(input.bodies.len() as u64, &mut code);
    for body in &input.bodies {
        write_uleb(body.len() as u64, &mut code);
        code.extend_from_slice(body);
    }

    // Errors are fine; panics are not.
    let _ = guestprof::CodeMap::build(
        guestprof::Section {
            offset: 0,
            data: &code,
        },
        None,
        None,
    );
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
