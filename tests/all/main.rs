mod dwarf;
mod pclntab;
mod sections;
mod unwind;

fn main() {}

use std::collections::HashMap;
use std::sync::Arc;

use guestprof::{FunctionInfo, GuestAccess, StackFrame};

/// A function descriptor for driving the listeners by hand.
pub fn function(module: &str, index: u32, name: &str, host: bool) -> Arc<FunctionInfo> {
    Arc::new(FunctionInfo {
        module: module.to_string(),
        index,
        name: name.to_string(),
        host,
        params: 0,
    })
}

/// The host-visible stack for one call, innermost first.
pub fn stack(frames: &[(&Arc<FunctionInfo>, u64)]) -> Vec<StackFrame> {
    frames
        .iter()
        .map(|&(func, pc)| StackFrame {
            func: func.clone(),
            pc,
        })
        .collect()
}

/// Guest memory/globals that answer nothing.
pub struct NoMemory;

impl GuestAccess for NoMemory {
    fn read_u64(&self, _addr: u32) -> Option<u64> {
        None
    }

    fn global(&self, _index: u32) -> Option<u64> {
        None
    }
}

/// Scripted guest memory: explicit 8-byte words and globals.
#[derive(Default)]
pub struct FakeMemory {
    pub words: HashMap<u32, u64>,
    pub globals: HashMap<u32, u64>,
}

impl GuestAccess for FakeMemory {
    fn read_u64(&self, addr: u32) -> Option<u64> {
        self.words.get(&addr).copied()
    }

    fn global(&self, index: u32) -> Option<u64> {
        self.globals.get(&index).copied()
    }
}
