//! Walking a Go guest's call stack out of its linear memory.
//!
//! The host runtime's own frame iterator stops at the first Go frame:
//! the Go runtime multiplexes goroutines over the wasm stack, so the
//! frames the host sees are not the frames the guest is running. This
//! walker reads the guest's scheduler state (the current g, found
//! through a module global) and replays its frame layout: each frame
//! stores the caller's resume PC at the stack pointer, and the frame
//! size recovered by the code map tells us where the next one starts.

use std::sync::Arc;

use crate::codemap::CodeMap;
use crate::listener::{FunctionInfo, GuestAccess, StackFrame};

// Field offsets inside the guest scheduler structures, a hard
// compatibility contract with the supported toolchain version.
//
// g:  stack.lo @ 0, stack.hi @ 8, m @ 48, sched.sp @ 56, sched.pc @ 64
// m:  g0 @ 0, curg @ 144
//
// Only stack.hi participates in the walk itself; the rest pins down
// the layout this unwinder was written against.
const G_STACK_HI: u64 = 8;

/// Module global holding the guest stack pointer.
pub(crate) const SP_GLOBAL: u32 = 0;
/// Module global holding the pointer to the running g.
pub(crate) const G_GLOBAL: u32 = 2;

/// Iterator over a Go guest's frames, innermost first.
///
/// Yields `(function, pc)` pairs equivalent to what the guest runtime
/// itself would report. A guest memory read that fails, a PC with no
/// code-map entry, or a stack pointer reaching `stack.hi` all end the
/// walk; frames produced so far remain valid.
pub struct GoStackWalker<'a> {
    mem: &'a dyn GuestAccess,
    codemap: &'a CodeMap,
    /// Function descriptors indexed by code-section function index.
    registry: &'a [Arc<FunctionInfo>],

    sp: u64,
    pc: u64,
    stack_hi: u64,
    started: bool,
    done: bool,
}

impl<'a> GoStackWalker<'a> {
    /// Starts a walk at the entry of the function with module index
    /// `entry_id`, snapshotting the stack pointer and the running g
    /// from the module globals.
    pub fn new(
        mem: &'a dyn GuestAccess,
        codemap: &'a CodeMap,
        registry: &'a [Arc<FunctionInfo>],
        entry_id: u32,
    ) -> Option<GoStackWalker<'a>> {
        let sp = mem.global(SP_GLOBAL)?;
        let g = mem.global(G_GLOBAL)?;
        let pc = codemap.pc_for_id(entry_id);

        // stack.hi bounds the walk; without it we would only stop on a
        // faulted read.
        let stack_hi = read_ptr(mem, g + G_STACK_HI)?;

        Some(GoStackWalker {
            mem,
            codemap,
            registry,
            sp,
            pc,
            stack_hi,
            started: false,
            done: false,
        })
    }

    fn frame_at(&self, pc: u64) -> Option<StackFrame> {
        let idx = self.codemap.func_index_for_pc(pc)?;
        let func = self.registry.get(idx)?.clone();
        Some(StackFrame { func, pc })
    }
}

impl Iterator for GoStackWalker<'_> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return match self.frame_at(self.pc) {
                Some(frame) => Some(frame),
                None => {
                    self.done = true;
                    None
                }
            };
        }

        if self.sp >= self.stack_hi {
            self.done = true;
            return None;
        }

        // The caller's resume PC sits at the stack pointer; its frame
        // size moves us up to the next frame.
        let Some(ret) = read_ptr(self.mem, self.sp) else {
            self.done = true;
            return None;
        };
        let Some(frame) = self.frame_at(ret) else {
            self.done = true;
            return None;
        };
        let frame_size = self
            .codemap
            .frame_size_for_pc(ret)
            .unwrap_or_default();

        self.sp += u64::from(frame_size) + 8;
        self.pc = ret;
        Some(frame)
    }
}

fn read_ptr(mem: &dyn GuestAccess, addr: u64) -> Option<u64> {
    mem.read_u64(u32::try_from(addr).ok()?)
}

/// Reads the size argument of `runtime.mallocgc`, whose calling
/// convention passes arguments on the guest stack: the first argument
/// is the u64 just above the return address.
pub(crate) fn go_stack_arg(mem: &dyn GuestAccess) -> Option<u64> {
    let sp = mem.global(SP_GLOBAL)?;
    read_ptr(mem, sp + 8)
}
