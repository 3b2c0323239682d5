use guestprof::GoStackWalker;

use crate::codemap::build_codemap;
use crate::FakeMemory;

// Globals the walker snapshots.
const SP_GLOBAL: u32 = 0;
const G_GLOBAL: u32 = 2;

fn memory(sp: u64, stack_hi: u64) -> FakeMemory {
    let g: u64 = 0x3000;
    let mut mem = FakeMemory::default();
    mem.globals.insert(SP_GLOBAL, sp);
    mem.globals.insert(G_GLOBAL, g);
    // g.stack.hi at offset 8.
    mem.words.insert(g as u32 + 8, stack_hi);
    mem
}

#[test]
fn walks_frames_through_guest_memory() {
    // Two Go functions: ids 1 (entry) and 2 (its caller), with frame
    // sizes 16 and 112.
    let map = build_codemap(&[16, 112], &[(1, "main.inner"), (2, "main.outer")]);
    let registry: Vec<_> = map
        .func_maps()
        .iter()
        .map(|fm| crate::function("", fm.id, &fm.name, false))
        .collect();

    let mut mem = memory(0x2000, 0x2100);
    // The caller's resume PC sits at the stack pointer: function 2,
    // block 1.
    let caller_pc = map.pc_for_id(2) | 1;
    mem.words.insert(0x2000, caller_pc);
    // The next return address is unmapped, ending the walk.
    mem.words.insert(0x2000 + 112 + 8, map.pc_for_id(3));

    let walker = GoStackWalker::new(&mem, &map, &registry, 1).unwrap();
    let frames: Vec<_> = walker.collect();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].func.name, "main.inner");
    assert_eq!(frames[0].pc, map.pc_for_id(1));
    assert_eq!(frames[1].func.name, "main.outer");
    assert_eq!(frames[1].pc, caller_pc);
}

#[test]
fn stops_at_the_top_of_the_goroutine_stack() {
    let map = build_codemap(&[16, 112], &[]);
    let registry: Vec<_> = map
        .func_maps()
        .iter()
        .map(|fm| crate::function("", fm.id, "f", false))
        .collect();

    // stack.hi equals the starting stack pointer: only the entry
    // frame is reported even though memory would keep answering.
    let mut mem = memory(0x2000, 0x2000);
    mem.words.insert(0x2000, map.pc_for_id(2));

    let walker = GoStackWalker::new(&mem, &map, &registry, 1).unwrap();
    assert_eq!(walker.count(), 1);
}

#[test]
fn failed_memory_reads_end_the_walk() {
    let map = build_codemap(&[16], &[]);
    let registry: Vec<_> = map
        .func_maps()
        .iter()
        .map(|fm| crate::function("", fm.id, "f", false))
        .collect();

    // No word mapped at the stack pointer.
    let mem = memory(0x2000, 0x2100);
    let walker = GoStackWalker::new(&mem, &map, &registry, 1).unwrap();
    let frames: Vec<_> = walker.collect();
    assert_eq!(frames.len(), 1);
}

#[test]
fn unreadable_scheduler_state_prevents_walking() {
    let map = build_codemap(&[16], &[]);
    let registry: Vec<_> = map
        .func_maps()
        .iter()
        .map(|fm| crate::function("", fm.id, "f", false))
        .collect();

    // No globals at all: the walker cannot start.
    let mem = FakeMemory::default();
    assert!(GoStackWalker::new(&mem, &map, &registry, 1).is_none());
}
