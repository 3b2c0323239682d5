//! The memory allocation profiler.

use std::collections::hash_map::RandomState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};
use crate::listener::{FunctionInfo, FunctionListener, GuestAccess, StackFrame};
use crate::pprof;
use crate::profile::{build_profile, StackCounterMap, StackTrace};
use crate::symbols::Symbolizer;
use crate::unwind::go_stack_arg;

/// Samples of memory allocated by the functions of a module
/// (`alloc_space`, in bytes).
///
/// The profiler recognizes the allocator entry points of the supported
/// guest toolchains by name and reads the requested size from the
/// call's parameters on entry; the allocation is charged to the
/// caller's stack when the allocator returns.
pub struct MemoryProfiler {
    state: Mutex<MemState>,
    seed: RandomState,
}

struct MemState {
    counts: Option<StackCounterMap>,
    /// In-flight calls; `None` entries keep the LIFO pairing for
    /// non-allocator calls.
    frames: Vec<Option<MemFrame>>,
    start: SystemTime,
}

struct MemFrame {
    size: i64,
    trace: StackTrace,
}

/// Bytes requested by a recognized allocator call, or `None` for any
/// other function.
///
/// `runtime.mallocgc` passes its arguments on the guest stack rather
/// than as wasm parameters, so its size is read from guest memory just
/// above the return address.
fn allocation_size(
    def: &FunctionInfo,
    params: &[u64],
    module: &dyn GuestAccess,
) -> Option<i64> {
    let p = |i: usize| params.get(i).map(|&v| i64::from(v as u32 as i32));
    match def.name.as_str() {
        // C standard library, Rust.
        "malloc" => p(0),
        "calloc" => Some(p(0)? * p(1)?),
        "realloc" => p(1),
        // Go.
        "runtime.mallocgc" => go_stack_arg(module).map(|v| v as i64),
        // TinyGo.
        "runtime.alloc" => p(0),
        _ => None,
    }
}

impl Default for MemoryProfiler {
    fn default() -> Self {
        MemoryProfiler {
            state: Mutex::new(MemState {
                counts: None,
                frames: Vec::new(),
                start: SystemTime::now(),
            }),
            seed: RandomState::new(),
        }
    }
}

impl MemoryProfiler {
    /// Constructs a new memory profiler.
    pub fn new() -> MemoryProfiler {
        MemoryProfiler::default()
    }

    /// Begins recording. Returns whether recording started: `false`
    /// means a profile is already being recorded.
    pub fn start_profile(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.counts.is_some() {
            return false;
        }
        state.counts = Some(StackCounterMap::default());
        state.start = SystemTime::now();
        true
    }

    /// Stops recording and builds the profile. Returns `None` when
    /// recording was never started.
    pub fn stop_profile(&self, sample_rate: f64, symbols: &Symbolizer<'_>) -> Option<pprof::Profile> {
        let (samples, start) = {
            let mut state = self.state.lock().unwrap();
            (state.counts.take()?, state.start)
        };
        let duration = SystemTime::now()
            .duration_since(start)
            .unwrap_or_default();
        Some(self.build(&samples, start, duration, sample_rate, symbols))
    }

    /// Builds a profile of the allocations recorded so far without
    /// stopping the profiler, the way a live heap endpoint serves it.
    pub fn snapshot(&self, sample_rate: f64, symbols: &Symbolizer<'_>) -> Option<pprof::Profile> {
        let (samples, start) = {
            let state = self.state.lock().unwrap();
            (state.counts.clone()?, state.start)
        };
        let duration = SystemTime::now()
            .duration_since(start)
            .unwrap_or_default();
        Some(self.build(&samples, start, duration, sample_rate, symbols))
    }

    fn build(
        &self,
        samples: &StackCounterMap,
        start: SystemTime,
        duration: Duration,
        sample_rate: f64,
        symbols: &Symbolizer<'_>,
    ) -> pprof::Profile {
        build_profile(
            symbols,
            samples,
            start,
            duration,
            &[("alloc_space", "bytes")],
            &[1.0 / sample_rate],
            |counter| vec![counter.total],
        )
    }

    /// Number of distinct stacks recorded so far.
    pub fn count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .counts
            .as_ref()
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Records for `duration` — or until `cancel` becomes true — then
    /// stops and returns the profile. A profile already being recorded
    /// yields [`Error::AlreadyRunning`].
    pub fn record(
        &self,
        duration: Duration,
        cancel: &AtomicBool,
        sample_rate: f64,
        symbols: &Symbolizer<'_>,
    ) -> Result<pprof::Profile> {
        if !self.start_profile() {
            return Err(Error::AlreadyRunning);
        }
        let started = Instant::now();
        while started.elapsed() < duration && !cancel.load(Ordering::Relaxed) {
            let left = duration - started.elapsed().min(duration);
            std::thread::sleep(left.min(Duration::from_millis(20)));
        }
        Ok(self
            .stop_profile(sample_rate, symbols)
            .unwrap_or_default())
    }
}

impl FunctionListener for MemoryProfiler {
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        let mut state = self.state.lock().unwrap();
        let frame = if state.counts.is_some() {
            match allocation_size(def, params, module) {
                Some(size) if size > 0 => Some(MemFrame {
                    size,
                    trace: StackTrace::capture(stack, &self.seed),
                }),
                _ => None,
            }
        } else {
            None
        };
        state.frames.push(frame);
    }

    fn after(&self, _def: &Arc<FunctionInfo>, _results: &[u64]) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(frame)) = state.frames.pop() {
            if let Some(counts) = &mut state.counts {
                counts.observe(&frame.trace, frame.size);
            }
        }
    }

    fn abort(&self, _def: &Arc<FunctionInfo>) {
        // The allocator did not return; the allocation may never have
        // happened, so drop the in-flight frame.
        let mut state = self.state.lock().unwrap();
        state.frames.pop();
    }
}
