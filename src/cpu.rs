//! The CPU time profiler.

use std::collections::hash_map::RandomState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};
use crate::listener::{FunctionInfo, FunctionListener, GuestAccess, StackFrame};
use crate::pprof;
use crate::profile::{build_profile, StackCounterMap, StackTrace};
use crate::symbols::Symbolizer;

/// Samples of CPU time spent in the functions of a module.
///
/// Two sample types are recorded per stack: `cpu` (nanoseconds spent
/// in calls) and `samples` (number of calls). Install the profiler as
/// a [`FunctionListener`] — usually behind a
/// [`SampledListener`][crate::SampledListener] and the module's
/// [adapter][crate::ModuleProfiling::adapt] — then bracket the run
/// with [`start_profile`][CpuProfiler::start_profile] and
/// [`stop_profile`][CpuProfiler::stop_profile].
pub struct CpuProfiler {
    state: Mutex<CpuState>,
    host_time: bool,
    clock: Box<dyn Fn() -> i64 + Send + Sync>,
    seed: RandomState,
}

struct CpuState {
    /// `Some` while a profile is being recorded.
    counts: Option<StackCounterMap>,
    /// In-flight calls, innermost last; `None` entries keep the LIFO
    /// pairing for calls that arrived while not recording.
    frames: Vec<Option<CpuTimeFrame>>,
    start: SystemTime,
}

struct CpuTimeFrame {
    start: i64,
    trace: StackTrace,
}

fn monotonic_nanos() -> i64 {
    static BASE: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    BASE.get_or_init(Instant::now).elapsed().as_nanos() as i64
}

impl Default for CpuProfiler {
    fn default() -> Self {
        CpuProfiler {
            state: Mutex::new(CpuState {
                counts: None,
                frames: Vec::new(),
                start: SystemTime::now(),
            }),
            host_time: false,
            clock: Box::new(monotonic_nanos),
            seed: RandomState::new(),
        }
    }
}

impl CpuProfiler {
    /// Constructs a profiler with host time excluded and the system
    /// monotonic clock.
    pub fn new() -> CpuProfiler {
        CpuProfiler::default()
    }

    /// Account for time spent in calls to host functions.
    ///
    /// When disabled (the default), samples whose innermost frame is a
    /// host function are removed on
    /// [`stop_profile`][CpuProfiler::stop_profile] and their time is
    /// debited from the guest stacks that contain them.
    pub fn host_time(&mut self, enable: bool) -> &mut Self {
        self.host_time = enable;
        self
    }

    /// Use `clock` to collect monotonic nanosecond timestamps instead
    /// of the system clock.
    pub fn clock(&mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> &mut Self {
        self.clock = Box::new(clock);
        self
    }

    /// Begins recording. Returns whether recording started: `false`
    /// means a profile is already being recorded, and the running one
    /// is left undisturbed.
    pub fn start_profile(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.counts.is_some() {
            return false;
        }
        state.counts = Some(StackCounterMap::default());
        state.start = SystemTime::now();
        true
    }

    /// Stops recording and builds the profile, symbolizing each
    /// unique frame through `symbols` and rescaling values by
    /// `1 / sample_rate`. Returns `None` when recording was never
    /// started.
    pub fn stop_profile(&self, sample_rate: f64, symbols: &Symbolizer<'_>) -> Option<pprof::Profile> {
        let (mut samples, start) = {
            let mut state = self.state.lock().unwrap();
            (state.counts.take()?, state.start)
        };
        let duration = SystemTime::now()
            .duration_since(start)
            .unwrap_or_default();

        if !self.host_time {
            samples.elide_host_frames();
        }

        let ratio = 1.0 / sample_rate;
        Some(build_profile(
            symbols,
            &samples,
            start,
            duration,
            &[("cpu", "nanoseconds"), ("samples", "count")],
            &[ratio, ratio],
            |counter| vec![counter.total, counter.count],
        ))
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
    /// stops and returns the profile. This is the busy/duration/cancel
    /// contract an HTTP `profile?seconds=N` handler needs: a profile
    /// already being recorded yields [`Error::AlreadyRunning`].
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

impl FunctionListener for CpuProfiler {
    fn before(
        &self,
        _module: &dyn GuestAccess,
        _def: &Arc<FunctionInfo>,
        _params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        let mut state = self.state.lock().unwrap();
        let frame = if state.counts.is_some() {
            Some(CpuTimeFrame {
                start: (self.clock)(),
                trace: StackTrace::capture(stack, &self.seed),
            })
        } else {
            None
        };
        state.frames.push(frame);
    }

    fn after(&self, _def: &Arc<FunctionInfo>, _results: &[u64]) {
        self.charge_elapsed();
    }

    fn abort(&self, _def: &Arc<FunctionInfo>) {
        // The call unwound, but its time was spent all the same.
        self.charge_elapsed();
    }
}

impl CpuProfiler {
    fn charge_elapsed(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(Some(frame)) = state.frames.pop() {
            let elapsed = ((self.clock)() - frame.start).max(0);
            if let Some(counts) = &mut state.counts {
                counts.observe(&frame.trace, elapsed);
            }
        }
    }
}
