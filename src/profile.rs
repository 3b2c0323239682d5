//! Stack traces, per-stack counters, and the conversion of counters
//! into a pprof profile.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::listener::{FunctionInfo, StackFrame};
use crate::pprof;
use crate::pprof::StringTable;
use crate::symbols::Symbolizer;

/// A captured guest call stack: parallel function and PC sequences,
/// innermost first, with a precomputed hash over the PCs.
///
/// Equality for counting purposes is by hash; the seed is drawn per
/// process, so collisions are negligible and hashes are not stable
/// across runs.
#[derive(Clone, Debug, Default)]
pub struct StackTrace {
    funcs: Vec<Arc<FunctionInfo>>,
    pcs: Vec<u64>,
    key: u64,
}

impl StackTrace {
    /// Drains `frames` into a trace and hashes it with `seed`.
    pub fn capture(
        frames: &mut dyn Iterator<Item = StackFrame>,
        seed: &RandomState,
    ) -> StackTrace {
        let mut funcs = Vec::new();
        let mut pcs = Vec::new();
        for frame in frames {
            funcs.push(frame.func);
            pcs.push(frame.pc);
        }

        let mut hasher = seed.build_hasher();
        for pc in &pcs {
            hasher.write_u64(*pc);
        }
        let key = hasher.finish();

        StackTrace { funcs, pcs, key }
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.pcs.len()
    }

    /// Whether the trace has no frames.
    pub fn is_empty(&self) -> bool {
        self.pcs.is_empty()
    }

    /// The frame at `i` (0 is innermost).
    pub fn frame(&self, i: usize) -> (&Arc<FunctionInfo>, u64) {
        (&self.funcs[i], self.pcs[i])
    }

    /// The trace's hash key.
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Whether the innermost frame is a host function.
    pub fn host(&self) -> bool {
        self.funcs.first().map(|f| f.host).unwrap_or(false)
    }

    /// Whether `other` is a (possibly equal) caller chain of `self`:
    /// its PC sequence is a suffix of this trace's.
    pub fn contains(&self, other: &StackTrace) -> bool {
        if other.pcs.len() > self.pcs.len() {
            return false;
        }
        self.pcs[self.pcs.len() - other.pcs.len()..] == other.pcs[..]
    }
}

/// A stack with how often it was seen and what it accumulated:
/// nanoseconds for CPU profiles, bytes for memory profiles.
#[derive(Clone, Debug)]
pub struct StackCounter {
    /// The observed stack.
    pub stack: StackTrace,
    /// Number of observations.
    pub count: i64,
    /// Accumulated value across observations.
    pub total: i64,
}

impl StackCounter {
    fn observe(&mut self, value: i64) {
        self.count += 1;
        self.total += value;
    }
}

/// Per-stack-trace counters, keyed by trace hash.
#[derive(Clone, Debug, Default)]
pub struct StackCounterMap {
    counters: HashMap<u64, StackCounter>,
}

impl StackCounterMap {
    /// Counts one observation of `stack` carrying `value`. The stack
    /// is cloned on first insertion so callers can reuse their
    /// capture buffers.
    pub fn observe(&mut self, stack: &StackTrace, value: i64) {
        self.counters
            .entry(stack.key())
            .or_insert_with(|| StackCounter {
                stack: stack.clone(),
                count: 0,
                total: 0,
            })
            .observe(value);
    }

    /// Number of distinct stacks.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no stack was observed.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterates over the counters in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &StackCounter> {
        self.counters.values()
    }

    /// Removes every counter whose innermost frame is a host function
    /// and subtracts its total from each counter whose stack contains
    /// the removed one, crediting the elided host time back out of the
    /// guest callers that accumulated it.
    pub fn elide_host_frames(&mut self) {
        let host_keys: Vec<u64> = self
            .counters
            .iter()
            .filter(|(_, c)| c.stack.host())
            .map(|(&k, _)| k)
            .collect();

        for key in host_keys {
            let Some(host) = self.counters.remove(&key) else {
                continue;
            };
            for other in self.counters.values_mut() {
                if host.stack.contains(&other.stack) {
                    other.total -= host.total;
                }
            }
        }
    }
}

#[derive(Hash, PartialEq, Eq)]
struct LocationKey {
    module: String,
    index: u32,
    name: String,
    pc: u64,
}

/// Converts stack counters into a pprof profile.
///
/// Locations are deduplicated by `(module, function index, function
/// name, pc)` and functions by stable name. A function first created
/// from an unresolved PC keeps the declared wasm name until a later
/// frame resolves, at which point the entry is patched in place.
/// `values` picks and orders the emitted values of each counter to
/// match `sample_types`; `ratios` undoes the sampling rate.
pub(crate) fn build_profile(
    symbols: &Symbolizer<'_>,
    samples: &StackCounterMap,
    start: SystemTime,
    duration: Duration,
    sample_types: &[(&str, &str)],
    ratios: &[f64],
    values: impl Fn(&StackCounter) -> Vec<i64>,
) -> pprof::Profile {
    let mut strings = StringTable::new();
    let mut profile = pprof::Profile {
        time_nanos: start
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0),
        duration_nanos: duration.as_nanos() as i64,
        ..Default::default()
    };
    profile.sample_type = sample_types
        .iter()
        .map(|&(t, unit)| pprof::ValueType {
            r#type: strings.intern(t),
            unit: strings.intern(unit),
        })
        .collect();

    let mut locations: HashMap<LocationKey, u64> = HashMap::new();
    let mut functions: HashMap<String, usize> = HashMap::new();

    for counter in samples.iter() {
        let mut location_id = Vec::with_capacity(counter.stack.len());
        for i in 0..counter.stack.len() {
            let (func, pc) = counter.stack.frame(i);
            let key = LocationKey {
                module: func.module.clone(),
                index: func.index,
                name: func.name.clone(),
                pc,
            };
            let id = match locations.get(&key) {
                Some(&id) => id,
                None => {
                    let id = location_for_call(
                        symbols,
                        func,
                        pc,
                        &mut profile,
                        &mut functions,
                        &mut strings,
                    );
                    locations.insert(key, id);
                    id
                }
            };
            location_id.push(id);
        }

        profile.sample.push(pprof::Sample {
            location_id,
            value: values(counter),
            label: Vec::new(),
        });
    }

    profile.string_table = strings.finish();
    profile.scale_n(ratios);
    profile
}

/// Creates the pprof location for one stack frame, interning the
/// functions of its inlined chain. Returns the location id.
fn location_for_call(
    symbols: &Symbolizer<'_>,
    func: &FunctionInfo,
    pc: u64,
    profile: &mut pprof::Profile,
    functions: &mut HashMap<String, usize>,
    strings: &mut StringTable,
) -> u64 {
    let (address, mut resolved) = if pc > 0 {
        symbols.locations(func, pc)
    } else {
        (0, Vec::new())
    };
    let symbol_found = !resolved.is_empty();

    if resolved.is_empty() {
        // No source location: attach to a generic point within the
        // function.
        resolved.push(crate::symbols::Location::default());
    }
    if resolved[0].stable_name.is_empty() {
        resolved[0].stable_name = func.name.clone();
    }
    if resolved[0].human_name.is_empty() {
        resolved[0].human_name = func.name.clone();
    }

    let mut lines = vec![pprof::Line::default(); resolved.len()];
    for (i, loc) in resolved.iter().enumerate() {
        let func_index = match functions.get(&loc.stable_name) {
            Some(&idx) => {
                if symbol_found {
                    // The function may have been created while its PC
                    // was still unresolved; correct it now that the
                    // symbol mapper succeeded.
                    let f = &mut profile.function[idx];
                    f.name = strings.intern(&loc.human_name);
                    f.system_name = strings.intern(&loc.stable_name);
                    f.filename = strings.intern(&loc.file);
                }
                idx
            }
            None => {
                let idx = profile.function.len();
                profile.function.push(pprof::Function {
                    // Id 0 is reserved by pprof.
                    id: idx as u64 + 1,
                    name: strings.intern(&loc.human_name),
                    system_name: strings.intern(&loc.stable_name),
                    filename: strings.intern(&loc.file),
                    start_line: 0,
                });
                functions.insert(loc.stable_name.clone(), idx);
                idx
            }
        };

        // Pprof wants lines to start with the root of the inlined
        // chain; the symbolizer produces them the other way around.
        lines[resolved.len() - 1 - i] = pprof::Line {
            function_id: func_index as u64 + 1,
            line: loc.line,
        };
    }

    let id = profile.location.len() as u64 + 1;
    profile.location.push(pprof::Location {
        id,
        mapping_id: 0,
        address,
        line: lines,
        is_folded: false,
    });
    id
}
