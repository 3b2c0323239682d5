//! Deterministic rate sampling of guest calls.

use std::sync::Arc;
use std::sync::Mutex;

use crate::listener::{FunctionInfo, FunctionListener, GuestAccess, StackFrame};

/// Wraps a listener so only a fixed fraction of calls reach it.
///
/// Sampling is a deterministic stride over the counter of observed
/// calls: call `n` is forwarded when `floor(n * rate)` increments,
/// which picks 1 in every `ceil(1/rate)` calls. A rate of 1 forwards
/// everything. The decision taken at `before` is remembered on a LIFO
/// stack so the matching `after`/`abort` is forwarded (or skipped)
/// consistently; the host guarantees strict nesting of its hooks.
pub struct SampledListener<L> {
    rate: f64,
    inner: L,
    state: Mutex<SamplerState>,
}

#[derive(Default)]
struct SamplerState {
    calls: u64,
    decisions: Vec<bool>,
}

impl<L> SampledListener<L> {
    /// Samples `inner` at `rate`, which must be in `(0, 1]`.
    pub fn new(rate: f64, inner: L) -> SampledListener<L> {
        assert!(rate > 0.0 && rate <= 1.0, "sample rate must be in (0, 1]");
        SampledListener {
            rate,
            inner,
            state: Mutex::new(SamplerState::default()),
        }
    }

    /// The wrapped listener.
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: FunctionListener> FunctionListener for SampledListener<L> {
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        let forward = {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            let n = state.calls;
            let forward = (n as f64 * self.rate).floor() > ((n - 1) as f64 * self.rate).floor();
            state.decisions.push(forward);
            forward
        };
        if forward {
            self.inner.before(module, def, params, stack);
        }
    }

    fn after(&self, def: &Arc<FunctionInfo>, results: &[u64]) {
        let forward = self.state.lock().unwrap().decisions.pop().unwrap_or(false);
        if forward {
            self.inner.after(def, results);
        }
    }

    fn abort(&self, def: &Arc<FunctionInfo>) {
        let forward = self.state.lock().unwrap().decisions.pop().unwrap_or(false);
        if forward {
            self.inner.abort(def);
        }
    }
}
