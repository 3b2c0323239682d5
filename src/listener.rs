//! The host-runtime interface and the adapter that bridges it to the
//! profilers.
//!
//! To avoid a public dependency on any particular WebAssembly runtime,
//! the profilers talk to the host through the small traits defined
//! here: the host invokes the [`FunctionListener`] hooks around every
//! guest call, supplies guest memory and globals through
//! [`GuestAccess`], and hands over its own view of the call stack as
//! an iterator of [`StackFrame`]s. It is up to embedders to implement
//! these for their runtime.
//!
//! [`ModuleProfiling`] inspects the module once at load time, picks
//! the right symbolizer for its toolchain, and adapts listeners so
//! that Go guests are walked through their own scheduler state instead
//! of the host's frame iterator, which cannot see across goroutine
//! stacks.

use std::sync::Arc;

use crate::codemap::CodeMap;
use crate::dwarf::DwarfSymbolizer;
use crate::error::{Error, Result};
use crate::pclntab::{pclntab_from_data, PclnTable};
use crate::sections::{custom_sections, ModuleSections};
use crate::symbols::{GoSymbolizer, Symbolizer};
use crate::unwind::GoStackWalker;

/// The host runtime's description of one function, owned so stack
/// traces can outlive the call that produced them. Embedders should
/// build one `Arc<FunctionInfo>` per function and reuse it across
/// calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Name of the module the function belongs to.
    pub module: String,
    /// Index in the module's function index space (imports included).
    pub index: u32,
    /// Declared name, from the export or name section.
    pub name: String,
    /// Whether the function is implemented by the host.
    pub host: bool,
    /// Number of parameters.
    pub params: u32,
}

/// One frame of a call stack.
#[derive(Clone, Debug)]
pub struct StackFrame {
    /// The function the frame executes.
    pub func: Arc<FunctionInfo>,
    /// The program counter, in the host runtime's encoding.
    pub pc: u64,
}

/// Read access to a module instance's linear memory and globals.
pub trait GuestAccess {
    /// Reads a little-endian `u64` from linear memory, or `None` when
    /// the address is out of bounds.
    fn read_u64(&self, addr: u32) -> Option<u64>;

    /// Reads a global by index, zero-extended to 64 bits.
    fn global(&self, index: u32) -> Option<u64>;
}

/// Hooks the host runtime invokes around every guest function call.
///
/// `before` and `after` are strictly nested per call; `abort` replaces
/// `after` when the call unwinds. Implementations must be safe to call
/// from any host worker thread.
pub trait FunctionListener: Send + Sync {
    /// Called on entry, with the call's parameters and the stack
    /// leading to it (innermost frame first).
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    );

    /// Called on ordinary return.
    fn after(&self, def: &Arc<FunctionInfo>, results: &[u64]);

    /// Called instead of `after` when the call traps or unwinds.
    fn abort(&self, def: &Arc<FunctionInfo>);
}

impl<T: FunctionListener + ?Sized> FunctionListener for Arc<T> {
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        (**self).before(module, def, params, stack);
    }

    fn after(&self, def: &Arc<FunctionInfo>, results: &[u64]) {
        (**self).after(def, results);
    }

    fn abort(&self, def: &Arc<FunctionInfo>) {
        (**self).abort(def);
    }
}

impl<T: FunctionListener + ?Sized> FunctionListener for &T {
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        (**self).before(module, def, params, stack);
    }

    fn after(&self, def: &Arc<FunctionInfo>, results: &[u64]) {
        (**self).after(def, results);
    }

    fn abort(&self, def: &Arc<FunctionInfo>) {
        (**self).abort(def);
    }
}

struct GoRuntime {
    codemap: Arc<CodeMap>,
    /// Function descriptors for walker-produced frames, indexed by
    /// code-section function index.
    registry: Vec<Arc<FunctionInfo>>,
}

/// Per-module profiling state: the detected toolchain, its symbolizer,
/// and (for Go guests) the code map driving the stack walker.
pub struct ModuleProfiling<'a> {
    symbols: Symbolizer<'a>,
    go: Option<GoRuntime>,
}

impl<'a> ModuleProfiling<'a> {
    /// Inspects a module and prepares symbolization for it.
    ///
    /// A module whose data section carries the Go runtime's line-table
    /// magic is treated as Go-compiled; failures decoding that layout
    /// are fatal, since the module cannot be profiled correctly
    /// without it. Any other module uses its DWARF sections, and a
    /// module without usable DWARF degrades to the no-op symbolizer.
    pub fn prepare(wasm: &'a [u8]) -> Result<ModuleProfiling<'a>> {
        let sections = ModuleSections::parse(wasm);

        if let Some(data) = sections.data {
            if let Some(image) = pclntab_from_data(data)? {
                let code = sections
                    .code
                    .ok_or(Error::MalformedPclntab("module has no code section"))?;
                let codemap = Arc::new(CodeMap::build(code, sections.name, sections.imports)?);
                let table = PclnTable::parse(image)?;

                let registry = codemap
                    .func_maps()
                    .iter()
                    .map(|fm| {
                        Arc::new(FunctionInfo {
                            module: String::new(),
                            index: fm.id,
                            name: fm.name.clone(),
                            host: false,
                            params: 0,
                        })
                    })
                    .collect();

                return Ok(ModuleProfiling {
                    symbols: Symbolizer::Go(GoSymbolizer::new(codemap.clone(), table)),
                    go: Some(GoRuntime { codemap, registry }),
                });
            }
        }

        let customs = custom_sections(wasm);
        let symbols = match DwarfSymbolizer::from_custom_sections(&customs) {
            Ok(dwarf) => Symbolizer::Dwarf(dwarf),
            Err(err) => {
                log::warn!("module has no usable debug info: {err}");
                Symbolizer::None
            }
        };
        Ok(ModuleProfiling {
            symbols,
            go: None,
        })
    }

    /// The symbolizer selected for this module.
    pub fn symbolizer(&self) -> &Symbolizer<'a> {
        &self.symbols
    }

    /// Whether the module was identified as a Go guest.
    pub fn is_go(&self) -> bool {
        self.go.is_some()
    }

    /// Wraps `listener` so it observes the right stack for this
    /// module's toolchain.
    pub fn adapt<L: FunctionListener>(&self, listener: L) -> ProfilerAdapter<'_, 'a, L> {
        ProfilerAdapter {
            profiling: self,
            inner: listener,
        }
    }
}

/// Substitutes the host's stack iterator with the guest-native walker
/// when the module requires one, then forwards to the wrapped
/// listener.
pub struct ProfilerAdapter<'p, 'a, L> {
    profiling: &'p ModuleProfiling<'a>,
    inner: L,
}

impl<L> ProfilerAdapter<'_, '_, L> {
    /// The wrapped listener.
    pub fn inner(&self) -> &L {
        &self.inner
    }
}

impl<L: FunctionListener> FunctionListener for ProfilerAdapter<'_, '_, L> {
    fn before(
        &self,
        module: &dyn GuestAccess,
        def: &Arc<FunctionInfo>,
        params: &[u64],
        stack: &mut dyn Iterator<Item = StackFrame>,
    ) {
        if let Some(go) = &self.profiling.go {
            if let Some(mut walker) =
                GoStackWalker::new(module, &go.codemap, &go.registry, def.index)
            {
                self.inner.before(module, def, params, &mut walker);
                return;
            }
            // Scheduler state was unreadable; the host's own view is
            // better than nothing.
        }
        self.inner.before(module, def, params, stack);
    }

    fn after(&self, def: &Arc<FunctionInfo>, results: &[u64]) {
        self.inner.after(def, results);
    }

    fn abort(&self, def: &Arc<FunctionInfo>) {
        self.inner.abort(def);
    }
}
