#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

mod codemap;
mod cpu;
mod dwarf;
mod error;
mod listener;
mod mem;
mod pclntab;
mod profile;
mod reader;
mod sampler;
mod sections;
mod symbols;
mod unwind;

pub mod pprof;

pub use codemap::{CodeMap, FuncMap, FUNC_VALUE_OFFSET};
pub use cpu::CpuProfiler;
pub use dwarf::DwarfSymbolizer;
pub use error::{Error, Result};
pub use listener::{
    FunctionInfo, FunctionListener, GuestAccess, ModuleProfiling, ProfilerAdapter, StackFrame,
};
pub use mem::MemoryProfiler;
pub use pclntab::{pclntab_from_data, DataIterator, PclnTable, Vmem, PCLNTAB_MAGIC};
pub use profile::{StackCounter, StackCounterMap, StackTrace};
pub use reader::Reader;
pub use sampler::SampledListener;
pub use sections::{custom_sections, ModuleSections, Section};
pub use symbols::{GoSymbolizer, Location, Symbolizer};
pub use unwind::GoStackWalker;
