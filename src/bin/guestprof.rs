use anyhow::{bail, Context, Result};
use clap::Parser;
use guestprof::{FunctionInfo, ModuleProfiling, Symbolizer};

/// Offline inspection of WebAssembly modules through guestprof's
/// symbolizers.
#[derive(Parser)]
enum Command {
    Symbolize(SymbolizeCommand),
    Functions(FunctionsCommand),
}

/// Resolve addresses in a module to source locations.
#[derive(Parser)]
struct SymbolizeCommand {
    /// Path to the WebAssembly module.
    module: std::path::PathBuf,

    /// Addresses to resolve, in hexadecimal (with or without `0x`).
    addresses: Vec<String>,
}

/// Dump the function tables recovered from a module.
#[derive(Parser)]
struct FunctionsCommand {
    /// Path to the WebAssembly module.
    module: std::path::PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    match Command::parse() {
        Command::Symbolize(cmd) => cmd.run(),
        Command::Functions(cmd) => cmd.run(),
    }
}

fn read_module(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read module at {}", path.display()))
}

impl SymbolizeCommand {
    fn run(self) -> Result<()> {
        let wasm = read_module(&self.module)?;
        let profiling =
            ModuleProfiling::prepare(&wasm).context("failed to prepare module for profiling")?;
        let symbols = profiling.symbolizer();

        // The declared-name fallback needs a function definition; an
        // anonymous one keeps the output focused on the debug info.
        let def = std::sync::Arc::new(FunctionInfo {
            module: String::new(),
            index: 0,
            name: String::new(),
            host: false,
            params: 0,
        });

        for addr in &self.addresses {
            let pc = parse_address(addr)?;
            let (resolved_at, locations) = symbols.locations(&def, pc);
            if locations.is_empty() {
                println!("{pc:#x}: ??");
                continue;
            }
            println!("{pc:#x} (resolved at {resolved_at:#x}):");
            for location in locations {
                let marker = if location.inlined { " (inlined)" } else { "" };
                println!(
                    "  {} at {}:{}:{}{marker}",
                    location.human_name, location.file, location.line, location.column,
                );
            }
        }
        Ok(())
    }
}

impl FunctionsCommand {
    fn run(self) -> Result<()> {
        let wasm = read_module(&self.module)?;
        let profiling =
            ModuleProfiling::prepare(&wasm).context("failed to prepare module for profiling")?;

        match profiling.symbolizer() {
            Symbolizer::Go(go) => {
                println!("Go module; {} functions in the line table", go.table().func_count());
                for fm in go.codemap().func_maps() {
                    println!(
                        "func[{}] {:#x}..{:#x} frame={} blocks={} {}",
                        fm.id,
                        fm.start,
                        fm.end,
                        fm.frame_size,
                        fm.blocks.len(),
                        fm.name,
                    );
                }
            }
            Symbolizer::Dwarf(_) => {
                println!("module with DWARF debug info; use `symbolize` to resolve addresses");
            }
            Symbolizer::None => {
                println!("module has no usable debug info");
            }
        }
        Ok(())
    }
}

fn parse_address(s: &str) -> Result<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    match u64::from_str_radix(digits, 16) {
        Ok(pc) => Ok(pc),
        Err(_) => bail!("invalid address: {s}"),
    }
}
