use anyhow::{bail, Context};
use calcvm_core::{decode_hex, disassemble, DefaultRational, PidTicker, Vm, VmConfig};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "calcvm", about = "Run and inspect control-VM bytecode.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a program until it halts or the step budget runs out.
    Run(RunArgs),
    /// Print the disassembly of a program.
    Disasm {
        program: PathBuf,
        /// Program file is hex text instead of raw bytes.
        #[arg(long)]
        hex: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    program: PathBuf,

    /// Program file is hex text instead of raw bytes.
    #[arg(long)]
    hex: bool,

    /// Maximum number of instructions to execute.
    #[arg(long, default_value_t = 1_000_000)]
    steps: usize,

    /// JSON VM configuration.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured memory size in bytes.
    #[arg(long)]
    memory_size: Option<usize>,

    /// Log every executed instruction.
    #[arg(long)]
    debug: bool,

    /// Print memory after the run, as `start:len` (start may be 0x-prefixed).
    #[arg(long, value_name = "START:LEN", value_parser = parse_range)]
    dump: Option<(u16, usize)>,
}

fn parse_number(text: &str) -> Result<usize, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("{text:?}: {err}"))
}

fn parse_range(text: &str) -> Result<(u16, usize), String> {
    let (start, len) = text
        .split_once(':')
        .ok_or_else(|| format!("expected START:LEN, got {text:?}"))?;
    let start = parse_number(start)?;
    let start = u16::try_from(start).map_err(|_| format!("start 0x{start:X} is beyond 0xFFFF"))?;
    Ok((start, parse_number(len)?))
}

fn hex_rows(start: u16, bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .enumerate()
        .map(|(row, chunk)| {
            let cells: Vec<String> = chunk.iter().map(|byte| format!("{byte:02X}")).collect();
            format!("{:04X}: {}", start as usize + row * 16, cells.join(" "))
        })
        .collect()
}

fn read_program(path: &Path, hex: bool) -> anyhow::Result<Vec<u8>> {
    if hex {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(decode_hex(&text)?)
    } else {
        fs::read(path).with_context(|| format!("reading {}", path.display()))
    }
}

/// Returns whether the program ended without an error halt.
fn run_program(args: RunArgs) -> anyhow::Result<bool> {
    let mut config = match &args.config {
        Some(path) => VmConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VmConfig::default(),
    };
    if let Some(size) = args.memory_size {
        config.memory_size = size;
    }
    config.debug |= args.debug;

    let program = read_program(&args.program, args.hex)?;
    if program.len() > config.memory_size {
        bail!(
            "program of {} bytes does not fit in {} bytes of memory",
            program.len(),
            config.memory_size
        );
    }

    let mut vm: Vm<DefaultRational> = config.build()?;
    vm.load_program(&program)?;
    let ticker = PidTicker::spawn(vm.pids().clone(), config.pid_interval())?;
    let pause = config.step_pause();
    let mut executed = 0usize;
    while executed < args.steps && !vm.is_halted() {
        executed += 1;
        let _ = vm.step();
        if !pause.is_zero() {
            thread::sleep(pause);
        }
    }
    ticker.shutdown();

    println!("steps:  {executed}");
    println!("pc:     0x{:04X}", vm.pc());
    println!("flags:  0x{:02X}", vm.flags());
    println!("status: 0x{:08X}", vm.status());
    if let Some((start, len)) = args.dump {
        let bytes = vm.memory().read_bytes(start, len)?;
        for row in hex_rows(start, &bytes) {
            println!("{row}");
        }
    }
    Ok(!vm.has_error())
}

fn run(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Command::Run(args) => run_program(args),
        Command::Disasm { program, hex } => {
            let program = read_program(&program, hex)?;
            for (address, line) in disassemble::<DefaultRational>(&program) {
                println!("{address:04X}  {line}");
            }
            Ok(true)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(matches!(&cli.command, Command::Run(args) if args.debug));
    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("fatal: {err:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dump_ranges() {
        assert_eq!(parse_range("0x70:16"), Ok((0x70, 16)));
        assert_eq!(parse_range("112:0x10"), Ok((112, 16)));
        assert!(parse_range("0x10000:4").is_err());
        assert!(parse_range("70").is_err());
    }

    #[test]
    fn hex_rows_wrap_at_sixteen_bytes() {
        let bytes: Vec<u8> = (0..18).collect();
        let rows = hex_rows(0x70, &bytes);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("0070: 00 01 02"));
        assert_eq!(rows[1], "0080: 10 11");
    }

    #[test]
    fn cli_accepts_run_options() {
        let cli = Cli::try_parse_from([
            "calcvm", "run", "prog.hex", "--hex", "--steps", "50", "--dump", "0x70:8",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert!(args.hex);
                assert_eq!(args.steps, 50);
                assert_eq!(args.dump, Some((0x70, 8)));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
