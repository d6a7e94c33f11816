//! CLI for inspecting and editing flash filesystem images

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use flashimg::shell::EXIT_FATAL;
use flashimg::{ExitStatus, FlashFs, Interpreter, RamFlash, Session};
use log::{debug, error};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "flashimg")]
#[command(about = "Inspect and edit flash filesystem images")]
#[command(version)]
#[command(group(ArgGroup::new("mode").args(["list", "interactive", "script"])))]
struct Cli {
    /// Filesystem image path
    #[arg(short = 'f', long = "file")]
    file: PathBuf,

    /// Create a new image of SIZE bytes (e.g. 1048576, 0x100000, 1M)
    #[arg(short = 'c', long = "create", value_name = "SIZE", value_parser = parse_size)]
    create: Option<u64>,

    /// List the root directory and exit
    #[arg(short, long)]
    list: bool,

    /// Read commands from standard input
    #[arg(short, long)]
    interactive: bool,

    /// Run commands from a script file
    #[arg(short = 'r', long = "script", value_name = "SCRIPT")]
    script: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

enum Mode<'a> {
    /// Mount and unmount only, e.g. to create an empty image
    None,
    List,
    Interactive,
    Script(&'a PathBuf),
}

impl Cli {
    fn mode(&self) -> Mode<'_> {
        if self.list {
            Mode::List
        } else if self.interactive {
            Mode::Interactive
        } else if let Some(script) = &self.script {
            Mode::Script(script)
        } else {
            Mode::None
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match run(&cli) {
        Ok(status) => ExitCode::from(status.code()),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitStatus> {
    let mut session = Session::open(&cli.file, cli.create)?;

    let result = run_commands(cli, session.fs());

    // Persist whatever was written, even after a fatal command error
    let finished = session.finish();
    match (result, finished) {
        (Ok(status), Ok(())) => Ok(status),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), finished) => {
            if let Err(flush) = finished {
                error!("{:#}", flush);
            }
            Err(e)
        }
    }
}

fn run_commands(cli: &Cli, fs: &mut FlashFs<RamFlash>) -> Result<ExitStatus> {
    let mut shell = Interpreter::new(fs, io::stdout().lock(), io::stderr().lock());

    match cli.mode() {
        Mode::None => {
            debug!("No command given");
            Ok(ExitStatus::Success)
        }
        Mode::List => {
            shell.execute_line("ls")?;
            Ok(shell.status())
        }
        Mode::Interactive => shell.run(io::stdin().lock(), true),
        Mode::Script(path) => {
            let script = File::open(path)
                .with_context(|| format!("Failed to open script '{}'", path.display()))?;
            shell.run(BufReader::new(script), false)
        }
    }
}

/// Parse a size with optional K/M/G suffix. The number may be decimal,
/// `0x` hexadecimal or `0`-prefixed octal.
fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let (num_str, multiplier) = if s.ends_with('K') || s.ends_with('k') {
        (&s[..s.len() - 1], 1024u64)
    } else if s.ends_with('M') || s.ends_with('m') {
        (&s[..s.len() - 1], 1024 * 1024)
    } else if s.ends_with('G') || s.ends_with('g') {
        (&s[..s.len() - 1], 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };

    let num = if let Some(hex) = num_str
        .strip_prefix("0x")
        .or_else(|| num_str.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16)
    } else if num_str.len() > 1 && num_str.starts_with('0') {
        u64::from_str_radix(&num_str[1..], 8)
    } else {
        num_str.parse()
    }
    .with_context(|| format!("Invalid size: {}", s))?;

    num.checked_mul(multiplier)
        .with_context(|| format!("Size too large: {}", s))
}
