//! frflash CLI - Command-line tool for flashing FR and R32C microcontrollers.
//!
//! ## Features
//!
//! - Flash S-record images over the serial boot ROM
//! - Upload the FR second-stage loader automatically
//! - Unlock ID-protected R32C parts (supplied key or key search)
//! - Configuration files and environment variable support

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use console::style;
use env_logger::Env;
use frflash::{ChipFamily, UnlockKey};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use commands::flash::{FlashOptions, cmd_flash};
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Serial device used when nothing else names one.
const DEFAULT_DEVICE: &str = "/dev/ttyUSB0";

/// Loader path tried first, relative to the working directory.
const DEFAULT_LOADER: &str = "pkernel/pkernel.mhx";

/// Installed loader locations, searched after the working directory.
const SYSTEM_LOADER_DIRS: &[&str] = &["/usr/local/share/frflash", "/usr/share/frflash"];

/// frflash - Flash FR and R32C microcontrollers over their serial boot ROM.
///
/// Environment variables:
///   FRFLASH_DEVICE            - Default serial device
///   FRFLASH_CHIP              - Default chip family (fr, r32c)
///   FRFLASH_LOADER            - Second-stage loader for FR targets
///   FRFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser, Debug)]
#[command(name = "frflash")]
#[command(author, version, about, long_about = None)]
#[command(disable_version_flag = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// S-record image to program.
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Serial device the board is attached to.
    #[arg(short, long, env = "FRFLASH_DEVICE")]
    device: Option<String>,

    /// Target chip family.
    #[arg(short, long, env = "FRFLASH_CHIP")]
    chip: Option<Chip>,

    /// Second-stage loader image (FR only).
    #[arg(long, value_name = "PATH", env = "FRFLASH_LOADER")]
    loader: Option<PathBuf>,

    /// ID key to try first on locked R32C parts, as ADDR:VALUE in hex.
    #[arg(long, value_name = "ADDR:VALUE", value_parser = parse_key)]
    key: Option<UnlockKey>,

    /// Read the uploaded loader back and compare it (FR only).
    #[arg(long)]
    verify_upload: bool,

    /// Non-interactive mode (never prompt).
    #[arg(long, env = "FRFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (--verbose, --verbose --verbose for more detail).
    #[arg(long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Print version.
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

/// Supported chip families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Chip {
    /// Fujitsu FR (boot ROM + pkernel loader).
    Fr,
    /// Renesas R32C (serial programming mode).
    R32c,
}

impl From<Chip> for ChipFamily {
    fn from(chip: Chip) -> Self {
        match chip {
            Chip::Fr => Self::Fr,
            Chip::R32c => Self::R32c,
        }
    }
}

/// Parse an unlock key given as `ADDR:VALUE` (both hex).
fn parse_key(s: &str) -> Result<UnlockKey, String> {
    let Some((addr, value)) = s.split_once(':') else {
        return Err(format!(
            "Invalid key: '{s}'. Expected 'ADDR:VALUE' (e.g., 'FFFFFFE8:FFFFFFFFFFFFFF')"
        ));
    };
    let address = parse_hex_u32(addr)?;
    let value = parse_hex_u64(value)?;
    if value > frflash::unlock::KEY_MASK {
        return Err(format!("Key value {value:X} is wider than 56 bits"));
    }
    Ok(UnlockKey::new(address, value))
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = strip_hex(s);
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    let s = strip_hex(s);
    u64::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex value: {e}"))
}

fn strip_hex(s: &str) -> String {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    s.chars().filter(|c| *c != '_').collect()
}

/// Settings after merging CLI, environment and config files.
fn resolve_options(cli: &Cli, config: &Config) -> Result<FlashOptions> {
    let chip = match (cli.chip, config.flash.chip.as_deref()) {
        (Some(chip), _) => chip.into(),
        (None, Some(name)) => ChipFamily::from_name(name)
            .with_context(|| format!("unknown chip '{name}' in config"))?,
        (None, None) => ChipFamily::default(),
    };

    let device = cli
        .device
        .clone()
        .or_else(|| config.connection.device.clone())
        .unwrap_or_else(|| DEFAULT_DEVICE.to_string());

    let key = match (cli.key, config.flash.key.as_deref()) {
        (Some(key), _) => Some(key),
        (None, Some(text)) => Some(
            parse_key(text)
                .map_err(anyhow::Error::msg)
                .context("invalid key in config")?,
        ),
        (None, None) => None,
    };

    let loader = if chip.needs_loader() {
        Some(resolve_loader(
            cli.loader.as_deref().or(config.flash.loader.as_deref()),
        )?)
    } else {
        None
    };

    Ok(FlashOptions {
        image: cli.image.clone(),
        device,
        chip,
        loader,
        key,
        verify_upload: cli.verify_upload || config.flash.verify_upload,
        interactive: !cli.non_interactive,
        quiet: cli.quiet,
    })
}

/// Pick the loader image: an explicit path wins, otherwise the first
/// existing default location.
fn resolve_loader(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let candidates = loader_candidates();
    if let Some(found) = candidates.iter().find(|p| p.is_file()) {
        debug!("Using loader {}", found.display());
        return Ok(found.clone());
    }

    let searched: Vec<String> = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    bail!(
        "no second-stage loader found (searched {}); pass --loader",
        searched.join(", ")
    )
}

fn loader_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(DEFAULT_LOADER)];
    if let Some(dir) = Config::data_dir() {
        candidates.push(dir.join("pkernel.mhx"));
    }
    candidates.extend(
        SYSTEM_LOADER_DIRS
            .iter()
            .map(|dir| Path::new(dir).join("pkernel.mhx")),
    );
    candidates
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            // Second Ctrl-C: give up immediately
            std::process::exit(130);
        }
        eprintln!("\nInterrupted, stopping after the current command...");
    });
    if let Err(err) = result {
        debug!("Could not install Ctrl-C handler: {err}");
    }
    frflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    let options = resolve_options(cli, &config)?;
    cmd_flash(&options)
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            // --help and --version print to stdout and are not errors
            return if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        },
    };

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "frflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::FAILURE
        },
    }
}
