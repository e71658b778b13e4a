//! Flash command implementation.

use anyhow::{Context, Result, bail};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use frflash::{ChipConfig, ChipFamily, Flasher, Image, UnlockKey};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::{use_fancy_output, was_interrupted};

/// Everything a flash run needs, after CLI/env/config merging.
#[derive(Debug, Clone)]
pub(crate) struct FlashOptions {
    pub image: PathBuf,
    pub device: String,
    pub chip: ChipFamily,
    pub loader: Option<PathBuf>,
    pub key: Option<UnlockKey>,
    pub verify_upload: bool,
    pub interactive: bool,
    pub quiet: bool,
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        bail!("interrupted by user");
    }
    Ok(())
}

fn load_image(path: &Path, what: &str) -> Result<Image> {
    let image = Image::from_file(path)
        .with_context(|| format!("couldn't open {what} file {}", path.display()))?;
    if !image.warnings().is_empty() {
        warn!(
            "{}: {} malformed line(s) skipped",
            path.display(),
            image.warnings().len()
        );
    }
    if image.is_empty() {
        bail!("{what} file {} contains no data records", path.display());
    }
    Ok(image)
}

/// The R32C enters serial programming mode on reset; the sync bytes must
/// follow within a few milliseconds of the user releasing it.
fn confirm_reset(options: &FlashOptions) -> Result<()> {
    let terminal = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
    if !options.interactive || !terminal {
        info!("Not prompting for reset; assuming the board was just reset");
        return Ok(());
    }

    let ready = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Press and release RESET on the board, then confirm")
        .default(true)
        .interact_opt()
        .context("reset prompt failed")?;
    match ready {
        Some(true) => Ok(()),
        _ => bail!("cancelled by user"),
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(options: &FlashOptions) -> Result<()> {
    if !options.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            options.image.display()
        );
    }
    let image = load_image(&options.image, "image")?;
    if !options.quiet {
        eprintln!(
            "{} {} record(s), {} bytes",
            style("ℹ").blue(),
            image.records().len(),
            image.total_bytes()
        );
    }

    let loader = match &options.loader {
        Some(path) => Some(load_image(path, "loader")?),
        None => None,
    };

    let config = ChipConfig::new(options.chip)
        .with_key(options.key)
        .with_verify_upload(options.verify_upload);

    if !options.quiet {
        eprintln!(
            "{} Using {} on {}",
            style("🔌").cyan(),
            options.chip,
            options.device
        );
    }
    let mut flasher = options
        .chip
        .create_flasher(&options.device, config, loader)
        .with_context(|| format!("couldn't open device {}", options.device))?;

    let result = run_session(flasher.as_mut(), &image, options);
    // Release the port on every path
    flasher.close();
    result
}

fn run_session(flasher: &mut dyn Flasher, image: &Image, options: &FlashOptions) -> Result<()> {
    ensure_not_interrupted()?;

    if options.chip.has_key_lock() {
        confirm_reset(options)?;
    }

    if !options.quiet {
        eprintln!("{} Waiting for the boot ROM...", style("⏳").yellow());
    }
    flasher.connect()?;
    ensure_not_interrupted()?;
    if !options.quiet {
        eprintln!("{} Connected", style("✓").green());
    }

    let pb = progress_bar(options.quiet);
    pb.set_message("erasing");
    let report = flasher.flash_image(image, &mut |done, total| {
        pb.set_length(total as u64);
        pb.set_position(done as u64);
        if done > 0 {
            pb.set_message("programming");
        }
    });
    let report = match report {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            return Err(err.into());
        },
    };
    pb.finish_with_message("done");
    ensure_not_interrupted()?;

    flasher.reset()?;

    if !options.quiet {
        if let Some(version) = &report.chip_version {
            eprintln!("{} Chip version: {version}", style("ℹ").blue());
        }
        if let Some(outcome) = &report.unlock {
            match outcome.key {
                Some(key) => eprintln!(
                    "{} Unlocked with key {key} after {} attempt(s)",
                    style("🔑").cyan(),
                    outcome.attempts
                ),
                None => eprintln!("{} Device was not locked", style("🔑").cyan()),
            }
        }
        eprintln!(
            "\n{} Wrote {} page(s) ({} skipped as erased) in {:.2?}",
            style("🎉").green().bold(),
            report.pages_written,
            report.pages_elided,
            report.elapsed
        );
    }

    Ok(())
}
