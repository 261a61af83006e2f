pub mod build;
pub mod cache;
pub mod completions;
pub mod gc;
pub mod inspect;
pub mod order;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use strata_core::{CoreError, StateLock, StrataConfig};
use strata_store::StateLayout;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_RECIPE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Resolved configuration plus output mode, shared by every command.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: StrataConfig,
    pub json: bool,
}

impl Context {
    /// Config file (explicit or `./strata.toml`), then command-line
    /// overrides. Relative paths in a config file are relative to that file.
    pub fn load(
        config_path: Option<&Path>,
        state_dir: Option<PathBuf>,
        rootfs_dir: Option<PathBuf>,
        oci_dir: Option<PathBuf>,
        json: bool,
    ) -> Result<Self, String> {
        let cwd = std::env::current_dir()
            .map_err(|e| format!("cannot determine working directory: {e}"))?;
        let (config, base) = match config_path {
            Some(path) => {
                let config = StrataConfig::load(path).map_err(|e| e.to_string())?;
                let base = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map_or_else(|| cwd.clone(), |p| cwd.join(p));
                (config, base)
            }
            None => (
                StrataConfig::discover(&cwd).map_err(|e| e.to_string())?,
                cwd.clone(),
            ),
        };
        let mut config = config.anchored(&base);
        if let Some(dir) = state_dir {
            config.state_dir = cwd.join(dir);
        }
        if let Some(dir) = rootfs_dir {
            config.rootfs_dir = cwd.join(dir);
        }
        if let Some(dir) = oci_dir {
            config.oci_dir = cwd.join(dir);
        }
        Ok(Self { config, json })
    }

    pub fn state(&self) -> StateLayout {
        StateLayout::new(&self.config.state_dir)
    }

    /// Hold the state directory for the rest of the command.
    pub fn lock(&self) -> Result<StateLock, String> {
        let path = self.state().lock_file();
        if let Some(lock) = StateLock::try_acquire(&path).map_err(|e| format!("state lock: {e}"))? {
            return Ok(lock);
        }
        if !self.json {
            eprintln!("waiting for another strata process to finish...");
        }
        StateLock::acquire(&path).map_err(|e| format!("state lock: {e}"))
    }
}

/// Error text whose prefix selects the exit code in `main`.
pub fn core_error(e: &CoreError) -> String {
    match e {
        CoreError::Layer { .. } if e.is_config() => format!("configuration error: {e}"),
        _ => e.to_string(),
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_outcome(outcome: &str) -> String {
    use console::Style;
    match outcome {
        "built" => Style::new().green().apply_to(outcome).to_string(),
        "cached" => Style::new().dim().apply_to(outcome).to_string(),
        "build_only" => Style::new().yellow().apply_to(outcome).to_string(),
        other => other.to_owned(),
    }
}
