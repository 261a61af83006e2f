use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::str::FromStr;
use strata_store::running_as_root;
use tracing::{debug, info, warn};

/// Where imports appear inside the rootfs under the chroot runner.
pub const IMPORTS_MOUNT: &str = "strata";
pub const IMPORTS_ENV: &str = "STRATA_IMPORTS";
/// File name of the generated script inside a layer's import directory.
pub const RUN_SCRIPT: &str = ".strata-run.sh";

/// What to do when a layer's script exits non-zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnRunFailure {
    #[default]
    Abort,
    /// Log the failure and keep building the layer as-is.
    Continue,
}

impl FromStr for OnRunFailure {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(OnRunFailure::Abort),
            "continue" => Ok(OnRunFailure::Continue),
            other => Err(CoreError::Config(format!(
                "unknown run failure policy '{other}' (expected abort or continue)"
            ))),
        }
    }
}

/// One script execution against a working rootfs.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub rootfs: &'a Path,
    pub import_dir: &'a Path,
    /// Script path on the host; it lives inside `import_dir`.
    pub script: &'a Path,
    pub on_failure: OnRunFailure,
    /// `(host source, absolute destination in the rootfs)`.
    pub extra_binds: &'a [(PathBuf, String)],
}

pub trait Runner {
    fn name(&self) -> &'static str;
    fn run(&self, request: &RunRequest<'_>) -> Result<ExitStatus, CoreError>;
}

fn check_status(
    runner: &str,
    status: ExitStatus,
    on_failure: OnRunFailure,
) -> Result<ExitStatus, CoreError> {
    if status.success() {
        return Ok(status);
    }
    match on_failure {
        OnRunFailure::Abort => Err(CoreError::Command(format!(
            "{runner} runner: script failed with {status}"
        ))),
        OnRunFailure::Continue => {
            warn!("{runner} runner: script failed with {status}, continuing");
            Ok(status)
        }
    }
}

/// Runs the script with the host's `/bin/sh`, working directory set to the
/// rootfs. No isolation: commands address files relative to the rootfs, and
/// the import directory is exported as `STRATA_IMPORTS`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

impl Runner for HostRunner {
    fn name(&self) -> &'static str {
        "host"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<ExitStatus, CoreError> {
        if !request.extra_binds.is_empty() {
            warn!("host runner ignores {} bind mount(s)", request.extra_binds.len());
        }
        debug!("running {} in {}", request.script.display(), request.rootfs.display());
        let status = Command::new("/bin/sh")
            .arg("-xe")
            .arg(request.script)
            .current_dir(request.rootfs)
            .env(IMPORTS_ENV, request.import_dir)
            .env("STRATA_ROOTFS", request.rootfs)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| CoreError::Command(format!("failed to start /bin/sh: {e}")))?;
        check_status(self.name(), status, request.on_failure)
    }
}

/// Runs the script inside the rootfs via `chroot`, with the import directory
/// bind-mounted at `/strata`. Requires root and a `bin/sh` in the rootfs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChrootRunner;

/// Bind mounts made for one run, undone in reverse order on drop.
struct Mounts {
    mounted: Vec<PathBuf>,
    created: Vec<PathBuf>,
}

impl Mounts {
    fn new() -> Self {
        Self {
            mounted: Vec::new(),
            created: Vec::new(),
        }
    }

    fn bind(&mut self, source: &Path, target: &Path) -> Result<(), CoreError> {
        if !target.exists() {
            let mut missing = Vec::new();
            let mut p = target;
            while !p.exists() {
                missing.push(p.to_path_buf());
                match p.parent() {
                    Some(parent) => p = parent,
                    None => break,
                }
            }
            if source.is_dir() {
                fs::create_dir_all(target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(target, b"")?;
            }
            // innermost first, so removal can walk the list in order
            self.created.extend(missing);
        }

        let status = Command::new("mount")
            .arg("--bind")
            .arg(source)
            .arg(target)
            .status()
            .map_err(|e| CoreError::Command(format!("failed to start mount: {e}")))?;
        if !status.success() {
            return Err(CoreError::Command(format!(
                "bind mount of {} at {} failed",
                source.display(),
                target.display()
            )));
        }
        self.mounted.push(target.to_path_buf());
        Ok(())
    }
}

impl Drop for Mounts {
    fn drop(&mut self) {
        for target in self.mounted.iter().rev() {
            let ok = Command::new("umount")
                .arg(target)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .is_ok_and(|s| s.success());
            if !ok {
                warn!("failed to unmount {}", target.display());
            }
        }
        for path in &self.created {
            let removed = if path.is_dir() {
                fs::remove_dir(path)
            } else {
                fs::remove_file(path)
            };
            if let Err(e) = removed {
                warn!("failed to remove mount point {}: {e}", path.display());
            }
        }
    }
}

impl Runner for ChrootRunner {
    fn name(&self) -> &'static str {
        "chroot"
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<ExitStatus, CoreError> {
        if !running_as_root() {
            return Err(CoreError::Config(
                "the chroot runner requires root privileges".to_owned(),
            ));
        }
        if !request.rootfs.join("bin").join("sh").exists() {
            return Err(CoreError::Command(format!(
                "rootfs {} has no /bin/sh",
                request.rootfs.display()
            )));
        }
        let script_name = request
            .script
            .file_name()
            .ok_or_else(|| CoreError::Command("script path has no file name".to_owned()))?;

        let mut mounts = Mounts::new();
        mounts.bind(request.import_dir, &request.rootfs.join(IMPORTS_MOUNT))?;
        for (source, dest) in request.extra_binds {
            mounts.bind(source, &request.rootfs.join(dest.trim_start_matches('/')))?;
        }

        let inside = Path::new("/").join(IMPORTS_MOUNT).join(script_name);
        info!("chroot {} /bin/sh -xe {}", request.rootfs.display(), inside.display());
        let status = Command::new("chroot")
            .arg(request.rootfs)
            .arg("/bin/sh")
            .arg("-xe")
            .arg(&inside)
            .env(IMPORTS_ENV, Path::new("/").join(IMPORTS_MOUNT))
            .stdin(Stdio::null())
            .status()
            .map_err(|e| CoreError::Command(format!("failed to start chroot: {e}")))?;
        drop(mounts);
        check_status(self.name(), status, request.on_failure)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Host,
    Chroot,
}

impl fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerKind::Host => f.write_str("host"),
            RunnerKind::Chroot => f.write_str("chroot"),
        }
    }
}

impl FromStr for RunnerKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(RunnerKind::Host),
            "chroot" => Ok(RunnerKind::Chroot),
            other => Err(CoreError::Config(format!(
                "unknown runner '{other}' (expected host or chroot)"
            ))),
        }
    }
}

pub fn select_runner(kind: RunnerKind) -> Box<dyn Runner> {
    match kind {
        RunnerKind::Host => Box::new(HostRunner),
        RunnerKind::Chroot => Box::new(ChrootRunner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(RUN_SCRIPT);
        fs::write(&path, format!("#!/bin/sh -xe\n{body}\n")).unwrap();
        path
    }

    #[test]
    fn host_runner_runs_in_rootfs() {
        let rootfs = tempfile::tempdir().unwrap();
        let imports = tempfile::tempdir().unwrap();
        fs::write(imports.path().join("payload"), "data").unwrap();
        let s = script(imports.path(), "cp \"$STRATA_IMPORTS/payload\" copied\necho hi > greeting");

        let status = HostRunner
            .run(&RunRequest {
                rootfs: rootfs.path(),
                import_dir: imports.path(),
                script: &s,
                on_failure: OnRunFailure::Abort,
                extra_binds: &[],
            })
            .unwrap();
        assert!(status.success());
        assert_eq!(fs::read_to_string(rootfs.path().join("copied")).unwrap(), "data");
        assert_eq!(fs::read_to_string(rootfs.path().join("greeting")).unwrap(), "hi\n");
    }

    #[test]
    fn failing_script_aborts() {
        let rootfs = tempfile::tempdir().unwrap();
        let imports = tempfile::tempdir().unwrap();
        let s = script(imports.path(), "false\necho never > after");
        let err = HostRunner
            .run(&RunRequest {
                rootfs: rootfs.path(),
                import_dir: imports.path(),
                script: &s,
                on_failure: OnRunFailure::Abort,
                extra_binds: &[],
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::Command(_)));
        assert!(!rootfs.path().join("after").exists());
    }

    #[test]
    fn failing_script_can_continue() {
        let rootfs = tempfile::tempdir().unwrap();
        let imports = tempfile::tempdir().unwrap();
        let s = script(imports.path(), "exit 3");
        let status = HostRunner
            .run(&RunRequest {
                rootfs: rootfs.path(),
                import_dir: imports.path(),
                script: &s,
                on_failure: OnRunFailure::Continue,
                extra_binds: &[],
            })
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn chroot_runner_needs_shell_in_rootfs() {
        if !running_as_root() {
            return;
        }
        let rootfs = tempfile::tempdir().unwrap();
        let imports = tempfile::tempdir().unwrap();
        let s = script(imports.path(), "true");
        let err = ChrootRunner
            .run(&RunRequest {
                rootfs: rootfs.path(),
                import_dir: imports.path(),
                script: &s,
                on_failure: OnRunFailure::Abort,
                extra_binds: &[],
            })
            .unwrap_err();
        assert!(err.to_string().contains("/bin/sh"));
        assert!(!rootfs.path().join(IMPORTS_MOUNT).exists());
    }

    #[test]
    fn runner_kinds_parse() {
        assert_eq!("host".parse::<RunnerKind>().unwrap(), RunnerKind::Host);
        assert_eq!("chroot".parse::<RunnerKind>().unwrap(), RunnerKind::Chroot);
        assert!("docker".parse::<RunnerKind>().is_err());
        assert_eq!(select_runner(RunnerKind::Chroot).name(), "chroot");
        assert_eq!(
            "continue".parse::<OnRunFailure>().unwrap(),
            OnRunFailure::Continue
        );
        assert!("retry".parse::<OnRunFailure>().is_err());
    }
}
