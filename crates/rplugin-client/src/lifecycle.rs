//! Helper process lifecycle: spawn, handshake, and reap, plus the
//! hand-rolled search-path walk used to locate the helper binary itself.
//!
//! The search-path logic below is deliberately not built on a path-discovery
//! crate; it mirrors the same `$HOME`-relative, OS-specific directory walk
//! used elsewhere in this codebase for locating plugin bundles, just applied
//! to the helper binary instead. `RPLUGIN_HELPER_PATH` is a colon-separated
//! list exactly like `PATH`/`VST_PATH`: when set it replaces the default
//! fallback chain entirely rather than extending it.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use rplugin_core::{Error, Result, REAP_TIMEOUT, STARTUP_TIMEOUT};
use rplugin_ipc::{ClientTransport, ControlPipe, TransportPaths};
use tracing::{debug, info, warn};

/// Where the helper process currently sits in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    /// `fork`/`exec` issued, not yet proven alive.
    Spawning,
    /// Request pipe opened, waiting on the readiness response.
    Handshaking,
    /// Readiness response received; the helper accepts normal traffic.
    Ready,
    /// Termination requested; waiting for the child to exit.
    Draining,
    /// `waitpid` observed the child's exit.
    Reaped,
}

/// Environment variable holding a colon-separated override list, exactly
/// like `PATH`/the original's `VST_PATH`.
const HELPER_PATH_ENV: &str = "RPLUGIN_HELPER_PATH";

/// Directories searched for the helper binary, in order. If
/// `RPLUGIN_HELPER_PATH` is set and non-empty, it's colon-split with
/// `std::env::split_paths` and used verbatim. Otherwise falls back to a
/// compile-time default next to the current executable, `$HOME`-relative
/// locations, then fixed system directories.
#[must_use]
pub fn helper_search_paths() -> Vec<PathBuf> {
    if let Some(override_list) = std::env::var_os(HELPER_PATH_ENV) {
        if !override_list.is_empty() {
            return std::env::split_paths(&override_list).collect();
        }
    }

    let mut paths = Vec::new();

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            paths.push(dir.to_path_buf());
        }
    }

    if let Some(home) = std::env::var_os("HOME") {
        let home = PathBuf::from(home);
        paths.push(home.join(".local/libexec/rplugin"));
        paths.push(home.join(".rplugin/helper"));
    }

    paths.push(PathBuf::from("/usr/libexec/rplugin"));
    paths.push(PathBuf::from("/usr/lib/rplugin"));

    paths
}

/// True if `path` names a regular file with any execute bit set.
#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Walks [`helper_search_paths`] for an executable named `binary_name`,
/// returning the first match whose mode bits include any execute bit.
pub fn find_helper_binary(binary_name: &str) -> Result<PathBuf> {
    for dir in helper_search_paths() {
        let candidate = dir.join(binary_name);
        if is_executable(&candidate) {
            debug!(path = %candidate.display(), "found helper binary");
            return Ok(candidate);
        }
    }
    Err(Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("helper binary {binary_name:?} not found in any search path"),
    )))
}

/// Owns the spawned child process, the transport it was handed, and the
/// request/response control pipes opened against it.
pub struct HelperLifecycle {
    state: HelperState,
    child: Child,
    transport: ClientTransport,
    request: ControlPipe,
    response: ControlPipe,
}

impl HelperLifecycle {
    /// Spawns `helper_path` with the single positional argument
    /// `"<plugin_id>,<suffixes>"`, creates the transport files first so the
    /// helper has something to open the moment it starts, then blocks
    /// (bounded by [`STARTUP_TIMEOUT`]) for the readiness handshake.
    pub fn spawn(
        helper_path: &Path,
        plugin_id: &str,
        paths: TransportPaths,
        gui: bool,
    ) -> Result<Self> {
        let transport = ClientTransport::create(paths)?;
        let suffixes = transport.paths().suffix_id()?;
        let arg = format!("{plugin_id},{suffixes}");
        let request_pipe = transport.paths().request_pipe.clone();
        let response_pipe = transport.paths().response_pipe.clone();

        let mut command = Command::new(helper_path);
        if gui {
            command.arg("-g");
        }
        command
            .arg(arg)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        info!(helper = %helper_path.display(), "spawning helper process");
        let child = command.spawn()?;

        let deadline = Instant::now() + STARTUP_TIMEOUT;
        let retry_delay = Duration::from_millis(50);
        let max_attempts = (STARTUP_TIMEOUT.as_millis() / retry_delay.as_millis()) as u32;

        let request = ControlPipe::open_writer_with_retry(&request_pipe, max_attempts, retry_delay)?;

        let mut lifecycle = Self {
            state: HelperState::Handshaking,
            child,
            transport,
            request,
            response: ControlPipe::open_reader(&response_pipe)?,
        };

        if Instant::now() > deadline {
            return Err(Error::ConnectionLost);
        }

        let ready = lifecycle.response.read_bool()?;
        if !ready {
            warn!("helper reported failed initialization during handshake");
            return Err(Error::ConnectionLost);
        }

        lifecycle.state = HelperState::Ready;
        Ok(lifecycle)
    }

    #[must_use]
    pub const fn state(&self) -> HelperState {
        self.state
    }

    #[must_use]
    pub fn transport(&self) -> &ClientTransport {
        &self.transport
    }

    pub fn request_pipe_mut(&mut self) -> &mut ControlPipe {
        &mut self.request
    }

    pub fn response_pipe_mut(&mut self) -> &mut ControlPipe {
        &mut self.response
    }

    /// Requests termination over the ring/control channel at the call
    /// site's discretion (spec §4.6: `Terminate` is a lifecycle opcode, both
    /// channels legal), then polls non-blockingly for the child to exit,
    /// force-killing it if [`REAP_TIMEOUT`] elapses first.
    pub fn drain_and_reap(&mut self) -> Result<()> {
        self.state = HelperState::Draining;
        let deadline = Instant::now() + REAP_TIMEOUT;
        loop {
            match self.child.try_wait()? {
                Some(_status) => {
                    self.state = HelperState::Reaped;
                    return Ok(());
                }
                None if Instant::now() >= deadline => {
                    warn!("helper did not exit before reap timeout, killing");
                    self.child.kill()?;
                    self.child.wait()?;
                    self.state = HelperState::Reaped;
                    return Ok(());
                }
                None => std::thread::sleep(Duration::from_millis(20)),
            }
        }
    }
}

impl Drop for HelperLifecycle {
    fn drop(&mut self) {
        if self.state != HelperState::Reaped {
            let _ = self.drain_and_reap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    /// Env var mutation is process-global and unsafe on newer toolchains;
    /// centralized here so every test goes through the same guarded path.
    fn with_helper_path_env<T>(value: impl AsRef<std::ffi::OsStr>, f: impl FnOnce() -> T) -> T {
        // SAFETY: serialized by `#[serial]` on every caller, so no other
        // test thread observes a torn environment.
        unsafe {
            std::env::set_var(HELPER_PATH_ENV, value);
        }
        let result = f();
        unsafe {
            std::env::remove_var(HELPER_PATH_ENV);
        }
        result
    }

    #[test]
    #[serial]
    fn helper_path_env_override_is_colon_split() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let joined = std::env::join_paths([dir_a.path(), dir_b.path()]).unwrap();
        let paths = with_helper_path_env(joined, helper_search_paths);
        assert_eq!(paths, vec![dir_a.path().to_path_buf(), dir_b.path().to_path_buf()]);
    }

    #[test]
    #[serial]
    fn empty_override_falls_back_to_defaults() {
        let paths = with_helper_path_env("", helper_search_paths);
        assert!(paths.contains(&PathBuf::from("/usr/libexec/rplugin")));
    }

    #[test]
    #[serial]
    fn find_helper_binary_skips_non_executable_candidates() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("rplugin-helper");
        fs::write(&candidate, b"#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&candidate).unwrap().permissions();
        perms.set_mode(0o644);
        fs::set_permissions(&candidate, perms).unwrap();

        let result = with_helper_path_env(dir.path(), || find_helper_binary("rplugin-helper"));
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn find_helper_binary_accepts_executable_candidates() {
        let dir = tempdir().unwrap();
        let candidate = dir.path().join("rplugin-helper");
        fs::write(&candidate, b"#!/bin/sh\n").unwrap();
        let mut perms = fs::metadata(&candidate).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&candidate, perms).unwrap();

        let result = with_helper_path_env(dir.path(), || find_helper_binary("rplugin-helper"));
        assert_eq!(result.unwrap(), candidate);
    }
}
