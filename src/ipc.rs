//! Platform-portable local IPC transport.
//!
//! The spec calls for a "named system-wide mutex" guarding a single governor
//! instance and a "named IPC endpoint" shims rendezvous on. Rust has no
//! portable named-mutex primitive without new unsafe FFI, so this project
//! resolves both with mechanisms `tokio` (already a dependency) already
//! provides: a Unix domain socket / Windows named pipe bound at a
//! well-known path is the rendezvous point, and *binding it* is the
//! exclusion mechanism — a second bind attempt fails exactly the way a
//! second `CreateMutex` acquisition would. See DESIGN.md for the recorded
//! rationale.

use std::path::PathBuf;

use crate::error::{GovResult, GovernorError};

/// The well-known endpoint name shims and the governor rendezvous on.
pub const ENDPOINT_NAME: &str = "BuildGovernor";

/// Directory the endpoint and the election lock file live under.
pub fn runtime_dir() -> PathBuf {
    std::env::temp_dir().join("build-governor")
}

#[cfg(unix)]
mod imp {
    use super::*;
    use tokio::net::{UnixListener, UnixStream};

    pub type IpcListener = UnixListener;
    pub type IpcStream = UnixStream;

    fn socket_path() -> PathBuf {
        runtime_dir().join(format!("{ENDPOINT_NAME}.sock"))
    }

    /// Binds the endpoint. Fails if another governor already holds it,
    /// after one stale-socket cleanup attempt.
    pub async fn bind() -> GovResult<IpcListener> {
        std::fs::create_dir_all(runtime_dir())?;
        let path = socket_path();

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(listener),
            Err(_) if path.exists() => {
                if UnixStream::connect(&path).await.is_ok() {
                    return Err(GovernorError::IpcUnavailable(
                        "another governor instance already holds the endpoint".into(),
                    ));
                }
                std::fs::remove_file(&path)?;
                UnixListener::bind(&path).map_err(GovernorError::from)
            }
            Err(e) => Err(GovernorError::from(e)),
        }
    }

    pub async fn connect() -> GovResult<IpcStream> {
        UnixStream::connect(socket_path())
            .await
            .map_err(GovernorError::from)
    }

    pub fn cleanup() {
        let _ = std::fs::remove_file(socket_path());
    }
}

#[cfg(windows)]
mod imp {
    use super::*;
    use tokio::net::windows::named_pipe::{ClientOptions, ServerOptions};
    pub use tokio::net::windows::named_pipe::{NamedPipeClient as IpcStream, NamedPipeServer as IpcListener};

    fn pipe_path() -> String {
        format!(r"\\.\pipe\{ENDPOINT_NAME}")
    }

    /// Binds the endpoint. A second `create` on an already-served pipe name
    /// fails, which is this project's stand-in for the named instance mutex.
    pub async fn bind() -> GovResult<IpcListener> {
        ServerOptions::new()
            .first_pipe_instance(true)
            .create(pipe_path())
            .map_err(|e| {
                GovernorError::IpcUnavailable(format!(
                    "another governor instance already holds the endpoint: {e}"
                ))
            })
    }

    pub async fn connect() -> GovResult<IpcStream> {
        ClientOptions::new()
            .open(pipe_path())
            .map_err(GovernorError::from)
    }

    /// Creates a further pipe instance on the same name. Named pipes are
    /// one-shot per client: after a connected instance is handed off to its
    /// session task, the accept loop must create a fresh instance to serve
    /// the next client.
    pub fn rebind() -> GovResult<IpcListener> {
        ServerOptions::new()
            .create(pipe_path())
            .map_err(GovernorError::from)
    }

    pub fn cleanup() {}
}

pub use imp::{bind, cleanup, connect, IpcListener, IpcStream};

#[cfg(windows)]
pub use imp::rebind;

/// Guards the short election window in which several concurrently-starting
/// shims race to become the one that launches the governor. Backed by an
/// exclusively-created lock file (`create_new` is atomic and portable),
/// standing in for the spec's `BuildGovernorMutex`.
pub struct ElectionLock {
    path: PathBuf,
}

impl ElectionLock {
    /// Attempts to acquire the election lock, polling up to `wait` before
    /// giving up.
    pub async fn acquire(wait: std::time::Duration) -> Option<Self> {
        let path = runtime_dir().join(format!("{ENDPOINT_NAME}.election.lock"));
        let _ = std::fs::create_dir_all(runtime_dir());
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Some(Self { path }),
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
                Err(_) => return None,
            }
        }
    }
}

impl Drop for ElectionLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_dir_is_under_temp() {
        assert!(runtime_dir().starts_with(std::env::temp_dir()));
    }

    #[tokio::test]
    async fn election_lock_excludes_concurrent_acquisition() {
        // Use a private runtime dir per test run would require more
        // plumbing than this module exposes; instead verify the
        // lock-then-drop-then-relock cycle, which is the property that
        // matters for the election window.
        let first = ElectionLock::acquire(std::time::Duration::from_millis(50)).await;
        assert!(first.is_some());
        drop(first);
        let second = ElectionLock::acquire(std::time::Duration::from_millis(50)).await;
        assert!(second.is_some());
    }
}
