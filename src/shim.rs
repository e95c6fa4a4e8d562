//! The tool shim lifecycle shared by `compiler-shim` and `linker-shim`.
//!
//! Each shim binary is a thin wrapper: it constructs a `ToolProfile`
//! describing its tool and calls `run_shim`, which does everything else.
//! The one invariant that overrides all others here is fall-open: whatever
//! goes wrong talking to the governor, the real tool still runs with its
//! exact argv and the shim exits with its exact exit code. Governance is a
//! courtesy layered on top of the build, never a gate in front of it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::classifier::Classification;
use crate::config::{Settings, TimeoutSettings};
use crate::ipc::{self, ElectionLock};
use crate::memory_probe::MemoryProbe;
use crate::protocol::{
    AcquireRequestData, AcquireResponseData, Envelope, ReleaseRequestData, ReleaseResponseData,
};

const STDERR_TAIL_BYTES: usize = 500;
const GOVERNOR_STARTUP_POLL: Duration = Duration::from_millis(200);
const GOVERNOR_STARTUP_BUDGET: Duration = Duration::from_secs(3);
/// How long a shim waits to win the governor-launch election before
/// falling back to polling for whichever shim did win it.
const ELECTION_WAIT: Duration = Duration::from_secs(5);

/// Per-tool behavior the shared lifecycle needs: what the tool is called,
/// how much it likely costs, and whether its stderr output counts as a
/// diagnostic for the classifier.
pub trait ToolProfile {
    fn tool_name(&self) -> &str;
    fn estimate_cost(&self, args: &[String]) -> u32;
    fn stderr_has_diagnostics(&self, stderr_tail: &str) -> bool;
}

/// Runs a tool invocation under governance, falling open on any governance
/// failure, and terminates the process with the real tool's exit code.
pub fn run_shim(profile: &dyn ToolProfile) -> ! {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let real_tool = match locate_real_tool(profile.tool_name()) {
        Some(path) => path,
        None => {
            eprintln!(
                "build-governor: could not locate real '{}' on PATH",
                profile.tool_name()
            );
            std::process::exit(127);
        }
    };

    let cost = profile.estimate_cost(&args);
    let args_hash = hash_args(&args);
    let timeouts = Settings::load().unwrap_or_default().timeouts;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();

    let negotiation = match runtime {
        Ok(rt) => rt.block_on(negotiate(profile.tool_name(), cost, &args_hash, &timeouts)),
        Err(e) => {
            debug!(error = %e, "could not start governance runtime, falling open");
            Negotiation::FellOpen
        }
    };

    let lease = match negotiation {
        Negotiation::Granted(lease) => Some(lease),
        Negotiation::Denied => None,
        Negotiation::FellOpen => {
            eprintln!("build-governor: governor unavailable, proceeding ungoverned");
            None
        }
    };

    let (exit_code, duration, stderr_tail, peak) = run_real_tool(&real_tool, &args);

    if let Some(lease) = lease {
        let stderr_had_diagnostics = profile.stderr_has_diagnostics(&stderr_tail);
        if let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() {
            let outcome = rt.block_on(release(
                lease.stream,
                lease.lease_id,
                peak,
                exit_code,
                duration,
                stderr_had_diagnostics,
                &timeouts,
            ));
            if let Some(outcome) = outcome {
                if matches!(
                    outcome.classification,
                    Classification::LikelyOOM | Classification::LikelyPagingDeath
                ) {
                    if let Some(message) = outcome.message {
                        eprintln!("{message}");
                    }
                }
            }
        }
    }

    std::process::exit(exit_code);
}

fn hash_args(args: &[String]) -> String {
    let mut hasher = DefaultHasher::new();
    for arg in args {
        arg.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Scans `PATH` for `tool_name`, skipping any entry that resolves to this
/// shim's own executable — which is how a shim ends up ahead of the real
/// tool on `PATH` in the first place.
fn locate_real_tool(tool_name: &str) -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var(format!("{}_REAL_PATH", tool_name.to_uppercase())) {
        let path = PathBuf::from(override_path);
        if path.is_file() {
            return Some(path);
        }
    }

    let self_path = std::env::current_exe().ok()?;
    let self_canonical = self_path.canonicalize().ok();

    let path_var = std::env::var_os("PATH")?;
    let exe_suffix = std::env::consts::EXE_SUFFIX;

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(format!("{tool_name}{exe_suffix}"));
        if !candidate.is_file() {
            continue;
        }
        let candidate_canonical = candidate.canonicalize().ok();
        if candidate_canonical.is_some() && candidate_canonical == self_canonical {
            continue;
        }
        return Some(candidate);
    }
    None
}

struct AcquiredLease {
    stream: ipc::IpcStream,
    lease_id: String,
}

/// Outcome of talking to the governor. Only `FellOpen` gets the user-visible
/// warning — `Denied` is the governor doing its job, not a failure.
enum Negotiation {
    Granted(AcquiredLease),
    Denied,
    FellOpen,
}

/// Connects to the governor, auto-starting it if nobody is listening, and
/// attempts to acquire a lease.
async fn negotiate(
    tool: &str,
    cost: u32,
    args_hash: &str,
    timeouts: &TimeoutSettings,
) -> Negotiation {
    let connect_timeout = Duration::from_millis(timeouts.connect_timeout_ms);
    let mut stream = match tokio::time::timeout(connect_timeout, ipc::connect()).await {
        Ok(Ok(stream)) => stream,
        _ => match ensure_governor_started(timeouts).await {
            Some(stream) => stream,
            None => return Negotiation::FellOpen,
        },
    };

    let request = Envelope::new(
        "acquire",
        AcquireRequestData {
            tool: tool.to_string(),
            args_hash: args_hash.to_string(),
            requested_tokens: cost,
            timeout_ms: timeouts.acquire_timeout_ms,
            working_directory: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            source_file: None,
            is_ltcg: None,
        },
    );
    let Ok(line) = request.encode_line() else {
        return Negotiation::FellOpen;
    };

    if stream.write_all(line.as_bytes()).await.is_err() {
        return Negotiation::FellOpen;
    }

    let mut reader = BufReader::new(&mut stream);
    let mut response_line = String::new();
    let read_budget =
        Duration::from_millis(timeouts.acquire_timeout_ms + timeouts.connect_timeout_ms);
    let read = match tokio::time::timeout(read_budget, reader.read_line(&mut response_line)).await
    {
        Ok(Ok(read)) => read,
        _ => return Negotiation::FellOpen,
    };
    if read == 0 {
        return Negotiation::FellOpen;
    }

    let Ok(envelope) = serde_json::from_str::<serde_json::Value>(response_line.trim_end()) else {
        return Negotiation::FellOpen;
    };
    let Some(data) = envelope
        .get("data")
        .and_then(|d| serde_json::from_value::<AcquireResponseData>(d.clone()).ok())
    else {
        return Negotiation::FellOpen;
    };

    if !data.granted {
        return Negotiation::Denied;
    }

    match data.lease_id {
        Some(lease_id) => Negotiation::Granted(AcquiredLease { stream, lease_id }),
        None => Negotiation::FellOpen,
    }
}

/// Races other concurrently-starting shims for the right to launch the
/// governor, then waits for it to accept connections.
async fn ensure_governor_started(timeouts: &TimeoutSettings) -> Option<ipc::IpcStream> {
    let debug = gov_debug_enabled();

    let Some(_election) = ElectionLock::acquire(ELECTION_WAIT).await else {
        if debug {
            eprintln!("build-governor: lost the governor-launch election, polling for readiness");
        }
        return poll_for_governor().await;
    };

    let connect_timeout = Duration::from_millis(timeouts.connect_timeout_ms);
    if let Ok(Ok(stream)) = tokio::time::timeout(connect_timeout, ipc::connect()).await {
        return Some(stream);
    }

    let governor_exe = governor_executable_path()?;
    if debug {
        eprintln!(
            "build-governor: auto-starting governor at {}",
            governor_exe.display()
        );
    }
    let spawned = std::process::Command::new(&governor_exe)
        .arg("--background")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        if debug {
            eprintln!("build-governor: failed to auto-start governor: {e}");
        }
        warn!(error = %e, "failed to auto-start governor");
        return None;
    }

    poll_for_governor().await
}

/// Resolves the governor executable, preferring an explicit `GOV_SERVICE_PATH`
/// override to the path derived from this shim's own location.
fn governor_executable_path() -> Option<PathBuf> {
    if let Ok(override_path) = std::env::var("GOV_SERVICE_PATH") {
        let path = PathBuf::from(override_path);
        if path.is_file() {
            return Some(path);
        }
    }

    let exe = std::env::current_exe().ok()?;
    Some(exe.with_file_name(format!(
        "build-governor{}",
        std::env::consts::EXE_SUFFIX
    )))
}

fn gov_debug_enabled() -> bool {
    std::env::var("GOV_DEBUG")
        .map(|v| !v.is_empty() && v != "0")
        .unwrap_or(false)
}

async fn poll_for_governor() -> Option<ipc::IpcStream> {
    let deadline = Instant::now() + GOVERNOR_STARTUP_BUDGET;
    loop {
        if let Ok(stream) = ipc::connect().await {
            return Some(stream);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(GOVERNOR_STARTUP_POLL).await;
    }
}

async fn release(
    mut stream: ipc::IpcStream,
    lease_id: String,
    peak: crate::memory_probe::ProcessMemory,
    exit_code: i32,
    duration: Duration,
    stderr_had_diagnostics: bool,
    timeouts: &TimeoutSettings,
) -> Option<ReleaseResponseData> {
    let request = Envelope::new(
        "release",
        ReleaseRequestData {
            lease_id,
            peak_working_set_bytes: peak.peak_working_set_bytes,
            peak_commit_bytes: peak.peak_commit_bytes,
            exit_code,
            duration_ms: duration.as_millis() as u64,
            stderr_had_diagnostics,
            stderr_digest: None,
        },
    );
    let line = request.encode_line().ok()?;
    stream.write_all(line.as_bytes()).await.ok()?;

    let mut reader = BufReader::new(&mut stream);
    let mut response_line = String::new();
    let release_timeout = Duration::from_millis(timeouts.release_timeout_ms);
    tokio::time::timeout(release_timeout, reader.read_line(&mut response_line))
        .await
        .ok()?
        .ok()?;

    let envelope: serde_json::Value = serde_json::from_str(response_line.trim_end()).ok()?;
    serde_json::from_value(envelope.get("data")?.clone()).ok()
}

/// Spawns the real tool, forwarding stdout/stderr unmodified while tee-ing
/// up to [`STDERR_TAIL_BYTES`] of stderr for the classifier, and samples
/// child memory at roughly 10Hz until it exits.
fn run_real_tool(
    real_tool: &Path,
    args: &[String],
) -> (
    i32,
    Duration,
    String,
    crate::memory_probe::ProcessMemory,
) {
    let start = Instant::now();
    let mut child = match std::process::Command::new(real_tool)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            eprintln!("build-governor: failed to spawn '{}': {e}", real_tool.display());
            return (
                126,
                start.elapsed(),
                String::new(),
                crate::memory_probe::ProcessMemory {
                    peak_working_set_bytes: 0,
                    peak_commit_bytes: 0,
                },
            );
        }
    };

    let pid = child.id();
    let probe = MemoryProbe::new();

    let stdout = child.stdout.take();
    let stdout_thread = stdout.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(&buf);
            let _ = stdout.flush();
        })
    });

    let stderr = child.stderr.take();
    let stderr_thread = stderr.map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let mut stderr = std::io::stderr();
            let _ = stderr.write_all(&buf);
            let _ = stderr.flush();
            let tail_start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&buf[tail_start..]).to_string()
        })
    });

    let mut peak = crate::memory_probe::ProcessMemory {
        peak_working_set_bytes: 0,
        peak_commit_bytes: 0,
    };
    let exit_status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if let Some(sample) = probe.sample_process(pid) {
                    peak.peak_working_set_bytes =
                        peak.peak_working_set_bytes.max(sample.peak_working_set_bytes);
                    peak.peak_commit_bytes = peak.peak_commit_bytes.max(sample.peak_commit_bytes);
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(_) => break child.wait().unwrap_or_else(|_| default_exit_status()),
        }
    };

    let stderr_tail = stderr_thread
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    if let Some(handle) = stdout_thread {
        let _ = handle.join();
    }

    let exit_code = exit_status.code().unwrap_or(1);
    (exit_code, start.elapsed(), stderr_tail, peak)
}

#[cfg(unix)]
fn default_exit_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}

#[cfg(windows)]
fn default_exit_status() -> std::process::ExitStatus {
    use std::os::windows::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestProfile;
    impl ToolProfile for TestProfile {
        fn tool_name(&self) -> &str {
            "cl"
        }
        fn estimate_cost(&self, args: &[String]) -> u32 {
            args.len() as u32
        }
        fn stderr_has_diagnostics(&self, stderr_tail: &str) -> bool {
            !stderr_tail.is_empty()
        }
    }

    #[test]
    fn hash_args_is_deterministic() {
        let args = vec!["-c".to_string(), "main.cpp".to_string()];
        assert_eq!(hash_args(&args), hash_args(&args));
    }

    #[test]
    fn hash_args_differs_on_different_input() {
        let a = vec!["-c".to_string()];
        let b = vec!["-o".to_string()];
        assert_ne!(hash_args(&a), hash_args(&b));
    }

    #[test]
    fn locate_real_tool_skips_own_executable() {
        let profile = TestProfile;
        // Self-location in a test sandbox has no PATH entry named "cl" that
        // resolves to the test binary, so this mainly exercises that the
        // scan does not panic when PATH is absent or sparse.
        let _ = locate_real_tool(profile.tool_name());
    }
}
