use std::path::Path;
use std::time::Duration;

use relay_types::ExecutionMode;
use tracing::warn;

const DOCKER_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DOCKERENV_MARKER: &str = "/.dockerenv";
const CGROUP_PATH: &str = "/proc/1/cgroup";
const CONTAINER_CGROUP_MARKERS: [&str; 3] = ["docker", "kubepods", "containerd"];

/// Outcome of a sandbox admission check, carried alongside a
/// human-readable reason for logging and for the `blocked` diagnostic.
#[derive(Debug, Clone)]
pub struct SandboxStatus {
    pub mode: ExecutionMode,
    pub reason: String,
}

fn env_flag_set(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Checks the ordered set of environment markers that indicate we are
/// already running inside some container or devcontainer.
fn running_inside_container() -> bool {
    if env_flag_set("DEVCONTAINER") || env_flag_set("RELAY_CONTAINER") {
        return true;
    }
    if Path::new(DOCKERENV_MARKER).exists() {
        return true;
    }
    if let Ok(contents) = std::fs::read_to_string(CGROUP_PATH) {
        if CONTAINER_CGROUP_MARKERS.iter().any(|marker| contents.contains(marker)) {
            return true;
        }
    }
    std::env::var("RELAY_BACKEND_HOST")
        .map(|host| host == "0.0.0.0")
        .unwrap_or(false)
}

/// Probes for an external container runtime by running its `info`
/// subcommand with a hard timeout; any failure (missing binary,
/// daemon not running, timeout) is treated as "unavailable".
async fn container_runtime_available() -> bool {
    let probe = tokio::process::Command::new("docker")
        .arg("info")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();
    match tokio::time::timeout(DOCKER_PROBE_TIMEOUT, probe).await {
        Ok(Ok(status)) => status.success(),
        _ => false,
    }
}

/// Pure decision table, isolated from environment/process probing so
/// it can be tested without a real container runtime or `/proc`.
fn compute_execution_mode(in_container: bool, allow_host: bool, runtime_available: bool) -> SandboxStatus {
    if in_container {
        return SandboxStatus {
            mode: ExecutionMode::Native,
            reason: "process is already running inside a container".to_string(),
        };
    }
    if allow_host {
        warn!("sandbox: host-override enabled, agents will run with uncontained host access");
        return SandboxStatus {
            mode: ExecutionMode::HostOverride,
            reason: "operator set an explicit host-override opt-in".to_string(),
        };
    }
    if runtime_available {
        return SandboxStatus {
            mode: ExecutionMode::ContainerWrap,
            reason: "container runtime detected, agents will be wrapped".to_string(),
        };
    }
    SandboxStatus {
        mode: ExecutionMode::Blocked,
        reason: blocked_diagnostic(),
    }
}

/// Decides, at task admission time, which sandbox mode agent processes
/// may be spawned under. `allow_host` mirrors the operator's explicit
/// opt-in (`RELAY_ALLOW_HOST`) to bypass containerization on a host the
/// operator has judged safe.
pub async fn detect_sandbox(allow_host: bool) -> SandboxStatus {
    let in_container = running_inside_container();
    let runtime_available = if in_container {
        false
    } else {
        container_runtime_available().await
    };
    compute_execution_mode(in_container, allow_host, runtime_available)
}

/// The diagnostic attached to a `blocked` admission, listing every
/// remedy an operator can apply.
pub fn blocked_diagnostic() -> String {
    "no sandbox available: remedies are (1) run the engine inside a container or devcontainer, \
     (2) install a container runtime so agents can run under container-wrap, or \
     (3) set RELAY_ALLOW_HOST=1 to explicitly accept host-override risk"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_diagnostic_lists_three_remedies() {
        let diagnostic = blocked_diagnostic();
        assert!(diagnostic.contains("devcontainer"));
        assert!(diagnostic.contains("container-wrap"));
        assert!(diagnostic.contains("RELAY_ALLOW_HOST"));
    }

    #[test]
    fn in_container_wins_over_every_other_input() {
        let status = compute_execution_mode(true, true, true);
        assert_eq!(status.mode, ExecutionMode::Native);
    }

    #[test]
    fn host_override_wins_over_runtime_availability() {
        let status = compute_execution_mode(false, true, true);
        assert_eq!(status.mode, ExecutionMode::HostOverride);
    }

    #[test]
    fn container_wrap_when_runtime_available_and_no_override() {
        let status = compute_execution_mode(false, false, true);
        assert_eq!(status.mode, ExecutionMode::ContainerWrap);
    }

    #[test]
    fn blocked_when_nothing_is_available() {
        let status = compute_execution_mode(false, false, false);
        assert_eq!(status.mode, ExecutionMode::Blocked);
    }
}
