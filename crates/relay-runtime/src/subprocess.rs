use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_types::ExecutionMode;
use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wall-clock budget for the orchestrator's own invocation.
pub const ORCHESTRATOR_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Wall-clock budget for any other (child) agent invocation.
pub const CHILD_AGENT_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("agent binary {0:?} could not be started: {1}")]
    Spawn(String, #[source] std::io::Error),
    #[error("failed to write sidechannel config: {0}")]
    SidechannelConfig(#[source] std::io::Error),
}

/// Contents of the short-lived sidechannel config file handed to an
/// agent invocation: the command to exec for its stdio bridge, plus
/// the three variables it needs to reach the internal API.
#[derive(Debug, Clone, Serialize)]
struct SidechannelConfig {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

/// Everything the runner needs to prepare one hermetic agent invocation.
pub struct AgentInvocation {
    pub agent_binary: String,
    pub model: String,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub sidechannel_binary: String,
    pub api_base_url: String,
    pub task_id: String,
    pub token: String,
    pub mode: ExecutionMode,
    pub container_image: String,
    pub timeout: Duration,
    /// True for the orchestrator, whose sidechannel exposes the full
    /// spawn/wait tool surface; false for a child agent (ask_user only).
    pub is_orchestrator: bool,
}

#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

fn write_sidechannel_config(invocation: &AgentInvocation) -> Result<NamedTempFile, RunnerError> {
    let mut env = HashMap::new();
    env.insert("RELAY_API_URL".to_string(), invocation.api_base_url.clone());
    env.insert("RELAY_TASK_ID".to_string(), invocation.task_id.clone());
    env.insert("RELAY_TOKEN".to_string(), invocation.token.clone());
    env.insert(
        "RELAY_SIDECHANNEL_ROLE".to_string(),
        if invocation.is_orchestrator { "orchestrator" } else { "child" }.to_string(),
    );
    let config = SidechannelConfig {
        command: invocation.sidechannel_binary.clone(),
        args: Vec::new(),
        env,
    };
    let mut file = NamedTempFile::with_prefix("relay-sidechannel-").map_err(RunnerError::SidechannelConfig)?;
    let body = serde_json::to_vec(&config).map_err(|e| RunnerError::SidechannelConfig(e.into()))?;
    file.write_all(&body).map_err(RunnerError::SidechannelConfig)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(0o600))
        .map_err(RunnerError::SidechannelConfig)?;
    Ok(file)
}

fn build_agent_argv(invocation: &AgentInvocation, sidechannel_config_path: &Path) -> Vec<String> {
    vec![
        invocation.agent_binary.clone(),
        "-p".to_string(),
        invocation.prompt.clone(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
        "--model".to_string(),
        invocation.model.clone(),
        "--dangerously-skip-permissions".to_string(),
        "--mcp-config".to_string(),
        sidechannel_config_path.display().to_string(),
    ]
}

fn container_api_base_url(mode_hint_macos: bool, port: u16) -> String {
    if mode_hint_macos {
        format!("http://host.docker.internal:{port}")
    } else {
        format!("http://127.0.0.1:{port}")
    }
}

/// Rewrites an argv/env/config-path triple for `container-wrap` mode:
/// mounts the working directory, a read-only credentials directory,
/// and the sidechannel config, then normalizes the inner binary name.
fn wrap_in_container(
    argv: &[String],
    env: &HashMap<String, String>,
    invocation: &AgentInvocation,
    sidechannel_config_path: &Path,
    port: u16,
) -> (Vec<String>, HashMap<String, String>) {
    let is_macos = cfg!(target_os = "macos");
    let api_url = container_api_base_url(is_macos, port);

    let mut docker_argv = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];
    if !is_macos {
        docker_argv.push("--network".to_string());
        docker_argv.push("host".to_string());
    }
    docker_argv.push("-v".to_string());
    docker_argv.push(format!("{}:/workspace", invocation.working_directory.display()));

    if let Some(home) = dirs_home() {
        let credentials = home.join(".relay-agent");
        if credentials.exists() {
            docker_argv.push("-v".to_string());
            docker_argv.push(format!("{}:/home/relay/.relay-agent:ro", credentials.display()));
        }
    }

    docker_argv.push("-v".to_string());
    docker_argv.push(format!(
        "{0}:{0}:ro",
        sidechannel_config_path.display()
    ));
    docker_argv.push("-e".to_string());
    docker_argv.push("RELAY_CONTAINER=1".to_string());
    docker_argv.push("-w".to_string());
    docker_argv.push("/workspace".to_string());
    docker_argv.push(invocation.container_image.clone());

    for (i, arg) in argv.iter().enumerate() {
        if i == 0 {
            let binary_name = Path::new(arg)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| arg.clone());
            docker_argv.push(binary_name);
        } else {
            docker_argv.push(arg.clone());
        }
    }

    let mut docker_env = env.clone();
    docker_env.insert("RELAY_API_URL".to_string(), api_url);
    (docker_argv, docker_env)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn port_from_base_url(base_url: &str) -> u16 {
    base_url
        .rsplit(':')
        .next()
        .and_then(|p| p.trim_end_matches('/').parse().ok())
        .unwrap_or(8000)
}

/// Runs one agent invocation to completion, dispatching every stdout
/// line through `on_line` as it arrives. Stdin is closed immediately;
/// the agent is not expected to read from it. `cancellation` is
/// checked alongside the timeout so a caller-initiated kill (or a
/// parent task abort) takes effect without waiting out the deadline.
pub async fn run_invocation(
    invocation: AgentInvocation,
    cancellation: CancellationToken,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<InvocationOutcome, RunnerError> {
    let config_file = write_sidechannel_config(&invocation)?;
    let config_path = config_file.path().to_path_buf();

    let mut argv = build_agent_argv(&invocation, &config_path);
    let mut env: HashMap<String, String> = HashMap::new();

    if invocation.mode == ExecutionMode::ContainerWrap {
        let port = port_from_base_url(&invocation.api_base_url);
        let (wrapped_argv, wrapped_env) = wrap_in_container(&argv, &env, &invocation, &config_path, port);
        argv = wrapped_argv;
        env = wrapped_env;
    }

    let program = argv[0].clone();
    let mut command = Command::new(&program);
    command
        .args(&argv[1..])
        .current_dir(&invocation.working_directory)
        .envs(&env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child: Child = command.spawn().map_err(|e| RunnerError::Spawn(program.clone(), e))?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut lines = BufReader::new(stdout).lines();

    let timed_out = tokio::select! {
        _ = read_lines_to_exit(&mut lines, &mut on_line) => false,
        _ = tokio::time::sleep(invocation.timeout) => true,
        _ = cancellation.cancelled() => true,
    };

    if timed_out {
        warn!(task_id = %invocation.task_id, "agent invocation timed out or was cancelled, sending SIGKILL");
        let _ = child.start_kill();
        on_line("[relay] agent timed out and was terminated");
        let _ = child.wait().await;
        return Ok(InvocationOutcome { exit_code: None, timed_out: true });
    }

    let status = child.wait().await.map_err(|e| RunnerError::Spawn(program, e))?;
    info!(task_id = %invocation.task_id, code = ?status.code(), "agent invocation exited");
    Ok(InvocationOutcome { exit_code: status.code(), timed_out: false })
}

async fn read_lines_to_exit(
    lines: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    on_line: &mut impl FnMut(&str),
) {
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => on_line(&line),
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invocation(mode: ExecutionMode) -> AgentInvocation {
        AgentInvocation {
            agent_binary: "/usr/local/bin/agent".to_string(),
            model: "default".to_string(),
            prompt: "do the thing".to_string(),
            working_directory: PathBuf::from("/work/task-001"),
            sidechannel_binary: "relay-sidechannel".to_string(),
            api_base_url: "http://127.0.0.1:8000".to_string(),
            task_id: "task-001".to_string(),
            token: "secret".to_string(),
            mode,
            container_image: "relay-agent-sandbox:latest".to_string(),
            timeout: CHILD_AGENT_TIMEOUT,
            is_orchestrator: false,
        }
    }

    #[test]
    fn sidechannel_config_has_0600_permissions() {
        let invocation = sample_invocation(ExecutionMode::Native);
        let file = write_sidechannel_config(&invocation).unwrap();
        let mode = file.as_file().metadata().unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn container_wrap_normalizes_binary_name_and_mounts_workspace() {
        let invocation = sample_invocation(ExecutionMode::ContainerWrap);
        let config_file = write_sidechannel_config(&invocation).unwrap();
        let argv = build_agent_argv(&invocation, config_file.path());
        let env = HashMap::new();
        let (wrapped, wrapped_env) = wrap_in_container(&argv, &env, &invocation, config_file.path(), 8000);
        assert_eq!(wrapped[0], "docker");
        assert!(wrapped.iter().any(|a| a.contains(":/workspace")));
        assert!(!wrapped.contains(&"/usr/local/bin/agent".to_string()));
        assert!(wrapped.contains(&"agent".to_string()));
        assert!(wrapped_env.contains_key("RELAY_API_URL"));
    }

    #[test]
    fn port_parsed_from_base_url() {
        assert_eq!(port_from_base_url("http://127.0.0.1:8123"), 8123);
        assert_eq!(port_from_base_url("not-a-url"), 8000);
    }
}
