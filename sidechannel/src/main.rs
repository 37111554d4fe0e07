use std::io::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Total budget a single `ask_user` call retries the answer long-poll
/// for before giving up and returning the timeout sentinel.
const ASK_USER_BUDGET: Duration = Duration::from_secs(5 * 60);

struct Bridge {
    client: reqwest::Client,
    api_base_url: String,
    task_id: String,
    token: String,
    is_orchestrator: bool,
}

impl Bridge {
    fn from_env() -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base_url: std::env::var("RELAY_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string()),
            task_id: std::env::var("RELAY_TASK_ID").unwrap_or_default(),
            token: std::env::var("RELAY_TOKEN").unwrap_or_default(),
            is_orchestrator: std::env::var("RELAY_SIDECHANNEL_ROLE").as_deref() == Ok("orchestrator"),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("x-relay-token", &self.token)
    }

    async fn ask_user(&self, question: String, suggested_answers: Vec<String>) -> Result<Value, String> {
        let created: Value = self
            .authed(self.client.post(self.url("/internal/question")))
            .json(&json!({"task_id": self.task_id, "prompt": question, "suggested_answers": suggested_answers}))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        let question_id = created["id"].as_str().ok_or("missing question id")?.to_string();

        let deadline = tokio::time::Instant::now() + ASK_USER_BUDGET;
        loop {
            let response = self
                .authed(self.client.get(self.url(&format!("/internal/question/{question_id}/answer"))))
                .send()
                .await
                .map_err(|e| e.to_string())?;
            match response.status().as_u16() {
                200 => {
                    let body: Value = response.json().await.map_err(|e| e.to_string())?;
                    return Ok(json!({"answer": body["answer"]}));
                }
                404 => return Err("question no longer exists".to_string()),
                _ if tokio::time::Instant::now() >= deadline => {
                    return Ok(json!({"answer": Value::Null, "timed_out": true}));
                }
                _ => continue,
            }
        }
    }

    async fn spawn_agent(&self, role: String, name: String, task: String, wait: bool) -> Result<Value, String> {
        let spawned: Value = self
            .authed(self.client.post(self.url("/internal/spawn-agent")))
            .json(&json!({"task_id": self.task_id, "role": role, "name": name, "task_text": task, "wait": false}))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())?;
        let agent_id = spawned["agent_id"].as_str().ok_or("missing agent id")?.to_string();

        if !wait {
            return Ok(json!({"agent_id": agent_id, "status": "running"}));
        }
        self.poll_agent_result(&agent_id).await
    }

    /// Long-polls `/agent/{id}/result` in 30 s windows until the agent
    /// reaches a terminal status.
    async fn poll_agent_result(&self, agent_id: &str) -> Result<Value, String> {
        loop {
            let snapshot: Value = self
                .authed(self.client.get(self.url(&format!("/internal/agent/{agent_id}/result"))))
                .send()
                .await
                .map_err(|e| e.to_string())?
                .json()
                .await
                .map_err(|e| e.to_string())?;
            let status = snapshot["status"].as_str().unwrap_or("");
            if matches!(status, "completed" | "failed") {
                return Ok(snapshot);
            }
        }
    }

    async fn get_agent_status(&self, agent_id: String) -> Result<Value, String> {
        self.authed(self.client.get(self.url(&format!("/internal/agent/{agent_id}/status"))))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }

    async fn spawn_agents(&self, requests: Vec<Value>) -> Result<Value, String> {
        let body: Vec<Value> = requests
            .into_iter()
            .map(|r| {
                json!({
                    "task_id": self.task_id,
                    "role": r["role"],
                    "name": r["name"],
                    "task_text": r["task"],
                    "wait": false,
                })
            })
            .collect();
        self.authed(self.client.post(self.url("/internal/spawn-agents")))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }

    async fn wait_for_agents(&self, agent_ids: Vec<String>, timeout_secs: u64) -> Result<Value, String> {
        self.authed(self.client.post(self.url("/internal/agents/wait")))
            .json(&json!({"agent_ids": agent_ids, "timeout_secs": timeout_secs.min(900)}))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json()
            .await
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

fn tool_schema(is_orchestrator: bool) -> Vec<Value> {
    let mut tools = vec![json!({
        "name": "ask_user",
        "description": "Ask the user a clarifying question and block for their answer.",
        "inputSchema": {
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "suggested_answers": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["question"]
        }
    })];
    if is_orchestrator {
        tools.extend([
            json!({
                "name": "spawn_agent",
                "description": "Spawn a single child agent and optionally wait for it to finish.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "role": {"type": "string"},
                        "name": {"type": "string"},
                        "task": {"type": "string"},
                        "wait": {"type": "boolean", "default": true}
                    },
                    "required": ["role", "name", "task"]
                }
            }),
            json!({
                "name": "get_agent_status",
                "description": "Fetch a non-blocking snapshot of an agent's status and recent output.",
                "inputSchema": {
                    "type": "object",
                    "properties": {"agent_id": {"type": "string"}},
                    "required": ["agent_id"]
                }
            }),
            json!({
                "name": "spawn_agents",
                "description": "Spawn a batch of child agents without waiting on any of them.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "agents": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "role": {"type": "string"},
                                    "name": {"type": "string"},
                                    "task": {"type": "string"}
                                },
                                "required": ["role", "name", "task"]
                            }
                        }
                    },
                    "required": ["agents"]
                }
            }),
            json!({
                "name": "wait_for_agents",
                "description": "Wait for a batch of agents, up to a caller-supplied timeout capped at 900s.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "agent_ids": {"type": "array", "items": {"type": "string"}},
                        "timeout_secs": {"type": "integer", "default": 900}
                    },
                    "required": ["agent_ids"]
                }
            }),
        ]);
    }
    tools
}

async fn dispatch(bridge: &Bridge, method: &str, params: &Value) -> Result<Value, String> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "relay-sidechannel", "version": env!("CARGO_PKG_VERSION")}
        })),
        "tools/list" => Ok(json!({"tools": tool_schema(bridge.is_orchestrator)})),
        "tools/call" => {
            let name = params["name"].as_str().unwrap_or_default();
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            let output = call_tool(bridge, name, arguments).await?;
            Ok(json!({"content": [{"type": "text", "text": output.to_string()}]}))
        }
        other => Err(format!("unknown method {other}")),
    }
}

async fn call_tool(bridge: &Bridge, name: &str, arguments: Value) -> Result<Value, String> {
    match name {
        "ask_user" => {
            let question = arguments["question"].as_str().unwrap_or_default().to_string();
            let suggested = arguments["suggested_answers"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            bridge.ask_user(question, suggested).await
        }
        "spawn_agent" if bridge.is_orchestrator => {
            let role = arguments["role"].as_str().unwrap_or_default().to_string();
            let name = arguments["name"].as_str().unwrap_or_default().to_string();
            let task = arguments["task"].as_str().unwrap_or_default().to_string();
            let wait = arguments["wait"].as_bool().unwrap_or(true);
            bridge.spawn_agent(role, name, task, wait).await
        }
        "get_agent_status" if bridge.is_orchestrator => {
            let agent_id = arguments["agent_id"].as_str().unwrap_or_default().to_string();
            bridge.get_agent_status(agent_id).await
        }
        "spawn_agents" if bridge.is_orchestrator => {
            let agents = arguments["agents"].as_array().cloned().unwrap_or_default();
            bridge.spawn_agents(agents).await
        }
        "wait_for_agents" if bridge.is_orchestrator => {
            let agent_ids = arguments["agent_ids"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let timeout_secs = arguments["timeout_secs"].as_u64().unwrap_or(900);
            bridge.wait_for_agents(agent_ids, timeout_secs).await
        }
        other => Err(format!("tool {other} is not available on this sidechannel")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter("info").with_writer(std::io::stderr).init();
    let bridge = Bridge::from_env();
    info!(task_id = %bridge.task_id, orchestrator = bridge.is_orchestrator, "relay-sidechannel bridge starting");

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let stdout = std::io::stdout();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => line,
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "failed to read from stdin");
                break;
            }
        };

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed JSON-RPC request");
                continue;
            }
        };

        let Some(id) = request.id else {
            // Notification (e.g. `notifications/initialized`): no response expected.
            continue;
        };

        let response = match dispatch(&bridge, &request.method, &request.params).await {
            Ok(result) => RpcResponse { jsonrpc: "2.0", id, result: Some(result), error: None },
            Err(message) => RpcResponse { jsonrpc: "2.0", id, result: None, error: Some(json!({"code": -32000, "message": message})) },
        };

        let mut handle = stdout.lock();
        if writeln!(handle, "{}", serde_json::to_string(&response).expect("RpcResponse always serializes")).is_err() {
            break;
        }
        let _ = handle.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_tool_schema_exposes_only_ask_user() {
        let tools = tool_schema(false);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "ask_user");
    }

    #[test]
    fn orchestrator_tool_schema_exposes_the_full_surface() {
        let tools = tool_schema(true);
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert_eq!(names, vec!["ask_user", "spawn_agent", "get_agent_status", "spawn_agents", "wait_for_agents"]);
    }
}
