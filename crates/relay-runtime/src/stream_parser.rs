use regex::Regex;
use relay_types::{FileAction, FindingType, Severity};
use serde_json::Value;
use std::sync::OnceLock;

/// One finding extracted from a line of agent output, not yet attached
/// to a task id or agent id (the scheduler fills those in).
#[derive(Debug, Clone, PartialEq)]
pub struct FindingDraft {
    pub severity: Severity,
    pub finding_type: FindingType,
    pub title: String,
    pub description: String,
}

/// What a single raw line of an agent's stdout produced, after JSON
/// dispatch and finding extraction.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    Output(String),
    FileActivity { action: FileAction, path: String },
    Finding(FindingDraft),
    /// A `spawn_agent` tool-use block, logged as an orchestration message.
    Orchestration(String),
}

enum Marker {
    Prefix(&'static str),
    Cve,
}

/// Ordered finding rules; first match wins. Mirrors the detecting
/// agent's own output conventions, not a generic log-scraper.
const FINDING_RULES: &[(Marker, Severity, FindingType)] = &[
    (Marker::Prefix("CRITICAL:"), Severity::Critical, FindingType::Security),
    (Marker::Prefix("VULNERABILITY:"), Severity::High, FindingType::Security),
    (Marker::Prefix("SECRET FOUND:"), Severity::Critical, FindingType::Security),
    (Marker::Prefix("SECRET DETECTED:"), Severity::Critical, FindingType::Security),
    (Marker::Cve, Severity::High, FindingType::Security),
    (Marker::Prefix("FINDING:"), Severity::Medium, FindingType::Security),
    (Marker::Prefix("WARNING:"), Severity::Low, FindingType::Quality),
];

fn cve_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"CVE-\d{4}-\d+").expect("static CVE regex is valid"))
}

/// Scans one output line for a finding marker. Order matters: the
/// first matching rule wins, matching the reference parser's
/// CRITICAL → VULNERABILITY → SECRET → CVE → FINDING → WARNING precedence.
pub fn parse_finding(line: &str) -> Option<FindingDraft> {
    for (marker, severity, finding_type) in FINDING_RULES {
        let title = match marker {
            Marker::Prefix(prefix) => line.find(prefix).map(|idx| line[idx..].trim_end().to_string()),
            Marker::Cve => cve_pattern().find(line).map(|m| m.as_str().to_string()),
        };
        if let Some(title) = title {
            return Some(FindingDraft {
                severity: *severity,
                finding_type: *finding_type,
                title,
                description: line.to_string(),
            });
        }
    }
    None
}

fn file_action_for_tool(tool_name: &str) -> Option<FileAction> {
    match tool_name.to_ascii_lowercase().as_str() {
        "read" | "grep" | "glob" => Some(FileAction::Read),
        "edit" => Some(FileAction::Edit),
        "write" => Some(FileAction::Create),
        _ => None,
    }
}

fn extract_path(input: &Value) -> Option<String> {
    for key in ["file_path", "path", "pattern"] {
        if let Some(value) = input.get(key).and_then(Value::as_str) {
            return Some(value.to_string());
        }
    }
    None
}

fn split_nonempty_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n').filter(|line| !line.is_empty())
}

fn handle_tool_use(block: &Value, out: &mut Vec<ParsedEvent>) {
    let Some(name) = block.get("name").and_then(Value::as_str) else {
        return;
    };
    if name == "spawn_agent" {
        out.push(ParsedEvent::Orchestration(format!(
            "spawn_agent tool-use: {}",
            block.get("input").cloned().unwrap_or(Value::Null)
        )));
        return;
    }
    let Some(action) = file_action_for_tool(name) else {
        return;
    };
    let Some(input) = block.get("input") else {
        return;
    };
    if let Some(path) = extract_path(input) {
        out.push(ParsedEvent::FileActivity { action, path });
    }
}

fn handle_assistant(value: &Value, out: &mut Vec<ParsedEvent>) {
    let Some(blocks) = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return;
    };
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    for line in split_nonempty_lines(text) {
                        out.push(ParsedEvent::Output(line.to_string()));
                    }
                }
            }
            Some("tool_use") => handle_tool_use(block, out),
            _ => {}
        }
    }
}

fn handle_result(value: &Value, out: &mut Vec<ParsedEvent>) {
    let Some(result) = value.get("result").and_then(Value::as_str) else {
        return;
    };
    for line in split_nonempty_lines(result) {
        out.push(ParsedEvent::Output(line.to_string()));
        if let Some(finding) = parse_finding(line) {
            out.push(ParsedEvent::Finding(finding));
        }
    }
}

/// Dispatches one raw line of an agent's stdout. Lines that don't
/// parse as JSON become a single opaque `Output` event; this is never
/// treated as fatal.
pub fn parse_agent_line(line: &str) -> Vec<ParsedEvent> {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return vec![ParsedEvent::Output(line.to_string())];
    };
    let mut out = Vec::new();
    match value.get("type").and_then(Value::as_str) {
        Some("assistant") => handle_assistant(&value, &mut out),
        Some("result") => handle_result(&value, &mut out),
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_json_is_opaque_output() {
        let events = parse_agent_line("not json at all");
        assert_eq!(events, vec![ParsedEvent::Output("not json at all".to_string())]);
    }

    #[test]
    fn unknown_type_is_ignored() {
        let line = json!({"type": "ping"}).to_string();
        assert!(parse_agent_line(&line).is_empty());
    }

    #[test]
    fn assistant_text_block_splits_into_output_lines() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "first\nsecond"}]}
        })
        .to_string();
        let events = parse_agent_line(&line);
        assert_eq!(
            events,
            vec![
                ParsedEvent::Output("first".to_string()),
                ParsedEvent::Output("second".to_string())
            ]
        );
    }

    #[test]
    fn assistant_edit_tool_use_emits_file_activity() {
        let line = json!({
            "type": "assistant",
            "message": {"content": [{
                "type": "tool_use",
                "name": "Edit",
                "input": {"file_path": "src/lib.rs"}
            }]}
        })
        .to_string();
        let events = parse_agent_line(&line);
        assert_eq!(
            events,
            vec![ParsedEvent::FileActivity {
                action: FileAction::Edit,
                path: "src/lib.rs".to_string()
            }]
        );
    }

    #[test]
    fn result_lines_are_scanned_for_findings() {
        let line = json!({"type": "result", "result": "ran tests\nCRITICAL: sql injection in auth.rs"}).to_string();
        let events = parse_agent_line(&line);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ParsedEvent::Output("ran tests".to_string()));
        assert_eq!(events[1], ParsedEvent::Output("CRITICAL: sql injection in auth.rs".to_string()));
        match &events[2] {
            ParsedEvent::Finding(f) => {
                assert_eq!(f.severity, Severity::Critical);
                assert_eq!(f.finding_type, FindingType::Security);
            }
            other => panic!("expected Finding, got {other:?}"),
        }
    }

    #[test]
    fn finding_rule_order_prefers_first_match() {
        let finding = parse_finding("VULNERABILITY: outdated dependency CVE-2024-1234").unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert!(finding.title.starts_with("VULNERABILITY:"));
    }

    #[test]
    fn bare_cve_reference_is_detected() {
        let finding = parse_finding("see CVE-2023-5678 for details").unwrap();
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(finding.title, "CVE-2023-5678");
    }

    #[test]
    fn no_marker_yields_no_finding() {
        assert!(parse_finding("all tests passed").is_none());
    }
}
