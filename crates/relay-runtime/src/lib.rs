pub mod sandbox;
pub mod stream_parser;
pub mod subprocess;

pub use sandbox::{detect_sandbox, SandboxStatus};
pub use stream_parser::{parse_agent_line, parse_finding, FindingDraft, ParsedEvent};
pub use subprocess::{
    run_invocation, AgentInvocation, InvocationOutcome, RunnerError, CHILD_AGENT_TIMEOUT,
    ORCHESTRATOR_TIMEOUT,
};
