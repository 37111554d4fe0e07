use thiserror::Error;

/// The engine's error taxonomy. Every handler in the Internal
/// Coordination API and the websocket routes returns this instead of
/// mapping status codes ad hoc at each call site; `relay-server` maps
/// each variant onto an HTTP status in its `IntoResponse` impl.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sandbox admission denied: {0}")]
    AdmissionDenied(String),

    #[error("agent subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("missing collaborator: {0}")]
    MissingCollaborator(String),

    #[error("invalid or missing sidechannel token")]
    SidechannelAuth,

    #[error("resource limit reached: {0}")]
    ClientResourceLimit(String),

    #[error("unknown id: {0}")]
    NotFound(String),
}
