use relay_orchestrator::Engine;

/// Everything `axum`'s extractors need to reach the engine. Thin on
/// purpose: `Engine` already bundles every shared table behind `Arc`s,
/// so this wrapper exists for room to grow (e.g. per-connection
/// counters) without disturbing the `Engine` type itself.
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}
