use outreach_infra::Engine;

/// Shared state behind every handler.
pub struct AppServices {
    pub engine: Engine,
}

impl AppServices {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}
