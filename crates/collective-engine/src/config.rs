/// The parameter manager's read-only hierarchical toggle (spec §6). The
/// engine owns no config surface of its own; callers back this with
/// whatever their runtime config layer looks like.
pub trait ParameterManager: Send + Sync {
    fn hierarchical_allreduce(&self) -> bool;
}

/// A fixed, never-changing implementation, for callers (and tests) that
/// don't need the toggle to react to runtime state.
#[derive(Debug, Clone, Copy)]
pub struct StaticParameterManager {
    pub hierarchical_allreduce: bool,
}

impl ParameterManager for StaticParameterManager {
    fn hierarchical_allreduce(&self) -> bool {
        self.hierarchical_allreduce
    }
}

/// Compile-time alignment atom for the hierarchical strategy's padding
/// (spec §4.6, §6).
pub const DEFAULT_FUSION_ATOM: i64 = 64;

/// The small set of knobs the engine needs at construction time: the
/// parameter manager backing the hierarchical toggle, the fusion atom,
/// and whether timeline tracing is enabled (spec §4.4's `RecordEventEnd`
/// only pays event cost when this is on).
pub struct EngineConfig {
    pub parameter_manager: Box<dyn ParameterManager>,
    pub fusion_atom: i64,
    pub tracing_enabled: bool,
}

impl EngineConfig {
    pub fn new(parameter_manager: impl ParameterManager + 'static) -> Self {
        Self {
            parameter_manager: Box::new(parameter_manager),
            fusion_atom: DEFAULT_FUSION_ATOM,
            tracing_enabled: false,
        }
    }

    pub fn with_tracing(mut self, tracing_enabled: bool) -> Self {
        self.tracing_enabled = tracing_enabled;
        self
    }

    pub fn hierarchical_allreduce(&self) -> bool {
        self.parameter_manager.hierarchical_allreduce()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_parameter_manager_reports_configured_value() {
        let config = EngineConfig::new(StaticParameterManager {
            hierarchical_allreduce: true,
        });
        assert!(config.hierarchical_allreduce());
    }
}
