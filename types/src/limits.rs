//! Model token limits and the per-call context budget derived from them.

/// Token constraints for one model: maximum context window (input + output)
/// and maximum tokens the model may generate in a single response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ModelLimits {
    context_window: u32,
    max_output: u32,
}

impl ModelLimits {
    #[must_use]
    pub const fn new(context_window: u32, max_output: u32) -> Self {
        Self {
            context_window,
            max_output,
        }
    }

    #[must_use]
    pub const fn context_window(&self) -> u32 {
        self.context_window
    }

    #[must_use]
    pub const fn max_output(&self) -> u32 {
        self.max_output
    }
}

/// Budget for one trimming decision.
///
/// Recomputed from the currently selected model every time trimming runs;
/// never persisted. The effective input budget reserves the model's response
/// tokens, the tool schema overhead, and a 5% safety margin for estimator
/// inaccuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBudget {
    limits: ModelLimits,
    reserved_tool_schema_tokens: u32,
}

impl ContextBudget {
    #[must_use]
    pub const fn new(limits: ModelLimits, reserved_tool_schema_tokens: u32) -> Self {
        Self {
            limits,
            reserved_tool_schema_tokens,
        }
    }

    #[must_use]
    pub const fn context_window(&self) -> u32 {
        self.limits.context_window()
    }

    /// Tokens available for input messages after reserving the response,
    /// tool schemas, and the safety margin.
    #[must_use]
    pub fn input_budget(&self) -> u32 {
        let reserved = self
            .limits
            .max_output()
            .saturating_add(self.reserved_tool_schema_tokens);
        let available = self.limits.context_window().saturating_sub(reserved);
        // 5% margin absorbs estimator drift.
        available.saturating_sub(available / 20)
    }

    /// The trim trigger: a fraction of the model's context window.
    ///
    /// Scales with the actual window rather than an absolute token count, so
    /// switching models moves the threshold with it.
    #[must_use]
    pub fn trim_threshold(&self, fraction: f64) -> u32 {
        let window = f64::from(self.limits.context_window());
        let threshold = (window * fraction.clamp(0.0, 1.0)) as u32;
        threshold.min(self.input_budget())
    }
}
