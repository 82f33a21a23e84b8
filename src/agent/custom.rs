use anyhow::{Context, Result};
use minijinja::{AutoEscape, Environment, context};
use std::time::Duration;

use super::{AgentContext, AgentRunner, quote_instruction};
use crate::config::CustomAgentConfig;

/// An agent whose command line comes from configuration.
///
/// The template sees `instruction` (raw), `quoted_instruction` (shell-safe),
/// `model` and `workdir`.
pub struct CustomAgent {
    name: String,
    template: String,
    timeout: Duration,
}

impl CustomAgent {
    pub fn new(name: &str, config: &CustomAgentConfig, default_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            template: config.command.clone(),
            timeout: config
                .timeout
                .map(Duration::from_secs)
                .unwrap_or(default_timeout),
        }
    }
}

impl AgentRunner for CustomAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn build_command(&self, instruction: &str, ctx: &AgentContext) -> Result<String> {
        let mut env = Environment::new();
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.render_str(
            &self.template,
            context! {
                instruction => instruction,
                quoted_instruction => quote_instruction(instruction),
                model => ctx.model,
                workdir => ctx.workdir,
            },
        )
        .with_context(|| format!("Failed to render command for agent '{}'", self.name))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
