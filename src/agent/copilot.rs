use anyhow::Result;
use std::time::Duration;

use super::{AgentContext, AgentRunner, quote_instruction};
use crate::shell::shell_quote;

/// GitHub Copilot CLI in non-interactive prompt mode.
pub struct CopilotAgent {
    timeout: Duration,
}

impl CopilotAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentRunner for CopilotAgent {
    fn name(&self) -> &str {
        "copilot"
    }

    fn build_command(&self, instruction: &str, ctx: &AgentContext) -> Result<String> {
        let mut line = String::from("copilot --allow-all-tools");
        if let Some(model) = &ctx.model {
            line.push_str(" --model ");
            line.push_str(&shell_quote(model));
        }
        line.push_str(" -p ");
        line.push_str(&quote_instruction(instruction));
        Ok(line)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_is_quoted_after_flags() {
        let agent = CopilotAgent::new(Duration::from_secs(300));
        let ctx = AgentContext {
            workdir: "/workspace".into(),
            model: Some("gpt-5".into()),
        };
        assert_eq!(
            agent.build_command("fix the user's bug", &ctx).unwrap(),
            "copilot --allow-all-tools --model gpt-5 -p 'fix the user'\\''s bug'"
        );
    }
}
