use anyhow::Result;
use std::time::Duration;

use super::{AgentContext, AgentRunner, quote_instruction};
use crate::shell::shell_quote;

/// Claude Code in print mode. Permission prompts are skipped because the
/// instance is disposable and has no host mounts.
pub struct ClaudeAgent {
    timeout: Duration,
}

impl ClaudeAgent {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl AgentRunner for ClaudeAgent {
    fn name(&self) -> &str {
        "claude"
    }

    fn build_command(&self, instruction: &str, ctx: &AgentContext) -> Result<String> {
        let mut args = vec!["claude".to_string(), "--dangerously-skip-permissions".to_string()];
        if let Some(model) = &ctx.model {
            args.push("--model".to_string());
            args.push(shell_quote(model));
        }
        args.push("--print".to_string());
        args.push(quote_instruction(instruction));
        Ok(args.join(" "))
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_mode_with_optional_model() {
        let agent = ClaudeAgent::new(Duration::from_secs(300));
        let mut ctx = AgentContext::default();
        assert_eq!(
            agent.build_command("add tests", &ctx).unwrap(),
            "claude --dangerously-skip-permissions --print 'add tests'"
        );
        ctx.model = Some("opus".into());
        assert!(agent
            .build_command("x", &ctx)
            .unwrap()
            .contains("--model opus --print x"));
    }
}
