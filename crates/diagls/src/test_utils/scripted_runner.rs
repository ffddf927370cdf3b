//
// test_utils/scripted_runner.rs
//
// CommandRunner that replays canned results instead of running containers
//

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;

use crate::context::RequestContext;
use crate::gateway::{CommandError, CommandResult, CommandRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub target: String,
    pub command: String,
    pub stdin: Option<String>,
}

struct Rule {
    pattern: String,
    delay: Option<Duration>,
    result: CommandResult,
}

#[derive(Default)]
struct Script {
    rules: Vec<Rule>,
    calls: Vec<RecordedCall>,
    /// Commands whose context was cancelled or timed out before they replied
    interrupted: Vec<String>,
    rejected_targets: HashSet<String>,
    rejected_binaries: HashSet<String>,
}

/// Replies to each command with the result of the most recently added rule
/// whose pattern occurs in the command line. Commands matching no rule
/// succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<Script>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn respond(&self, pattern: &str, result: CommandResult) {
        self.add_rule(pattern, None, result);
    }

    /// Like [`ScriptedRunner::respond`], but the reply takes `delay`. The
    /// call ends early with the context's interrupt, as a killed process would.
    pub fn respond_after(&self, pattern: &str, delay: Duration, result: CommandResult) {
        self.add_rule(pattern, Some(delay), result);
    }

    fn add_rule(&self, pattern: &str, delay: Option<Duration>, result: CommandResult) {
        self.script().rules.push(Rule {
            pattern: pattern.to_string(),
            delay,
            result,
        });
    }

    pub fn reject_target(&self, target: &str) {
        self.script().rejected_targets.insert(target.to_string());
    }

    pub fn reject_binary(&self, binary: &str) {
        self.script().rejected_binaries.insert(binary.to_string());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.script().calls.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.script().calls.iter().map(|call| call.command.clone()).collect()
    }

    pub fn interrupted(&self) -> Vec<String> {
        self.script().interrupted.clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|call| call.command.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        ctx: &RequestContext,
        target: &str,
        command: &str,
        stdin: Option<&str>,
    ) -> CommandResult {
        let (delay, result) = {
            let mut script = self.script();
            script.calls.push(RecordedCall {
                target: target.to_string(),
                command: command.to_string(),
                stdin: stdin.map(str::to_string),
            });
            script
                .rules
                .iter()
                .rev()
                .find(|rule| command.contains(&rule.pattern))
                .map(|rule| (rule.delay, rule.result.clone()))
                .unwrap_or_else(|| (None, CommandResult::completed(0, "", "")))
        };

        let interrupt = match (ctx.interrupted(), delay) {
            (Some(interrupt), _) => interrupt,
            (None, None) => return result,
            (None, Some(delay)) => tokio::select! {
                interrupt = ctx.done() => interrupt,
                _ = tokio::time::sleep(delay) => return result,
            },
        };
        self.script().interrupted.push(command.to_string());
        CommandResult::failed(CommandError::from(interrupt))
    }

    async fn validate_target(&self, target: &str) -> anyhow::Result<()> {
        if self.script().rejected_targets.contains(target) {
            bail!("container {target} is not running");
        }
        Ok(())
    }

    async fn validate_binary(&self, target: &str, binary: &str) -> anyhow::Result<()> {
        if self.script().rejected_binaries.contains(binary) {
            bail!("binary {binary} not found in container {target}");
        }
        Ok(())
    }
}
