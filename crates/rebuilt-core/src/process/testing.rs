//! Scripted command runner for tests.
//!
//! Rules are matched by substring against the rendered command line, first
//! match wins. Handlers receive the full request so they can fabricate
//! filesystem side effects (a "clone" creating a directory, a "pack"
//! dropping a tarball) relative to the request's working directory.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{CommandOutput, CommandRequest, CommandRunner, ProcessError};

type Handler = Box<dyn Fn(&CommandRequest) -> Result<CommandOutput, ProcessError> + Send + Sync>;

struct Rule {
    pattern: String,
    handler: Handler,
}

/// Deterministic [`CommandRunner`] driven by scripted rules.
#[derive(Default)]
pub struct FakeRunner {
    rules: Mutex<Vec<Rule>>,
    invocations: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for command lines containing `pattern`.
    pub fn on<F>(&self, pattern: &str, handler: F)
    where
        F: Fn(&CommandRequest) -> Result<CommandOutput, ProcessError> + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            handler: Box::new(handler),
        });
    }

    /// Register a fixed successful response for `pattern`.
    pub fn succeed_with(&self, pattern: &str, stdout: &str) {
        let stdout = stdout.to_string();
        self.on(pattern, move |_| {
            Ok(CommandOutput {
                exit_code: 0,
                stdout: stdout.clone(),
                stderr: String::new(),
            })
        });
    }

    /// Register a fixed failing response for `pattern`.
    pub fn fail_with(&self, pattern: &str, stderr: &str) {
        let stderr = stderr.to_string();
        self.on(pattern, move |_| {
            Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: stderr.clone(),
            })
        });
    }

    /// Every command line seen so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    /// Whether any recorded invocation contains `pattern`.
    pub fn saw(&self, pattern: &str) -> bool {
        self.invocations().iter().any(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput, ProcessError> {
        let line = req.command_line();
        self.invocations.lock().unwrap().push(line.clone());

        let rules = self.rules.lock().unwrap();
        for rule in rules.iter() {
            if line.contains(&rule.pattern) {
                return (rule.handler)(req);
            }
        }
        panic!("FakeRunner: no rule matches command line: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_matching_rule_wins_and_invocations_are_recorded() {
        let runner = FakeRunner::new();
        runner.succeed_with("ls-remote", "abc\trefs/tags/v1.0.0");
        runner.fail_with("clone", "fatal: repository not found");

        let out = runner
            .run(&CommandRequest::new("git").args(["ls-remote", "https://x"]))
            .await
            .unwrap();
        assert!(out.stdout.contains("refs/tags"));

        let out = runner
            .run(&CommandRequest::new("git").args(["clone", "https://x"]))
            .await
            .unwrap();
        assert!(!out.success());
        assert!(runner.saw("ls-remote"));
        assert_eq!(runner.invocations().len(), 2);
    }
}
