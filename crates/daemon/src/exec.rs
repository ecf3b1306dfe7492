//! Subprocess execution
//!
//! Every external binary the daemon drives (`wg`, `wireguard-go`, `ip`,
//! `ifconfig`, `route`, `systemctl`) goes through [`CommandRunner`]. No
//! production code path spawns a process any other way, which is what makes
//! the drivers testable against a scripted runner.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn fail(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Swappable command executor.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, optionally piping `stdin`.
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> std::io::Result<CommandOutput>;

    /// Run without stdin.
    async fn output(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        self.run(program, args, None).await
    }
}

/// Production runner backed by `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        program: &str,
        args: &[&str],
        stdin: Option<&str>,
    ) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn()?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }
        let out = child.wait_with_output().await?;
        Ok(CommandOutput {
            success: out.status.success(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

/// Resolve a program on PATH, like the shell would.
pub fn look_path(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let p = PathBuf::from(program);
        return p.is_file().then_some(p);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted runner for driver tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub program: String,
        pub args: Vec<String>,
        pub stdin: Option<String>,
    }

    impl RecordedCall {
        pub fn rendered(&self) -> String {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    #[derive(Default)]
    pub struct MockRunner {
        rules: Mutex<Vec<(String, CommandOutput)>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl MockRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Respond with `output` to any command whose rendered form
        /// contains `pattern`. First matching rule wins; unmatched
        /// commands succeed with empty output.
        pub fn on(&self, pattern: &str, output: CommandOutput) {
            self.rules.lock().push((pattern.to_string(), output));
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().clone()
        }

        pub fn calls_matching(&self, pattern: &str) -> Vec<RecordedCall> {
            self.calls()
                .into_iter()
                .filter(|c| c.rendered().contains(pattern))
                .collect()
        }
    }

    #[async_trait]
    impl CommandRunner for MockRunner {
        async fn run(
            &self,
            program: &str,
            args: &[&str],
            stdin: Option<&str>,
        ) -> std::io::Result<CommandOutput> {
            let call = RecordedCall {
                program: program.to_string(),
                args: args.iter().map(|s| s.to_string()).collect(),
                stdin: stdin.map(|s| s.to_string()),
            };
            let rendered = call.rendered();
            self.calls.lock().push(call);
            let rules = self.rules.lock();
            for (pattern, output) in rules.iter() {
                if rendered.contains(pattern.as_str()) {
                    return Ok(output.clone());
                }
            }
            Ok(CommandOutput::ok(""))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let out = SystemRunner.output("echo", &["hello"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_system_runner_pipes_stdin() {
        let out = SystemRunner.run("cat", &[], Some("piped")).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "piped");
    }

    #[test]
    fn test_look_path_finds_shell() {
        assert!(look_path("sh").is_some());
        assert!(look_path("definitely-not-a-binary-wgmesh").is_none());
    }
}
