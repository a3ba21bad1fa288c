//! External process boundary.
//!
//! The runner never spawns processes itself. Every invocation goes through a
//! [`CommandExecutor`], and only the programs named by [`Tool`] can be run.
//! [`SystemExecutor`] launches real processes through tokio, and
//! [`RecordingExecutor`] records invocations for tests and dry runs.

use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;

/// The closed set of programs a build may invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Hdiutil,
    Codesign,
    Xcrun,
    Chmod,
    Bless,
}

impl Tool {
    /// Program name looked up on `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            Tool::Hdiutil => "hdiutil",
            Tool::Codesign => "codesign",
            Tool::Xcrun => "xcrun",
            Tool::Chmod => "chmod",
            Tool::Bless => "bless",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

/// Failure of a single external invocation.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("{tool} not found in PATH: {source}")]
    NotFound {
        tool: Tool,
        #[source]
        source: which::Error,
    },

    #[error("failed to execute {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited unsuccessfully. `output` holds the combined
    /// stdout/stderr when it was captured.
    #[error("{tool} exited with {}", exit_description(.code))]
    Failed {
        tool: Tool,
        code: Option<i32>,
        output: String,
    },

    #[error("{tool} timed out after {after:?}")]
    TimedOut { tool: Tool, after: Duration },
}

impl ExecError {
    /// Captured output of a failed invocation, empty when nothing was captured.
    pub fn output(&self) -> &str {
        match self {
            ExecError::Failed { output, .. } => output,
            _ => "",
        }
    }
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status (terminated by signal)".to_string(),
    }
}

/// Runs the allow-listed external tools.
pub trait CommandExecutor {
    /// Runs `tool` with its stdout/stderr attached to ours.
    fn run(&self, tool: Tool, args: &[String]) -> impl Future<Output = Result<(), ExecError>> + Send;

    /// Runs `tool` and returns its combined stdout and stderr.
    ///
    /// [`SystemExecutor`] captures the two streams separately and returns all
    /// of stdout followed by all of stderr, so lines are not interleaved in
    /// the order the tool wrote them.
    fn run_output(
        &self,
        tool: Tool,
        args: &[String],
    ) -> impl Future<Output = Result<String, ExecError>> + Send;
}

/// Executor that launches real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    timeout: Option<Duration>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kills any invocation that runs longer than `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    fn command(&self, tool: Tool, args: &[String]) -> Result<tokio::process::Command, ExecError> {
        let path = which::which(tool.program()).map_err(|source| ExecError::NotFound { tool, source })?;
        log::debug!("Resolved {} to {}", tool, path.display());

        let mut cmd = tokio::process::Command::new(path);
        cmd.args(args).kill_on_drop(true);
        Ok(cmd)
    }

    async fn bounded<F, T>(&self, tool: Tool, fut: F) -> Result<T, ExecError>
    where
        F: Future<Output = Result<T, ExecError>>,
    {
        match self.timeout {
            Some(after) => tokio::time::timeout(after, fut)
                .await
                .map_err(|_| ExecError::TimedOut { tool, after })?,
            None => fut.await,
        }
    }
}

impl CommandExecutor for SystemExecutor {
    async fn run(&self, tool: Tool, args: &[String]) -> Result<(), ExecError> {
        let mut cmd = self.command(tool, args)?;
        cmd.stdin(Stdio::null());

        let status = self
            .bounded(tool, async {
                cmd.status()
                    .await
                    .map_err(|source| ExecError::Spawn { tool, source })
            })
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(ExecError::Failed {
                tool,
                code: status.code(),
                output: String::new(),
            })
        }
    }

    async fn run_output(&self, tool: Tool, args: &[String]) -> Result<String, ExecError> {
        let mut cmd = self.command(tool, args)?;
        cmd.stdin(Stdio::null());

        let output = self
            .bounded(tool, async {
                cmd.output()
                    .await
                    .map_err(|source| ExecError::Spawn { tool, source })
            })
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(combined)
        } else {
            Err(ExecError::Failed {
                tool,
                code: output.status.code(),
                output: combined,
            })
        }
    }
}

/// One recorded call to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub args: Vec<String>,
}

impl Invocation {
    /// First argument, usually the hdiutil subcommand.
    pub fn first_arg(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }
}

type Responder = Box<dyn Fn(&Invocation) -> Result<String, ExecError> + Send + Sync>;

/// Executor that records invocations instead of spawning anything.
///
/// By default every call succeeds with empty output. A responder installed
/// with [`RecordingExecutor::with_responder`] can return canned output or
/// errors per invocation.
#[derive(Default)]
pub struct RecordingExecutor {
    invocations: Mutex<Vec<Invocation>>,
    responder: Option<Responder>,
}

impl fmt::Debug for RecordingExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingExecutor")
            .field("invocations", &self.invocations())
            .field("responder", &self.responder.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&Invocation) -> Result<String, ExecError> + Send + Sync + 'static,
    {
        Self {
            invocations: Mutex::new(Vec::new()),
            responder: Some(Box::new(responder)),
        }
    }

    /// Snapshot of everything recorded so far.
    pub fn invocations(&self) -> Vec<Invocation> {
        match self.invocations.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Number of recorded invocations of `tool`.
    pub fn count(&self, tool: Tool) -> usize {
        self.invocations().iter().filter(|i| i.tool == tool).count()
    }

    pub fn last(&self) -> Option<Invocation> {
        self.invocations().pop()
    }

    fn record(&self, tool: Tool, args: &[String]) -> Result<String, ExecError> {
        let invocation = Invocation {
            tool,
            args: args.to_vec(),
        };
        let result = match &self.responder {
            Some(responder) => responder(&invocation),
            None => Ok(String::new()),
        };
        match self.invocations.lock() {
            Ok(mut guard) => guard.push(invocation),
            Err(poisoned) => poisoned.into_inner().push(invocation),
        }
        result
    }
}

impl CommandExecutor for RecordingExecutor {
    async fn run(&self, tool: Tool, args: &[String]) -> Result<(), ExecError> {
        self.record(tool, args).map(|_| ())
    }

    async fn run_output(&self, tool: Tool, args: &[String]) -> Result<String, ExecError> {
        self.record(tool, args)
    }
}
