use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Command as StdCommand, ExitStatus, Output},
};

use anyhow::anyhow;
use log::trace;
use strum_macros::IntoStaticStr;

use fabriclab_api::error::{
    EnvironmentError, FabricError, FabricResultExt, ProvisioningError,
};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Failed to find dependency '{dependency}': {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("Failed to execute dependency '{dependency}': {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("Dependency '{dependency}' finished unsuccessfully: {explanation}\nCmdline: {rendered_command}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        rendered_command: String,
        code: Option<i32>,
        signal: Option<i32>,
        stdout: String,
        stderr: String,
        explanation: String,
        output: String,
    },
}

impl From<DependencyError> for FabricError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        match value {
            DependencyError::NotFound { dependency, source } => FabricError::with_source(
                EnvironmentError::MissingBinary {
                    binary: dependency.name().into(),
                },
                source.into(),
            ),
            DependencyError::CouldNotExecute { dependency, inner } => FabricError::with_source(
                ProvisioningError::CommandCouldNotExecute {
                    binary: dependency.name().into(),
                },
                inner.into(),
            ),
            DependencyError::ExecutionFailed {
                dependency,
                rendered_command,
                explanation,
                output,
                ..
            } => FabricError::with_source(
                ProvisioningError::CommandFailed {
                    binary: dependency.name().into(),
                    command: rendered_command,
                    explanation,
                },
                anyhow!("Process output:\n{output}"),
            ),
        }
    }
}

pub trait DependencyResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, FabricError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, FabricError> {
        let result: Result<T, FabricError> = self.map_err(|e| (*e).into());
        result.message(context)
    }
}

/// Enum of runtime and test dependencies used in the code base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Qm,
    // Test dependencies
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    /// Gets the path for a dependency not in $PATH
    fn path_override(&self) -> Option<PathBuf> {
        Some(PathBuf::from(match self {
            Self::Qm => "/usr/sbin/qm",
            #[cfg(test)]
            _ => return None,
        }))
    }

    /// Gets the name of the dependency
    ///
    /// For example, Dependency::Qm => "qm"
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Gets the path of the dependency, preferring $PATH over the well-known
    /// location.
    pub fn path(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(self.name())
            .or_else(|e| match self.path_override() {
                Some(path) => which::which(path),
                None => Err(e),
            })
            .map_err(|source| {
                Box::new(DependencyError::NotFound {
                    dependency: *self,
                    source,
                })
            })
    }

    /// Converts the dependency to a new Command instance
    /// (Note this does not create a std::process::Command instance)
    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: vec![],
        }
    }
}

/// Runs commands on behalf of the rest of the code base.
///
/// Everything that talks to the hypervisor goes through this trait so that
/// the real process spawning can be swapped for scripted responses.
pub trait Executor {
    /// Runs the command to completion. A nonzero exit is not an error at this
    /// level; callers decide with [`CommandOutput::check`].
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>>;
}

/// Executor spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

impl Executor for SystemExecutor {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        command.output()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl Command {
    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn with_arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args(args);
        self
    }

    /// Runs the command through `executor` and fails on a nonzero exit.
    pub fn run_and_check(&self, executor: &dyn Executor) -> Result<(), Box<DependencyError>> {
        executor.execute(self)?.check()
    }

    /// Runs the command through `executor` and returns stdout, failing on a
    /// nonzero exit.
    pub fn output_and_check(&self, executor: &dyn Executor) -> Result<String, Box<DependencyError>> {
        executor.execute(self)?.check_output()
    }

    pub fn render_command(&self) -> String {
        if self.args.is_empty() {
            self.dependency.to_string()
        } else {
            format!(
                "{} {}",
                self.dependency,
                self.args
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .map(|arg| if arg.contains(' ') {
                        format!("'{arg}'")
                    } else {
                        arg.into()
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        }
    }

    /// Spawns the process and waits for it to exit.
    pub fn output(&self) -> Result<CommandOutput, Box<DependencyError>> {
        let mut cmd = StdCommand::new(self.dependency.path()?);
        cmd.args(&self.args);
        let rendered_command = self.render_command();
        trace!("Executing '{rendered_command}'");
        let output = cmd
            .output()
            .map_err(|inner| DependencyError::CouldNotExecute {
                dependency: self.dependency,
                inner,
            })?;
        let output = CommandOutput::new(self, output);
        trace!(
            "Executed '{rendered_command}': {}. Report:\n{}",
            output.explain_exit(),
            output.output_report(),
        );
        Ok(output)
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    rendered_command: String,
    dependency: Dependency,
    inner: Output,
}

impl CommandOutput {
    pub fn new(command: &Command, inner: Output) -> Self {
        Self {
            rendered_command: command.render_command(),
            dependency: command.dependency,
            inner,
        }
    }

    /// Builds the output of a process that exited normally with `code`.
    pub fn from_exit_code(
        command: &Command,
        code: i32,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::new(
            command,
            Output {
                // Wait status layout: the exit code lives in the second byte.
                status: ExitStatus::from_raw((code & 0xff) << 8),
                stdout: stdout.into().into_bytes(),
                stderr: stderr.into().into_bytes(),
            },
        )
    }

    pub fn rendered_command(&self) -> &str {
        &self.rendered_command
    }

    /// Checks if the process exited successfully
    pub fn success(&self) -> bool {
        self.inner.status.success()
    }

    /// Gets the exit code of the process, if it exited normally
    pub fn code(&self) -> Option<i32> {
        self.inner.status.code()
    }

    /// Gets the signal that terminated the process, if it was terminated by a signal
    fn signal(&self) -> Option<i32> {
        self.inner.status.signal()
    }

    /// Gets stderr
    pub fn error_output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stderr).into()
    }

    /// Gets stdout
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.inner.stdout).into()
    }

    /// Gets all available output, useful for reporting or debugging
    pub fn output_report(&self) -> String {
        let stdout = self.output();
        let stderr = self.error_output();

        let mut res = String::with_capacity(stdout.len() + stderr.len() + 20);

        if !stdout.is_empty() {
            res += &format!("stdout:\n{stdout}\n");
        }

        if !stderr.is_empty() {
            if !res.is_empty() {
                res += "\n";
            }
            res += &format!("stderr:\n{stderr}\n");
        }

        res
    }

    /// Checks if the process exited successfully, otherwise produces an error
    pub fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.success() {
            return Ok(());
        }

        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            rendered_command: self.rendered_command.clone(),
            code: self.code(),
            signal: self.signal(),
            stdout: self.output(),
            stderr: self.error_output(),
            explanation: self.explain_exit(),
            output: match self.output_report() {
                s if !s.is_empty() => s,
                _ => "(no output collected)".into(),
            },
        }))
    }

    /// Checks if the process exited successfully and returns the output,
    /// otherwise produces an error with the output
    pub fn check_output(&self) -> Result<String, Box<DependencyError>> {
        self.check()?;
        Ok(self.output())
    }

    /// Produces a string explaining the exit status of the process
    pub fn explain_exit(&self) -> String {
        if let Some(code) = self.code() {
            format!("exited with status: {code}")
        } else if let Some(signal) = self.signal() {
            format!("terminated by signal: {signal}")
        } else {
            "exited with unknown status".into()
        }
    }
}
