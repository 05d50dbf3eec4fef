//! Test doubles for code that talks to external processes.

use std::{
    cell::RefCell,
    collections::VecDeque,
    fs::{File, FileTimes},
    path::Path,
    time::SystemTime,
};

use crate::dependencies::{Command, CommandOutput, DependencyError, Executor};

/// Scripted result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeResponse {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl FakeResponse {
    /// A successful exit printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed exit with `code`, printing `stderr`.
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Executor answering commands from a script instead of spawning processes.
///
/// Responses are keyed by a prefix of the rendered command line; the longest
/// matching prefix wins. Responses registered for the same prefix are
/// returned in order, and the last one keeps being returned once the others
/// are used up. Commands without a matching prefix succeed with no output.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    script: RefCell<Vec<(String, VecDeque<FakeResponse>)>>,
    calls: RefCell<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `response` to the queue of commands starting with `prefix`.
    pub fn on(self, prefix: impl Into<String>, response: FakeResponse) -> Self {
        let prefix = prefix.into();
        {
            let mut script = self.script.borrow_mut();
            match script.iter_mut().find(|(p, _)| *p == prefix) {
                Some((_, queue)) => queue.push_back(response),
                None => script.push((prefix, VecDeque::from([response]))),
            }
        }
        self
    }

    /// Every command executed so far, rendered, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// The executed commands starting with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn next_response(&self, rendered: &str) -> FakeResponse {
        let mut script = self.script.borrow_mut();
        let Some((_, queue)) = script
            .iter_mut()
            .filter(|(prefix, _)| rendered.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
        else {
            return FakeResponse::ok("");
        };

        if queue.len() > 1 {
            queue.pop_front().unwrap_or_else(|| FakeResponse::ok(""))
        } else {
            queue.front().cloned().unwrap_or_else(|| FakeResponse::ok(""))
        }
    }
}

impl Executor for FakeExecutor {
    fn execute(&self, command: &Command) -> Result<CommandOutput, Box<DependencyError>> {
        let rendered = command.render_command();
        self.calls.borrow_mut().push(rendered.clone());
        let response = self.next_response(&rendered);
        Ok(CommandOutput::from_exit_code(
            command,
            response.code,
            response.stdout,
            response.stderr,
        ))
    }
}

/// Creates an empty file at `path` with the given modification time.
pub fn touch_with_mtime(path: impl AsRef<Path>, modified: SystemTime) {
    let file = File::create(path.as_ref()).unwrap();
    file.set_times(FileTimes::new().set_modified(modified))
        .unwrap();
}
