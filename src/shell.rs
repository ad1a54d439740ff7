use crate::elevation::{wrap_for_elevation, OSASCRIPT};
use crate::error::FixError;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

pub const SHELL: &str = "/bin/bash";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellResult {
    /// The program and arguments actually spawned, joined with spaces.
    pub command: String,
    /// stdout and stderr merged, in arrival order.
    pub output: String,
    pub exit_code: i32,
}

impl ShellResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub require_elevation: bool,
    pub allow_non_zero_exit: bool,
}

impl RunOptions {
    pub fn checked() -> Self {
        Self::default()
    }

    pub fn allow_failure() -> Self {
        Self {
            allow_non_zero_exit: true,
            ..Self::default()
        }
    }

    pub fn elevated() -> Self {
        Self {
            require_elevation: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn for_command(command: &str, require_elevation: bool) -> Self {
        if require_elevation {
            Self {
                program: OSASCRIPT.to_string(),
                args: vec!["-e".to_string(), wrap_for_elevation(command)],
            }
        } else {
            Self {
                program: SHELL.to_string(),
                args: vec!["-lc".to_string(), command.to_string()],
            }
        }
    }

    pub fn render(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Spawns processes. The production implementation talks to the OS; tests
/// substitute recorded outputs.
pub trait CommandRunner: Send + Sync {
    /// Runs `invocation` to completion, forwarding each non-empty output line
    /// to `on_line` as it is produced.
    fn spawn(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ShellResult, io::Error>;

    /// Resolves `program` on the search path.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

pub struct ShellExecutor;

impl CommandRunner for ShellExecutor {
    fn spawn(
        &self,
        invocation: &Invocation,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<ShellResult, io::Error> {
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (tx, rx) = mpsc::channel::<String>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut output = String::new();
        for line in rx {
            output.push_str(&line);
            output.push('\n');
            let cleaned = line.trim_end_matches(['\r', '\n']);
            if !cleaned.trim().is_empty() {
                on_line(cleaned);
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child.wait()?;
        let exit_code = status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 });
        Ok(ShellResult {
            command: invocation.render(),
            output,
            exit_code,
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

fn forward_lines<R: Read + Send + 'static>(reader: R, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(reader);
        for chunk in reader.split(b'\n') {
            let Ok(bytes) = chunk else { break };
            if tx.send(String::from_utf8_lossy(&bytes).into_owned()).is_err() {
                break;
            }
        }
    })
}

/// Runs `command` through the shell (or the elevation prompt) and applies the
/// exit-code policy: a non-zero exit is `CommandFailed` unless
/// `allow_non_zero_exit` is set.
pub fn execute(
    runner: &dyn CommandRunner,
    command: &str,
    options: RunOptions,
    on_line: Option<&mut dyn FnMut(&str)>,
) -> Result<ShellResult, FixError> {
    let invocation = Invocation::for_command(command, options.require_elevation);
    let mut ignore = |_: &str| {};
    let sink: &mut dyn FnMut(&str) = match on_line {
        Some(callback) => callback,
        None => &mut ignore,
    };
    let result = runner.spawn(&invocation, sink).map_err(|err| {
        FixError::Process(format!(
            "failed to run command `{}`: {err}",
            invocation.render()
        ))
    })?;
    if !result.success() && !options.allow_non_zero_exit {
        return Err(FixError::CommandFailed {
            command: command.to_string(),
            exit_code: result.exit_code,
            output: result.output.trim().to_string(),
        });
    }
    Ok(result)
}
