// Copyright 2021 System76 <info@system76.com>
// SPDX-License-Identifier: LGPL-3.0-only

//! Execution of external storage tools.
//!
//! Every tool invocation in the crate goes through a [`CommandRunner`], so that the
//! sequencing logic can be exercised without touching real devices. Secrets are only
//! ever written to the child's standard input.

use crate::errors::{OperationError, Result};
use cradle::prelude::*;
use secstr::SecStr;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A single invocation of an external program.
#[derive(Clone)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<SecStr>,
}

impl ToolCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_owned(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        let arg = path.to_string_lossy().into_owned();
        self.arg(arg)
    }

    pub fn env(mut self, key: &str, value: impl AsRef<str>) -> Self {
        self.env.push((key.to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Feeds `secret` followed by a newline to the child's stdin.
    pub fn secret(mut self, secret: &SecStr) -> Self {
        let mut bytes = Vec::with_capacity(secret.unsecure().len() + 1);
        bytes.extend_from_slice(secret.unsecure());
        bytes.push(b'\n');
        self.stdin = Some(SecStr::new(bytes));
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCommand")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.as_ref().map(|_| "<secret>"))
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Blocks until the external program exits.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput>;
}

/// Runs `command` and converts a non-zero exit into an error.
pub fn run_checked(runner: &dyn CommandRunner, command: &ToolCommand) -> Result<ToolOutput> {
    let output = runner.run(command)?;
    if output.success() {
        Ok(output)
    } else {
        tracing::error!("{} exited with status {}", command, output.status);
        Err(OperationError::Command {
            program: command.program.clone(),
            status: output.status,
            stderr: output.stderr.trim().to_owned(),
        })
    }
}

/// Spawns real processes, appending their output to `<log_dir>/<program>.log`.
pub struct SystemRunner {
    log_dir: PathBuf,
}

impl SystemRunner {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
        }
    }

    fn log_output(&self, command: &ToolCommand, output: &ToolOutput) {
        let program = Path::new(&command.program)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.program.clone());

        let path = self.log_dir.join(format!("{}.log", program));
        let file = OpenOptions::new().create(true).append(true).open(&path);

        let mut file = match file {
            Ok(file) => file,
            Err(why) => {
                tracing::warn!("unable to open tool log {:?}: {}", path, why);
                return;
            }
        };

        let _ = writeln!(file, "Running... {}", command);
        let _ = file.write_all(output.stdout.as_bytes());
        let _ = file.write_all(output.stderr.as_bytes());
        let _ = writeln!(file, "exit status: {}", output.status);
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, command: &ToolCommand) -> Result<ToolOutput> {
        tracing::info!("running {}", command);

        let stdin: Vec<u8> = command
            .stdin
            .as_ref()
            .map(|secret| secret.unsecure().to_vec())
            .unwrap_or_default();

        let env: Vec<Env<String, String>> = command
            .env
            .iter()
            .map(|(key, value)| Env(key.clone(), value.clone()))
            .collect();

        let result: std::result::Result<(Status, StdoutUntrimmed, Stderr), cradle::Error> = run_result!(
            command.program.clone(),
            command.args.clone(),
            env,
            Stdin(stdin)
        );

        let (Status(status), StdoutUntrimmed(stdout), Stderr(stderr)) =
            result.map_err(|why| OperationError::Spawn {
                program: command.program.clone(),
                why: why.to_string(),
            })?;

        let output = ToolOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        };

        self.log_output(command, &output);
        Ok(output)
    }
}
