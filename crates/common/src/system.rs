//! Running external tools
//!
//! Every call to `certutil`, the package manager, `make` and friends goes
//! through [`CommandRunner`] so the workflows can be exercised without
//! touching the host.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::os::{OsFamily, OsInfo};
use crate::Error;

/// An external command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Feed `input` to the command's standard input
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// True if this runs `program` with `first` as its first argument
    pub fn is(&self, program: &str, first: &str) -> bool {
        self.program == program && self.args.first().map(String::as_str) == Some(first)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Turn a non-zero exit into `Error::Tool` labelled `what`
    pub fn check(self, what: &str) -> Result<Output, Error> {
        if self.success {
            Ok(self)
        } else {
            let detail = self.stderr.trim();
            let detail = if detail.is_empty() {
                "command returned non-zero status".to_string()
            } else {
                detail.lines().last().unwrap_or_default().to_string()
            };
            Err(Error::tool(what, detail))
        }
    }
}

pub trait CommandRunner {
    /// Run `cmd` to completion. Spawn failures are errors, non-zero exits are not.
    fn run(&self, cmd: &Cmd) -> Result<Output, Error>;

    /// Run `cmd` and fail with "`what` failed" unless it exits zero
    fn run_checked(&self, cmd: &Cmd, what: &str) -> Result<Output, Error> {
        self.run(cmd)?.check(what)
    }
}

/// Runs commands on the local host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<Output, Error> {
        log::debug!("Running: {}", cmd);

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &cmd.cwd {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::tool(cmd.program.clone(), e.to_string()))?;

        // the pipe is dropped before waiting so the child sees EOF
        let written = match (&cmd.stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => pipe.write_all(input.as_bytes()),
            _ => Ok(()),
        };
        let output = child.wait_with_output()?;
        written?;
        Ok(Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Fail unless the effective user is root
pub fn require_root(runner: &dyn CommandRunner) -> Result<(), Error> {
    let out = runner.run_checked(&Cmd::new("id").arg("-u"), "Checking user ID")?;
    if out.stdout.trim() != "0" {
        return Err(Error::precondition(
            "This must be run as root. Try again with 'sudo'.",
        ));
    }
    Ok(())
}

/// Fail unless every tool in `names` is on PATH
pub fn require_tools(names: &[&str]) -> Result<(), Error> {
    let missing: Vec<&str> = names
        .iter()
        .copied()
        .filter(|name| which::which(name).is_err())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "Required tool(s) not found: {}. Is Libreswan installed?",
            missing.join(", ")
        )))
    }
}

/// Restart the Libreswan service using the init system of `os`
pub fn restart_ipsec(runner: &dyn CommandRunner, os: &OsInfo) -> Result<(), Error> {
    log::info!("Restarting IPsec service...");
    let mkdir = runner.run(&Cmd::new("mkdir").args(["-p", "/run/pluto"]))?;
    if !mkdir.success {
        log::warn!("Could not create /run/pluto: {}", mkdir.stderr.trim());
    }
    let cmd = match os.family {
        OsFamily::Alpine => Cmd::new("rc-service").args(["ipsec", "restart"]),
        _ => Cmd::new("service").args(["ipsec", "restart"]),
    };
    runner.run_checked(&cmd, "Restarting IPsec service")?;
    Ok(())
}

/// Machine hardware name as reported by `uname -m`
pub fn machine_arch(runner: &dyn CommandRunner) -> Result<String, Error> {
    let out = runner.run_checked(&Cmd::new("uname").arg("-m"), "Detecting architecture")?;
    Ok(out.stdout.trim().to_string())
}
