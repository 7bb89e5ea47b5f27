use std::ffi::{OsStr, OsString};
use std::fmt::Display;
use std::fs::File;
use std::process::{ExitStatus, Output, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command as BaseCommand};
use tracing::debug;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to spawn command: {command}")]
    Spawn {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("failed to wait for command: {command}")]
    Wait {
        command: String,
        #[source]
        error: std::io::Error,
    },

    #[error("command failed ({status}): {command}\n{stderr}")]
    Failure {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Where the standard streams of a spawned command go.
#[derive(Debug, Default)]
pub enum Io {
    /// stdin closed, stdout and stderr captured.
    #[default]
    Capture,
    /// All three streams shared with the current terminal.
    Inherit,
    /// stdin shared with the terminal (so a privilege wrapper can prompt), output discarded.
    Quiet,
    /// stdin closed, stdout and stderr appended to the given file.
    Log(File),
}

#[derive(Debug)]
pub struct Command {
    cmd: BaseCommand,
    io: Io,
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = self.cmd.as_std();
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl Command {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            cmd: BaseCommand::new(program),
            io: Io::default(),
        }
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.cmd.arg(arg);
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.cmd.args(args);
        self
    }

    pub fn io(&mut self, io: Io) -> &mut Self {
        self.io = io;
        self
    }

    pub fn program(&self) -> &OsStr {
        self.cmd.as_std().get_program()
    }

    pub fn get_args(&self) -> Vec<OsString> {
        self.cmd.as_std().get_args().map(OsStr::to_owned).collect()
    }

    /// Run in a fresh process group so the child survives the caller and
    /// does not receive the terminal's job-control signals.
    #[cfg(unix)]
    pub fn detach(&mut self) -> &mut Self {
        self.cmd.process_group(0);
        self
    }

    #[cfg(not(unix))]
    pub fn detach(&mut self) -> &mut Self {
        self
    }

    /// Re-run this command through a privilege wrapper such as `sudo`.
    pub fn sudo<S: AsRef<OsStr>>(self, wrapper: S) -> Self {
        let mut privileged = Command::new(wrapper);
        {
            let cmd = self.cmd.as_std();
            privileged.arg(cmd.get_program()).args(cmd.get_args());
            if let Some(dir) = cmd.get_current_dir() {
                privileged.cmd.current_dir(dir);
            }
        }
        privileged.io = self.io;
        privileged
    }

    fn apply_io(&mut self) -> Result<(), CommandError> {
        let (stdin, stdout, stderr) = match &self.io {
            Io::Capture => (Stdio::null(), Stdio::piped(), Stdio::piped()),
            Io::Inherit => (Stdio::inherit(), Stdio::inherit(), Stdio::inherit()),
            Io::Quiet => (Stdio::inherit(), Stdio::null(), Stdio::null()),
            Io::Log(file) => {
                let clone = |file: &File| {
                    file.try_clone().map_err(|error| CommandError::Spawn {
                        command: self.to_string(),
                        error,
                    })
                };
                (
                    Stdio::null(),
                    Stdio::from(clone(file)?),
                    Stdio::from(clone(file)?),
                )
            }
        };
        self.cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        Ok(())
    }

    pub fn spawn(&mut self) -> Result<Child, CommandError> {
        self.apply_io()?;
        debug!("spawn: {self}");
        self.cmd.spawn().map_err(|error| CommandError::Spawn {
            command: self.to_string(),
            error,
        })
    }

    pub async fn status(&mut self) -> Result<ExitStatus, CommandError> {
        let mut child = self.spawn()?;
        child.wait().await.map_err(|error| CommandError::Wait {
            command: self.to_string(),
            error,
        })
    }

    pub async fn output(&mut self) -> Result<Output, CommandError> {
        self.apply_io()?;
        debug!("output: {self}");
        self.cmd.output().await.map_err(|error| CommandError::Spawn {
            command: self.to_string(),
            error,
        })
    }

    /// Like [`Command::output`], but a non-zero exit is an error.
    pub async fn run(&mut self) -> Result<Output, CommandError> {
        let output = self.output().await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(CommandError::Failure {
                command: self.to_string(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}
