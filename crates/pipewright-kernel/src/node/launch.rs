//! Launching a node against concrete endpoints.
//!
//! External commands become processes in their own process group. Ends
//! bound to the terminal, `/dev/null`, or a file are handed to the process as
//! descriptors; ends bound to a stream get a pipe plus a pump task.
//!
//! Functions become tokio tasks. Every end a function sees is a stream, so
//! terminal and file ends get an adapter stream plus a pump.
//!
//! All fallible setup (resolution, argument checks, opening redirect files)
//! happens before anything is spawned, so a launch error leaves nothing
//! running.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::Signal;
use pipewright_types::BufferPolicy;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::handle::{FunctionHandle, Handle, NodeExit, ProcessHandle, exit_slot};
use super::resolve::resolve_command;
use super::{Identity, Node};
use crate::error::{LaunchError, StreamError};
use crate::functions::{FunctionNode, NodeIo};
use crate::scheduler::pump::{BoxReader, BoxWriter, spawn_copy, spawn_tee};
use crate::scheduler::stderr_sample::SharedSample;
use crate::scheduler::{StreamReader, StreamWriter, empty_stream, stream};

/// What feeds a node's stdin.
#[derive(Debug)]
pub enum Inlet {
    Inherit,
    Null,
    File(PathBuf),
    Stream(StreamReader),
}

/// Where a node's stdout or stderr goes.
#[derive(Debug)]
pub enum Outlet {
    HostStdout,
    HostStderr,
    Null,
    File { path: PathBuf, append: bool },
    Stream(StreamWriter),
}

/// Resolved endpoints for one launch.
#[derive(Debug)]
pub struct Bindings {
    pub stdin: Inlet,
    pub stdout: Outlet,
    pub stderr: Outlet,
    /// Keep a stderr tail here.
    pub sample: Option<SharedSample>,
    /// Pipeline token; the node gets a child of it.
    pub cancel: CancellationToken,
    /// Policy for adapter streams created during launch.
    pub policy: BufferPolicy,
}

/// A started node and the pumps serving it.
#[derive(Debug)]
pub struct Launched {
    pub handle: Handle,
    /// Feed the node's stdin. Stopped once the node exits.
    pub inbound: Vec<JoinHandle<()>>,
    /// Carry the node's output. Awaited before the result is final.
    pub outbound: Vec<JoinHandle<()>>,
}

fn redirect_error(path: &Path, err: io::Error) -> LaunchError {
    LaunchError::Redirect {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn open_source(path: &Path) -> Result<File, LaunchError> {
    File::open(path).map_err(|e| redirect_error(path, e))
}

fn open_sink(path: &Path, append: bool) -> Result<File, LaunchError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .map_err(|e| redirect_error(path, e))
}

fn dup_host(fd: impl AsFd, identity: &str) -> Result<Stdio, LaunchError> {
    let owned = fd
        .as_fd()
        .try_clone_to_owned()
        .map_err(|e| LaunchError::Spawn {
            identity: identity.to_string(),
            message: format!("duplicating host descriptor: {e}"),
        })?;
    Ok(Stdio::from(owned))
}

/// A process end: a descriptor the child uses directly, or a pipe we pump.
enum ProcessEnd<T> {
    Direct(Stdio),
    Pump(T),
}

impl Inlet {
    fn for_process(self) -> Result<ProcessEnd<StreamReader>, LaunchError> {
        Ok(match self {
            Inlet::Inherit => ProcessEnd::Direct(Stdio::inherit()),
            Inlet::Null => ProcessEnd::Direct(Stdio::null()),
            Inlet::File(path) => ProcessEnd::Direct(Stdio::from(open_source(&path)?)),
            Inlet::Stream(reader) => ProcessEnd::Pump(reader),
        })
    }

    /// Reader to pump into a fresh stream, or the stream itself.
    fn for_function(self) -> Result<Result<StreamReader, Option<BoxReader>>, LaunchError> {
        Ok(match self {
            Inlet::Stream(reader) => Ok(reader),
            Inlet::Null => Err(None),
            Inlet::Inherit => Err(Some(Box::new(tokio::io::stdin()))),
            Inlet::File(path) => Err(Some(Box::new(tokio::fs::File::from_std(open_source(&path)?)))),
        })
    }
}

impl Outlet {
    fn for_process(self, identity: &str) -> Result<ProcessEnd<StreamWriter>, LaunchError> {
        Ok(match self {
            Outlet::HostStdout => ProcessEnd::Direct(dup_host(io::stdout(), identity)?),
            Outlet::HostStderr => ProcessEnd::Direct(dup_host(io::stderr(), identity)?),
            Outlet::Null => ProcessEnd::Direct(Stdio::null()),
            Outlet::File { path, append } => ProcessEnd::Direct(Stdio::from(open_sink(&path, append)?)),
            Outlet::Stream(writer) => ProcessEnd::Pump(writer),
        })
    }

    /// Async writer for pumps.
    fn into_writer(self) -> Result<BoxWriter, LaunchError> {
        Ok(match self {
            Outlet::HostStdout => Box::new(tokio::io::stdout()),
            Outlet::HostStderr => Box::new(tokio::io::stderr()),
            Outlet::Null => Box::new(tokio::io::sink()),
            Outlet::File { path, append } => {
                Box::new(tokio::fs::File::from_std(open_sink(&path, append)?))
            }
            Outlet::Stream(writer) => Box::new(writer),
        })
    }
}

fn spawn_error(identity: &str, program: &str, err: io::Error) -> LaunchError {
    match err.kind() {
        io::ErrorKind::NotFound => LaunchError::NotFound(program.to_string()),
        io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied(program.to_string()),
        _ => LaunchError::Spawn {
            identity: identity.to_string(),
            message: err.to_string(),
        },
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> NodeExit {
    match (status.code(), status.signal()) {
        (Some(code), _) => NodeExit::code(code),
        (None, Some(signal)) => NodeExit::signaled(signal),
        (None, None) => NodeExit::code(1),
    }
}

impl Node {
    /// Start this node with the given endpoints.
    ///
    /// Either the node is fully started (a process with its descriptors, or
    /// a scheduled task) or a `LaunchError` is returned and nothing runs.
    /// Must be called from within a tokio runtime.
    #[tracing::instrument(level = "debug", skip(self, bindings), fields(node = %self.display_name()))]
    pub fn launch(&self, bindings: Bindings) -> Result<Launched, LaunchError> {
        match self.identity() {
            Identity::External(program) => self.launch_process(program, bindings),
            Identity::Function(func) => self.launch_function(func, bindings),
        }
    }

    fn launch_process(&self, program: &str, b: Bindings) -> Result<Launched, LaunchError> {
        let identity = self.display_name();
        let path = resolve_command(program, &self.search_path())?;

        let mut cmd = Command::new(&path);
        // argv[0] is the name as written, not the resolved path.
        cmd.arg0(program);
        cmd.args(self.argv());
        if self.clears_env() {
            cmd.env_clear();
        }
        for (key, value) in self.env_overrides() {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }
        if let Some(dir) = self.working_dir() {
            cmd.current_dir(dir);
        }
        // Own process group, so a kill reaches the command's children too.
        cmd.process_group(0);

        let stdin = b.stdin.for_process()?;
        let stdout = b.stdout.for_process(&identity)?;
        let stderr = match b.sample {
            Some(sample) => Err((sample, b.stderr.into_writer()?)),
            None => Ok(b.stderr.for_process(&identity)?),
        };

        let stdin_reader = match stdin {
            ProcessEnd::Direct(stdio) => {
                cmd.stdin(stdio);
                None
            }
            ProcessEnd::Pump(reader) => {
                cmd.stdin(Stdio::piped());
                Some(reader)
            }
        };
        let stdout_writer = match stdout {
            ProcessEnd::Direct(stdio) => {
                cmd.stdout(stdio);
                None
            }
            ProcessEnd::Pump(writer) => {
                cmd.stdout(Stdio::piped());
                Some(writer)
            }
        };
        let stderr_pump = match stderr {
            Ok(ProcessEnd::Direct(stdio)) => {
                cmd.stderr(stdio);
                None
            }
            Ok(ProcessEnd::Pump(writer)) => {
                cmd.stderr(Stdio::piped());
                Some((None, Box::new(writer) as BoxWriter))
            }
            Err((sample, writer)) => {
                cmd.stderr(Stdio::piped());
                Some((Some(sample), writer))
            }
        };

        let mut child = cmd
            .spawn()
            .map_err(|e| spawn_error(&identity, program, e))?;
        let pid = child.id();
        tracing::debug!(node = %identity, ?pid, path = %path.display(), "process started");

        let mut inbound = Vec::new();
        let mut outbound = Vec::new();

        if let (Some(reader), Some(child_stdin)) = (stdin_reader, child.stdin.take()) {
            inbound.push(spawn_copy(identity.clone(), "stdin", reader, child_stdin));
        }
        if let (Some(writer), Some(child_stdout)) = (stdout_writer, child.stdout.take()) {
            outbound.push(spawn_copy(identity.clone(), "stdout", child_stdout, writer));
        }
        if let (Some((sample, writer)), Some(child_stderr)) = (stderr_pump, child.stderr.take()) {
            outbound.push(spawn_tee(identity.clone(), child_stderr, sample, writer));
        }

        let (tx, rx) = exit_slot();
        let waiter_identity = identity.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    tracing::warn!(node = %waiter_identity, "wait failed: {}", e);
                    NodeExit::code(1)
                }
            };
            tracing::debug!(node = %waiter_identity, status = exit.status, "process exited");
            let _ = tx.send(Some(exit));
        });

        Ok(Launched {
            handle: Handle::Process(ProcessHandle::new(identity, pid, rx)),
            inbound,
            outbound,
        })
    }

    fn launch_function(&self, func: &FunctionNode, b: Bindings) -> Result<Launched, LaunchError> {
        let identity = self.display_name();
        let args = self.argv();
        func.function()
            .setup(&args)
            .map_err(|message| LaunchError::Setup {
                identity: identity.clone(),
                message,
            })?;

        let stdin = b.stdin.for_function()?;
        let stdout = match b.stdout {
            Outlet::Stream(writer) => Ok(writer),
            other => Err(other.into_writer()?),
        };
        let stderr = match (b.sample, b.stderr) {
            (None, Outlet::Stream(writer)) => Ok(writer),
            (sample, other) => Err((sample, other.into_writer()?)),
        };

        // Nothing below can fail.
        let cancel = b.cancel.child_token();
        let mut inbound = Vec::new();
        let mut outbound = Vec::new();

        let stdin = match stdin {
            Ok(reader) => reader,
            Err(None) => empty_stream(b.policy),
            Err(Some(source)) => {
                let (writer, reader) = stream(b.policy);
                inbound.push(spawn_copy(identity.clone(), "stdin", source, writer));
                reader
            }
        };
        let stdout = match stdout {
            Ok(writer) => writer,
            Err(sink) => {
                let (writer, reader) = stream(b.policy);
                outbound.push(spawn_copy(identity.clone(), "stdout", reader, sink));
                writer
            }
        };
        let stderr = match stderr {
            Ok(writer) => writer,
            Err((sample, sink)) => {
                let (writer, reader) = stream(b.policy);
                outbound.push(spawn_tee(identity.clone(), reader, sample, sink));
                writer
            }
        };

        let stderr = stderr.with_cancel(cancel.clone());
        let mut diagnostics = stderr.clone();
        let io = NodeIo {
            args,
            env: self.effective_env(),
            cwd: self.working_dir().map(Path::to_path_buf),
            stdin: stdin.with_cancel(cancel.clone()),
            stdout: stdout.with_cancel(cancel.clone()),
            stderr,
            cancel: cancel.clone(),
        };

        let function = func.function().clone();
        let name = func.name().to_string();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = match function.run(io).await {
                Ok(status) => NodeExit::code(status),
                Err(_) if token.is_cancelled() => NodeExit::signaled(Signal::SIGTERM as i32),
                Err(e) if StreamError::is_broken_pipe(&e) => NodeExit::broken_pipe(),
                Err(e) => {
                    let _ = diagnostics.write_line(&format!("{name}: {e:#}")).await;
                    NodeExit::code(1)
                }
            };
            let _ = diagnostics.close().await;
            exit
        });
        let abort = task.abort_handle();

        let (tx, rx) = exit_slot();
        let waiter_identity = identity.clone();
        tokio::spawn(async move {
            let exit = match task.await {
                Ok(exit) => exit,
                Err(e) if e.is_cancelled() => NodeExit::signaled(Signal::SIGKILL as i32),
                Err(e) => {
                    tracing::warn!(node = %waiter_identity, "function panicked: {}", e);
                    NodeExit::code(1)
                }
            };
            tracing::debug!(node = %waiter_identity, status = exit.status, "function finished");
            let _ = tx.send(Some(exit));
        });

        Ok(Launched {
            handle: Handle::Function(FunctionHandle::new(identity, cancel, abort, rx)),
            inbound,
            outbound,
        })
    }
}
