//! Long-lived elevated shell behind a [`Credential`](crate::elevation::Credential)
//!
//! Granting elevation starts one privileged `/bin/sh`. Every later privileged
//! command is written to that shell as a single shell-quoted line followed by
//! a status marker, so only the launch itself ever prompts, and the privilege
//! lasts exactly as long as the shell.
//!
//! How the shell is started depends on the elevation method:
//!
//! - `sudo`, `run0`, `pkexec`: the tool runs `/bin/sh` with piped stdio
//! - `osascript`: `do shell script` cannot keep a pipe open, so it starts a
//!   background `/bin/sh` wired to two FIFOs in a private temporary directory

use crate::elevation::ElevationMethod;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const SHELL: &str = "/bin/sh";
const STATUS_MARKER: &str = "__hush_status__";
const FIFO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit status and combined stdout/stderr of one command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

struct Pipes {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

/// A privileged shell kept open for the life of a credential
pub struct ElevatedShell {
    // Dropped first: closing the command pipe ends the shell
    pipes: tokio::sync::Mutex<Pipes>,
    closed: AtomicBool,
    _child: Option<std::sync::Mutex<Child>>,
    _fifo_dir: Option<tempfile::TempDir>,
}

impl ElevatedShell {
    /// Starts the shell with `method`'s privileges. This is the one prompt.
    ///
    /// Resolves once the shell answered a first command, so a dismissed or
    /// failed prompt surfaces here as `PermissionDenied`, `BrokenPipe` or
    /// `UnexpectedEof`.
    pub async fn launch(method: ElevationMethod) -> io::Result<Self> {
        let shell = match method {
            ElevationMethod::Direct => Self::spawn(Command::new(SHELL))?,
            ElevationMethod::Osascript => Self::launch_via_osascript().await?,
            ElevationMethod::Sudo | ElevationMethod::Run0 | ElevationMethod::Pkexec => {
                let mut cmd = Command::new(method.binary().unwrap_or("sudo"));
                cmd.arg(SHELL);
                Self::spawn(cmd)?
            }
        };

        let first = shell.run("true", &[]).await?;
        if !first.success() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("elevated shell rejected its first command (exit {})", first.code),
            ));
        }
        debug!("Elevated shell ready via {method}");
        Ok(shell)
    }

    fn spawn(mut cmd: Command) -> io::Result<Self> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("shell stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("shell stdout unavailable"))?;

        Ok(Self::new(
            Box::new(stdin),
            Box::new(stdout),
            Some(child),
            None,
        ))
    }

    async fn launch_via_osascript() -> io::Result<Self> {
        use nix::sys::stat::Mode;

        let dir = tempfile::Builder::new().prefix("hush-").tempdir()?;
        let commands = dir.path().join("in");
        let replies = dir.path().join("out");
        for fifo in [&commands, &replies] {
            nix::unistd::mkfifo(fifo.as_path(), Mode::S_IRUSR | Mode::S_IWUSR)?;
        }

        let line = format!(
            "{SHELL} <{} >{} 2>&1 &",
            shell_quote(&commands.to_string_lossy()),
            shell_quote(&replies.to_string_lossy()),
        );
        let status = Command::new("osascript")
            .arg("-e")
            .arg(apple_script(&line))
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("osascript exited with {:?}", status.code()),
            ));
        }

        // The shell opens its stdin FIFO first, then its stdout FIFO
        let writer = connect_fifo(commands, true).await?;
        let reader = connect_fifo(replies, false).await?;
        Ok(Self::new(
            Box::new(writer),
            Box::new(reader),
            None,
            Some(dir),
        ))
    }

    fn new(
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        child: Option<Child>,
        fifo_dir: Option<tempfile::TempDir>,
    ) -> Self {
        Self {
            pipes: tokio::sync::Mutex::new(Pipes {
                writer,
                reader: BufReader::new(reader),
            }),
            closed: AtomicBool::new(false),
            _child: child.map(std::sync::Mutex::new),
            _fifo_dir: fifo_dir,
        }
    }

    /// Whether the shell still accepts commands.
    pub fn is_live(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Runs `program args` in the shell and waits for its exit status.
    ///
    /// Arguments are single-quoted, never interpreted by the shell. Commands
    /// are serialized; a broken pipe closes the shell for good.
    pub async fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        if !self.is_live() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "elevated shell has exited",
            ));
        }

        let script = format!(
            "{} </dev/null 2>&1; printf '\\n{STATUS_MARKER} %d\\n' \"$?\"\n",
            command_line(program, args)
        );
        let mut pipes = self.pipes.lock().await;
        let result = exchange(&mut pipes, &script).await;
        if let Err(e) = &result {
            warn!("Elevated shell closed: {e}");
            self.closed.store(true, Ordering::SeqCst);
        }
        result
    }
}

async fn exchange(pipes: &mut Pipes, script: &str) -> io::Result<CommandOutput> {
    pipes.writer.write_all(script.as_bytes()).await?;
    pipes.writer.flush().await?;

    let mut output = String::new();
    let mut line = String::new();
    loop {
        line.clear();
        if pipes.reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "elevated shell exited",
            ));
        }
        if let Some(status) = line.trim_end().strip_prefix(STATUS_MARKER) {
            let code = status.trim().parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("malformed status line {line:?}"),
                )
            })?;
            // Drop the newline printf put in front of the marker
            output.pop();
            return Ok(CommandOutput { code, output });
        }
        output.push_str(&line);
    }
}

/// Opens one end of a FIFO once the shell has opened the other.
async fn connect_fifo(path: PathBuf, write: bool) -> io::Result<tokio::fs::File> {
    let open = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .read(!write)
            .write(write)
            .open(path)
    });
    let file = tokio::time::timeout(FIFO_CONNECT_TIMEOUT, open)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "elevated shell did not connect"))?
        .map_err(io::Error::other)??;
    Ok(tokio::fs::File::from_std(file))
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds `do shell script "..." with administrator privileges`.
fn apple_script(shell_line: &str) -> String {
    let escaped = shell_line.replace('\\', "\\\\").replace('"', "\\\"");
    format!("do shell script \"{escaped}\" with administrator privileges")
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}
