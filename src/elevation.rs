//! Privilege elevation for system network configuration
//!
//! hush runs as an unprivileged user and only elevates to rewrite the system
//! proxy settings through `networksetup`. Grayscale never needs elevation.
//!
//! # Elevation Strategy
//!
//! - **Already root**: commands run directly, no prompt
//! - **Preferred**: `run0` when available (systemd v256+, no SUID)
//! - **Terminal**: `sudo`
//! - **GUI**: `osascript` on macOS, `pkexec` elsewhere
//!
//! # Environment Variables
//!
//! - `HUSH_ELEVATION_METHOD`: Force a specific method (`sudo`, `run0`, `pkexec`, `osascript`).
//! - `HUSH_TEST_NO_ELEVATION`: Bypass elevation entirely (for testing only).
//!
//! # Credential lifetime
//!
//! [`AuthorizationBroker::acquire`] prompts at most once per process. Concurrent
//! callers that arrive while the prompt is open wait for that prompt's outcome
//! instead of opening a second one. A successful [`Credential`] owns one
//! [`ElevatedShell`] started by that prompt and runs every privileged command
//! through it, so no later command prompts. It is cached until the broker is
//! dropped or the shell exits; a denial is handed to every waiter but not
//! cached, so the next explicit request prompts again.

use crate::elevated_shell::{CommandOutput, ElevatedShell};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Error type for privilege elevation operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElevationError {
    /// The user dismissed the prompt or entered the wrong password
    #[error("Elevation was denied")]
    Denied,

    /// pkexec binary not found in PATH
    #[error("pkexec not found - please install PolicyKit")]
    PkexecNotFound,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    /// Invalid value for `HUSH_ELEVATION_METHOD`
    #[error("Invalid HUSH_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec, osascript")]
    InvalidMethod(String),

    /// The prompt process could not be started or was abandoned
    #[error("Elevation prompt failed: {0}")]
    Prompt(String),
}

/// How privileged commands are launched
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ElevationMethod {
    /// Already privileged (root or test mode)
    Direct,
    Sudo,
    Run0,
    Pkexec,
    Osascript,
}

impl ElevationMethod {
    fn parse(name: &str) -> Result<Self, ElevationError> {
        match name {
            "sudo" => Ok(Self::Sudo),
            "run0" => Ok(Self::Run0),
            "pkexec" => Ok(Self::Pkexec),
            "osascript" => Ok(Self::Osascript),
            _ => Err(ElevationError::InvalidMethod(name.to_string())),
        }
    }

    pub(crate) fn binary(self) -> Option<&'static str> {
        match self {
            Self::Direct => None,
            Self::Sudo => Some("sudo"),
            Self::Run0 => Some("run0"),
            Self::Pkexec => Some("pkexec"),
            Self::Osascript => Some("osascript"),
        }
    }
}

/// Checks if a binary exists in PATH
fn binary_exists(name: &str) -> bool {
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Picks the elevation method for this process.
///
/// Resolution order: test bypass, already root, `HUSH_ELEVATION_METHOD`,
/// then automatic detection.
pub fn resolve_method() -> Result<ElevationMethod, ElevationError> {
    use std::os::fd::AsFd;

    // 1. Strict Test Mode Override (Highest Priority)
    if std::env::var("HUSH_TEST_NO_ELEVATION").is_ok() {
        return Ok(ElevationMethod::Direct);
    }

    // 2. Direct Root Execution (No prompt needed)
    if nix::unistd::getuid().is_root() {
        return Ok(ElevationMethod::Direct);
    }

    // 3. Explicit elevation method override
    if let Ok(method) = std::env::var("HUSH_ELEVATION_METHOD") {
        let method = method.to_lowercase();
        if !method.is_empty() {
            let method = ElevationMethod::parse(&method)?;
            let binary = method.binary().unwrap_or_default();
            if !binary_exists(binary) {
                return Err(ElevationError::MethodNotAvailable(binary.into()));
            }
            return Ok(method);
        }
    }

    // 4. Automatic detection
    if binary_exists("run0") {
        return Ok(ElevationMethod::Run0);
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty {
        return Ok(ElevationMethod::Sudo);
    }

    if cfg!(target_os = "macos") {
        return Ok(ElevationMethod::Osascript);
    }

    if !binary_exists("pkexec") {
        return Err(ElevationError::PkexecNotFound);
    }
    Ok(ElevationMethod::Pkexec)
}

/// Performs the one interactive elevation request.
#[async_trait]
pub trait Elevator: Send + Sync {
    async fn elevate(&self) -> Result<Credential, ElevationError>;
}

/// Prompts through the platform's elevation tool by starting the elevated shell.
#[derive(Debug, Default)]
pub struct SystemElevator;

#[async_trait]
impl Elevator for SystemElevator {
    async fn elevate(&self) -> Result<Credential, ElevationError> {
        let method = resolve_method()?;
        if method == ElevationMethod::Direct {
            debug!("Already privileged, skipping elevation prompt");
            return Ok(Credential::direct());
        }

        info!("Requesting administrator permission via {method}");
        match ElevatedShell::launch(method).await {
            Ok(shell) => Ok(Credential::elevated(method, shell)),
            Err(e) => match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Err(ElevationError::MethodNotAvailable(method.to_string()))
                }
                std::io::ErrorKind::PermissionDenied
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => {
                    warn!("Elevation via {method} refused: {e}");
                    Err(ElevationError::Denied)
                }
                _ => Err(ElevationError::Prompt(e.to_string())),
            },
        }
    }
}

struct CredentialInner {
    method: ElevationMethod,
    /// `None` when the process is already privileged
    shell: Option<ElevatedShell>,
}

impl Drop for CredentialInner {
    fn drop(&mut self) {
        if self.method == ElevationMethod::Sudo {
            // Invalidate the cached sudo timestamp so it does not outlive us
            let _ = std::process::Command::new("sudo")
                .arg("-k")
                .stdin(std::process::Stdio::null())
                .status();
        }
    }
}

/// Live proof that elevation succeeded.
///
/// Never serialized. The elevated shell is closed when the last clone is
/// dropped.
#[derive(Clone)]
pub struct Credential(Arc<CredentialInner>);

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("method", &self.0.method)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Credential {
    /// Runs commands with this process's own privileges (root, tests).
    pub fn direct() -> Self {
        Self(Arc::new(CredentialInner {
            method: ElevationMethod::Direct,
            shell: None,
        }))
    }

    pub(crate) fn elevated(method: ElevationMethod, shell: ElevatedShell) -> Self {
        Self(Arc::new(CredentialInner {
            method,
            shell: Some(shell),
        }))
    }

    pub fn method(&self) -> ElevationMethod {
        self.0.method
    }

    /// Whether privileged commands can still run without a new prompt.
    pub fn is_live(&self) -> bool {
        self.0.shell.as_ref().is_none_or(ElevatedShell::is_live)
    }

    /// Runs `networksetup` with this credential's privileges.
    ///
    /// `networksetup` is the only binary hush ever runs with privileges.
    /// Arguments are passed without shell interpretation.
    pub async fn networksetup(&self, args: &[&str]) -> std::io::Result<CommandOutput> {
        const PROGRAM: &str = "networksetup";
        match &self.0.shell {
            Some(shell) => shell.run(PROGRAM, args).await,
            None => {
                let output = Command::new(PROGRAM)
                    .args(args)
                    .stdin(std::process::Stdio::null())
                    .output()
                    .await?;
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(CommandOutput {
                    code: output.status.code().unwrap_or(-1),
                    output: combined,
                })
            }
        }
    }
}

type Outcome = Result<Credential, ElevationError>;

enum Slot {
    Idle,
    Pending(watch::Receiver<Option<Outcome>>),
    Ready(Credential),
}

enum Next {
    Prompt(watch::Sender<Option<Outcome>>),
    Wait(watch::Receiver<Option<Outcome>>),
}

/// Obtains and caches one elevated-privilege credential for the process lifetime.
pub struct AuthorizationBroker {
    elevator: Box<dyn Elevator>,
    slot: Mutex<Slot>,
}

impl AuthorizationBroker {
    pub fn new(elevator: Box<dyn Elevator>) -> Self {
        Self {
            elevator,
            slot: Mutex::new(Slot::Idle),
        }
    }

    /// Broker backed by the platform's elevation tool.
    pub fn system() -> Self {
        Self::new(Box::new(SystemElevator))
    }

    /// Returns the cached credential, prompting only if none exists yet.
    pub async fn acquire(&self) -> Outcome {
        let next = {
            let mut slot = self.lock_slot();
            match &*slot {
                Slot::Ready(credential) if credential.is_live() => {
                    return Ok(credential.clone());
                }
                // A closed sender means the prompting task was dropped mid-prompt
                Slot::Pending(rx) if rx.has_changed().is_ok() => Next::Wait(rx.clone()),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Slot::Pending(rx);
                    Next::Prompt(tx)
                }
            }
        };

        match next {
            Next::Prompt(tx) => self.prompt(tx).await,
            Next::Wait(mut rx) => {
                debug!("Elevation prompt already open, waiting for its outcome");
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map_err(|_| ElevationError::Prompt("prompt was abandoned".into()))?;
                outcome
                    .clone()
                    .unwrap_or_else(|| Err(ElevationError::Prompt("prompt was abandoned".into())))
            }
        }
    }

    /// Whether a credential has already been granted.
    pub fn is_authorized(&self) -> bool {
        matches!(&*self.lock_slot(), Slot::Ready(credential) if credential.is_live())
    }

    async fn prompt(&self, tx: watch::Sender<Option<Outcome>>) -> Outcome {
        let outcome = self.elevator.elevate().await;

        {
            let mut slot = self.lock_slot();
            *slot = match &outcome {
                Ok(credential) => Slot::Ready(credential.clone()),
                Err(_) => Slot::Idle,
            };
        }
        let _ = tx.send(Some(outcome.clone()));

        match &outcome {
            Ok(credential) => info!("Elevation granted via {}", credential.method()),
            Err(e) => warn!("Elevation failed: {e}"),
        }
        outcome
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        // The slot holds no invariant a panicking holder could break
        self.slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
