//! `networksetup`-backed configuration store (macOS)
//!
//! `networksetup` exposes one auto-proxy setting per network service, so both
//! protocol layers of a service map onto the same pair of fields. Reads run
//! unprivileged; writes run through the elevated [`Credential`], whose shell
//! was opened by the one authorization prompt.
//!
//! Transaction semantics are layered on top:
//!
//! - **lock**: exclusive `flock` on a lock file in the state directory, so two
//!   hush processes never interleave edits
//! - **commit**: writes every staged service; if one write fails, services
//!   already written are restored to the values read at lock time
//! - **apply**: re-reads every committed service and fails if the live value
//!   differs from what was committed
//!
//! `networksetup` cannot delete the URL field, so disabling leaves the URL in
//! place with the enabled flag off.

use crate::core::error::{ConfigStage, Error, Result};
use crate::core::netconfig::{
    AUTO_CONFIG_ENABLE, AUTO_CONFIG_URL, ConfigStore, NetworkService, ProtocolLayer,
    ProxySettings, auto_config_enabled, auto_config_url,
};
use crate::elevation::Credential;
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::Command;
use tracing::{debug, info, warn};

const DISABLED_MARKER: char = '*';
const LISTING_NOTE_PREFIX: &str = "An asterisk";

#[derive(Default)]
struct Session {
    lock: Option<Flock<File>>,
    credential: Option<Credential>,
    /// Live values as first read during this session
    originals: BTreeMap<String, ProxySettings>,
    staged: BTreeMap<String, ProxySettings>,
    committed: BTreeMap<String, ProxySettings>,
}

pub struct NetworksetupStore {
    lock_path: PathBuf,
    session: Mutex<Session>,
}

impl NetworksetupStore {
    pub fn new(lock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            session: Mutex::new(Session::default()),
        }
    }

    /// Store using the default lock file in the state directory.
    pub fn system() -> Result<Self> {
        let mut path = crate::utils::get_state_dir()
            .ok_or_else(|| Error::Internal("Failed to get state directory".to_string()))?;
        path.push("netconfig.lock");
        Ok(Self::new(path))
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn credential(&self) -> Result<Credential> {
        self.session()
            .credential
            .clone()
            .ok_or_else(|| Error::config(ConfigStage::Commit, "store is not locked"))
    }

    async fn read_service(service: &str) -> Result<ProxySettings> {
        let mut cmd = Command::new("networksetup");
        cmd.args(["-getautoproxyurl", service]);
        let stdout = run(cmd)
            .await
            .map_err(|e| Error::config(ConfigStage::Read, format!("{service}: {e}")))?;
        Ok(parse_auto_proxy(&stdout))
    }

    async fn write_service(
        credential: &Credential,
        service: &str,
        settings: &ProxySettings,
    ) -> std::result::Result<(), String> {
        match auto_config_url(settings).filter(|_| auto_config_enabled(settings)) {
            Some(url) => {
                run_privileged(credential, &["-setautoproxyurl", service, url]).await?;
                run_privileged(credential, &["-setautoproxystate", service, "on"]).await
            }
            None => run_privileged(credential, &["-setautoproxystate", service, "off"]).await,
        }
    }
}

#[async_trait]
impl ConfigStore for NetworksetupStore {
    fn lock(&self, credential: &Credential) -> Result<()> {
        if let Some(dir) = self.lock_path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| Error::config(ConfigStage::Lock, e.to_string()))?;
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| Error::config(ConfigStage::Lock, e.to_string()))?;

        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
            Error::config(
                ConfigStage::Lock,
                format!("held by another process ({errno})"),
            )
        })?;

        let mut session = self.session();
        *session = Session {
            lock: Some(lock),
            credential: Some(credential.clone()),
            ..Session::default()
        };
        debug!("Locked network configuration via {:?}", self.lock_path);
        Ok(())
    }

    fn unlock(&self) {
        let mut session = self.session();
        if session.lock.is_some() {
            debug!("Unlocking network configuration");
        }
        // Dropping the Flock releases the advisory lock
        *session = Session::default();
    }

    fn discard(&self) {
        self.session().staged.clear();
    }

    async fn services(&self) -> Result<Vec<NetworkService>> {
        let mut cmd = Command::new("networksetup");
        cmd.arg("-listallnetworkservices");
        let stdout = run(cmd)
            .await
            .map_err(|e| Error::config(ConfigStage::Read, e))?;
        Ok(parse_service_list(&stdout))
    }

    async fn proxies(
        &self,
        service: &NetworkService,
        _layer: ProtocolLayer,
    ) -> Result<ProxySettings> {
        let known = self.session().originals.get(&service.id).cloned();
        if let Some(known) = known {
            return Ok(known);
        }
        let settings = Self::read_service(&service.name).await?;
        self.session()
            .originals
            .insert(service.id.clone(), settings.clone());
        Ok(settings)
    }

    fn set_proxies(
        &self,
        service: &NetworkService,
        _layer: ProtocolLayer,
        settings: ProxySettings,
    ) -> Result<()> {
        self.session().staged.insert(service.id.clone(), settings);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let credential = self.credential()?;
        let (staged, originals) = {
            let mut session = self.session();
            (std::mem::take(&mut session.staged), session.originals.clone())
        };

        let mut written: Vec<&String> = Vec::new();
        for (service, settings) in &staged {
            if let Err(e) = Self::write_service(&credential, service, settings).await {
                warn!("Writing proxy settings for {service} failed: {e}; rolling back");
                for done in written {
                    if let Some(original) = originals.get(done)
                        && let Err(re) = Self::write_service(&credential, done, original).await
                    {
                        warn!("Rollback of {done} failed: {re}");
                    }
                }
                return Err(Error::config(ConfigStage::Commit, format!("{service}: {e}")));
            }
            written.push(service);
        }

        info!("Committed proxy settings for {} service(s)", staged.len());
        self.session().committed.extend(staged);
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        let committed = std::mem::take(&mut self.session().committed);
        for (service, expected) in &committed {
            let live = Self::read_service(service)
                .await
                .map_err(|e| Error::config(ConfigStage::Apply, e.to_string()))?;
            let enabled = auto_config_enabled(expected);
            let matches = auto_config_enabled(&live) == enabled
                && (!enabled || auto_config_url(&live) == auto_config_url(expected));
            if !matches {
                return Err(Error::config(
                    ConfigStage::Apply,
                    format!("{service} did not take the new auto-proxy settings"),
                ));
            }
        }
        Ok(())
    }
}

/// Runs one `networksetup` write through the credential's elevated shell.
async fn run_privileged(
    credential: &Credential,
    args: &[&str],
) -> std::result::Result<(), String> {
    let result = credential
        .networksetup(args)
        .await
        .map_err(|e| format!("elevated networksetup unavailable: {e}"))?;
    if !result.success() || result.output.contains("** Error") {
        return Err(format!("exit {}: {}", result.code, result.output.trim()));
    }
    Ok(())
}

/// Runs a command and returns stdout, treating `** Error` output as failure.
async fn run(mut cmd: Command) -> std::result::Result<String, String> {
    let output = cmd
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| format!("failed to spawn networksetup: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() || stdout.contains("** Error") {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(format!("exit {:?}: {detail}", output.status.code()));
    }
    Ok(stdout)
}

/// Parses `networksetup -listallnetworkservices`.
fn parse_service_list(stdout: &str) -> Vec<NetworkService> {
    stdout
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with(LISTING_NOTE_PREFIX))
        .map(|line| {
            let (enabled, name) = match line.strip_prefix(DISABLED_MARKER) {
                Some(rest) => (false, rest.trim_start()),
                None => (true, line),
            };
            NetworkService {
                id: name.to_string(),
                name: name.to_string(),
                enabled,
            }
        })
        .collect()
}

/// Parses `networksetup -getautoproxyurl` into a proxy dictionary.
fn parse_auto_proxy(stdout: &str) -> ProxySettings {
    let mut settings = ProxySettings::new();
    for line in stdout.lines() {
        if let Some(url) = line.strip_prefix("URL:") {
            let url = url.trim();
            if !url.is_empty() && url != "(null)" {
                settings.insert(AUTO_CONFIG_URL.to_string(), url.into());
            }
        } else if let Some(flag) = line.strip_prefix("Enabled:") {
            let on = flag.trim().eq_ignore_ascii_case("yes");
            settings.insert(AUTO_CONFIG_ENABLE.to_string(), u8::from(on).into());
        }
    }
    settings
}
