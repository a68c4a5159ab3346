//! Network domain blocking through the system proxy auto-config
//!
//! Activation renders the block list into a PAC script, persists it under the
//! data directory and points every enabled network service (both protocol
//! layers) at it. Deactivation turns auto-config off again and leaves the
//! script file in place.
//!
//! Both directions run as one lock transaction against the [`ConfigStore`]:
//!
//! 1. Lock (released on every exit path by [`ConfigLock`])
//! 2. Read and edit the proxy settings of each enabled service and layer
//! 3. Commit, then apply
//!
//! A commit failure leaves nothing behind (the store discards staged edits).
//! An apply failure re-commits the settings captured in step 2 before the
//! error is returned, so the store never stays half-applied.

use crate::core::blocklist::{BlockList, SCRIPT_FILE_NAME, render_script, script_digest};
use crate::core::error::{Error, Result};
use crate::core::netconfig::{
    ConfigLock, ConfigStore, NetworkService, ProtocolLayer, ProxySettings, disable_auto_config,
    enable_auto_config,
};
use crate::core::networksetup::NetworksetupStore;
use crate::elevation::{AuthorizationBroker, Credential};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

/// Mode of the persisted script; system networking clients must be able to read it
const SCRIPT_MODE: u32 = 0o644;

/// What a successful activation did
#[derive(Debug, Clone)]
pub struct ActivationSummary {
    pub script_path: PathBuf,
    pub script_url: String,
    /// SHA-256 of the script content
    pub digest: String,
    /// Enabled services whose settings were rewritten
    pub services_updated: usize,
}

pub struct NetworkBlockController {
    broker: Arc<AuthorizationBroker>,
    store: Arc<dyn ConfigStore>,
    script_path: PathBuf,
}

impl NetworkBlockController {
    pub fn new(
        broker: Arc<AuthorizationBroker>,
        store: Arc<dyn ConfigStore>,
        script_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            broker,
            store,
            script_path: script_path.into(),
        }
    }

    /// Controller for this machine: `networksetup` store, script in the data directory.
    pub fn system(broker: Arc<AuthorizationBroker>) -> Result<Self> {
        let mut script_path = crate::utils::get_data_dir()
            .ok_or_else(|| Error::Internal("Failed to get data directory".to_string()))?;
        script_path.push(SCRIPT_FILE_NAME);
        Ok(Self::new(
            broker,
            Arc::new(NetworksetupStore::system()?),
            script_path,
        ))
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Whether a credential is already held, so the next change will not prompt.
    pub fn is_authorized(&self) -> bool {
        self.broker.is_authorized()
    }

    /// Auto-config URL written into the network settings.
    pub fn script_url(&self) -> String {
        crate::utils::file_url(&self.script_path)
    }

    /// Renders and persists the script, then enables it on every enabled service.
    pub async fn activate(&self, domains: &BlockList) -> Result<ActivationSummary> {
        let script = render_script(domains);
        let digest = script_digest(&script);
        debug!(
            "Rendered script for {} domain(s), sha256 {digest}",
            domains.len()
        );

        persist_script(self.script_path.clone(), script).await?;

        let credential = self.broker.acquire().await?;
        let script_url = self.script_url();
        let services_updated = self
            .rewrite_services(&credential, |settings| {
                enable_auto_config(settings, &script_url);
            })
            .await?;

        info!(
            "Blocking active on {services_updated} service(s) via {}",
            self.script_path.display()
        );
        Ok(ActivationSummary {
            script_path: self.script_path.clone(),
            script_url,
            digest,
            services_updated,
        })
    }

    /// Turns auto-config off on every enabled service. The script file stays.
    pub async fn deactivate(&self) -> Result<usize> {
        let credential = self.broker.acquire().await?;
        let services_updated = self
            .rewrite_services(&credential, disable_auto_config)
            .await?;
        info!("Blocking removed from {services_updated} service(s)");
        Ok(services_updated)
    }

    async fn rewrite_services<F>(&self, credential: &Credential, edit: F) -> Result<usize>
    where
        F: Fn(&mut ProxySettings),
    {
        let lock = ConfigLock::acquire(self.store.as_ref(), credential)?;
        let store = lock.store();

        let services = store.services().await?;
        let mut originals: Vec<(NetworkService, ProtocolLayer, ProxySettings)> = Vec::new();
        let mut updated = 0;

        for service in services {
            if !service.enabled {
                debug!("Skipping disabled service {}", service.name);
                continue;
            }
            for layer in ProtocolLayer::iter() {
                let current = store.proxies(&service, layer).await?;
                let mut settings = current.clone();
                edit(&mut settings);
                store.set_proxies(&service, layer, settings)?;
                originals.push((service.clone(), layer, current));
            }
            updated += 1;
        }

        store.commit().await?;
        if let Err(e) = store.apply().await {
            error!("Applying network settings failed: {e}; restoring previous settings");
            restore(store, &originals).await;
            return Err(e);
        }
        Ok(updated)
    }
}

/// Re-commits settings captured before an edit. Best effort.
async fn restore(
    store: &dyn ConfigStore,
    originals: &[(NetworkService, ProtocolLayer, ProxySettings)],
) {
    for (service, layer, settings) in originals {
        if let Err(e) = store.set_proxies(service, *layer, settings.clone()) {
            warn!("Could not stage restore of {} {layer}: {e}", service.name);
        }
    }
    if let Err(e) = store.commit().await {
        warn!("Restoring previous network settings failed: {e}");
        return;
    }
    if let Err(e) = store.apply().await {
        warn!("Restored network settings did not apply: {e}");
    }
}

/// Writes the script next to its final path and renames it into place.
///
/// A failed write leaves the previous script untouched.
async fn persist_script(path: PathBuf, script: String) -> Result<()> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let dir = path.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "script path has no parent")
        })?;
        std::fs::create_dir_all(dir)?;

        let mut temp = NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(SCRIPT_MODE))?;
        }
        temp.write_all(script.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("script writer panicked: {e}")))??;
    Ok(())
}
