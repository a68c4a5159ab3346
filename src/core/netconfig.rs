//! System network configuration store abstraction
//!
//! Mirrors the transaction shape of the platform preference store: take an
//! exclusive lock, stage edits per network service and protocol layer, then
//! commit and apply. Staged edits that were never committed are discarded when
//! the lock is released.

use crate::core::error::Result;
use crate::elevation::Credential;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Proxy dictionary key: auto-config enabled flag (0/1)
pub const AUTO_CONFIG_ENABLE: &str = "ProxyAutoConfigEnable";

/// Proxy dictionary key: auto-config script URL
pub const AUTO_CONFIG_URL: &str = "ProxyAutoConfigURLString";

/// Proxy settings of one protocol layer of one service.
///
/// Keys hush does not own are carried through unchanged.
pub type ProxySettings = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter)]
pub enum ProtocolLayer {
    #[strum(serialize = "IPv4")]
    Ipv4,
    #[strum(serialize = "IPv6")]
    Ipv6,
}

/// A configured network interface ("network service")
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkService {
    pub id: String,
    pub name: String,
    pub enabled: bool,
}

/// Lockable, transactional network configuration store.
///
/// `lock`, `unlock`, `discard` and `set_proxies` are synchronous so the
/// [`ConfigLock`] guard can release the store from `Drop`.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Takes the exclusive lock. Fails with a `Lock` stage error when held elsewhere.
    fn lock(&self, credential: &Credential) -> Result<()>;

    /// Releases the lock. Must be safe to call when not locked.
    fn unlock(&self);

    /// Drops staged edits that were not committed.
    fn discard(&self);

    async fn services(&self) -> Result<Vec<NetworkService>>;

    async fn proxies(&self, service: &NetworkService, layer: ProtocolLayer)
    -> Result<ProxySettings>;

    fn set_proxies(
        &self,
        service: &NetworkService,
        layer: ProtocolLayer,
        settings: ProxySettings,
    ) -> Result<()>;

    /// Persists staged edits. On failure nothing staged may remain visible.
    async fn commit(&self) -> Result<()>;

    /// Makes committed edits take effect on the live system.
    async fn apply(&self) -> Result<()>;
}

/// Scoped store lock: discards uncommitted edits and unlocks on every exit path.
pub struct ConfigLock<'a> {
    store: &'a dyn ConfigStore,
}

impl<'a> ConfigLock<'a> {
    pub fn acquire(store: &'a dyn ConfigStore, credential: &Credential) -> Result<Self> {
        store.lock(credential)?;
        Ok(Self { store })
    }

    pub fn store(&self) -> &'a dyn ConfigStore {
        self.store
    }
}

impl Drop for ConfigLock<'_> {
    fn drop(&mut self) {
        self.store.discard();
        self.store.unlock();
    }
}

/// Enables auto-config with `url`, preserving every other key.
pub fn enable_auto_config(settings: &mut ProxySettings, url: &str) {
    settings.insert(AUTO_CONFIG_ENABLE.to_string(), serde_json::Value::from(1));
    settings.insert(AUTO_CONFIG_URL.to_string(), serde_json::Value::from(url));
}

/// Disables auto-config and removes its URL, preserving every other key.
pub fn disable_auto_config(settings: &mut ProxySettings) {
    settings.insert(AUTO_CONFIG_ENABLE.to_string(), serde_json::Value::from(0));
    settings.remove(AUTO_CONFIG_URL);
}

/// Reads the auto-config flag, accepting numeric or boolean encodings.
pub fn auto_config_enabled(settings: &ProxySettings) -> bool {
    match settings.get(AUTO_CONFIG_ENABLE) {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

pub fn auto_config_url(settings: &ProxySettings) -> Option<&str> {
    settings.get(AUTO_CONFIG_URL).and_then(serde_json::Value::as_str)
}
