//! Shared test utilities for core module tests
//!
//! In-memory stand-ins for every external resource the core touches: the
//! elevation prompt, the network configuration store, display hardware and
//! the preference store. Each records what was done to it and can be told to
//! fail. [`PacEngine`] runs rendered PAC scripts. This module is only
//! compiled in test mode.

use crate::config::{PreferenceStore, Preferences};
use crate::core::blocklist::BlockList;
use crate::core::coordinator::Feature;
use crate::core::error::{ConfigStage, Error, Result};
use crate::core::gamma::{DisplayId, GammaDevice, TransferTable};
use crate::core::netconfig::{ConfigStore, NetworkService, ProtocolLayer, ProxySettings};
use crate::elevation::{Credential, ElevationError, Elevator};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("HUSH_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("HUSH_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A credential that runs commands unwrapped.
pub fn direct_credential() -> Credential {
    Credential::direct()
}

/// Elevator that counts prompts and can hold each one open until released.
pub struct CountingElevator {
    grant: bool,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Notify>>,
}

impl CountingElevator {
    pub fn granting() -> Self {
        Self {
            grant: true,
            calls: Arc::new(AtomicUsize::new(0)),
            gate: None,
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: false,
            ..Self::granting()
        }
    }

    /// Each prompt waits for one `gate().notify_one()` before resolving.
    #[must_use]
    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn gate(&self) -> Arc<Notify> {
        self.gate.clone().unwrap_or_default()
    }
}

#[async_trait]
impl Elevator for CountingElevator {
    async fn elevate(&self) -> std::result::Result<Credential, ElevationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.grant {
            Ok(Credential::direct())
        } else {
            Err(ElevationError::Denied)
        }
    }
}

/// Proxy settings with an unrelated manual HTTP proxy configured.
pub fn proxy_with_http() -> ProxySettings {
    let mut settings = ProxySettings::new();
    settings.insert("HTTPEnable".into(), serde_json::json!(1));
    settings.insert("HTTPProxy".into(), serde_json::json!("10.0.0.1"));
    settings.insert("HTTPPort".into(), serde_json::json!(3128));
    settings
}

type LayerKey = (String, ProtocolLayer);

#[derive(Default)]
struct StoreState {
    services: Vec<NetworkService>,
    committed: BTreeMap<LayerKey, ProxySettings>,
    staged: BTreeMap<LayerKey, ProxySettings>,
    applied: BTreeMap<LayerKey, ProxySettings>,
    locked: bool,
    fail_lock: bool,
    fail_commit: bool,
    fail_apply: bool,
    fail_next_apply: bool,
    commits: usize,
}

/// Configuration store keeping committed and applied settings in memory
#[derive(Default)]
pub struct MemoryConfigStore {
    state: Mutex<StoreState>,
}

impl MemoryConfigStore {
    pub fn with_services<'a>(services: impl IntoIterator<Item = (&'a str, bool)>) -> Self {
        let store = Self::default();
        locked(&store.state).services = services
            .into_iter()
            .map(|(name, enabled)| NetworkService {
                id: format!("svc-{name}"),
                name: name.to_string(),
                enabled,
            })
            .collect();
        store
    }

    fn key(&self, name: &str, layer: ProtocolLayer) -> LayerKey {
        (format!("svc-{name}"), layer)
    }

    /// Pre-existing live settings for one layer.
    pub fn seed(&self, name: &str, layer: ProtocolLayer, settings: ProxySettings) {
        let key = self.key(name, layer);
        let mut state = locked(&self.state);
        state.committed.insert(key.clone(), settings.clone());
        state.applied.insert(key, settings);
    }

    pub fn committed(&self, name: &str, layer: ProtocolLayer) -> ProxySettings {
        let key = self.key(name, layer);
        locked(&self.state).committed.get(&key).cloned().unwrap_or_default()
    }

    pub fn applied(&self, name: &str, layer: ProtocolLayer) -> ProxySettings {
        let key = self.key(name, layer);
        locked(&self.state).applied.get(&key).cloned().unwrap_or_default()
    }

    pub fn is_locked(&self) -> bool {
        locked(&self.state).locked
    }

    pub fn commit_count(&self) -> usize {
        locked(&self.state).commits
    }

    pub fn fail_lock(&self, fail: bool) {
        locked(&self.state).fail_lock = fail;
    }

    pub fn fail_commit(&self, fail: bool) {
        locked(&self.state).fail_commit = fail;
    }

    pub fn fail_apply(&self, fail: bool) {
        locked(&self.state).fail_apply = fail;
    }

    /// Only the next apply fails.
    pub fn fail_next_apply(&self) {
        locked(&self.state).fail_next_apply = true;
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    fn lock(&self, _credential: &Credential) -> Result<()> {
        let mut state = locked(&self.state);
        if state.fail_lock || state.locked {
            return Err(Error::config(ConfigStage::Lock, "store is locked"));
        }
        state.locked = true;
        Ok(())
    }

    fn unlock(&self) {
        locked(&self.state).locked = false;
    }

    fn discard(&self) {
        locked(&self.state).staged.clear();
    }

    async fn services(&self) -> Result<Vec<NetworkService>> {
        Ok(locked(&self.state).services.clone())
    }

    async fn proxies(
        &self,
        service: &NetworkService,
        layer: ProtocolLayer,
    ) -> Result<ProxySettings> {
        let key = (service.id.clone(), layer);
        Ok(locked(&self.state)
            .committed
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn set_proxies(
        &self,
        service: &NetworkService,
        layer: ProtocolLayer,
        settings: ProxySettings,
    ) -> Result<()> {
        let mut state = locked(&self.state);
        if !state.locked {
            return Err(Error::config(ConfigStage::Commit, "store is not locked"));
        }
        state.staged.insert((service.id.clone(), layer), settings);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = locked(&self.state);
        if !state.locked {
            return Err(Error::config(ConfigStage::Commit, "store is not locked"));
        }
        let staged = std::mem::take(&mut state.staged);
        if state.fail_commit {
            return Err(Error::config(ConfigStage::Commit, "injected commit failure"));
        }
        state.committed.extend(staged);
        state.commits += 1;
        Ok(())
    }

    async fn apply(&self) -> Result<()> {
        let mut state = locked(&self.state);
        if state.fail_apply || std::mem::take(&mut state.fail_next_apply) {
            return Err(Error::config(ConfigStage::Apply, "injected apply failure"));
        }
        state.applied = state.committed.clone();
        Ok(())
    }
}

#[derive(Default)]
struct DisplayState {
    tables: BTreeMap<DisplayId, TransferTable>,
    capacities: BTreeMap<DisplayId, u32>,
    failing_writes: BTreeSet<DisplayId>,
    fail_enumeration: bool,
    writes: usize,
}

/// Display hardware holding transfer tables in memory
#[derive(Default)]
pub struct MemoryDisplays {
    state: Mutex<DisplayState>,
}

impl MemoryDisplays {
    pub fn new(displays: impl IntoIterator<Item = (DisplayId, TransferTable)>) -> Self {
        let this = Self::default();
        for (id, table) in displays {
            this.connect(id, table);
        }
        this
    }

    pub fn connect(&self, id: DisplayId, table: TransferTable) {
        let mut state = locked(&self.state);
        state.capacities.insert(id, table.len() as u32);
        state.tables.insert(id, table);
    }

    pub fn disconnect(&self, id: DisplayId) {
        let mut state = locked(&self.state);
        state.tables.remove(&id);
        state.capacities.remove(&id);
    }

    pub fn table(&self, id: DisplayId) -> Option<TransferTable> {
        locked(&self.state).tables.get(&id).cloned()
    }

    pub fn set_capacity(&self, id: DisplayId, capacity: u32) {
        locked(&self.state).capacities.insert(id, capacity);
    }

    pub fn fail_writes(&self, id: DisplayId) {
        locked(&self.state).failing_writes.insert(id);
    }

    pub fn fail_enumeration(&self, fail: bool) {
        locked(&self.state).fail_enumeration = fail;
    }

    /// Successful table writes so far.
    pub fn write_count(&self) -> usize {
        locked(&self.state).writes
    }
}

impl GammaDevice for MemoryDisplays {
    fn active_displays(&self) -> Result<Vec<DisplayId>> {
        let state = locked(&self.state);
        if state.fail_enumeration {
            return Err(Error::Internal("display list unavailable".into()));
        }
        Ok(state.tables.keys().copied().collect())
    }

    fn table_capacity(&self, display: DisplayId) -> Result<u32> {
        locked(&self.state)
            .capacities
            .get(&display)
            .copied()
            .ok_or_else(|| Error::DisplayQuery {
                display,
                message: "no such display".into(),
            })
    }

    fn read_table(&self, display: DisplayId, capacity: u32) -> Result<TransferTable> {
        let state = locked(&self.state);
        let table = state.tables.get(&display).ok_or_else(|| Error::DisplayQuery {
            display,
            message: "no such display".into(),
        })?;
        let len = table.len().min(capacity as usize);
        Ok(TransferTable {
            red: table.red[..len].to_vec(),
            green: table.green[..len].to_vec(),
            blue: table.blue[..len].to_vec(),
        })
    }

    fn write_table(&self, display: DisplayId, table: &TransferTable) -> Result<()> {
        let mut state = locked(&self.state);
        if state.failing_writes.contains(&display) || !state.tables.contains_key(&display) {
            return Err(Error::DisplayWrite {
                display,
                message: "injected write failure".into(),
            });
        }
        state.tables.insert(display, table.clone());
        state.writes += 1;
        Ok(())
    }
}

/// Preference store without a backing file
#[derive(Default)]
pub struct MemoryPreferences {
    prefs: Mutex<Preferences>,
}

impl MemoryPreferences {
    pub fn with_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefs: Mutex::new(Preferences {
                blocked_domains: domains.into_iter().map(Into::into).collect(),
                ..Preferences::default()
            }),
        }
    }

    pub fn flag(&self, feature: Feature) -> bool {
        locked(&self.prefs).desired(feature)
    }

    pub fn set_flag(&self, feature: Feature, on: bool) {
        locked(&self.prefs).set_desired(feature, on);
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferences {
    async fn desired(&self, feature: Feature) -> bool {
        self.flag(feature)
    }

    async fn set_desired(&self, feature: Feature, on: bool) -> std::io::Result<()> {
        self.set_flag(feature, on);
        Ok(())
    }

    async fn block_list(&self) -> BlockList {
        locked(&self.prefs).block_list()
    }
}

/// Standard PAC helper the rendered script relies on.
const PAC_HELPERS: &str = r#"
function dnsDomainIs(host, domain) {
  return host.length >= domain.length &&
    host.substring(host.length - domain.length) === domain;
}
"#;

/// Runs a rendered PAC script the way a browser would.
pub struct PacEngine {
    context: boa_engine::Context,
}

impl PacEngine {
    pub fn load(script: &str) -> Self {
        let mut context = boa_engine::Context::default();
        for source in [PAC_HELPERS, script] {
            context
                .eval(boa_engine::Source::from_bytes(source))
                .unwrap_or_else(|e| panic!("PAC script failed to load: {e}"));
        }
        Self { context }
    }

    /// The directive `FindProxyForURL` returns for `host`.
    pub fn directive_for(&mut self, host: &str) -> String {
        let host = serde_json::Value::from(host);
        let call = format!("FindProxyForURL(\"http://\" + {host} + \"/\", {host})");
        let value = self
            .context
            .eval(boa_engine::Source::from_bytes(&call))
            .unwrap_or_else(|e| panic!("FindProxyForURL threw: {e}"));
        value
            .to_string(&mut self.context)
            .unwrap_or_else(|e| panic!("non-string directive: {e}"))
            .to_std_string_escaped()
    }
}
