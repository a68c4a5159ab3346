//! Integration tests for hush
//!
//! These tests drive the public API end-to-end: preferences on disk, the
//! coordinator, both controllers and the audit log. External resources (the
//! elevation prompt, the network configuration store and display hardware)
//! are replaced with in-memory fakes, so no privileges are needed:
//! ```bash
//! cargo test --test integration_tests
//! ```

#![allow(clippy::uninlined_format_args)]

use async_trait::async_trait;
use hush::audit::AuditLog;
use hush::config::{JsonPreferences, PreferenceStore, load_preferences};
use hush::core::blocking::NetworkBlockController;
use hush::core::blocklist::{BlockList, render_script};
use hush::core::error::ConfigStage;
use hush::core::gamma::{DisplayGammaController, DisplayId, GammaDevice, TransferTable};
use hush::core::netconfig::{
    ConfigStore, NetworkService, ProtocolLayer, ProxySettings, auto_config_enabled,
    auto_config_url,
};
use hush::elevation::{AuthorizationBroker, Credential, ElevationError, Elevator};
use hush::validators::validate_new_domain;
use hush::{Error, Feature, StateCoordinator, SystemEvent, ToggleState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct GrantingElevator {
    prompts: Arc<AtomicUsize>,
}

#[async_trait]
impl Elevator for GrantingElevator {
    async fn elevate(&self) -> Result<Credential, ElevationError> {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        Ok(Credential::direct())
    }
}

/// Single-service store; both layers are tracked separately
#[derive(Default)]
struct FakeStore {
    locked: AtomicBool,
    fail_commit: AtomicBool,
    staged: Mutex<BTreeMap<ProtocolLayer, ProxySettings>>,
    live: Mutex<BTreeMap<ProtocolLayer, ProxySettings>>,
}

impl FakeStore {
    fn live(&self, layer: ProtocolLayer) -> ProxySettings {
        self.live.lock().unwrap().get(&layer).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ConfigStore for FakeStore {
    fn lock(&self, _credential: &Credential) -> hush::Result<()> {
        if self.locked.swap(true, Ordering::SeqCst) {
            return Err(Error::config(ConfigStage::Lock, "already locked"));
        }
        Ok(())
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn discard(&self) {
        self.staged.lock().unwrap().clear();
    }

    async fn services(&self) -> hush::Result<Vec<NetworkService>> {
        Ok(vec![NetworkService {
            id: "0".into(),
            name: "Wi-Fi".into(),
            enabled: true,
        }])
    }

    async fn proxies(
        &self,
        _service: &NetworkService,
        layer: ProtocolLayer,
    ) -> hush::Result<ProxySettings> {
        Ok(self.live(layer))
    }

    fn set_proxies(
        &self,
        _service: &NetworkService,
        layer: ProtocolLayer,
        settings: ProxySettings,
    ) -> hush::Result<()> {
        self.staged.lock().unwrap().insert(layer, settings);
        Ok(())
    }

    async fn commit(&self) -> hush::Result<()> {
        let staged = std::mem::take(&mut *self.staged.lock().unwrap());
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Error::config(ConfigStage::Commit, "rejected"));
        }
        self.live.lock().unwrap().extend(staged);
        Ok(())
    }

    async fn apply(&self) -> hush::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeDisplays {
    tables: Mutex<BTreeMap<DisplayId, TransferTable>>,
}

impl GammaDevice for FakeDisplays {
    fn active_displays(&self) -> hush::Result<Vec<DisplayId>> {
        Ok(self.tables.lock().unwrap().keys().copied().collect())
    }

    fn table_capacity(&self, display: DisplayId) -> hush::Result<u32> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(&display)
            .map_or(0, |t| t.len() as u32))
    }

    fn read_table(&self, display: DisplayId, _capacity: u32) -> hush::Result<TransferTable> {
        self.tables
            .lock()
            .unwrap()
            .get(&display)
            .cloned()
            .ok_or(Error::DisplayQuery {
                display,
                message: "gone".into(),
            })
    }

    fn write_table(&self, display: DisplayId, table: &TransferTable) -> hush::Result<()> {
        self.tables.lock().unwrap().insert(display, table.clone());
        Ok(())
    }
}

struct Setup {
    dir: tempfile::TempDir,
    prompts: Arc<AtomicUsize>,
    store: Arc<FakeStore>,
    displays: Arc<FakeDisplays>,
    prefs: Arc<JsonPreferences>,
    coordinator: StateCoordinator,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let prompts = Arc::new(AtomicUsize::new(0));
    let store = Arc::new(FakeStore::default());
    let displays = Arc::new(FakeDisplays::default());
    displays
        .tables
        .lock()
        .unwrap()
        .insert(1, TransferTable::identity(256));
    let prefs = Arc::new(JsonPreferences::open(dir.path().join("preferences.json")).await);

    let broker = Arc::new(AuthorizationBroker::new(Box::new(GrantingElevator {
        prompts: Arc::clone(&prompts),
    })));
    let coordinator = StateCoordinator::new(
        NetworkBlockController::new(broker, store.clone(), dir.path().join("proxy.pac")),
        Arc::new(DisplayGammaController::new(displays.clone())),
        prefs.clone(),
    )
    .with_audit(AuditLog::at(dir.path().join("audit.log")));

    Setup {
        dir,
        prompts,
        store,
        displays,
        prefs,
        coordinator,
    }
}

#[tokio::test]
async fn test_enable_blocking_end_to_end() {
    let s = setup().await;
    let domain = validate_new_domain("https://Example.com/", &[]).unwrap();
    s.prefs
        .update(|p| p.blocked_domains.push(domain))
        .await
        .unwrap();

    s.coordinator
        .request_activate(Feature::Blocking)
        .await
        .unwrap();

    assert_eq!(s.coordinator.state(Feature::Blocking), ToggleState::On);
    let script = std::fs::read_to_string(s.dir.path().join("proxy.pac")).unwrap();
    assert_eq!(script, render_script(&BlockList::new(["example.com"])));
    for layer in [ProtocolLayer::Ipv4, ProtocolLayer::Ipv6] {
        let live = s.store.live(layer);
        assert!(auto_config_enabled(&live));
        assert!(auto_config_url(&live).unwrap().ends_with("/proxy.pac"));
    }

    // Desired state reached the disk
    let on_disk = load_preferences(s.prefs.path()).await;
    assert!(on_disk.blocking_enabled);
    assert_eq!(on_disk.blocked_domains, vec!["example.com".to_string()]);
}

#[tokio::test]
async fn test_commit_failure_reverts_toggle_and_intent() {
    let s = setup().await;
    s.store.fail_commit.store(true, Ordering::SeqCst);

    let err = s
        .coordinator
        .request_activate(Feature::Blocking)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConfigAccess { .. }));
    assert!(err.translate().suggestions.len() >= 1);
    assert_eq!(s.coordinator.state(Feature::Blocking), ToggleState::Off);
    assert!(!s.prefs.desired(Feature::Blocking).await);
    assert!(!auto_config_enabled(&s.store.live(ProtocolLayer::Ipv4)));
    assert!(!s.store.locked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_disable_blocking_keeps_script_and_prompts_once() {
    let s = setup().await;
    s.coordinator
        .request_activate(Feature::Blocking)
        .await
        .unwrap();
    s.coordinator
        .request_deactivate(Feature::Blocking)
        .await
        .unwrap();

    let live = s.store.live(ProtocolLayer::Ipv6);
    assert!(!auto_config_enabled(&live));
    assert_eq!(auto_config_url(&live), None);
    assert!(s.dir.path().join("proxy.pac").exists());
    assert_eq!(s.prompts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_grayscale_survives_restart_via_replay() {
    let s = setup().await;
    s.prefs.set_desired(Feature::Grayscale, true).await.unwrap();

    // A fresh process reads the same preferences file
    let reopened = Arc::new(JsonPreferences::open(s.prefs.path()).await);
    let coordinator = StateCoordinator::new(
        NetworkBlockController::new(
            Arc::new(AuthorizationBroker::new(Box::new(GrantingElevator {
                prompts: Arc::clone(&s.prompts),
            }))),
            s.store.clone(),
            s.dir.path().join("proxy.pac"),
        ),
        Arc::new(DisplayGammaController::new(s.displays.clone())),
        reopened,
    );

    let failures = coordinator.handle_event(SystemEvent::Startup).await;

    assert!(failures.is_empty());
    assert_eq!(coordinator.state(Feature::Grayscale), ToggleState::On);
    assert_eq!(coordinator.state(Feature::Blocking), ToggleState::Off);
    let table = s.displays.tables.lock().unwrap()[&1].clone();
    assert_eq!(table.red, table.green);
    // No blocking replay means no prompt
    assert_eq!(s.prompts.load(Ordering::SeqCst), 0);

    coordinator.shutdown().await;
    assert_eq!(
        s.displays.tables.lock().unwrap()[&1],
        TransferTable::identity(256)
    );
}

#[tokio::test]
async fn test_audit_log_records_script_digest() {
    let s = setup().await;
    s.coordinator
        .request_activate(Feature::Blocking)
        .await
        .unwrap();

    let events = AuditLog::at(s.dir.path().join("audit.log"))
        .read_recent(1)
        .await
        .unwrap();
    let digest = events[0].details["script_sha256"].as_str().unwrap();
    assert_eq!(digest.len(), 64);
}
