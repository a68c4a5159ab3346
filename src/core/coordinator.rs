//! Toggle state machines tying user intent to side effects
//!
//! Each feature runs the same machine:
//!
//! ```text
//! Off --enable--> Activating --ok--> On
//!                 Activating --err--> Failed --> Off
//! On --disable--> Deactivating --(ok or err)--> Off
//! ```
//!
//! `On` is only entered after the controller confirmed success. Operations on
//! one feature are totally ordered by a per-feature operation lock: user
//! requests arriving while one is in flight are rejected with
//! [`Error::Busy`], replays queue behind it. The two features never wait on
//! each other.
//!
//! Replay ([`StateCoordinator::handle_event`]) re-runs activation for every
//! feature whose durable desired flag is set. A failed replay forces the flag
//! off and reports once; a failed user activation restores the flag's
//! previous value.
//!
//! Entering `Failed` undoes what the feature still has in effect (a proxy
//! left enabled by rollback, displays still gray) before settling on `Off`,
//! unless that would need a new authorization prompt.

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::config::PreferenceStore;
use crate::core::blocking::NetworkBlockController;
use crate::core::error::{Error, Result};
use crate::core::gamma::{DisplayGammaController, GrayscaleReport};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Feature {
    Blocking,
    Grayscale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum ToggleState {
    #[default]
    Off,
    Activating,
    On,
    Deactivating,
    Failed,
}

/// External triggers that reapply desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SystemEvent {
    Startup,
    Wake,
    DisplaysChanged,
}

impl SystemEvent {
    /// Whether this trigger reapplies `feature`.
    pub fn replays(self, feature: Feature) -> bool {
        match self {
            Self::Startup | Self::Wake => true,
            Self::DisplaysChanged => feature == Feature::Grayscale,
        }
    }
}

/// Published on every state change
#[derive(Debug, Clone)]
pub struct Transition {
    pub feature: Feature,
    pub from: ToggleState,
    pub to: ToggleState,
    /// Error text when entering `Failed`
    pub message: Option<String>,
}

#[derive(Default)]
struct FeatureSlot {
    state: Mutex<ToggleState>,
    /// Held for the full duration of one activation or deactivation
    operation: tokio::sync::Mutex<()>,
}

pub struct StateCoordinator {
    blocking: NetworkBlockController,
    gamma: Arc<DisplayGammaController>,
    prefs: Arc<dyn PreferenceStore>,
    audit: Option<AuditLog>,
    blocking_slot: FeatureSlot,
    grayscale_slot: FeatureSlot,
    transitions: broadcast::Sender<Transition>,
}

impl StateCoordinator {
    pub fn new(
        blocking: NetworkBlockController,
        gamma: Arc<DisplayGammaController>,
        prefs: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (transitions, _) = broadcast::channel(64);
        Self {
            blocking,
            gamma,
            prefs,
            audit: None,
            blocking_slot: FeatureSlot::default(),
            grayscale_slot: FeatureSlot::default(),
            transitions,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn blocking(&self) -> &NetworkBlockController {
        &self.blocking
    }

    pub fn gamma(&self) -> &DisplayGammaController {
        &self.gamma
    }

    pub fn state(&self, feature: Feature) -> ToggleState {
        *self
            .slot(feature)
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Receives every transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    fn slot(&self, feature: Feature) -> &FeatureSlot {
        match feature {
            Feature::Blocking => &self.blocking_slot,
            Feature::Grayscale => &self.grayscale_slot,
        }
    }

    fn transition(&self, feature: Feature, to: ToggleState, message: Option<String>) {
        let from = {
            let mut state = self
                .slot(feature)
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        debug!("{feature}: {from} -> {to}");
        // No subscribers is fine
        let _ = self.transitions.send(Transition {
            feature,
            from,
            to,
            message,
        });
    }

    /// User request to turn `feature` on.
    ///
    /// Rejected with [`Error::Busy`] while another operation on the feature
    /// is in flight. On failure the feature ends `Off` and the desired flag
    /// returns to its previous value.
    pub async fn request_activate(&self, feature: Feature) -> Result<()> {
        let _operation = self
            .slot(feature)
            .operation
            .try_lock()
            .map_err(|_| Error::Busy(feature))?;

        if self.state(feature) == ToggleState::On {
            debug!("{feature} already on");
            return Ok(());
        }

        let op_id = Uuid::new_v4();
        info!(%op_id, "Enabling {feature}");
        let previous = self.prefs.desired(feature).await;
        self.persist_desired(feature, true).await;
        self.transition(feature, ToggleState::Activating, None);

        match self.activate_feature(feature).await {
            Ok(details) => {
                self.transition(feature, ToggleState::On, None);
                info!(%op_id, "{feature} enabled");
                self.audit(EventType::EnableFeature, feature, Ok(details))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(%op_id, "Enabling {feature} failed: {e}");
                self.fail(feature, &e).await;
                self.persist_desired(feature, previous).await;
                self.audit(EventType::EnableFeature, feature, Err(&e)).await;
                Err(e)
            }
        }
    }

    /// User request to turn `feature` off.
    ///
    /// Best effort: the feature always ends `Off`, a failure is still returned.
    pub async fn request_deactivate(&self, feature: Feature) -> Result<()> {
        let _operation = self
            .slot(feature)
            .operation
            .try_lock()
            .map_err(|_| Error::Busy(feature))?;

        let op_id = Uuid::new_v4();
        info!(%op_id, "Disabling {feature}");
        self.persist_desired(feature, false).await;
        self.transition(feature, ToggleState::Deactivating, None);

        let result = self.deactivate_feature(feature).await;
        self.transition(feature, ToggleState::Off, None);

        match result {
            Ok(details) => {
                info!(%op_id, "{feature} disabled");
                self.audit(EventType::DisableFeature, feature, Ok(details))
                    .await;
                Ok(())
            }
            Err(e) => {
                warn!(%op_id, "Disabling {feature} incomplete: {e}");
                self.audit(EventType::DisableFeature, feature, Err(&e))
                    .await;
                Err(e)
            }
        }
    }

    /// Single subscription point for external triggers.
    ///
    /// Reapplies every affected feature whose desired flag is set. Features
    /// replay concurrently; each failure is returned once and leaves that
    /// feature `Off` with its desired flag cleared.
    pub async fn handle_event(&self, event: SystemEvent) -> Vec<(Feature, Error)> {
        info!("Reapplying desired state after {event}");
        let replay = move |feature: Feature| async move {
            if !event.replays(feature) {
                return None;
            }
            self.replay(feature, event).await.err().map(|e| (feature, e))
        };

        let (blocking, grayscale) =
            tokio::join!(replay(Feature::Blocking), replay(Feature::Grayscale));
        blocking.into_iter().chain(grayscale).collect()
    }

    /// Reapplies one feature after its inputs changed (e.g. the block list).
    pub async fn reapply(&self, feature: Feature) -> Result<()> {
        self.replay(feature, SystemEvent::Startup).await
    }

    /// Restores display curves before the process exits.
    ///
    /// Runs whenever a display is still held in grayscale, whatever the
    /// toggle state. Desired flags are kept so the next start reapplies
    /// grayscale. Proxy settings outlive the process and are left as they are.
    pub async fn shutdown(&self) {
        let _operation = self.slot(Feature::Grayscale).operation.lock().await;
        if self.gamma.snapshotted_displays().is_empty() {
            debug!("No display in grayscale, nothing to restore");
            return;
        }

        self.transition(Feature::Grayscale, ToggleState::Deactivating, None);
        let gamma = Arc::clone(&self.gamma);
        match run_blocking(move || Ok(gamma.deactivate_grayscale())).await {
            Ok(report) => log_display_failures(&report),
            Err(e) => warn!("Restoring displays on shutdown failed: {e}"),
        }
        self.transition(Feature::Grayscale, ToggleState::Off, None);
    }

    async fn replay(&self, feature: Feature, event: SystemEvent) -> Result<()> {
        // Queue behind any in-flight operation
        let _operation = self.slot(feature).operation.lock().await;

        if !self.prefs.desired(feature).await {
            debug!("{feature} not desired, nothing to replay");
            return Ok(());
        }

        let was_on = self.state(feature) == ToggleState::On;
        if !was_on {
            self.transition(feature, ToggleState::Activating, None);
        }

        let result = match (feature, event) {
            (Feature::Grayscale, SystemEvent::DisplaysChanged) => {
                let gamma = Arc::clone(&self.gamma);
                run_blocking(move || gamma.on_topology_change(true))
                    .await
                    .map(|report| report.unwrap_or_default().summary())
            }
            _ => self.activate_feature(feature).await,
        };

        match result {
            Ok(mut details) => {
                if !was_on {
                    self.transition(feature, ToggleState::On, None);
                }
                details["trigger"] = serde_json::Value::from(event.to_string());
                self.audit(EventType::ReplayFeature, feature, Ok(details))
                    .await;
                Ok(())
            }
            Err(e) => {
                error!("Reapplying {feature} after {event} failed, turning it off: {e}");
                self.fail(feature, &e).await;
                self.persist_desired(feature, false).await;
                self.audit(EventType::ReplayFeature, feature, Err(&e)).await;
                Err(e)
            }
        }
    }

    /// Publishes `Failed`, undoes whatever the feature still has in effect,
    /// then settles on `Off`.
    ///
    /// Blocking is only undone with a credential already in hand; a failure
    /// to authorize never turns into a second prompt.
    async fn fail(&self, feature: Feature, err: &Error) {
        self.transition(feature, ToggleState::Failed, Some(err.to_string()));

        if feature == Feature::Blocking && !self.blocking.is_authorized() {
            debug!("Not authorized, leaving network settings as they are");
        } else if let Err(e) = self.deactivate_feature(feature).await {
            warn!("Undoing {feature} after failure incomplete: {e}");
        }

        self.transition(feature, ToggleState::Off, None);
    }

    async fn activate_feature(&self, feature: Feature) -> Result<serde_json::Value> {
        match feature {
            Feature::Blocking => {
                let domains = self.prefs.block_list().await;
                let summary = self.blocking.activate(&domains).await?;
                Ok(serde_json::json!({
                    "domains": domains.len(),
                    "services_updated": summary.services_updated,
                    "script_sha256": summary.digest,
                }))
            }
            Feature::Grayscale => {
                let gamma = Arc::clone(&self.gamma);
                let report = run_blocking(move || gamma.activate_grayscale()).await?;
                log_display_failures(&report);
                Ok(report.summary())
            }
        }
    }

    async fn deactivate_feature(&self, feature: Feature) -> Result<serde_json::Value> {
        match feature {
            Feature::Blocking => {
                let services_updated = self.blocking.deactivate().await?;
                Ok(serde_json::json!({ "services_updated": services_updated }))
            }
            Feature::Grayscale => {
                let gamma = Arc::clone(&self.gamma);
                let report = run_blocking(move || Ok(gamma.deactivate_grayscale())).await?;
                log_display_failures(&report);
                Ok(report.summary())
            }
        }
    }

    async fn persist_desired(&self, feature: Feature, on: bool) {
        if let Err(e) = self.prefs.set_desired(feature, on).await {
            warn!("Could not save desired state of {feature}: {e}");
        }
    }

    async fn audit(
        &self,
        event_type: EventType,
        feature: Feature,
        outcome: std::result::Result<serde_json::Value, &Error>,
    ) {
        let Some(audit) = &self.audit else {
            return;
        };
        let event = match outcome {
            Ok(details) => AuditEvent::new(event_type, feature, true, details, None),
            Err(e) => AuditEvent::new(
                event_type,
                feature,
                false,
                serde_json::json!({}),
                Some(e.to_string()),
            ),
        };
        audit.record(event).await;
    }
}

/// Runs display work on the blocking pool; gamma calls may stall.
async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("display task panicked: {e}")))?
}

fn log_display_failures(report: &GrayscaleReport) {
    for failure in &report.failures {
        warn!("{failure}");
    }
}
