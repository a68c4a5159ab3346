//! Display transfer tables and grayscale
//!
//! Grayscale is produced by replacing each display's red, green and blue
//! transfer curves with one luminance curve
//! (`0.299 r + 0.587 g + 0.114 b` per sample). The original curves are kept in
//! a per-display [`GammaSnapshot`] and written back verbatim on deactivation.
//!
//! A display has a snapshot exactly when its table currently differs from its
//! natural one because of hush. Failures are isolated per display: a display
//! that cannot be queried or written is reported and skipped, the rest are
//! still processed.

use crate::core::error::{Error, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub type DisplayId = u32;

/// Luminance weights applied per sample
pub const RED_WEIGHT: f32 = 0.299;
pub const GREEN_WEIGHT: f32 = 0.587;
pub const BLUE_WEIGHT: f32 = 0.114;

pub fn luminance(red: f32, green: f32, blue: f32) -> f32 {
    RED_WEIGHT * red + GREEN_WEIGHT * green + BLUE_WEIGHT * blue
}

/// Per-channel transfer curves of one display, normalized to `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct TransferTable {
    pub red: Vec<f32>,
    pub green: Vec<f32>,
    pub blue: Vec<f32>,
}

impl TransferTable {
    /// The same curve on all three channels.
    pub fn uniform(curve: Vec<f32>) -> Self {
        Self {
            red: curve.clone(),
            green: curve.clone(),
            blue: curve,
        }
    }

    /// A linear ramp of `samples` entries (the usual natural table).
    pub fn identity(samples: usize) -> Self {
        let last = samples.saturating_sub(1).max(1) as f32;
        Self::uniform((0..samples).map(|i| i as f32 / last).collect())
    }

    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }

    /// Collapses the three curves into one luminance curve on every channel.
    ///
    /// Channels of unequal length are truncated to the shortest.
    pub fn grayscale(&self) -> Self {
        let gray = self
            .red
            .iter()
            .zip(&self.green)
            .zip(&self.blue)
            .map(|((&r, &g), &b)| luminance(r, g, b))
            .collect();
        Self::uniform(gray)
    }
}

/// Original curves of a display captured before hush modified it
#[derive(Debug, Clone, PartialEq)]
pub struct GammaSnapshot {
    pub display_id: DisplayId,
    pub original: TransferTable,
}

/// Hardware access to display transfer tables.
///
/// Calls may block; the coordinator runs them on the blocking pool.
pub trait GammaDevice: Send + Sync {
    /// Currently active displays, queried fresh on every call.
    fn active_displays(&self) -> Result<Vec<DisplayId>>;

    /// Number of samples the display's table supports; zero means unsupported.
    fn table_capacity(&self, display: DisplayId) -> Result<u32>;

    fn read_table(&self, display: DisplayId, capacity: u32) -> Result<TransferTable>;

    fn write_table(&self, display: DisplayId, table: &TransferTable) -> Result<()>;
}

/// Backend for platforms without transfer-table support: no displays.
#[derive(Debug, Default)]
pub struct NoDisplays;

impl GammaDevice for NoDisplays {
    fn active_displays(&self) -> Result<Vec<DisplayId>> {
        Ok(Vec::new())
    }

    fn table_capacity(&self, display: DisplayId) -> Result<u32> {
        Err(unsupported(display))
    }

    fn read_table(&self, display: DisplayId, _capacity: u32) -> Result<TransferTable> {
        Err(unsupported(display))
    }

    fn write_table(&self, display: DisplayId, _table: &TransferTable) -> Result<()> {
        Err(unsupported(display))
    }
}

fn unsupported(display: DisplayId) -> Error {
    Error::DisplayQuery {
        display,
        message: "transfer tables are not supported on this platform".into(),
    }
}

/// Gamma backend for the current platform.
pub fn system_device() -> Arc<dyn GammaDevice> {
    #[cfg(target_os = "macos")]
    {
        Arc::new(crate::core::gamma_macos::MacDisplays)
    }

    #[cfg(not(target_os = "macos"))]
    {
        Arc::new(NoDisplays)
    }
}

/// Outcome of one grayscale pass across all displays
#[derive(Debug, Default)]
pub struct GrayscaleReport {
    /// Displays switched to grayscale by this pass
    pub applied: Vec<DisplayId>,
    /// Displays whose original curves were written back
    pub restored: Vec<DisplayId>,
    /// Displays already in grayscale, left untouched
    pub skipped: Vec<DisplayId>,
    /// Snapshots dropped because their display is no longer active
    pub released: Vec<DisplayId>,
    /// Per-display failures; the affected displays were skipped
    pub failures: Vec<Error>,
}

impl GrayscaleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "applied": self.applied,
            "restored": self.restored,
            "skipped": self.skipped,
            "released": self.released,
            "failures": self.failures.iter().map(ToString::to_string).collect::<Vec<_>>(),
        })
    }
}

type SnapshotMap = BTreeMap<DisplayId, GammaSnapshot>;

/// Captures, grays and restores display transfer tables.
pub struct DisplayGammaController {
    device: Arc<dyn GammaDevice>,
    snapshots: Mutex<SnapshotMap>,
}

impl DisplayGammaController {
    pub fn new(device: Arc<dyn GammaDevice>) -> Self {
        Self {
            device,
            snapshots: Mutex::new(BTreeMap::new()),
        }
    }

    fn snapshots(&self) -> MutexGuard<'_, SnapshotMap> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active displays, never cached.
    pub fn enumerate_active_displays(&self) -> Result<Vec<DisplayId>> {
        self.device.active_displays()
    }

    /// Displays currently held in grayscale.
    pub fn snapshotted_displays(&self) -> Vec<DisplayId> {
        self.snapshots().keys().copied().collect()
    }

    pub fn snapshot(&self, display: DisplayId) -> Option<GammaSnapshot> {
        self.snapshots().get(&display).cloned()
    }

    /// Switches every active display without a snapshot to grayscale.
    ///
    /// Snapshots of displays that are no longer active are dropped first: a
    /// display comes back from a disconnect with its natural table, so it is
    /// grayed again like a new one. Only fails when the display list itself
    /// cannot be obtained.
    pub fn activate_grayscale(&self) -> Result<GrayscaleReport> {
        // Held for the whole pass so topology events and toggles never interleave
        let mut snapshots = self.snapshots();
        let displays = self.device.active_displays()?;
        let mut report = GrayscaleReport {
            released: release_inactive(&mut snapshots, &displays),
            ..GrayscaleReport::default()
        };

        for id in displays {
            if snapshots.contains_key(&id) {
                report.skipped.push(id);
                continue;
            }

            match self.gray_display(id) {
                Ok(snapshot) => {
                    debug!("Display {id} switched to grayscale");
                    snapshots.insert(id, snapshot);
                    report.applied.push(id);
                }
                Err(e) => {
                    warn!("Skipping display {id}: {e}");
                    report.failures.push(e);
                }
            }
        }

        info!(
            "Grayscale pass: {} applied, {} skipped, {} released, {} failed",
            report.applied.len(),
            report.skipped.len(),
            report.released.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Captures the original table and writes the grayscale one.
    ///
    /// The snapshot is only returned when the write succeeded.
    fn gray_display(&self, display: DisplayId) -> Result<GammaSnapshot> {
        let capacity = self.device.table_capacity(display)?;
        if capacity == 0 {
            return Err(Error::DisplayQuery {
                display,
                message: "display has no transfer table".into(),
            });
        }

        let original = self.device.read_table(display, capacity)?;
        if original.is_empty() {
            return Err(Error::DisplayQuery {
                display,
                message: "display returned an empty transfer table".into(),
            });
        }

        self.device.write_table(display, &original.grayscale())?;
        Ok(GammaSnapshot {
            display_id: display,
            original,
        })
    }

    /// Restores every snapshotted display and clears the snapshot map.
    ///
    /// Displays that are no longer active are released without a write. If
    /// the display list is unavailable every snapshot is written back anyway.
    /// A failed restore is reported, not retried.
    pub fn deactivate_grayscale(&self) -> GrayscaleReport {
        let mut snapshots = self.snapshots();
        let mut report = GrayscaleReport::default();

        match self.device.active_displays() {
            Ok(displays) => report.released = release_inactive(&mut snapshots, &displays),
            Err(e) => warn!("Display list unavailable, restoring every snapshot: {e}"),
        }

        for (id, snapshot) in std::mem::take(&mut *snapshots) {
            match self.device.write_table(id, &snapshot.original) {
                Ok(()) => report.restored.push(id),
                Err(e) => {
                    warn!("Failed to restore display {id}: {e}");
                    report.failures.push(e);
                }
            }
        }

        info!(
            "Restored {} display(s), released {}, {} failed",
            report.restored.len(),
            report.released.len(),
            report.failures.len()
        );
        report
    }

    /// Reaction to a display topology change.
    ///
    /// Re-runs [`Self::activate_grayscale`] when grayscale is desired, which
    /// releases displays that went away, grays newly connected ones and
    /// skips those already gray.
    pub fn on_topology_change(&self, desired_on: bool) -> Result<Option<GrayscaleReport>> {
        if !desired_on {
            debug!("Display topology changed, grayscale not desired");
            return Ok(None);
        }
        self.activate_grayscale().map(Some)
    }
}

/// Drops snapshots of displays missing from `active`, returning their ids.
fn release_inactive(snapshots: &mut SnapshotMap, active: &[DisplayId]) -> Vec<DisplayId> {
    let gone: Vec<DisplayId> = snapshots
        .keys()
        .copied()
        .filter(|id| !active.contains(id))
        .collect();
    for id in &gone {
        debug!("Display {id} is no longer active, dropping its snapshot");
        snapshots.remove(id);
    }
    gone
}
