//! Authoritative in-memory view of every known device's last-known state.
//!
//! The registry is a cache: devices are the ground truth for lock state,
//! and heartbeats reconcile any divergence left by missed commands or
//! restarts. Mutation goes exclusively through `CommandDispatcher`, the
//! heartbeat path and the offline sweep; `snapshot`/`get` hand out clones,
//! never references into the map.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use guardian_types::models::{
    Command, CommandAction, Connectivity, Device, LockState, ReportedState,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("{action:?} is not applicable to {device_id} in state {state:?}")]
    InvalidTransition {
        device_id: String,
        action: CommandAction,
        state: LockState,
    },
}

/// Outcome of an admission check. `AlreadyInState` means the command would
/// be a no-op and must not be appended or broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    AlreadyInState,
}

#[derive(Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<RwLock<HashMap<String, Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent upsert: a new device starts unlocked and offline, an
    /// existing one is left untouched.
    pub async fn register(&self, device_id: &str, owner_member_id: &str, family_id: &str) {
        let mut devices = self.devices.write().await;
        if devices.contains_key(device_id) {
            return;
        }
        devices.insert(
            device_id.to_string(),
            Device {
                device_id: device_id.to_string(),
                owner_member_id: owner_member_id.to_string(),
                family_id: family_id.to_string(),
                lock_state: LockState::Unlocked,
                connectivity: Connectivity::Offline,
                last_seen_at: None,
                pending_command_id: None,
                pending_action: None,
            },
        );
        info!("device {} registered", device_id);
    }

    /// Record a liveness/state report. With no command outstanding, a
    /// conflicting reported state wins over the cached one.
    pub async fn heartbeat(
        &self,
        device_id: &str,
        reported: ReportedState,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.to_string()))?;

        device.last_seen_at = Some(now);
        device.connectivity = Connectivity::Online;

        if device.pending_command_id.is_none() && device.lock_state != reported.lock_state() {
            info!(
                "device {} reconciled {:?} -> {:?} from heartbeat",
                device_id,
                device.lock_state,
                reported.lock_state()
            );
            device.lock_state = reported.lock_state();
        }

        Ok(())
    }

    /// Check whether an action may be issued against the device's current
    /// state. Called under the dispatcher's per-device lock, so the answer
    /// stays valid until the matching `apply`.
    pub async fn admit(
        &self,
        device_id: &str,
        action: CommandAction,
    ) -> Result<Admission, RegistryError> {
        let devices = self.devices.read().await;
        let device = devices
            .get(device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(device_id.to_string()))?;

        // An active lockdown must be explicitly released before ordinary
        // commands apply
        if device.pending_action == Some(CommandAction::EmergencyLockdown)
            && action != CommandAction::EmergencyRelease
        {
            return Err(RegistryError::InvalidTransition {
                device_id: device_id.to_string(),
                action,
                state: device.lock_state,
            });
        }

        if device.pending_command_id.is_none() {
            let already = match action {
                CommandAction::Lock | CommandAction::EmergencyLockdown => {
                    device.lock_state == LockState::Locked
                }
                CommandAction::Unlock | CommandAction::EmergencyRelease => {
                    device.lock_state == LockState::Unlocked
                }
                CommandAction::Locate => false,
            };
            if already {
                return Ok(Admission::AlreadyInState);
            }
        }

        Ok(Admission::Proceed)
    }

    /// Make a freshly appended command the device's outstanding one. A
    /// superseded predecessor is simply overwritten.
    pub async fn apply(&self, command: &Command) -> Result<(), RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(&command.device_id)
            .ok_or_else(|| RegistryError::DeviceNotFound(command.device_id.clone()))?;

        device.pending_command_id = Some(command.command_id);
        device.pending_action = Some(command.action);
        if let Some(pending) = command.action.pending_state() {
            device.lock_state = pending;
        }

        Ok(())
    }

    /// Clear the outstanding command if it matches `command_id` and settle
    /// the lock state. `Some(reported)` adopts the device's own report;
    /// `None` (expiry, outcome unknown) falls back to the concrete state
    /// the pending variant came from — the next heartbeat tells the truth.
    pub async fn resolve(&self, command_id: i64, outcome: Option<ReportedState>) {
        let mut devices = self.devices.write().await;
        let Some(device) = devices
            .values_mut()
            .find(|d| d.pending_command_id == Some(command_id))
        else {
            debug!("resolve for {} matched no pending device", command_id);
            return;
        };

        device.pending_command_id = None;
        device.pending_action = None;
        device.lock_state = match outcome {
            Some(reported) => reported.lock_state(),
            None => match device.lock_state {
                LockState::PendingLock => LockState::Unlocked,
                LockState::PendingUnlock => LockState::Locked,
                concrete => concrete,
            },
        };
    }

    pub async fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Point-in-time view, optionally scoped to one family. Sorted by
    /// device id so snapshots are stable.
    pub async fn snapshot(&self, family_id: Option<&str>) -> Vec<Device> {
        let devices = self.devices.read().await;
        let mut out: Vec<Device> = devices
            .values()
            .filter(|d| family_id.is_none_or(|f| d.family_id == f))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        out
    }

    /// Timer-driven transition to offline for devices whose last heartbeat
    /// is older than the staleness threshold. Returns the ids swept.
    pub async fn sweep_offline(&self, staleness: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut devices = self.devices.write().await;
        let mut swept = Vec::new();

        for device in devices.values_mut() {
            if device.connectivity == Connectivity::Offline {
                continue;
            }
            let stale = match device.last_seen_at {
                Some(seen) => now - seen > staleness,
                None => true,
            };
            if stale {
                device.connectivity = Connectivity::Offline;
                swept.push(device.device_id.clone());
            }
        }

        if !swept.is_empty() {
            info!("offline sweep: {} device(s) went stale", swept.len());
        }
        swept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(device_id: &str) -> DeviceRegistry {
        let registry = DeviceRegistry::new();
        registry.register(device_id, "member-1", "fam-1").await;
        registry
    }

    fn command(id: i64, device_id: &str, action: CommandAction) -> Command {
        Command {
            command_id: id,
            device_id: device_id.to_string(),
            action,
            issued_by: "parent".to_string(),
            issued_at: Utc::now(),
            status: guardian_types::models::CommandStatus::Issued,
            resolved_at: None,
        }
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = registry_with("dev-1").await;
        registry
            .heartbeat("dev-1", ReportedState::Locked, Utc::now())
            .await
            .unwrap();

        // Re-registering leaves the reconciled state alone
        registry.register("dev-1", "member-9", "fam-9").await;
        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.owner_member_id, "member-1");
        assert_eq!(device.lock_state, LockState::Locked);
    }

    #[tokio::test]
    async fn heartbeat_reconciles_when_no_command_pending() {
        let registry = registry_with("dev-1").await;

        registry
            .heartbeat("dev-1", ReportedState::Locked, Utc::now())
            .await
            .unwrap();

        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::Locked);
        assert_eq!(device.connectivity, Connectivity::Online);
        assert!(device.last_seen_at.is_some());
    }

    #[tokio::test]
    async fn heartbeat_does_not_override_pending_state() {
        let registry = registry_with("dev-1").await;
        registry
            .apply(&command(1, "dev-1", CommandAction::Lock))
            .await
            .unwrap();

        registry
            .heartbeat("dev-1", ReportedState::Unlocked, Utc::now())
            .await
            .unwrap();

        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::PendingLock);
        assert_eq!(device.pending_command_id, Some(1));
    }

    #[tokio::test]
    async fn lock_on_locked_device_is_noop() {
        let registry = registry_with("dev-1").await;
        registry
            .heartbeat("dev-1", ReportedState::Locked, Utc::now())
            .await
            .unwrap();

        let admission = registry.admit("dev-1", CommandAction::Lock).await.unwrap();
        assert_eq!(admission, Admission::AlreadyInState);
    }

    #[tokio::test]
    async fn ordinary_commands_rejected_under_pending_lockdown() {
        let registry = registry_with("dev-1").await;
        registry
            .apply(&command(1, "dev-1", CommandAction::EmergencyLockdown))
            .await
            .unwrap();

        let err = registry.admit("dev-1", CommandAction::Unlock).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        // Release is the one allowed way out
        let admission = registry
            .admit("dev-1", CommandAction::EmergencyRelease)
            .await
            .unwrap();
        assert_eq!(admission, Admission::Proceed);
    }

    #[tokio::test]
    async fn resolve_with_report_adopts_reported_state() {
        let registry = registry_with("dev-1").await;
        registry
            .apply(&command(7, "dev-1", CommandAction::Lock))
            .await
            .unwrap();

        registry.resolve(7, Some(ReportedState::Locked)).await;

        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::Locked);
        assert_eq!(device.pending_command_id, None);
        assert_eq!(device.pending_action, None);
    }

    #[tokio::test]
    async fn resolve_with_unknown_outcome_reverts_pending() {
        let registry = registry_with("dev-1").await;
        registry
            .apply(&command(7, "dev-1", CommandAction::Lock))
            .await
            .unwrap();

        registry.resolve(7, None).await;

        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::Unlocked);
        assert_eq!(device.pending_command_id, None);
    }

    #[tokio::test]
    async fn resolve_ignores_stale_command_id() {
        let registry = registry_with("dev-1").await;
        registry
            .apply(&command(7, "dev-1", CommandAction::Lock))
            .await
            .unwrap();

        // An ack for a superseded command must not clear the newer one
        registry.resolve(3, Some(ReportedState::Unlocked)).await;

        let device = registry.get("dev-1").await.unwrap();
        assert_eq!(device.pending_command_id, Some(7));
        assert_eq!(device.lock_state, LockState::PendingLock);
    }

    #[tokio::test]
    async fn offline_sweep_marks_stale_devices() {
        let registry = registry_with("dev-1").await;
        registry.register("dev-2", "member-2", "fam-1").await;

        let old = Utc::now() - Duration::seconds(300);
        registry.heartbeat("dev-1", ReportedState::Unlocked, old).await.unwrap();
        registry
            .heartbeat("dev-2", ReportedState::Unlocked, Utc::now())
            .await
            .unwrap();

        let swept = registry.sweep_offline(Duration::seconds(90), Utc::now()).await;
        assert_eq!(swept, vec!["dev-1".to_string()]);

        assert_eq!(
            registry.get("dev-1").await.unwrap().connectivity,
            Connectivity::Offline
        );
        assert_eq!(
            registry.get("dev-2").await.unwrap().connectivity,
            Connectivity::Online
        );
    }

    #[tokio::test]
    async fn snapshot_scopes_by_family() {
        let registry = registry_with("dev-1").await;
        registry.register("dev-2", "member-2", "fam-2").await;

        assert_eq!(registry.snapshot(None).await.len(), 2);

        let fam1 = registry.snapshot(Some("fam-1")).await;
        assert_eq!(fam1.len(), 1);
        assert_eq!(fam1[0].device_id, "dev-1");
    }
}
