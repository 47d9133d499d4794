//! The only entry point allowed to mutate device lock state.
//!
//! All mutations for a given device are serialized behind a per-device
//! async mutex, which is what upholds the single-outstanding-command
//! invariant; different devices proceed fully in parallel. The dispatcher
//! is also the sole translator of internal component failures into
//! caller-facing errors.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{info, warn};

use guardian_db::{Database, LogError};
use guardian_gateway::PresenceChannel;
use guardian_types::api::EmergencyDeviceResult;
use guardian_types::events::PresenceEvent;
use guardian_types::models::{CommandAction, CommandStatus, LockState, ReportedState};

use crate::interpreter::{CommandInterpreter, Interpretation, MIN_CONFIDENCE};
use crate::registry::{Admission, DeviceRegistry, RegistryError};

/// Ack timeout: long enough for mobile push latency, short enough that a
/// dashboard does not show "pending" forever.
const DEFAULT_ACK_TIMEOUT_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("{action:?} is not applicable to {device_id} in state {state:?}")]
    InvalidTransition {
        device_id: String,
        action: CommandAction,
        state: LockState,
    },

    #[error("{0:?} is family-wide and cannot target a single device")]
    FamilyScoped(CommandAction),

    #[error("command {0} not found")]
    CommandNotFound(i64),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("could not interpret command text")]
    Unintelligible,
}

impl From<RegistryError> for DispatchError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            RegistryError::InvalidTransition {
                device_id,
                action,
                state,
            } => Self::InvalidTransition {
                device_id,
                action,
                state,
            },
        }
    }
}

impl From<LogError> for DispatchError {
    fn from(e: LogError) -> Self {
        match e {
            LogError::NotFound(id) => Self::CommandNotFound(id),
            // AlreadyResolved is handled at the call sites that can see it
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}

/// Result of `issue`: either a new command, or nothing because the device
/// was already in the requested state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    Issued(i64),
    AlreadyInState,
}

impl IssueOutcome {
    pub fn command_id(&self) -> Option<i64> {
        match self {
            Self::Issued(id) => Some(*id),
            Self::AlreadyInState => None,
        }
    }
}

/// Result of `acknowledge`: `Duplicate` means the command was already
/// terminal and no event was re-published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied,
    Duplicate,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    db: Arc<Database>,
    registry: DeviceRegistry,
    channel: PresenceChannel,
    interpreter: Arc<dyn CommandInterpreter>,
    ack_timeout: Duration,

    /// Per-device serialization points. Entries are created on first use
    /// and kept for the process lifetime.
    device_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CommandDispatcher {
    pub fn new(
        db: Arc<Database>,
        registry: DeviceRegistry,
        channel: PresenceChannel,
        interpreter: Arc<dyn CommandInterpreter>,
    ) -> Self {
        Self::with_ack_timeout(
            db,
            registry,
            channel,
            interpreter,
            Duration::seconds(DEFAULT_ACK_TIMEOUT_SECS),
        )
    }

    pub fn with_ack_timeout(
        db: Arc<Database>,
        registry: DeviceRegistry,
        channel: PresenceChannel,
        interpreter: Arc<dyn CommandInterpreter>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                db,
                registry,
                channel,
                interpreter,
                ack_timeout,
                device_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.inner.registry
    }

    /// Register a device: durable row plus registry entry, both idempotent.
    pub async fn register_device(
        &self,
        device_id: &str,
        owner_member_id: &str,
        family_id: &str,
    ) -> Result<(), DispatchError> {
        {
            let device_id = device_id.to_string();
            let owner = owner_member_id.to_string();
            let family = family_id.to_string();
            self.blocking(move |db| db.upsert_device(&device_id, &owner, &family))
                .await?;
        }
        self.inner
            .registry
            .register(device_id, owner_member_id, family_id)
            .await;
        Ok(())
    }

    /// Issue a command against one device. Any still-unresolved predecessor
    /// is superseded first: the newest instruction always wins.
    ///
    /// Emergency actions are refused here: they only enter through
    /// `emergency_lockdown` / `emergency_release`, which keep the fan-out
    /// and the audit record together.
    pub async fn issue(
        &self,
        device_id: &str,
        action: CommandAction,
        issued_by: &str,
    ) -> Result<IssueOutcome, DispatchError> {
        if action.is_emergency() {
            return Err(DispatchError::FamilyScoped(action));
        }
        self.issue_for_device(device_id, action, issued_by).await
    }

    async fn issue_for_device(
        &self,
        device_id: &str,
        action: CommandAction,
        issued_by: &str,
    ) -> Result<IssueOutcome, DispatchError> {
        let lock = self.device_lock(device_id).await;
        let _guard = lock.lock().await;

        match self.inner.registry.admit(device_id, action).await? {
            Admission::AlreadyInState => {
                info!("{:?} for {} is a no-op, already in state", action, device_id);
                return Ok(IssueOutcome::AlreadyInState);
            }
            Admission::Proceed => {}
        }

        let now = Utc::now();
        let (superseded, command) = {
            let device_id = device_id.to_string();
            let issued_by = issued_by.to_string();
            self.blocking(move |db| {
                let superseded = match db.get_pending(&device_id)? {
                    Some(prev) => {
                        match db.mark_resolved(prev.command_id, CommandStatus::Superseded, now) {
                            Ok(()) => Some(prev.command_id),
                            Err(LogError::AlreadyResolved(_)) => None,
                            Err(e) => return Err(e),
                        }
                    }
                    None => None,
                };
                let id = db.append_command(&device_id, action, &issued_by, now)?;
                let command = db.get_command(id)?.ok_or(LogError::NotFound(id))?;
                Ok((superseded, command))
            })
            .await?
        };

        if let Some(prev) = superseded {
            info!(
                "command {} for {} superseded by {}",
                prev, device_id, command.command_id
            );
        }

        if let Err(e) = self.inner.registry.apply(&command).await {
            // Rejected after append (lost a race with deregistration):
            // void the record so the caller is never left with a dangling
            // issued command.
            let id = command.command_id;
            let _ = self
                .blocking(move |db| db.mark_resolved(id, CommandStatus::Superseded, Utc::now()))
                .await;
            return Err(e.into());
        }

        self.inner
            .channel
            .publish(&PresenceEvent::CommandIssued {
                device_id: device_id.to_string(),
                command_id: command.command_id,
                action,
                issued_by: issued_by.to_string(),
            })
            .await;

        Ok(IssueOutcome::Issued(command.command_id))
    }

    /// Close the loop on a command the device confirmed. Safe to retry:
    /// a duplicate ack is a no-op and publishes nothing.
    pub async fn acknowledge(
        &self,
        command_id: i64,
        reported: ReportedState,
    ) -> Result<AckOutcome, DispatchError> {
        let command = self
            .blocking(move |db| db.get_command(command_id))
            .await?
            .ok_or(DispatchError::CommandNotFound(command_id))?;

        let lock = self.device_lock(&command.device_id).await;
        let _guard = lock.lock().await;

        let now = Utc::now();
        let applied = self
            .blocking(move |db| {
                match db.mark_resolved(command_id, CommandStatus::Acknowledged, now) {
                    Ok(()) => Ok(true),
                    Err(LogError::AlreadyResolved(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;

        if !applied {
            return Ok(AckOutcome::Duplicate);
        }

        self.inner.registry.resolve(command_id, Some(reported)).await;

        self.inner
            .channel
            .publish(&PresenceEvent::CommandAcknowledged {
                command_id,
                device_id: command.device_id,
                result_state: reported.lock_state(),
            })
            .await;

        Ok(AckOutcome::Applied)
    }

    /// Periodic sweep: every issued command older than the ack timeout is
    /// expired and announced, so dashboards show "did not respond" instead
    /// of a command hanging in pending forever. Returns the expired ids.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<i64>, DispatchError> {
        let cutoff = now - self.inner.ack_timeout;
        let stale = self.blocking(move |db| db.stale_commands(cutoff)).await?;

        let mut expired = Vec::new();
        for command in stale {
            let lock = self.device_lock(&command.device_id).await;
            let _guard = lock.lock().await;

            let id = command.command_id;
            let applied = self
                .blocking(move |db| match db.mark_resolved(id, CommandStatus::Expired, now) {
                    Ok(()) => Ok(true),
                    Err(LogError::AlreadyResolved(_)) => Ok(false),
                    Err(e) => Err(e),
                })
                .await?;

            // Resolved between the scan and the lock: nothing to do
            if !applied {
                continue;
            }

            self.inner.registry.resolve(id, None).await;
            warn!("command {} for {} expired unacknowledged", id, command.device_id);

            self.inner
                .channel
                .publish(&PresenceEvent::CommandExpired {
                    command_id: id,
                    device_id: command.device_id.clone(),
                })
                .await;
            expired.push(id);
        }

        Ok(expired)
    }

    /// Family-wide lockdown: one independent per-device issue per device,
    /// so the single-outstanding invariant holds for each, plus a durable
    /// audit event. Per-device failures are reported, not fatal; offline
    /// devices pick the command up from pending replay on reconnect.
    pub async fn emergency_lockdown(
        &self,
        family_id: &str,
        issued_by: &str,
    ) -> Result<(i64, Vec<EmergencyDeviceResult>), DispatchError> {
        self.emergency_fan_out(family_id, CommandAction::EmergencyLockdown, issued_by)
            .await
    }

    /// Family-wide release, mirroring lockdown. Also closes out any open
    /// emergency audit records for the family.
    pub async fn emergency_release(
        &self,
        family_id: &str,
        issued_by: &str,
    ) -> Result<(i64, Vec<EmergencyDeviceResult>), DispatchError> {
        self.emergency_fan_out(family_id, CommandAction::EmergencyRelease, issued_by)
            .await
    }

    async fn emergency_fan_out(
        &self,
        family_id: &str,
        action: CommandAction,
        issued_by: &str,
    ) -> Result<(i64, Vec<EmergencyDeviceResult>), DispatchError> {
        let now = Utc::now();

        let device_ids = {
            let family = family_id.to_string();
            self.blocking(move |db| db.family_device_ids(&family)).await?
        };

        let event_id = {
            let family = family_id.to_string();
            let by = issued_by.to_string();
            self.blocking(move |db| {
                let id = db.record_emergency(&family, action, &by, now)?;
                if action == CommandAction::EmergencyRelease {
                    db.resolve_open_emergencies(&family, now)?;
                }
                Ok(id)
            })
            .await?
        };

        let mut results = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            match self.issue_for_device(&device_id, action, issued_by).await {
                Ok(outcome) => results.push(EmergencyDeviceResult {
                    device_id,
                    command_id: outcome.command_id(),
                    error: None,
                }),
                Err(e) => {
                    warn!("emergency {:?} failed for {}: {}", action, device_id, e);
                    results.push(EmergencyDeviceResult {
                        device_id,
                        command_id: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let event = match action {
            CommandAction::EmergencyLockdown => PresenceEvent::EmergencyLockdownActivated {
                event_id,
                family_id: family_id.to_string(),
            },
            _ => PresenceEvent::EmergencyReleased {
                event_id,
                family_id: family_id.to_string(),
            },
        };
        self.inner.channel.publish(&event).await;

        Ok((event_id, results))
    }

    /// Route free text through the opaque interpreter and act on it only
    /// when confident; anything else is declined with no side effect.
    pub async fn interpret_and_issue(
        &self,
        text: &str,
        issued_by: &str,
    ) -> Result<(Interpretation, IssueOutcome), DispatchError> {
        let interpretation = self.inner.interpreter.interpret(text);
        if interpretation.confidence < MIN_CONFIDENCE {
            return Err(DispatchError::Unintelligible);
        }
        let (Some(action), Some(device_id)) = (
            interpretation.action,
            interpretation.target_device_id.clone(),
        ) else {
            return Err(DispatchError::Unintelligible);
        };

        let outcome = self.issue(&device_id, action, issued_by).await?;
        Ok((interpretation, outcome))
    }

    async fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.inner.device_locks.lock().await;
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run a storage closure off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&Database) -> Result<T, LogError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.inner.db.clone();
        task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| DispatchError::StorageUnavailable(format!("task join error: {}", e)))?
            .map_err(DispatchError::from)
    }
}

/// Rebuild the registry after a restart: registered devices come from the
/// devices table, outstanding commands are replayed from the log. All
/// devices start offline until their next heartbeat.
pub async fn bootstrap_registry(db: Arc<Database>) -> Result<DeviceRegistry, DispatchError> {
    let (devices, pending) = task::spawn_blocking(move || {
        let devices = db.list_devices()?;
        let pending = db.pending_commands()?;
        Ok::<_, LogError>((devices, pending))
    })
    .await
    .map_err(|e| DispatchError::StorageUnavailable(format!("task join error: {}", e)))??;

    let registry = DeviceRegistry::new();
    for row in &devices {
        registry
            .register(&row.id, &row.owner_member_id, &row.family_id)
            .await;
    }
    for command in &pending {
        if let Err(e) = registry.apply(command).await {
            warn!("pending command {} has no device: {}", command.command_id, e);
        }
    }

    info!(
        "registry restored: {} device(s), {} pending command(s)",
        devices.len(),
        pending.len()
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardian_types::events::ObserverRole;
    use guardian_types::models::Connectivity;
    use tokio::sync::mpsc;

    use crate::interpreter::KeywordInterpreter;

    fn harness() -> (CommandDispatcher, Arc<Database>, PresenceChannel) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let registry = DeviceRegistry::new();
        let channel = PresenceChannel::new();
        let dispatcher = CommandDispatcher::new(
            db.clone(),
            registry,
            channel.clone(),
            Arc::new(KeywordInterpreter),
        );
        (dispatcher, db, channel)
    }

    async fn online_device(dispatcher: &CommandDispatcher, device_id: &str) {
        dispatcher
            .register_device(device_id, "member-1", "fam-1")
            .await
            .unwrap();
        dispatcher
            .registry()
            .heartbeat(device_id, ReportedState::Unlocked, Utc::now())
            .await
            .unwrap();
    }

    /// Drain the Welcome and return the live receiver.
    async fn observe(channel: &PresenceChannel) -> mpsc::Receiver<PresenceEvent> {
        let (_, mut rx) = channel.connect(ObserverRole::Dashboard, None).await;
        rx.recv().await.unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<PresenceEvent>) -> Vec<PresenceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn rapid_commands_supersede_older_pending() {
        let (dispatcher, db, _) = harness();
        online_device(&dispatcher, "dev-1").await;

        let first = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();
        let second = dispatcher
            .issue("dev-1", CommandAction::Unlock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();

        assert_eq!(
            db.get_command(first).unwrap().unwrap().status,
            CommandStatus::Superseded
        );
        let pending = db.get_pending("dev-1").unwrap().unwrap();
        assert_eq!(pending.command_id, second);

        let device = dispatcher.registry().get("dev-1").await.unwrap();
        assert_eq!(device.pending_command_id, Some(second));
        assert_eq!(device.lock_state, LockState::PendingUnlock);
    }

    #[tokio::test]
    async fn duplicate_ack_publishes_nothing() {
        let (dispatcher, _, channel) = harness();
        online_device(&dispatcher, "dev-1").await;

        let id = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();

        let mut rx = observe(&channel).await;

        assert_eq!(
            dispatcher.acknowledge(id, ReportedState::Locked).await.unwrap(),
            AckOutcome::Applied
        );
        assert_eq!(
            dispatcher.acknowledge(id, ReportedState::Locked).await.unwrap(),
            AckOutcome::Duplicate
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            PresenceEvent::CommandAcknowledged { command_id, .. } if command_id == id
        ));
    }

    #[tokio::test]
    async fn unacknowledged_command_expires_exactly_once() {
        let (dispatcher, db, channel) = harness();
        online_device(&dispatcher, "dev-1").await;

        let id = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();

        let mut rx = observe(&channel).await;

        // Not yet past the timeout window
        let soon = Utc::now() + Duration::seconds(5);
        assert!(dispatcher.expire_stale(soon).await.unwrap().is_empty());

        let later = Utc::now() + Duration::seconds(60);
        assert_eq!(dispatcher.expire_stale(later).await.unwrap(), vec![id]);
        // Second sweep finds nothing
        assert!(dispatcher.expire_stale(later).await.unwrap().is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PresenceEvent::CommandExpired { command_id, .. } if command_id == id));

        assert_eq!(
            db.get_command(id).unwrap().unwrap().status,
            CommandStatus::Expired
        );
        let device = dispatcher.registry().get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::Unlocked);
        assert_eq!(device.pending_command_id, None);

        // A stale ack after expiry is a duplicate, not a state change
        assert_eq!(
            dispatcher.acknowledge(id, ReportedState::Locked).await.unwrap(),
            AckOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn lock_ack_lock_scenario() {
        let (dispatcher, _, channel) = harness();
        online_device(&dispatcher, "dev-1").await;
        let mut rx = observe(&channel).await;

        let id = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();

        let device = dispatcher.registry().get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::PendingLock);
        assert_eq!(device.pending_command_id, Some(id));

        dispatcher.acknowledge(id, ReportedState::Locked).await.unwrap();

        let device = dispatcher.registry().get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::Locked);
        assert_eq!(device.pending_command_id, None);

        // Locking an already-locked device: no-op success, no new command,
        // no superfluous event
        let outcome = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap();
        assert_eq!(outcome, IssueOutcome::AlreadyInState);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PresenceEvent::CommandIssued { .. }));
        assert!(matches!(events[1], PresenceEvent::CommandAcknowledged { .. }));
    }

    #[tokio::test]
    async fn unknown_device_and_command_are_typed_errors() {
        let (dispatcher, _, _) = harness();

        let err = dispatcher
            .issue("ghost", CommandAction::Lock, "parent")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeviceNotFound(_)));

        let err = dispatcher
            .acknowledge(42, ReportedState::Locked)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::CommandNotFound(42)));
    }

    #[tokio::test]
    async fn lockdown_fans_out_to_offline_devices_too() {
        let (dispatcher, db, channel) = harness();
        online_device(&dispatcher, "dev-1").await;
        // dev-2 never heartbeats: offline at issuance time
        dispatcher
            .register_device("dev-2", "member-2", "fam-1")
            .await
            .unwrap();

        let mut rx = observe(&channel).await;

        let (event_id, results) = dispatcher
            .emergency_lockdown("fam-1", "parent")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.error.is_none()));

        for device_id in ["dev-1", "dev-2"] {
            let device = dispatcher.registry().get(device_id).await.unwrap();
            assert_eq!(device.lock_state, LockState::PendingLock);
            // The offline device's command waits in the log for replay on
            // its next connect
            assert!(db.get_pending(device_id).unwrap().is_some());
        }
        assert_eq!(
            dispatcher.registry().get("dev-2").await.unwrap().connectivity,
            Connectivity::Offline
        );

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(
            events[2],
            PresenceEvent::EmergencyLockdownActivated { event_id: e, .. } if e == event_id
        ));

        let audit = db.family_emergencies("fam-1", 10).unwrap();
        assert_eq!(audit.len(), 1);
        assert!(audit[0].resolved_at.is_none());
    }

    #[tokio::test]
    async fn ordinary_lock_rejected_during_lockdown_until_release() {
        let (dispatcher, db, _) = harness();
        online_device(&dispatcher, "dev-1").await;

        dispatcher.emergency_lockdown("fam-1", "parent").await.unwrap();

        let err = dispatcher
            .issue("dev-1", CommandAction::Unlock, "parent")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition { .. }));

        let (_, results) = dispatcher.emergency_release("fam-1", "parent").await.unwrap();
        assert!(results[0].command_id.is_some());

        let device = dispatcher.registry().get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::PendingUnlock);

        // Release closes the open lockdown audit record
        let audit = db.family_emergencies("fam-1", 10).unwrap();
        assert!(audit.iter().all(|e| e.resolved_at.is_some()));
    }

    #[tokio::test]
    async fn emergency_actions_refused_on_the_per_device_path() {
        let (dispatcher, db, _) = harness();
        online_device(&dispatcher, "dev-1").await;

        // A single-device lockdown would skip the family audit record and
        // leave the device stuck behind the lockdown admission rule
        let err = dispatcher
            .issue("dev-1", CommandAction::EmergencyLockdown, "parent")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::FamilyScoped(CommandAction::EmergencyLockdown)
        ));
        assert!(db.get_pending("dev-1").unwrap().is_none());
        assert!(db.family_emergencies("fam-1", 10).unwrap().is_empty());

        // The interpreter path goes through the same guard
        let err = dispatcher
            .interpret_and_issue("lockdown device dev-1", "parent")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::FamilyScoped(_)));

        // Device is not trapped: ordinary commands still admitted
        let outcome = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap();
        assert!(outcome.command_id().is_some());
    }

    #[tokio::test]
    async fn restart_replays_pending_state() {
        let (dispatcher, db, _) = harness();
        online_device(&dispatcher, "dev-1").await;

        let id = dispatcher
            .issue("dev-1", CommandAction::Lock, "parent")
            .await
            .unwrap()
            .command_id()
            .unwrap();

        // Fresh registry from the same storage, as after a process restart
        let restored = bootstrap_registry(db).await.unwrap();
        let device = restored.get("dev-1").await.unwrap();
        assert_eq!(device.lock_state, LockState::PendingLock);
        assert_eq!(device.pending_command_id, Some(id));
        assert_eq!(device.connectivity, Connectivity::Offline);
    }

    #[tokio::test]
    async fn interpreter_declines_low_confidence() {
        let (dispatcher, _, _) = harness();
        online_device(&dispatcher, "dev-1").await;

        let err = dispatcher
            .interpret_and_issue("what a lovely day", "parent")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Unintelligible));

        let (interpretation, outcome) = dispatcher
            .interpret_and_issue("lock device dev-1", "parent")
            .await
            .unwrap();
        assert_eq!(interpretation.action, Some(CommandAction::Lock));
        assert!(outcome.command_id().is_some());
    }
}
