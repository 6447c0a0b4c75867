use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use medguard_core::{
    decode_identifier, escalation_due, reminder_due, sanitize_identifier, AlertKey, AlertStatus,
    Contact, CoreError, Reminder, SosAlert,
};
use medguard_store_sqlite::{AlertStore, ConfirmOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// How many of the newest alerts the recency-based resolver strategies scan.
pub const RECENT_SCAN_LIMIT: usize = 50;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
}

/// Push delivery boundary. The contract is at-least-once *attempt*: a send
/// error is reported to the caller for logging and then abandoned. There is
/// no retry and no delivery confirmation; callers must not assume stronger
/// guarantees.
pub trait PushGateway: Send + Sync {
    /// Deliver one notification to one device token.
    ///
    /// # Errors
    /// Returns an error when the transport rejects or cannot reach the
    /// device; the attempt is not repeated.
    fn send(&self, message: &PushMessage) -> Result<()>;
}

/// JSON-over-HTTP push transport (the hosted messaging relay).
pub struct HttpPushGateway {
    endpoint: String,
    agent: ureq::Agent,
}

impl HttpPushGateway {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(std::time::Duration::from_secs(10))
                .build(),
        }
    }
}

impl PushGateway for HttpPushGateway {
    fn send(&self, message: &PushMessage) -> Result<()> {
        self.agent
            .post(&self.endpoint)
            .send_json(serde_json::json!({
                "token": message.token,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
            }))
            .with_context(|| format!("push endpoint {} rejected dispatch", self.endpoint))?;
        Ok(())
    }
}

/// The in-memory pending-reminder collection. Owned by the scheduler; the
/// raw container is never exposed. `add` and `remove_due` serialize against
/// each other, so a submission arriving mid-tick lands in this pass or the
/// next, never nowhere. Contents do not survive a restart.
#[derive(Default)]
pub struct ReminderQueue {
    entries: Mutex<Vec<Reminder>>,
}

impl ReminderQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, reminder: Reminder) {
        self.entries.lock().push(reminder);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Atomically remove and return every reminder due at `now`. Entries
    /// outside their grace window stay queued; entries whose window has
    /// passed entirely are kept too, dormant until a future listed date.
    pub fn remove_due(&self, now: OffsetDateTime) -> Vec<Reminder> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        let mut remaining = Vec::with_capacity(entries.len());
        for reminder in entries.drain(..) {
            if reminder_due(&reminder, now) {
                due.push(reminder);
            } else {
                remaining.push(reminder);
            }
        }
        *entries = remaining;
        due
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SubmitOutcome {
    SentImmediately,
    Scheduled,
}

/// One emergency contact in an alert-creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CreateContact {
    pub name: String,
    pub phone: String,
}

/// Alert-creation payload from the mobile client flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateAlertRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub call_scheduled_at: Option<OffsetDateTime>,
    pub contacts: Vec<CreateContact>,
}

/// Ordered identifier-resolution fallback. Earlier strategies are higher
/// confidence and cheaper; the first match wins.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LookupStrategy {
    /// Point lookup by the collection's native document key.
    NativeKey,
    /// Equality lookup on the stored `id` field.
    IdField,
    /// Case-insensitive match on key or `id` over the newest alerts.
    RecentCaseInsensitive,
    /// Last resort: the newest active alert that has the contact index at all.
    ContactIndexRescue,
}

pub const LOOKUP_ORDER: [LookupStrategy; 4] = [
    LookupStrategy::NativeKey,
    LookupStrategy::IdField,
    LookupStrategy::RecentCaseInsensitive,
    LookupStrategy::ContactIndexRescue,
];

impl LookupStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NativeKey => "native_key",
            Self::IdField => "id_field",
            Self::RecentCaseInsensitive => "recent_case_insensitive",
            Self::ContactIndexRescue => "contact_index_rescue",
        }
    }

    fn apply(
        self,
        store: &AlertStore,
        identifier: &str,
        contact_index: &str,
    ) -> Result<Option<AlertKey>> {
        match self {
            Self::NativeKey => Ok(store.get_by_key(identifier)?.map(|alert| alert.key)),
            Self::IdField => Ok(store.find_by_id_field(identifier)?.map(|alert| alert.key)),
            Self::RecentCaseInsensitive => {
                let recent = store.recent(RECENT_SCAN_LIMIT)?;
                Ok(recent
                    .into_iter()
                    .find(|alert| {
                        alert.key.as_str().eq_ignore_ascii_case(identifier)
                            || alert.id.eq_ignore_ascii_case(identifier)
                    })
                    .map(|alert| alert.key))
            }
            Self::ContactIndexRescue => {
                let recent = store.recent(RECENT_SCAN_LIMIT)?;
                Ok(recent
                    .into_iter()
                    .filter(|alert| alert.status == AlertStatus::Active)
                    .find(|alert| alert.contacts.contains_key(contact_index))
                    .map(|alert| alert.key))
            }
        }
    }
}

/// A successfully resolved and applied confirmation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Confirmation {
    pub alert_key: AlertKey,
    pub contact_index: String,
    pub already_confirmed: bool,
    pub strategy: LookupStrategy,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveFailure {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("no matching alert for the supplied identifier")]
    NotFound,
    #[error("store error: {0}")]
    Internal(String),
}

/// Facade over the reminder scheduler, the escalation engine, and the
/// confirmation resolver. Cheap to clone; the queue and gateway are shared.
#[derive(Clone)]
pub struct SafetyApi {
    db_path: PathBuf,
    queue: Arc<ReminderQueue>,
    gateway: Arc<dyn PushGateway>,
}

impl SafetyApi {
    #[must_use]
    pub fn new(db_path: PathBuf, gateway: Arc<dyn PushGateway>) -> Self {
        Self { db_path, queue: Arc::new(ReminderQueue::new()), gateway }
    }

    fn open_store(&self) -> Result<AlertStore> {
        let store = AlertStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Accept one reminder submission. When the reminder is already inside
    /// its grace window it is dispatched on the spot and never enqueued, so
    /// the first scheduler tick cannot miss it.
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] for missing or malformed fields;
    /// nothing is enqueued in that case.
    pub fn submit_reminder(
        &self,
        token: &str,
        dates: &[String],
        reminder_time: &str,
        now: OffsetDateTime,
    ) -> Result<SubmitOutcome, CoreError> {
        let reminder = Reminder::new(token, dates, reminder_time)?;
        if reminder_due(&reminder, now) {
            self.dispatch(&reminder);
            return Ok(SubmitOutcome::SentImmediately);
        }
        self.queue.add(reminder);
        Ok(SubmitOutcome::Scheduled)
    }

    /// One reminder-scheduler pass: due entries leave the queue first, then
    /// each is dispatched. Removal never waits on the transport, so a slow
    /// or failing send cannot re-queue or re-send anything. Returns the
    /// number of dispatch attempts.
    pub fn reminder_tick(&self, now: OffsetDateTime) -> usize {
        let due = self.queue.remove_due(now);
        if due.is_empty() {
            tracing::debug!("reminder tick: nothing due");
            return 0;
        }
        let count = due.len();
        for reminder in &due {
            self.dispatch(reminder);
        }
        count
    }

    fn dispatch(&self, reminder: &Reminder) {
        let message = PushMessage {
            token: reminder.token.clone(),
            title: "\u{1f48a} Medication reminder".to_string(),
            body: format!(
                "This is your scheduled notification for {:02}:{:02}",
                reminder.time.hour(),
                reminder.time.minute()
            ),
        };
        // The queue entry is already gone; a failed send is logged and
        // abandoned (at-least-once attempt, no retry).
        match self.gateway.send(&message) {
            Ok(()) => tracing::info!(token = %redact_token(&reminder.token), "reminder dispatched"),
            Err(err) => {
                tracing::warn!(
                    token = %redact_token(&reminder.token),
                    "push dispatch failed: {err:#}"
                );
            }
        }
    }

    /// One escalation pass over all active alerts: every contact still at
    /// `sent` whose alert sits inside the 65-second window after
    /// `callScheduledAt` is promoted to `callPending` via the store's
    /// guarded update. Alerts with no contacts or no scheduled call time are
    /// skipped silently. Per-contact failures are logged and do not abort
    /// the rest of the batch. Returns the number of promotions.
    ///
    /// # Errors
    /// Returns an error only when the store cannot be opened or listed.
    pub fn escalation_tick(&self, now: OffsetDateTime) -> Result<usize> {
        let store = self.open_store()?;
        let alerts = store.active_alerts()?;
        let mut promoted = 0;
        for alert in alerts {
            let Some(call_scheduled_at) = alert.call_scheduled_at else {
                continue;
            };
            if !escalation_due(now, call_scheduled_at) {
                continue;
            }
            for (index, contact) in &alert.contacts {
                if !contact.status.can_promote() {
                    continue;
                }
                match store.promote_contact(&alert.key, index, now) {
                    Ok(true) => {
                        promoted += 1;
                        tracing::info!(
                            alert = %alert.key,
                            contact = %index,
                            "contact promoted to callPending"
                        );
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::error!(
                            alert = %alert.key,
                            contact = %index,
                            "promotion failed: {err:#}"
                        );
                    }
                }
            }
        }
        Ok(promoted)
    }

    /// Resolve a relayed confirmation link back to its exact alert/contact
    /// pair and apply the `confirmed` transition. Both inputs pass through
    /// the identifier codec; the identifier is additionally sanitized for
    /// document-key-hostile characters. Strategies in [`LOOKUP_ORDER`] are
    /// tried in sequence, first match wins. Confirming twice is a success
    /// both times.
    ///
    /// # Errors
    /// [`ResolveFailure::BadRequest`] when either input is empty after
    /// decoding, [`ResolveFailure::NotFound`] when every strategy misses or
    /// the matched alert lacks the contact index, [`ResolveFailure::Internal`]
    /// for store failures.
    pub fn confirm(
        &self,
        raw_alert_id: &str,
        raw_contact_index: &str,
        now: OffsetDateTime,
    ) -> Result<Confirmation, ResolveFailure> {
        let identifier = decode_identifier(raw_alert_id)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ResolveFailure::BadRequest("empty alert identifier".to_string()))?;
        let contact_index = decode_identifier(raw_contact_index)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ResolveFailure::BadRequest("empty contact index".to_string()))?;
        let identifier = sanitize_identifier(&identifier);

        let store = self.open_store().map_err(internal)?;
        for strategy in LOOKUP_ORDER {
            match strategy.apply(&store, &identifier, &contact_index) {
                Ok(Some(key)) => {
                    return apply_confirmation(&store, key, &contact_index, strategy, now);
                }
                Ok(None) => {}
                Err(err) => {
                    // A failed strategy is not fatal; the next tier may
                    // still resolve the link.
                    tracing::warn!(
                        strategy = strategy.as_str(),
                        "lookup strategy failed: {err:#}"
                    );
                }
            }
        }
        Err(ResolveFailure::NotFound)
    }

    /// Persist a new alert with every contact at `sent`. The native key is
    /// generated here; the stable `id` defaults to it when absent.
    ///
    /// # Errors
    /// Returns an error when the request has no contacts or the store
    /// rejects the insert.
    pub fn create_alert(
        &self,
        request: CreateAlertRequest,
        now: OffsetDateTime,
    ) -> Result<SosAlert> {
        if request.contacts.is_empty() {
            anyhow::bail!("an alert needs at least one contact");
        }
        let key = AlertKey::generate();
        let id = request.id.unwrap_or_else(|| key.as_str().to_string());
        let contacts = request
            .contacts
            .into_iter()
            .enumerate()
            .map(|(index, contact)| (index.to_string(), Contact::new(contact.name, contact.phone)))
            .collect();
        let alert = SosAlert {
            key,
            id,
            status: AlertStatus::Active,
            call_scheduled_at: request.call_scheduled_at,
            timestamp: now,
            contacts,
        };
        let mut store = self.open_store()?;
        store.insert_alert(&alert)?;
        tracing::info!(alert = %alert.key, contacts = alert.contacts.len(), "alert persisted");
        Ok(alert)
    }

    /// Number of reminders currently queued.
    #[must_use]
    pub fn pending_reminders(&self) -> usize {
        self.queue.len()
    }
}

fn apply_confirmation(
    store: &AlertStore,
    key: AlertKey,
    contact_index: &str,
    strategy: LookupStrategy,
    now: OffsetDateTime,
) -> Result<Confirmation, ResolveFailure> {
    match store.confirm_contact(&key, contact_index, now) {
        Ok(ConfirmOutcome::Confirmed) => {
            tracing::info!(
                alert = %key,
                contact = %contact_index,
                strategy = strategy.as_str(),
                "contact confirmed"
            );
            Ok(Confirmation {
                alert_key: key,
                contact_index: contact_index.to_string(),
                already_confirmed: false,
                strategy,
            })
        }
        Ok(ConfirmOutcome::AlreadyConfirmed) => Ok(Confirmation {
            alert_key: key,
            contact_index: contact_index.to_string(),
            already_confirmed: true,
            strategy,
        }),
        Ok(ConfirmOutcome::NoSuchContact) => Err(ResolveFailure::NotFound),
        Err(err) => Err(internal(err)),
    }
}

fn internal(err: anyhow::Error) -> ResolveFailure {
    ResolveFailure::Internal(format!("{err:#}"))
}

fn redact_token(token: &str) -> String {
    let prefix: String = token.chars().take(10).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    struct RecordingGateway {
        sent: Mutex<Vec<PushMessage>>,
    }

    impl RecordingGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()) })
        }

        fn sent(&self) -> Vec<PushMessage> {
            self.sent.lock().clone()
        }
    }

    impl PushGateway for RecordingGateway {
        fn send(&self, message: &PushMessage) -> Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
    }

    struct FailingGateway;

    impl PushGateway for FailingGateway {
        fn send(&self, _message: &PushMessage) -> Result<()> {
            anyhow::bail!("transport down")
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("medguard-api-{}.sqlite3", AlertKey::generate()))
    }

    fn mk_api(gateway: Arc<dyn PushGateway>) -> (SafetyApi, PathBuf) {
        let db_path = unique_temp_db_path();
        (SafetyApi::new(db_path.clone(), gateway), db_path)
    }

    fn mk_alert_request(id: &str, call_scheduled_at: Option<OffsetDateTime>) -> CreateAlertRequest {
        CreateAlertRequest {
            id: Some(id.to_string()),
            call_scheduled_at,
            contacts: vec![
                CreateContact { name: "Dana".to_string(), phone: "+15550100".to_string() },
                CreateContact { name: "Ravi".to_string(), phone: "+15550101".to_string() },
            ],
        }
    }

    #[test]
    fn submission_inside_grace_window_sends_immediately() -> Result<()> {
        let gateway = RecordingGateway::new();
        let (api, db_path) = mk_api(gateway.clone());

        let now = datetime!(2024-06-01 09:02:00 UTC);
        let outcome = api.submit_reminder("T1", &["2024-06-01".to_string()], "09:00", now)?;

        assert_eq!(outcome, SubmitOutcome::SentImmediately);
        assert_eq!(api.pending_reminders(), 0);
        let sent = gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "T1");
        assert!(sent[0].body.contains("09:00"));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn scheduled_reminder_dispatches_exactly_once() -> Result<()> {
        let gateway = RecordingGateway::new();
        let (api, db_path) = mk_api(gateway.clone());

        let submitted_at = datetime!(2024-06-01 08:00:00 UTC);
        let outcome =
            api.submit_reminder("T2", &["2024-06-01".to_string()], "09:00", submitted_at)?;
        assert_eq!(outcome, SubmitOutcome::Scheduled);
        assert_eq!(api.pending_reminders(), 1);

        // Not yet due.
        assert_eq!(api.reminder_tick(datetime!(2024-06-01 08:59:00 UTC)), 0);
        assert_eq!(api.pending_reminders(), 1);

        // Due: dispatched and removed.
        assert_eq!(api.reminder_tick(datetime!(2024-06-01 09:01:00 UTC)), 1);
        assert_eq!(api.pending_reminders(), 0);

        // Nothing left for the next tick.
        assert_eq!(api.reminder_tick(datetime!(2024-06-01 09:02:00 UTC)), 0);
        assert_eq!(gateway.sent().len(), 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn reminder_past_grace_window_stays_queued_indefinitely() -> Result<()> {
        let gateway = RecordingGateway::new();
        let (api, db_path) = mk_api(gateway.clone());

        api.submit_reminder(
            "T3",
            &["2024-06-01".to_string()],
            "09:00",
            datetime!(2024-06-01 08:00:00 UTC),
        )?;

        // The window has fully elapsed: neither sent nor removed.
        assert_eq!(api.reminder_tick(datetime!(2024-06-01 09:06:00 UTC)), 0);
        assert_eq!(api.pending_reminders(), 1);
        assert_eq!(api.reminder_tick(datetime!(2024-06-02 12:00:00 UTC)), 0);
        assert_eq!(api.pending_reminders(), 1);
        assert!(gateway.sent().is_empty());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn dispatch_failure_still_removes_the_reminder() -> Result<()> {
        let (api, db_path) = mk_api(Arc::new(FailingGateway));

        api.submit_reminder(
            "T4",
            &["2024-06-01".to_string()],
            "09:00",
            datetime!(2024-06-01 08:00:00 UTC),
        )?;
        assert_eq!(api.reminder_tick(datetime!(2024-06-01 09:00:30 UTC)), 1);
        assert_eq!(api.pending_reminders(), 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn escalation_promotes_only_inside_window_and_only_once() -> Result<()> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:01:00 UTC);

        api.create_alert(mk_alert_request("in-window", Some(now - Duration::seconds(30))), now)?;
        api.create_alert(mk_alert_request("too-old", Some(now - Duration::seconds(66))), now)?;
        api.create_alert(mk_alert_request("future", Some(now + Duration::seconds(30))), now)?;
        api.create_alert(CreateAlertRequest { id: Some("no-schedule".to_string()), call_scheduled_at: None, contacts: vec![CreateContact { name: "Lee".to_string(), phone: "+15550102".to_string() }] }, now)?;

        // Both contacts of the in-window alert, nothing else.
        assert_eq!(api.escalation_tick(now)?, 2);
        // Already promoted: the guarded update refuses a second promotion.
        assert_eq!(api.escalation_tick(now)?, 0);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn escalation_skips_confirmed_contacts() -> Result<()> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:01:00 UTC);

        let alert =
            api.create_alert(mk_alert_request("half-confirmed", Some(now)), now)?;
        let encoded_id = BASE64.encode(alert.id.as_bytes());
        let encoded_idx = BASE64.encode("0".as_bytes());
        api.confirm(&encoded_id, &encoded_idx, now).map_err(|err| anyhow::anyhow!("{err}"))?;

        // Only the unconfirmed contact is promoted.
        assert_eq!(api.escalation_tick(now)?, 1);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_resolves_via_native_key() -> Result<(), ResolveFailure> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        let alert = match api.create_alert(mk_alert_request("abc-123", Some(now)), now) {
            Ok(alert) => alert,
            Err(err) => panic!("fixture insert failed: {err:#}"),
        };

        let raw_id = BASE64.encode(alert.key.as_str().as_bytes());
        let raw_idx = BASE64.encode("1".as_bytes());
        let confirmation = api.confirm(&raw_id, &raw_idx, now)?;

        assert_eq!(confirmation.strategy, LookupStrategy::NativeKey);
        assert_eq!(confirmation.alert_key, alert.key);
        assert_eq!(confirmation.contact_index, "1");
        assert!(!confirmation.already_confirmed);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_falls_back_to_id_field_lookup() -> Result<(), ResolveFailure> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        if let Err(err) = api.create_alert(mk_alert_request("friendly-9", Some(now)), now) {
            panic!("fixture insert failed: {err:#}");
        }

        // "friendly-9" is the stored id field, not the native key.
        let confirmation = api.confirm("friendly-9", "0", now)?;
        assert_eq!(confirmation.strategy, LookupStrategy::IdField);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_falls_back_to_case_insensitive_recent_scan() -> Result<(), ResolveFailure> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        if let Err(err) = api.create_alert(mk_alert_request("MiXeD-Case", Some(now)), now) {
            panic!("fixture insert failed: {err:#}");
        }

        let confirmation = api.confirm("mixed-case", "0", now)?;
        assert_eq!(confirmation.strategy, LookupStrategy::RecentCaseInsensitive);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_rescues_by_contact_index_as_last_resort() -> Result<(), ResolveFailure> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        // Two contacts: indices "0" and "1". Ask for "1" with a hopeless id.
        if let Err(err) = api.create_alert(mk_alert_request("rescue-target", Some(now)), now) {
            panic!("fixture insert failed: {err:#}");
        }

        let confirmation = api.confirm("zzz", "1", now)?;
        assert_eq!(confirmation.strategy, LookupStrategy::ContactIndexRescue);
        assert_eq!(confirmation.contact_index, "1");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_is_idempotent_for_the_caller() -> Result<(), ResolveFailure> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        if let Err(err) = api.create_alert(mk_alert_request("double-click", Some(now)), now) {
            panic!("fixture insert failed: {err:#}");
        }

        let first = api.confirm("double-click", "0", now)?;
        let second = api.confirm("double-click", "0", now)?;
        assert!(!first.already_confirmed);
        assert!(second.already_confirmed);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn confirm_rejects_empty_inputs_before_resolution() {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);

        assert!(matches!(api.confirm("", "0", now), Err(ResolveFailure::BadRequest(_))));
        assert!(matches!(api.confirm("abc", "", now), Err(ResolveFailure::BadRequest(_))));

        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn confirm_reports_not_found_when_every_strategy_misses() -> Result<()> {
        let (api, db_path) = mk_api(RecordingGateway::new());
        let now = datetime!(2024-06-01 09:00:00 UTC);
        api.create_alert(mk_alert_request("lonely", Some(now)), now)?;

        // Index "9" exists in no recent alert, so even the rescue tier misses.
        assert!(matches!(api.confirm("zzz", "9", now), Err(ResolveFailure::NotFound)));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
