use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use medguard_core::{AlertKey, AlertStatus, Contact, ContactStatus, SosAlert};
use rusqlite::{params, Connection, OptionalExtension};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS sos_alerts (
  alert_key TEXT PRIMARY KEY,
  alert_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','resolved','cancelled')),
  call_scheduled_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sos_contacts (
  alert_key TEXT NOT NULL,
  contact_index TEXT NOT NULL,
  name TEXT NOT NULL,
  phone TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('sent','callPending','confirmed')),
  call_pending_at TEXT,
  confirmed_at TEXT,
  PRIMARY KEY (alert_key, contact_index),
  FOREIGN KEY (alert_key) REFERENCES sos_alerts(alert_key)
);

CREATE INDEX IF NOT EXISTS idx_sos_alerts_status ON sos_alerts(status);
CREATE INDEX IF NOT EXISTS idx_sos_alerts_created_at ON sos_alerts(created_at);
";

/// Outcome of a guarded confirm update. Double confirmation is a success for
/// the caller; only a missing contact row is a resolution failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfirmOutcome {
    Confirmed,
    AlreadyConfirmed,
    NoSuchContact,
}

/// The persisted SOS alert collection. Contact status changes go through
/// guarded single-row UPDATEs so that the state machine's "no-op if already
/// past this state" rule is enforced against the stored status, never an
/// in-memory copy.
pub struct AlertStore {
    conn: Connection,
}

impl AlertStore {
    /// Open the alert database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;
        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist a new alert together with its contact rows.
    ///
    /// # Errors
    /// Returns an error when the alert key already exists or any row fails
    /// to insert.
    pub fn insert_alert(&mut self, alert: &SosAlert) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start insert transaction")?;
        tx.execute(
            "INSERT INTO sos_alerts(alert_key, alert_id, status, call_scheduled_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                alert.key.as_str(),
                alert.id,
                alert.status.as_str(),
                alert.call_scheduled_at.map(format_timestamp).transpose()?,
                format_timestamp(alert.timestamp)?,
            ],
        )
        .with_context(|| format!("failed to insert alert {}", alert.key))?;

        for (index, contact) in &alert.contacts {
            tx.execute(
                "INSERT INTO sos_contacts(
                    alert_key, contact_index, name, phone, status, call_pending_at, confirmed_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    alert.key.as_str(),
                    index,
                    contact.name,
                    contact.phone,
                    contact.status.as_str(),
                    contact.call_pending_at.map(format_timestamp).transpose()?,
                    contact.confirmed_at.map(format_timestamp).transpose()?,
                ],
            )
            .with_context(|| format!("failed to insert contact {index} of alert {}", alert.key))?;
        }

        tx.commit().context("failed to commit alert insert")
    }

    /// Point lookup by the collection's native document key.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored data is malformed.
    pub fn get_by_key(&self, key: &str) -> Result<Option<SosAlert>> {
        let row = self
            .conn
            .query_row(
                "SELECT alert_key, alert_id, status, call_scheduled_at, created_at
                 FROM sos_alerts WHERE alert_key = ?1",
                params![key],
                map_alert_row,
            )
            .optional()
            .context("failed to query alert by key")?;
        row.map(|row| self.assemble(row)).transpose()
    }

    /// Field-equality lookup on the stored `id`; newest match wins.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored data is malformed.
    pub fn find_by_id_field(&self, id: &str) -> Result<Option<SosAlert>> {
        let row = self
            .conn
            .query_row(
                "SELECT alert_key, alert_id, status, call_scheduled_at, created_at
                 FROM sos_alerts WHERE alert_id = ?1
                 ORDER BY created_at DESC LIMIT 1",
                params![id],
                map_alert_row,
            )
            .optional()
            .context("failed to query alert by id field")?;
        row.map(|row| self.assemble(row)).transpose()
    }

    /// The most recent alerts ordered by creation time, newest first.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored data is malformed.
    pub fn recent(&self, limit: usize) -> Result<Vec<SosAlert>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT alert_key, alert_id, status, call_scheduled_at, created_at
                 FROM sos_alerts
                 ORDER BY created_at DESC, alert_key ASC
                 LIMIT ?1",
            )
            .context("failed to prepare recency scan")?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], map_alert_row)
            .context("failed to run recency scan")?
            .collect::<rusqlite::Result<Vec<AlertRow>>>()
            .context("failed to read recency scan rows")?;
        rows.into_iter().map(|row| self.assemble(row)).collect()
    }

    /// Every alert still in `active` status.
    ///
    /// # Errors
    /// Returns an error when the query fails or stored data is malformed.
    pub fn active_alerts(&self) -> Result<Vec<SosAlert>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT alert_key, alert_id, status, call_scheduled_at, created_at
                 FROM sos_alerts WHERE status = 'active'
                 ORDER BY created_at DESC, alert_key ASC",
            )
            .context("failed to prepare active-alert listing")?;
        let rows = stmt
            .query_map([], map_alert_row)
            .context("failed to list active alerts")?
            .collect::<rusqlite::Result<Vec<AlertRow>>>()
            .context("failed to read active alert rows")?;
        rows.into_iter().map(|row| self.assemble(row)).collect()
    }

    /// Move one contact from `sent` to `callPending`, stamping
    /// `callPendingAt`. Returns false when the stored status was no longer
    /// `sent` (already promoted or confirmed): a no-op, not an error.
    ///
    /// # Errors
    /// Returns an error when the update statement fails.
    pub fn promote_contact(
        &self,
        key: &AlertKey,
        contact_index: &str,
        now: OffsetDateTime,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE sos_contacts
                 SET status = 'callPending', call_pending_at = ?3
                 WHERE alert_key = ?1 AND contact_index = ?2 AND status = 'sent'",
                params![key.as_str(), contact_index, format_timestamp(now)?],
            )
            .with_context(|| format!("failed to promote contact {contact_index} of {key}"))?;
        Ok(changed > 0)
    }

    /// Move one contact to `confirmed`, stamping `confirmedAt`. Legal from
    /// both `sent` and `callPending`; confirming an already-confirmed
    /// contact reports [`ConfirmOutcome::AlreadyConfirmed`].
    ///
    /// # Errors
    /// Returns an error when a statement fails or stored data is malformed.
    pub fn confirm_contact(
        &self,
        key: &AlertKey,
        contact_index: &str,
        now: OffsetDateTime,
    ) -> Result<ConfirmOutcome> {
        let changed = self
            .conn
            .execute(
                "UPDATE sos_contacts
                 SET status = 'confirmed', confirmed_at = ?3
                 WHERE alert_key = ?1 AND contact_index = ?2
                   AND status IN ('sent', 'callPending')",
                params![key.as_str(), contact_index, format_timestamp(now)?],
            )
            .with_context(|| format!("failed to confirm contact {contact_index} of {key}"))?;
        if changed > 0 {
            return Ok(ConfirmOutcome::Confirmed);
        }

        match self.contact_status(key, contact_index)? {
            Some(ContactStatus::Confirmed) => Ok(ConfirmOutcome::AlreadyConfirmed),
            Some(other) => Err(anyhow!(
                "contact {contact_index} of {key} raced to unexpected status {}",
                other.as_str()
            )),
            None => Ok(ConfirmOutcome::NoSuchContact),
        }
    }

    /// Current stored status of one contact, if the row exists.
    ///
    /// # Errors
    /// Returns an error when the query fails or the stored status is unknown.
    pub fn contact_status(
        &self,
        key: &AlertKey,
        contact_index: &str,
    ) -> Result<Option<ContactStatus>> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM sos_contacts WHERE alert_key = ?1 AND contact_index = ?2",
                params![key.as_str(), contact_index],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query contact status")?;
        match status {
            None => Ok(None),
            Some(value) => ContactStatus::parse(&value)
                .map(Some)
                .ok_or_else(|| anyhow!("unknown stored contact status {value:?}")),
        }
    }

    fn assemble(&self, row: AlertRow) -> Result<SosAlert> {
        let contacts = self.load_contacts(&row.key)?;
        let status = AlertStatus::parse(&row.status)
            .ok_or_else(|| anyhow!("unknown stored alert status {:?}", row.status))?;
        Ok(SosAlert {
            key: AlertKey(row.key),
            id: row.id,
            status,
            call_scheduled_at: row.call_scheduled_at.as_deref().map(parse_timestamp).transpose()?,
            timestamp: parse_timestamp(&row.created_at)?,
            contacts,
        })
    }

    fn load_contacts(&self, key: &str) -> Result<BTreeMap<String, Contact>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT contact_index, name, phone, status, call_pending_at, confirmed_at
                 FROM sos_contacts WHERE alert_key = ?1",
            )
            .context("failed to prepare contact listing")?;
        let rows = stmt
            .query_map(params![key], |row| {
                Ok(ContactRow {
                    index: row.get(0)?,
                    name: row.get(1)?,
                    phone: row.get(2)?,
                    status: row.get(3)?,
                    call_pending_at: row.get(4)?,
                    confirmed_at: row.get(5)?,
                })
            })
            .context("failed to list contacts")?
            .collect::<rusqlite::Result<Vec<ContactRow>>>()
            .context("failed to read contact rows")?;

        let mut contacts = BTreeMap::new();
        for row in rows {
            let status = ContactStatus::parse(&row.status)
                .ok_or_else(|| anyhow!("unknown stored contact status {:?}", row.status))?;
            contacts.insert(
                row.index,
                Contact {
                    name: row.name,
                    phone: row.phone,
                    status,
                    call_pending_at: row.call_pending_at.as_deref().map(parse_timestamp).transpose()?,
                    confirmed_at: row.confirmed_at.as_deref().map(parse_timestamp).transpose()?,
                },
            );
        }
        Ok(contacts)
    }
}

struct AlertRow {
    key: String,
    id: String,
    status: String,
    call_scheduled_at: Option<String>,
    created_at: String,
}

struct ContactRow {
    index: String,
    name: String,
    phone: String,
    status: String,
    call_pending_at: Option<String>,
    confirmed_at: Option<String>,
}

fn map_alert_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlertRow> {
    Ok(AlertRow {
        key: row.get(0)?,
        id: row.get(1)?,
        status: row.get(2)?,
        call_scheduled_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .context("failed to read schema version")
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let applied_at = format_timestamp(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )
    .context("failed to record schema version")?;
    Ok(())
}

// Timestamps are normalized to UTC before formatting so that the stored
// RFC 3339 strings sort chronologically.
fn format_timestamp(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .context("failed to format timestamp")
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("failed to parse stored timestamp {value:?}"))
}
