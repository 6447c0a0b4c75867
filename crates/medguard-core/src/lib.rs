use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, Time};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// How long after `callScheduledAt` a contact may still be promoted to
/// `callPending`. Outside this window the contact stays at `sent`; a missed
/// window is never retried.
pub const ESCALATION_WINDOW: Duration = Duration::seconds(65);

/// How long after its scheduled minute a reminder is still dispatchable.
/// A reminder whose window has fully elapsed is neither sent nor removed.
pub const REMINDER_GRACE_WINDOW: Duration = Duration::minutes(5);

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]");

/// The alert collection's native document key. Distinct from the stored `id`
/// field; both are valid lookup keys for the same alert.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AlertKey(pub String);

impl AlertKey {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AlertKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AlertStatus {
    Active,
    Resolved,
    Cancelled,
}

impl AlertStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Resolved => "resolved",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "resolved" => Some(Self::Resolved),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Per-contact escalation state: `sent` -> `callPending` -> `confirmed`, with
/// the direct `sent` -> `confirmed` shortcut when a contact confirms before
/// escalation reaches them. `confirmed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ContactStatus {
    Sent,
    CallPending,
    Confirmed,
}

impl ContactStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::CallPending => "callPending",
            Self::Confirmed => "confirmed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sent" => Some(Self::Sent),
            "callPending" => Some(Self::CallPending),
            "confirmed" => Some(Self::Confirmed),
            _ => None,
        }
    }

    /// Whether the escalation tick may move this contact to `callPending`.
    #[must_use]
    pub fn can_promote(self) -> bool {
        matches!(self, Self::Sent)
    }

    /// Whether a confirmation request may move this contact to `confirmed`.
    /// Confirming an already-confirmed contact is a no-op, not an error.
    #[must_use]
    pub fn can_confirm(self) -> bool {
        matches!(self, Self::Sent | Self::CallPending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub phone: String,
    pub status: ContactStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub call_pending_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub confirmed_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: phone.into(),
            status: ContactStatus::Sent,
            call_pending_at: None,
            confirmed_at: None,
        }
    }
}

/// A persisted emergency event. Contact indices are small integers carried as
/// string keys; they stay stable for the lifetime of the alert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SosAlert {
    pub key: AlertKey,
    pub id: String,
    pub status: AlertStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub call_scheduled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub contacts: BTreeMap<String, Contact>,
}

/// True when a contact at `sent` qualifies for promotion right now:
/// the scheduled call moment has arrived and no more than 65 seconds have
/// passed since. The upper bound keeps long-stale alerts (service outage,
/// clock jump) from escalating far too late.
#[must_use]
pub fn escalation_due(now: OffsetDateTime, call_scheduled_at: OffsetDateTime) -> bool {
    let elapsed = now - call_scheduled_at;
    elapsed >= Duration::ZERO && elapsed <= ESCALATION_WINDOW
}

/// A scheduled medication reminder: fires on each listed calendar date at the
/// given time of day, addressed to one device token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub token: String,
    pub dates: Vec<Date>,
    pub time: Time,
}

impl Reminder {
    /// Build a reminder from wire-format fields (`YYYY-MM-DD` dates,
    /// `HH:MM` 24h time).
    ///
    /// # Errors
    /// Returns [`CoreError::Validation`] when the token is empty, no dates
    /// are given, or any date/time fails to parse.
    pub fn new(token: impl Into<String>, dates: &[String], time: &str) -> Result<Self, CoreError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CoreError::Validation("token must be non-empty".to_string()));
        }
        if dates.is_empty() {
            return Err(CoreError::Validation("at least one date is required".to_string()));
        }
        let dates = dates.iter().map(|date| parse_reminder_date(date)).collect::<Result<
            Vec<Date>,
            CoreError,
        >>()?;
        let time = parse_reminder_time(time)?;
        Ok(Self { token, dates, time })
    }
}

/// Parse a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`CoreError::Validation`] on any other shape.
pub fn parse_reminder_date(value: &str) -> Result<Date, CoreError> {
    Date::parse(value, DATE_FORMAT)
        .map_err(|err| CoreError::Validation(format!("invalid date {value:?}: {err}")))
}

/// Parse an `HH:MM` 24-hour time of day.
///
/// # Errors
/// Returns [`CoreError::Validation`] on any other shape.
pub fn parse_reminder_time(value: &str) -> Result<Time, CoreError> {
    Time::parse(value, TIME_FORMAT)
        .map_err(|err| CoreError::Validation(format!("invalid time {value:?}: {err}")))
}

/// Due test for one reminder at one instant: today must be a listed date and
/// `now` must sit inside the grace window after the scheduled minute.
#[must_use]
pub fn reminder_due(reminder: &Reminder, now: OffsetDateTime) -> bool {
    if !reminder.dates.contains(&now.date()) {
        return false;
    }
    let scheduled = now.replace_time(reminder.time);
    let elapsed = now - scheduled;
    elapsed >= Duration::ZERO && elapsed <= REMINDER_GRACE_WINDOW
}

const MAX_PERCENT_DECODE_ROUNDS: usize = 8;

/// Decode an identifier that arrived through an unreliable relay. Relays
/// re-encode links unpredictably: percent-encoding may be applied more than
/// once, `+` may come back as a space, and base64 may arrive in the url-safe
/// alphabet with its padding stripped.
///
/// Tries the base64 route first (percent-unescape, restore `+`, normalize
/// the alphabet, repair padding, decode); when that yields nothing readable,
/// falls back to the plain percent-decoded value. Returns `None` only when
/// no usable text results. Pure: never reads shared state, never panics.
#[must_use]
pub fn decode_identifier(raw: &str) -> Option<String> {
    let unescaped = percent_decode_repeated(raw);
    let candidate = unescaped.replace(' ', "+");
    if let Some(text) = decode_base64_text(&candidate) {
        return Some(text);
    }
    if unescaped.is_empty() {
        None
    } else {
        Some(unescaped)
    }
}

/// Replace characters that are illegal in a document key (and that relays
/// corrupt differently across transports) with `-`.
#[must_use]
pub fn sanitize_identifier(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            '&' | '+' | '=' | '%' | '#' | '?' => '-',
            other => other,
        })
        .collect()
}

fn percent_decode_repeated(raw: &str) -> String {
    let mut current = raw.to_string();
    // Fixed-point with a hard round bound so adversarial input cannot keep
    // the loop busy.
    for _ in 0..MAX_PERCENT_DECODE_ROUNDS {
        if !current.contains('%') {
            break;
        }
        let decoded =
            percent_encoding::percent_decode_str(&current).decode_utf8_lossy().into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn decode_base64_text(candidate: &str) -> Option<String> {
    if candidate.is_empty() {
        return None;
    }
    let normalized = candidate.replace('-', "+").replace('_', "/");
    let padded = match normalized.len() % 4 {
        2 => format!("{normalized}=="),
        3 => format!("{normalized}="),
        _ => normalized,
    };
    let bytes = BASE64.decode(padded.as_bytes()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    if text.is_empty() || text.chars().any(char::is_control) {
        return None;
    }
    Some(text)
}
