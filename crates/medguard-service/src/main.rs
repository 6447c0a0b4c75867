use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use medguard_api::{
    Confirmation, CreateAlertRequest, HttpPushGateway, ResolveFailure, SafetyApi, SubmitOutcome,
};
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

const OFFSET_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[offset_hour sign:mandatory]:[offset_minute]");

/// Query keys the relay has historically used for the alert identifier.
/// "sosld" is a long-lived typo on the sending side, kept for compatibility.
const ID_PARAMS: [&str; 3] = ["id", "sosId", "sosld"];
const INDEX_PARAMS: [&str; 3] = ["idx", "contactIndex", "contactIdx"];

#[derive(Clone)]
struct ServiceState {
    api: SafetyApi,
    clock_offset: UtcOffset,
}

impl ServiceState {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.clock_offset)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    error: String,
}

impl ServiceError {
    fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, Json(self)).into_response()
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Every field is optional at the wire level so that absence can be reported
/// with one message instead of a serde rejection.
#[derive(Debug, Clone, Deserialize)]
struct ScheduleRequest {
    token: Option<String>,
    dates: Option<Vec<String>>,
    #[serde(rename = "reminderTime")]
    reminder_time: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct ScheduleResponse {
    outcome: SubmitOutcome,
    message: &'static str,
    pending: usize,
}

#[derive(Debug, Parser)]
#[command(name = "medguard-service")]
#[command(about = "Reminder scheduling and SOS escalation service")]
struct Args {
    #[arg(long, default_value = "./medguard.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    /// Push relay endpoint reminder notifications are POSTed to.
    #[arg(long, default_value = "http://127.0.0.1:8572/send")]
    push_endpoint: String,
    /// Offset of the wall clock reminders and escalations are judged against.
    #[arg(long, default_value = "+00:00", value_parser = parse_utc_offset)]
    utc_offset: UtcOffset,
    /// Seconds between scheduler and escalation passes.
    #[arg(long, default_value_t = 60)]
    tick_secs: u64,
}

fn parse_utc_offset(value: &str) -> Result<UtcOffset, String> {
    UtcOffset::parse(value, OFFSET_FORMAT)
        .map_err(|err| format!("invalid utc offset {value:?}: {err}"))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/schedule", post(schedule))
        .route("/sos/alerts", post(create_alert))
        .route("/sos/confirm", get(confirm_by_query))
        .route("/sos/confirm/:alert_id/:contact_index", get(confirm_by_path))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let gateway = Arc::new(HttpPushGateway::new(args.push_endpoint.clone()));
    let api = SafetyApi::new(args.db.clone(), gateway);
    let state = ServiceState { api: api.clone(), clock_offset: args.utc_offset };

    spawn_tick_loop(api, args.utc_offset, args.tick_secs);

    tracing::info!(bind = %args.bind, db = %args.db.display(), "medguard service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Background pass driving both engines: due reminders are dispatched and
/// in-window contacts are promoted. The pass runs on the blocking pool
/// because the store and the push transport are synchronous.
fn spawn_tick_loop(api: SafetyApi, offset: UtcOffset, period_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(period_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let api = api.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                let now = OffsetDateTime::now_utc().to_offset(offset);
                let dispatched = api.reminder_tick(now);
                let promoted = match api.escalation_tick(now) {
                    Ok(promoted) => promoted,
                    Err(err) => {
                        tracing::error!("escalation pass failed: {err:#}");
                        0
                    }
                };
                (dispatched, promoted)
            })
            .await;
            match outcome {
                Ok((dispatched, promoted)) => {
                    if dispatched > 0 || promoted > 0 {
                        tracing::info!(dispatched, promoted, "tick complete");
                    }
                }
                Err(err) => tracing::error!("tick task panicked: {err}"),
            }
        }
    });
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn schedule(
    State(state): State<ServiceState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ServiceError> {
    let (Some(token), Some(dates), Some(reminder_time)) =
        (request.token, request.dates, request.reminder_time)
    else {
        return Err(ServiceError::new("Missing token, dates, or reminderTime"));
    };
    let outcome = state
        .api
        .submit_reminder(&token, &dates, &reminder_time, state.now())
        .map_err(|err| ServiceError::new(err.to_string()))?;
    let message = match outcome {
        SubmitOutcome::SentImmediately => "Reminder sent immediately",
        SubmitOutcome::Scheduled => "Reminder scheduled",
    };
    Ok(Json(ScheduleResponse { outcome, message, pending: state.api.pending_reminders() }))
}

async fn create_alert(
    State(state): State<ServiceState>,
    Json(request): Json<CreateAlertRequest>,
) -> Result<Response, ServiceError> {
    let alert = state
        .api
        .create_alert(request, state.now())
        .map_err(|err| ServiceError::new(format!("{err:#}")))?;
    Ok((StatusCode::CREATED, Json(alert)).into_response())
}

async fn confirm_by_path(
    State(state): State<ServiceState>,
    Path((alert_id, contact_index)): Path<(String, String)>,
) -> Response {
    render_confirmation(&state, &alert_id, &contact_index)
}

async fn confirm_by_query(
    State(state): State<ServiceState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(alert_id) = first_param(&params, &ID_PARAMS) else {
        return failure_page(
            StatusCode::BAD_REQUEST,
            "We could not read this link",
            "The confirmation link is missing its alert identifier.",
        );
    };
    let Some(contact_index) = first_param(&params, &INDEX_PARAMS) else {
        return failure_page(
            StatusCode::BAD_REQUEST,
            "We could not read this link",
            "The confirmation link is missing its contact index.",
        );
    };
    render_confirmation(&state, &alert_id, &contact_index)
}

/// Case-insensitive lookup over the accepted aliases for one parameter.
fn first_param(params: &HashMap<String, String>, names: &[&str]) -> Option<String> {
    for name in names {
        for (key, value) in params {
            if key.eq_ignore_ascii_case(name) {
                return Some(value.clone());
            }
        }
    }
    None
}

fn render_confirmation(state: &ServiceState, raw_id: &str, raw_index: &str) -> Response {
    match state.api.confirm(raw_id, raw_index, state.now()) {
        Ok(confirmation) => {
            (StatusCode::OK, Html(confirmation_page(&confirmation))).into_response()
        }
        Err(ResolveFailure::BadRequest(detail)) => {
            tracing::warn!(%detail, "unreadable confirmation link");
            failure_page(
                StatusCode::BAD_REQUEST,
                "We could not read this link",
                "The confirmation link appears incomplete. Please use the link from the alert message without editing it.",
            )
        }
        Err(ResolveFailure::NotFound) => failure_page(
            StatusCode::NOT_FOUND,
            "Alert not found",
            "This alert could not be found. It may have been resolved already, or the link may be very old.",
        ),
        Err(ResolveFailure::Internal(detail)) => {
            tracing::error!(%detail, "confirmation failed");
            failure_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Something went wrong",
                "We could not record your confirmation. Please try the link again in a moment.",
            )
        }
    }
}

fn confirmation_page(confirmation: &Confirmation) -> String {
    let note = if confirmation.already_confirmed {
        "This link was already confirmed earlier. No further action is needed."
    } else {
        "Your response has been recorded. The person who sent this alert can see that you are responding."
    };
    page(
        "Confirmation received",
        &format!(
            "<p>{note}</p><p class=\"ref\">Alert {key}, contact {index}.</p>",
            key = confirmation.alert_key,
            index = confirmation.contact_index,
        ),
    )
}

fn failure_page(status: StatusCode, title: &str, detail: &str) -> Response {
    (status, Html(page(title, &format!("<p>{detail}</p>")))).into_response()
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>Medguard</title></head>\
         <body style=\"font-family: sans-serif; max-width: 32rem; margin: 4rem auto;\">\
         <h1>{title}</h1>{body}</body></html>"
    )
}
