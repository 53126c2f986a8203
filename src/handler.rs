use crate::db::{self, NewFormSubmission};
use crate::geo::GeoLocator;
use crate::notifier::Mailer;
use crate::submission::{render_template, EmailSubmission};
use axum::{extract::ConnectInfo, extract::State, Json};
use chrono::FixedOffset;
use serde::Serialize;
use sqlx::SqlitePool;
use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

pub const SUCCESS_MESSAGE: &str = "Email Sent Successfully";

/// Everything a request needs, built once at start-up.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub mailer: Arc<dyn Mailer>,
    pub geo: Arc<dyn GeoLocator>,
    pub template: Arc<str>,
    pub utc_offset: FixedOffset,
    /// Background email deliveries, drained on shutdown.
    pub tasks: TaskTracker,
}

#[derive(Debug, Serialize)]
pub struct SendEmailResponse {
    pub message: &'static str,
}

/// Logs a failed step with its full source chain and carries on without the value.
pub trait LogFailure<T> {
    fn log_failure(self, context: &str) -> Option<T>;
}

impl<T, E: Error> LogFailure<T> for Result<T, E> {
    fn log_failure(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                error!("{context}: {}", error_chain(&e));
                None
            }
        }
    }
}

fn error_chain(err: &dyn Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(&format!("\n  caused by: {cause}"));
        source = cause.source();
    }
    chain
}

/// `POST /send-email`. Validation is done by the `Json` extractor, so nothing
/// below runs for a rejected payload.
pub async fn send_email(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(submission): Json<EmailSubmission>,
) -> Json<SendEmailResponse> {
    info!("Send email API hit!");
    let submission = Arc::new(submission);

    state.tasks.spawn(send_email_task(
        state.mailer.clone(),
        state.template.clone(),
        submission.clone(),
    ));

    let client_ip = client_ip(addr);
    info!("Getting IP info...");
    let location = state
        .geo
        .locate(client_ip)
        .await
        .log_failure("Something went wrong while getting IP info")
        .unwrap_or_default();

    info!("Saving the form entry to DB...");
    let record = NewFormSubmission::new(
        &submission,
        client_ip.to_string(),
        location,
        state.utc_offset,
    );
    if let Some(id) = db::insert(&state.db, &record)
        .await
        .log_failure("Something went wrong while saving to DB")
    {
        info!("Form entry {id} saved to DB successfully!");
    }

    Json(SendEmailResponse {
        message: SUCCESS_MESSAGE,
    })
}

/// Renders and sends the notification. Runs detached from the request.
async fn send_email_task(mailer: Arc<dyn Mailer>, template: Arc<str>, submission: Arc<EmailSubmission>) {
    info!("Send email function called");
    debug!("email_data: {submission:?}");

    let body = render_template(&template, &submission);
    info!("Sending Email...");
    if mailer
        .send_html(&body)
        .await
        .log_failure("Something went wrong while sending email")
        .is_some()
    {
        info!("Email sent successfully!");
    }
}

/// IPv4 peers reached over a dual-stack socket are reported as plain IPv4.
fn client_ip(addr: SocketAddr) -> IpAddr {
    match addr.ip() {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        ip => ip,
    }
}
