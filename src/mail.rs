//! Outgoing mail: an outbox table filled by domain operations and a dispatcher that
//! delivers due entries through a [`MailTransport`], retrying with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MailConfig;
use crate::error::{AppResult, OptionExt};
use crate::state::AppState;
use crate::users::User;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
}

pub const STATUS_PENDING: &str = "PENDING";
pub const STATUS_SENT: &str = "SENT";
pub const STATUS_FAILED: &str = "FAILED";

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, sender: &str, mail: &OutgoingMail) -> anyhow::Result<()>;
}

/// Writes mails to the log instead of delivering them.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send(&self, sender: &str, mail: &OutgoingMail) -> anyhow::Result<()> {
        tracing::info!(from = sender, to = %mail.recipient, subject = %mail.subject, "mail:\n{}", mail.body);
        Ok(())
    }
}

#[derive(Serialize)]
struct HttpMailPayload<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    text: &'a str,
}

/// POSTs mails as JSON to a mail API.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: String, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fdm/", env!("CARGO_PKG_VERSION"), " (+reqwest)"))
            .tcp_nodelay(true)
            .pool_idle_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client, endpoint, api_key })
    }
}

#[async_trait]
impl MailTransport for HttpTransport {
    async fn send(&self, sender: &str, mail: &OutgoingMail) -> anyhow::Result<()> {
        let payload =
            HttpMailPayload { from: sender, to: vec![mail.recipient.as_str()], subject: &mail.subject, text: &mail.body };
        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        let status = res.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = res.text().await.unwrap_or_default();
            Err(anyhow::anyhow!("mail API error: HTTP {status}: {body}"))
        }
    }
}

pub fn transport_from_config(cfg: &MailConfig) -> anyhow::Result<Arc<dyn MailTransport>> {
    match cfg.transport.as_str() {
        "http" => {
            let endpoint =
                cfg.endpoint.clone().ok_or_else(|| anyhow::anyhow!("mail.endpoint missing for http transport"))?;
            Ok(Arc::new(HttpTransport::new(endpoint, cfg.api_key.clone())?))
        }
        _ => Ok(Arc::new(LogTransport)),
    }
}

/// Queues a mail and wakes the dispatcher. Never waits for delivery.
pub async fn enqueue(state: &AppState, mail: OutgoingMail) -> AppResult<Uuid> {
    let id = enqueue_db(&state.db, &mail).await?;
    state.mail_wakeup.notify_one();
    Ok(id)
}

pub async fn enqueue_db(db: &SqlitePool, mail: &OutgoingMail) -> AppResult<Uuid> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO mail_outbox (id, recipient, subject, body, status, attempts, next_attempt_at, created_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
    )
    .bind(id)
    .bind(&mail.recipient)
    .bind(&mail.subject)
    .bind(&mail.body)
    .bind(STATUS_PENDING)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    Ok(id)
}

pub async fn get_entry(db: &SqlitePool, id: Uuid) -> AppResult<Option<OutboxEntry>> {
    Ok(sqlx::query_as::<_, OutboxEntry>(
        "SELECT id, recipient, subject, body, status, attempts, last_error, next_attempt_at FROM mail_outbox WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db)
    .await?)
}

/// Seconds to wait before attempt number `attempts + 1`.
pub fn backoff_secs(base: i64, attempts: i64) -> i64 {
    let exp = (attempts - 1).clamp(0, 16) as u32;
    base.saturating_mul(2i64.saturating_pow(exp))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: usize,
    pub failed: usize,
}

/// Delivers up to `batch` due mails once.
pub async fn dispatch_due(
    db: &SqlitePool,
    transport: &dyn MailTransport,
    cfg: &MailConfig,
    batch: i64,
) -> AppResult<DispatchSummary> {
    let due = sqlx::query_as::<_, OutboxEntry>(
        "SELECT id, recipient, subject, body, status, attempts, last_error, next_attempt_at FROM mail_outbox \
         WHERE status = ? AND next_attempt_at <= ? ORDER BY created_at LIMIT ?",
    )
    .bind(STATUS_PENDING)
    .bind(Utc::now())
    .bind(batch)
    .fetch_all(db)
    .await?;

    let mut summary = DispatchSummary::default();
    for entry in due {
        if deliver(db, transport, cfg, entry).await? {
            summary.sent += 1;
        } else {
            summary.failed += 1;
        }
    }
    Ok(summary)
}

/// Delivers one pending outbox entry right away, whatever else is due. Returns whether it was
/// sent; a failure counts as an attempt like in [`dispatch_due`].
pub async fn send_entry(db: &SqlitePool, transport: &dyn MailTransport, cfg: &MailConfig, id: Uuid) -> AppResult<bool> {
    let entry = get_entry(db, id)
        .await?
        .filter(|e| e.status == STATUS_PENDING)
        .ok_or_not_found("Pending mail")?;
    deliver(db, transport, cfg, entry).await
}

async fn deliver(db: &SqlitePool, transport: &dyn MailTransport, cfg: &MailConfig, entry: OutboxEntry) -> AppResult<bool> {
    let mail = OutgoingMail { recipient: entry.recipient.clone(), subject: entry.subject.clone(), body: entry.body };
    match transport.send(&cfg.sender, &mail).await {
        Ok(()) => {
            sqlx::query("UPDATE mail_outbox SET status = ?, attempts = attempts + 1, sent_at = ?, last_error = NULL WHERE id = ?")
                .bind(STATUS_SENT)
                .bind(Utc::now())
                .bind(entry.id)
                .execute(db)
                .await?;
            Ok(true)
        }
        Err(e) => {
            let attempts = entry.attempts + 1;
            let status = if attempts >= cfg.max_retries { STATUS_FAILED } else { STATUS_PENDING };
            let next = Utc::now() + chrono::Duration::seconds(backoff_secs(cfg.retry_backoff_secs, attempts));
            tracing::error!(mail = %entry.id, attempts, "Sending mail to {} failed: {}", entry.recipient, e);
            sqlx::query("UPDATE mail_outbox SET status = ?, attempts = ?, last_error = ?, next_attempt_at = ? WHERE id = ?")
                .bind(status)
                .bind(attempts)
                .bind(e.to_string())
                .bind(next)
                .bind(entry.id)
                .execute(db)
                .await?;
            Ok(false)
        }
    }
}

/// Dispatcher loop: runs on every interval tick and whenever a mail is enqueued.
pub async fn run_dispatcher(state: AppState, transport: Arc<dyn MailTransport>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.workers.interval_ms));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
            _ = state.mail_wakeup.notified() => {},
        }
        match dispatch_due(&state.db, transport.as_ref(), &state.config.mail, state.config.workers.mail_batch_size).await {
            Ok(summary) => {
                if summary.sent + summary.failed > 0 {
                    tracing::info!("Mail dispatch: {} sent, {} failed", summary.sent, summary.failed);
                }
                state.metrics.add_mails(summary.sent, summary.failed);
            }
            Err(e) => tracing::error!("Mail dispatch failed: {}", e),
        }
    }
    tracing::info!("Mail dispatcher stopped");
}

pub fn account_created(user: &User, token: &str) -> OutgoingMail {
    OutgoingMail {
        recipient: user.email.clone(),
        subject: "Your FDM account has been created".to_string(),
        body: format!(
            "Hello {},\n\nan account has been created for you. Set your password with this token:\n\n    {}\n",
            user.display_name(),
            token
        ),
    }
}

pub fn password_reset(user: &User, token: &str) -> OutgoingMail {
    OutgoingMail {
        recipient: user.email.clone(),
        subject: "Reset your FDM password".to_string(),
        body: format!(
            "Hello {},\n\nsomebody requested a password reset for your account. Use this token to choose a new \
             password:\n\n    {}\n\nIf this was not you, ignore this mail.\n",
            user.display_name(),
            token
        ),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    Added,
    Changed,
    Removed,
}

pub fn project_membership(recipient: &User, project_name: &str, change: MembershipChange, by: &User) -> OutgoingMail {
    let (subject, line) = match change {
        MembershipChange::Added => ("You have been added to a project", "added you to"),
        MembershipChange::Changed => ("Your project permissions have changed", "changed your permissions in"),
        MembershipChange::Removed => ("You have been removed from a project", "removed you from"),
    };
    OutgoingMail {
        recipient: recipient.email.clone(),
        subject: format!("{}: {}", subject, project_name),
        body: format!("Hello {},\n\n{} {} the project \"{}\".\n", recipient.display_name(), by.display_name(), line, project_name),
    }
}

pub fn test_mail(recipient: &str) -> OutgoingMail {
    OutgoingMail {
        recipient: recipient.to_string(),
        subject: "FDM test mail".to_string(),
        body: "This is a test mail sent by `fdm send-test-mail`.\n".to_string(),
    }
}
