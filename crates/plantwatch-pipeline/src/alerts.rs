//! Alert deduplication and dispatch.
//!
//! Error rows for plants alerted within the suppression window are dropped;
//! the rest go out as one HTML digest and are then recorded in the alert
//! history under [`ALERT_HISTORY_PREFIX`].

use std::collections::BTreeSet;
use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use plantwatch_core::{AlertRecord, EntityId, Reading};
use plantwatch_storage::{sha256_hex, ObjectStore, ObjectStoreError};
use thiserror::Error;
use tracing::{error, info, warn};

pub const ALERT_HISTORY_PREFIX: &str = "alert_history/";

/// `alert_history/alert_history_{date}_{time}_{digest}.json`. The body digest
/// keeps two dispatches within the same second from sharing a key.
pub fn history_key(sent_at: DateTime<Utc>, body: &[u8]) -> String {
    format!(
        "{ALERT_HISTORY_PREFIX}alert_history_{}_{}.json",
        sent_at.format("%Y-%m-%d_%H%M%S"),
        &sha256_hex(body)[..16]
    )
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox {value:?}: {source}")]
    Address {
        value: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("no alert recipients configured")]
    NoRecipients,
    #[error("building alert email: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp transport: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("alert email rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("rendering alert digest: {0}")]
    Render(#[from] askama::Error),
    #[error("sending alert digest: {0}")]
    Notify(#[from] NotifyError),
    #[error("encoding alert history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("writing alert history {key}: {source}")]
    History {
        key: String,
        #[source]
        source: ObjectStoreError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlertDigest {
    pub subject: String,
    pub html: String,
    pub entity_count: usize,
    pub row_count: usize,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, digest: &AlertDigest) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub recipients: Vec<String>,
}

fn mailbox(value: &str) -> Result<Mailbox, NotifyError> {
    value.trim().parse().map_err(|source| NotifyError::Address {
        value: value.to_string(),
        source,
    })
}

/// Sends digests over SMTP with STARTTLS.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl SmtpNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        let recipients = settings
            .recipients
            .iter()
            .map(|r| mailbox(r))
            .collect::<Result<Vec<_>, _>>()?;
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?.port(settings.port);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from: mailbox(&settings.from)?,
            recipients,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, digest: &AlertDigest) -> Result<(), NotifyError> {
        let mut message = Message::builder()
            .from(self.from.clone())
            .subject(digest.subject.clone())
            .header(ContentType::TEXT_HTML);
        for recipient in &self.recipients {
            message = message.to(recipient.clone());
        }
        let message = message.body(digest.html.clone())?;

        let response = self.transport.send(message).await?;
        if !response.is_positive() {
            return Err(NotifyError::Rejected(response.code().to_string()));
        }
        info!(recipients = self.recipients.len(), "alert email sent");
        Ok(())
    }
}

struct DigestRow {
    entity_id: i64,
    issue: &'static str,
    temperature: String,
    soil_moisture: String,
    recorded_at: String,
    detail: String,
}

#[derive(Template)]
#[template(path = "alert_digest.html")]
struct AlertDigestTemplate {
    rows: Vec<DigestRow>,
    row_count: usize,
    entity_count: usize,
    generated_at: String,
}

fn fmt_measure(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"))
}

pub fn render_digest(rows: &[Reading], now: DateTime<Utc>) -> Result<AlertDigest, askama::Error> {
    let entity_count = rows
        .iter()
        .map(|r| r.entity_id)
        .collect::<BTreeSet<_>>()
        .len();
    let template = AlertDigestTemplate {
        rows: rows
            .iter()
            .map(|r| DigestRow {
                entity_id: r.entity_id.0,
                issue: r.error_tag.map_or("Unclassified", |tag| tag.label()),
                temperature: fmt_measure(r.temperature),
                soil_moisture: fmt_measure(r.soil_moisture),
                recorded_at: r
                    .recorded_at
                    .map_or_else(|| "-".to_string(), |at| at.to_rfc3339()),
                detail: r.error_detail.clone().unwrap_or_default(),
            })
            .collect(),
        row_count: rows.len(),
        entity_count,
        generated_at: now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    };
    Ok(AlertDigest {
        subject: format!("Plant health alert: {entity_count} plant(s) need attention"),
        html: template.render()?,
        entity_count,
        row_count: rows.len(),
    })
}

/// Entities with an alert sent strictly after `now - window`.
pub fn recently_alerted(
    history: &[AlertRecord],
    now: DateTime<Utc>,
    window: Duration,
) -> BTreeSet<EntityId> {
    let cutoff = now - window;
    history
        .iter()
        .filter(|record| record.sent_at > cutoff)
        .map(AlertRecord::entity_id)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    NoErrors,
    AllSuppressed { suppressed: usize },
    Sent {
        history_key: String,
        alerted: usize,
        entities: usize,
        suppressed: usize,
    },
}

impl AlertOutcome {
    pub fn message(&self) -> String {
        match self {
            AlertOutcome::NoErrors => "no alert sent: no error rows".to_string(),
            AlertOutcome::AllSuppressed { suppressed } => {
                format!("no new errors after filtering ({suppressed} suppressed)")
            }
            AlertOutcome::Sent {
                alerted, entities, ..
            } => format!("alert sent for {alerted} reading(s) across {entities} plant(s)"),
        }
    }
}

pub struct AlertDeduper {
    history: Arc<dyn ObjectStore>,
    notifier: Arc<dyn Notifier>,
    window: Duration,
}

impl AlertDeduper {
    pub fn new(history: Arc<dyn ObjectStore>, notifier: Arc<dyn Notifier>, window: Duration) -> Self {
        Self {
            history,
            notifier,
            window,
        }
    }

    /// Every readable history record. Listing or decoding problems are logged
    /// and treated as missing history.
    pub async fn load_history(&self) -> Vec<AlertRecord> {
        let keys = match self.history.list(ALERT_HISTORY_PREFIX).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "could not list alert history; assuming none");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for key in keys {
            let bytes = match self.history.get(&key).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(err) => {
                    warn!(%key, error = %err, "skipping unreadable alert history");
                    continue;
                }
            };
            match serde_json::from_slice::<Vec<AlertRecord>>(&bytes) {
                Ok(batch) => records.extend(batch),
                Err(err) => warn!(%key, error = %err, "skipping corrupt alert history"),
            }
        }
        records
    }

    pub async fn run(
        &self,
        error_rows: Vec<Reading>,
        now: DateTime<Utc>,
    ) -> Result<AlertOutcome, AlertError> {
        if error_rows.is_empty() {
            info!("no plant readings contain errors");
            return Ok(AlertOutcome::NoErrors);
        }

        let history = self.load_history().await;
        let recent = recently_alerted(&history, now, self.window);
        let total = error_rows.len();
        let fresh: Vec<Reading> = error_rows
            .into_iter()
            .filter(|row| !recent.contains(&row.entity_id))
            .collect();
        let suppressed = total - fresh.len();
        if fresh.is_empty() {
            info!(suppressed, "no new errors after filtering");
            return Ok(AlertOutcome::AllSuppressed { suppressed });
        }

        let digest = render_digest(&fresh, now)?;
        if let Err(err) = self.notifier.send(&digest).await {
            error!(error = %err, "alert dispatch failed; history left untouched");
            return Err(err.into());
        }

        let records: Vec<AlertRecord> = fresh
            .into_iter()
            .map(|reading| AlertRecord {
                sent_at: now,
                reading,
            })
            .collect();
        let body = serde_json::to_vec(&records)?;
        let key = history_key(now, &body);
        if let Err(source) = self.history.put(&key, &body).await {
            error!(%key, error = %source, "alert sent but history write failed");
            return Err(AlertError::History { key, source });
        }

        info!(
            alerted = records.len(),
            entities = digest.entity_count,
            suppressed,
            %key,
            "alert digest sent"
        );
        Ok(AlertOutcome::Sent {
            history_key: key,
            alerted: records.len(),
            entities: digest.entity_count,
            suppressed,
        })
    }
}
