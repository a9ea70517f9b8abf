use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Error;

/// An outbound message handed to the external mail transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Attachment filename and raw bytes, if any
    pub attachment: Option<(String, Vec<u8>)>,
}

/// Boundary to the external mail transport. This subsystem never speaks the
/// mail-server protocol itself; it hands messages across this seam.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Envelope written to the outbox directory. Attachment bytes live in a
/// sibling file so the envelope stays a small readable document.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    to: String,
    subject: String,
    body: String,
    queued_at: chrono::DateTime<Utc>,
    attachment_file: Option<String>,
}

/// Mail transport that drops one envelope file per message into an outbox
/// directory for the external delivery agent to pick up. Written via temp
/// file and rename so the agent never reads a half-written envelope.
pub struct OutboxMailer {
    outbox_dir: PathBuf,
}

impl OutboxMailer {
    pub fn new(outbox_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(outbox_dir)
            .map_err(|e| Error::Mail(format!("Failed to create outbox dir: {}", e)))?;
        Ok(Self {
            outbox_dir: outbox_dir.to_path_buf(),
        })
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::Mail(format!("Failed to write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::Mail(format!("Failed to rename {:?}: {}", tmp, e)))?;
        Ok(())
    }
}

#[async_trait]
impl MailTransport for OutboxMailer {
    async fn send(&self, message: &MailMessage) -> Result<()> {
        let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let attachment_file = match &message.attachment {
            Some((name, bytes)) => {
                let file = format!("mail-{}-{}", stamp, name);
                self.write_atomic(&self.outbox_dir.join(&file), bytes)
                    .await?;
                Some(file)
            }
            None => None,
        };

        let envelope = Envelope {
            to: message.to.clone(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            queued_at: Utc::now(),
            attachment_file,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)
            .map_err(|e| Error::Mail(format!("Failed to serialize envelope: {}", e)))?;

        let path = self.outbox_dir.join(format!("mail-{}.json", stamp));
        self.write_atomic(&path, &bytes).await?;

        info!("Queued mail {:?} to {}", message.subject, message.to);
        Ok(())
    }
}
