// Mail delivery plugin
// Sends matching staged files as attachments through a pluggable Mailer

use super::args::MailArgs;
use super::{Plugin, PluginContext};
use crate::audit::NewFileEvent;
use crate::config::SmtpConfig;
use crate::errors::PluginError;
use crate::filter;
use crate::models::FileStatus;
use crate::protocol::local::list_directory;
use crate::staging::io_error;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::path::PathBuf;
use tracing::{info, instrument};

/// A file to attach, read from disk when the message is sent
#[derive(Debug, Clone)]
pub struct MailAttachment {
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<MailAttachment>,
}

/// Outbound mail transport
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<(), PluginError>;
}

/// SMTP delivery over lettre's tokio transport
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, PluginError> {
        let builder = if self.config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.hostname)
                .map_err(|e| PluginError::Mail(format!("Invalid SMTP relay: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.hostname)
        };
        let builder = builder.port(self.config.port);
        let builder = match (&self.config.username, &self.config.password) {
            (Some(username), password) if !username.is_empty() => builder.credentials(
                Credentials::new(username.clone(), password.clone().unwrap_or_default()),
            ),
            _ => builder,
        };
        Ok(builder.build())
    }
}

fn build_message(message: &MailMessage) -> Result<Message, PluginError> {
    let mailbox = |address: &str| {
        address
            .parse::<Mailbox>()
            .map_err(|e| PluginError::Mail(format!("Invalid address '{}': {}", address, e)))
    };

    let mut builder = Message::builder()
        .from(mailbox(&message.from)?)
        .subject(message.subject.clone());
    for to in &message.to {
        builder = builder.to(mailbox(to)?);
    }

    let octet_stream = ContentType::parse("application/octet-stream")
        .map_err(|e| PluginError::Mail(e.to_string()))?;
    let mut body = MultiPart::mixed().singlepart(SinglePart::plain(message.body.clone()));
    for attachment in &message.attachments {
        let content = std::fs::read(&attachment.path).map_err(|e| io_error(&attachment.path, e))?;
        body = body.singlepart(
            Attachment::new(attachment.file_name.clone()).body(content, octet_stream.clone()),
        );
    }

    builder
        .multipart(body)
        .map_err(|e| PluginError::Mail(format!("Failed to build message: {}", e)))
}

#[async_trait]
impl Mailer for SmtpMailer {
    #[instrument(skip_all, fields(host = %self.config.hostname, recipients = message.to.len()))]
    async fn send(&self, message: MailMessage) -> Result<(), PluginError> {
        let email = build_message(&message)?;
        self.transport()?
            .send(email)
            .await
            .map_err(|e| PluginError::Mail(format!("SMTP delivery failed: {}", e)))?;
        info!(attachments = message.attachments.len(), "Mail sent");
        Ok(())
    }
}

/// Mail staged files matching a filter
pub struct SendFiles {
    args: MailArgs,
}

impl SendFiles {
    pub fn new(args: MailArgs) -> Self {
        Self { args }
    }

    fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, PluginError> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PluginError::Configuration(format!("mail_send_files requires {}", field)))
    }
}

#[async_trait]
impl Plugin for SendFiles {
    fn name(&self) -> &'static str {
        "mail_send_files"
    }

    #[instrument(skip_all, fields(step_id = ctx.step_id))]
    async fn process(&self, ctx: &mut PluginContext) -> Result<(), PluginError> {
        let from = Self::required(self.args.from_address.as_deref(), "from_address")?;
        let subject = Self::required(self.args.subject.as_deref(), "subject")?;
        let body = Self::required(self.args.body.as_deref(), "body")?;
        let to: Vec<String> = self
            .args
            .to_addresses
            .iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if to.is_empty() {
            return Err(PluginError::Configuration(
                "mail_send_files requires to_addresses".to_string(),
            ));
        }

        let found = list_directory(&ctx.staging_dir).await?;
        let matched = filter::filter_records(&found, &self.args.file_filter);

        if !matched.is_empty() {
            let attachments = matched
                .iter()
                .map(|f| MailAttachment {
                    file_name: f.name.clone(),
                    path: ctx.staging_dir.join(&f.name),
                })
                .collect();
            ctx.mailer
                .send(MailMessage {
                    from: from.to_string(),
                    to: to.clone(),
                    subject: subject.to_string(),
                    body: body.to_string(),
                    attachments,
                })
                .await?;

            for file in &matched {
                ctx.audit
                    .record_file_event(NewFileEvent::new(
                        ctx.run_id,
                        ctx.task_id,
                        ctx.step_id,
                        file,
                        FileStatus::Mailed,
                    ))
                    .await?;
            }
            info!(files = matched.len(), to = ?to, "Mailed files");

            if self.args.delete_files {
                for file in &matched {
                    let path = ctx.staging_dir.join(&file.name);
                    tokio::fs::remove_file(&path)
                        .await
                        .map_err(|e| io_error(&path, e))?;
                }
            }
        }

        ctx.set_files("found_files", &found);
        ctx.set_files("matched_files", &matched);
        ctx.set_files("mailed_files", &matched);
        Ok(())
    }
}
