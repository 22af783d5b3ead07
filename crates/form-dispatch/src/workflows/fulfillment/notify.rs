use std::fmt::Debug;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::info;

use crate::config::MailConfig;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("invalid address '{address}': {reason}")]
    Address { address: String, reason: String },
    #[error("unable to read attachment {path:?}: {source}")]
    Attachment {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to build message: {0}")]
    Message(String),
    #[error("smtp delivery failed: {0}")]
    Transport(String),
}

/// Everything sent to one applicant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicantMessage {
    pub recipient: String,
    pub phone_number: String,
    pub merged_pdf: PathBuf,
    pub summary_csv: PathBuf,
}

#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    async fn send(&self, message: ApplicantMessage) -> Result<(), NotifyError>;
}

/// Body template with `{{TOKEN}}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
    pub applicants_champion: String,
    pub applicants_label: String,
    pub sender_name: String,
    pub sender_team: String,
}

impl EmailTemplate {
    pub fn from_config(config: &MailConfig) -> Self {
        Self {
            subject: config.subject.clone(),
            body: config.body_template.clone(),
            applicants_champion: config.applicants_champion.clone(),
            applicants_label: config.applicants_label.clone(),
            sender_name: config.sender_name.clone(),
            sender_team: config.sender_team.clone(),
        }
    }

    pub fn render_body(&self, phone_number: &str) -> String {
        self.body
            .replace(
                "{{SCHOLARSHIP_APPLICANTS_CHAMPION}}",
                &self.applicants_champion,
            )
            .replace("{{phoneNumber}}", phone_number)
            .replace("{{SCHOLARSHIP_APPLICANTS}}", &self.applicants_label)
            .replace("{{SENDER_NAME}}", &self.sender_name)
            .replace("{{SENDER_TEAM}}", &self.sender_team)
    }
}

/// Correlation header some relays use to keep messages out of threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRefId(pub String);

impl Header for EntityRefId {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("X-Entity-Ref-ID")
    }

    fn parse(raw: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self(raw.to_string()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

/// STARTTLS relay delivery through lettre.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
    domain: String,
    template: EmailTemplate,
}

impl SmtpNotifier {
    pub fn from_config(config: &MailConfig) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|err| NotifyError::Transport(err.to_string()))?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        let template = EmailTemplate::from_config(config);
        let sender = sender_mailbox(&template.sender_name, &config.username)?;

        Ok(Self {
            transport,
            sender,
            domain: config.domain.clone(),
            template,
        })
    }

    fn build_message(&self, message: &ApplicantMessage) -> Result<Message, NotifyError> {
        let recipient: Mailbox =
            message
                .recipient
                .parse()
                .map_err(|err: lettre::address::AddressError| NotifyError::Address {
                    address: message.recipient.clone(),
                    reason: err.to_string(),
                })?;

        let pdf = attachment(&message.merged_pdf, "application/pdf")?;
        let csv = attachment(&message.summary_csv, "text/csv")?;
        let now = Utc::now().timestamp_millis();

        Message::builder()
            .from(self.sender.clone())
            .to(recipient)
            .subject(self.template.subject.clone())
            .message_id(Some(message_id(now, &self.domain)))
            .header(EntityRefId(now.to_string()))
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(
                        self.template.render_body(&message.phone_number),
                    ))
                    .singlepart(pdf)
                    .singlepart(csv),
            )
            .map_err(|err| NotifyError::Message(err.to_string()))
    }
}

impl std::fmt::Debug for SmtpNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpNotifier")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn send(&self, message: ApplicantMessage) -> Result<(), NotifyError> {
        let email = self.build_message(&message)?;
        let response = self
            .transport
            .send(email)
            .await
            .map_err(|err| NotifyError::Transport(err.to_string()))?;
        info!(
            recipient = %message.recipient,
            code = %response.code(),
            "email accepted by relay"
        );
        Ok(())
    }
}

fn sender_mailbox(name: &str, address: &str) -> Result<Mailbox, NotifyError> {
    let email = address.parse().map_err(|err: lettre::address::AddressError| {
        NotifyError::Address {
            address: address.to_string(),
            reason: err.to_string(),
        }
    })?;
    let name = Some(name.trim().to_string()).filter(|name| !name.is_empty());
    Ok(Mailbox::new(name, email))
}

fn attachment(path: &Path, content_type: &str) -> Result<SinglePart, NotifyError> {
    let body = std::fs::read(path).map_err(|source| NotifyError::Attachment {
        path: path.to_path_buf(),
        source,
    })?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    let content_type =
        ContentType::parse(content_type).map_err(|err| NotifyError::Message(err.to_string()))?;
    Ok(Attachment::new(file_name).body(body, content_type))
}

fn message_id(now_millis: i64, domain: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("<{now_millis}-{}@{domain}>", &nonce[..9])
}
