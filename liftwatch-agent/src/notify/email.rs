use super::{Sink, SinkError};
use crate::config::{EmailConfig, SinkKind};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;

/// Sends each notification as a single mail to every recipient over implicit TLS
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    subject: String,
}

impl EmailSink {
    pub fn new(config: &EmailConfig) -> Result<Self, SinkError> {
        let from = parse_mailbox(&config.user)?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| parse_mailbox(r))
            .collect::<Result<Vec<_>, _>>()?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)?
            .port(config.smtp_port)
            .credentials(Credentials::new(
                config.user.clone(),
                config.password.expose().to_string(),
            ))
            .build();

        Ok(Self {
            transport,
            from,
            recipients,
            subject: config.subject.clone(),
        })
    }

    fn compose(&self, body: &str) -> Result<Message, SinkError> {
        compose_message(&self.from, &self.recipients, &self.subject, body)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, SinkError> {
    address
        .parse()
        .map_err(|e| SinkError::Config(format!("invalid email address `{address}`: {e}")))
}

fn compose_message(
    from: &Mailbox,
    recipients: &[Mailbox],
    subject: &str,
    body: &str,
) -> Result<Message, SinkError> {
    let mut builder = Message::builder()
        .from(from.clone())
        .subject(subject)
        .header(ContentType::TEXT_PLAIN);
    for recipient in recipients {
        builder = builder.to(recipient.clone());
    }

    builder
        .body(body.to_string())
        .map_err(|e| SinkError::Other(format!("failed to build email: {e}")))
}

#[async_trait]
impl Sink for EmailSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Email
    }

    async fn deliver(&self, message: &str) -> Result<(), SinkError> {
        let email = self.compose(message)?;
        self.transport.send(email).await?;
        debug!("Email sent to {} recipients", self.recipients.len());
        Ok(())
    }
}
