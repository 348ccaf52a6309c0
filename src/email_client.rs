use anyhow::Result;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use std::env;

/// Thin SMTP wrapper for operator mail. All connection parameters come from
/// the environment; with any of them missing, send() degrades to a log line
/// so the bot keeps running without mail configured.
pub struct EmailClient {
    smtp_host: Option<String>,
    smtp_user: Option<String>,
    smtp_password: Option<String>,
    mail_from: Option<String>,
    mail_to: Option<String>,
}

impl EmailClient {
    pub fn new() -> Self {
        Self {
            smtp_host: env::var("SMTP_HOST").ok().filter(|v| !v.is_empty()),
            smtp_user: env::var("SMTP_USER").ok().filter(|v| !v.is_empty()),
            smtp_password: env::var("SMTP_PASSWORD").ok().filter(|v| !v.is_empty()),
            mail_from: env::var("MAIL_FROM").ok().filter(|v| !v.is_empty()),
            mail_to: env::var("MAIL_TO").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn send(&self, subject: &str, body: &str) {
        let (host, user, password, from, to) = match (
            self.smtp_host.as_deref(),
            self.smtp_user.as_deref(),
            self.smtp_password.as_deref(),
            self.mail_from.as_deref(),
            self.mail_to.as_deref(),
        ) {
            (Some(h), Some(u), Some(p), Some(f), Some(t)) => (h, u, p, f, t),
            _ => {
                log::debug!("email not configured, dropping '{}'", subject);
                return;
            }
        };

        match Self::deliver(host, user, password, from, to, subject, body) {
            Ok(()) => log::info!("email sent: {}", subject),
            Err(err) => log::warn!("failed to send email '{}': {:?}", subject, err),
        }
    }

    fn deliver(
        host: &str,
        user: &str,
        password: &str,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<()> {
        let email = Message::builder()
            .from(from.parse()?)
            .to(to.parse()?)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())?;

        let mailer = SmtpTransport::relay(host)?
            .credentials(Credentials::new(user.to_string(), password.to_string()))
            .build();
        mailer.send(&email)?;
        Ok(())
    }
}

impl Default for EmailClient {
    fn default() -> Self {
        Self::new()
    }
}
