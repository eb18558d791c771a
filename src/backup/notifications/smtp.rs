use crate::backup::function_path;
use crate::backup::notifications::Notification;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::secret::SecretRef;
use bon::Builder;
use function_name::named;
use getset::Getters;
use itertools::Itertools;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt::Display;
use validator::Validate;

/// Failure reports by e-mail.
///
/// Credentials are optional; the password is a [`SecretRef`] resolved right
/// before sending, so it never sits in memory between reports.
#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, Getters)]
#[serde(deny_unknown_fields)]
#[getset(get = "pub")]
pub struct SmtpNotificationConfig {
    #[validate(length(min = 1))]
    #[builder(into)]
    host: String,
    #[builder(into)]
    smtp_mode: SmtpMode,
    #[builder(into)]
    from: Mailbox,
    #[validate(length(min = 1))]
    #[builder(into)]
    to: Vec<Mailbox>,
    #[builder(into)]
    username: Option<String>,
    password: Option<SecretRef>,
}

/// - `Unsecured`: plain text connection, only for local relays
/// - `Ssl`: TLS from the start
/// - `StartTls`: plain text upgraded to TLS
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmtpMode {
    Unsecured,
    Ssl,
    StartTls,
}

impl SmtpNotificationConfig {
    fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Ok(Some(Credentials::new(
                username.clone(),
                password.resolve()?.inner().to_string(),
            ))),
            _ => Ok(None),
        }
    }
}

impl Notification for SmtpNotificationConfig {
    #[named]
    fn send<D1: Display, D2: Display>(&self, topic: D1, msg: D2) -> Result<()> {
        tracing::info!(
            "Sending failure notification from {} to {}",
            self.from,
            self.to.iter().join(", ")
        );
        let email = self
            .to
            .iter()
            .fold(Message::builder(), |email, send_to| {
                email.to(send_to.clone())
            })
            .from(self.from.clone())
            .subject(topic.to_string())
            .header(ContentType::TEXT_PLAIN)
            .body(msg.to_string())
            .map_err(Error::from)
            .add_msg(format!(
                "Fail to build notification email from {} to {}",
                self.from,
                self.to.iter().join(", ")
            ))
            .add_fn_name(function_path!())?;

        let builder = match self.smtp_mode {
            SmtpMode::Unsecured => Ok(SmtpTransport::builder_dangerous(self.host.as_str())),
            SmtpMode::Ssl => SmtpTransport::relay(self.host.as_str()),
            SmtpMode::StartTls => SmtpTransport::starttls_relay(self.host.as_str()),
        }
        .map_err(Error::from)
        .add_msg(format!(
            "Failed to build smtp client for host: {:?} with mode {:?}",
            self.host, self.smtp_mode
        ))
        .add_fn_name(function_path!())?;
        let mailer = match self.credentials().add_fn_name(function_path!())? {
            Some(credentials) => builder.credentials(credentials),
            None => builder,
        }
        .build();

        let response = mailer
            .send(&email)
            .map_err(Error::from)
            .add_fn_name(function_path!())?;
        if response.is_positive() {
            Ok(())
        } else {
            let error_vec = response
                .message()
                .map(|m| Error::smtp_send_error(m.to_owned()))
                .collect_vec();
            Err(Error::lots_of_error(error_vec))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::class::ErrorClass;

    fn config(host: String, to: Vec<Mailbox>) -> SmtpNotificationConfig {
        SmtpNotificationConfig::builder()
            .host(host)
            .smtp_mode(SmtpMode::Unsecured)
            .from("backup@example.com".parse::<Mailbox>().unwrap())
            .to(to)
            .username("backup")
            .password(SecretRef::Value("testpass".into()))
            .build()
    }

    #[test]
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn test_smtp_notification_send() {
        let server = maik::MockServer::builder().no_verify_credentials().build();
        let config = config(
            format!("{}:{}", server.host(), server.port()),
            vec!["dba@example.com".parse::<Mailbox>().unwrap()],
        );

        server.start();
        std::thread::sleep(std::time::Duration::from_millis(100));

        let result = config.send("[db-backup] shop failed", "[shop] failed in dumping");

        std::thread::sleep(std::time::Duration::from_millis(200));

        if result.is_ok() {
            let assertion = maik::MailAssertion::new()
                .recipients_are(["dba@example.com"])
                .body_is("[shop] failed in dumping");
            assert!(server.assert(assertion));
        }
    }

    #[test]
    fn test_smtp_notification_validation() {
        let valid = config(
            "smtp.example.com".into(),
            vec!["dba@example.com".parse::<Mailbox>().unwrap()],
        );
        assert!(valid.validate().is_ok());

        let no_recipients = config("smtp.example.com".into(), vec![]);
        assert!(no_recipients.validate().is_err());
    }

    #[test]
    fn test_missing_password_fails_before_connecting() {
        let mut config = config(
            "127.0.0.1:1".into(),
            vec!["dba@example.com".parse::<Mailbox>().unwrap()],
        );
        config.password = Some(SecretRef::Env("DB_BACKUP_TEST_UNSET_SMTP_PASSWORD".into()));
        let err = config.send("topic", "body").unwrap_err();
        assert_eq!(err.class(), ErrorClass::PermanentConfig);
    }

    #[test]
    fn test_smtp_mode_serialization() {
        for (mode, expected) in [
            (SmtpMode::Unsecured, "\"unsecured\""),
            (SmtpMode::Ssl, "\"ssl\""),
            (SmtpMode::StartTls, "\"start_tls\""),
        ] {
            let serialized = serde_json::to_string(&mode).unwrap();
            assert_eq!(serialized, expected);
            let deserialized: SmtpMode = serde_json::from_str(&serialized).unwrap();
            assert_eq!(deserialized, mode);
        }
    }

    #[test]
    fn test_deserialize_with_env_password() {
        let yaml = r#"
host: smtp.example.com:465
smtp_mode: ssl
from: backup@example.com
to: [dba@example.com]
username: backup
password: { env: SMTP_PASSWORD }
"#;
        let config: SmtpNotificationConfig = serde_yml::from_str(yaml).unwrap();
        assert_eq!(
            config.password(),
            &Some(SecretRef::Env("SMTP_PASSWORD".into()))
        );
        assert_eq!(config.to().len(), 1);
    }
}
