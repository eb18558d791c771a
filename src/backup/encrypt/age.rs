use crate::backup::encrypt::{Encryptor, EncryptorBuilder};
use crate::backup::result_error::result::Result;
use crate::backup::secret::SecretRef;
use age::secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::result;
use validator::{Validate, ValidationError, ValidationErrors};

/// Minimum length accepted for an inline passphrase
static MIN_PASSPHRASE_LEN: usize = 8;

/// Age encryption, applied to the compressed stream.
///
/// Only passphrase (scrypt) recipients are supported. The passphrase is a
/// [`SecretRef`]; it is resolved when the job starts, and a passphrase that
/// cannot be resolved fails the job without retry.
#[derive(Clone, Deserialize, Serialize, Debug, PartialEq, Eq)]
#[serde(tag = "secret_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AgeEncryptorConfig {
    Passphrase { passphrase: SecretRef },
}

impl<W: Write> EncryptorBuilder<W> for AgeEncryptorConfig {
    fn build_encryptor(&self, writer: W) -> Result<Encryptor<W>> {
        match self {
            AgeEncryptorConfig::Passphrase { passphrase } => {
                let passphrase = passphrase.resolve()?;
                tracing::debug!("Initializing Age encryption with passphrase");
                Ok(
                    age::Encryptor::with_user_passphrase(SecretString::from(
                        passphrase.inner().clone(),
                    ))
                    .wrap_output(writer)?
                    .into(),
                )
            }
        }
    }
}

impl Validate for AgeEncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            AgeEncryptorConfig::Passphrase {
                passphrase: SecretRef::Value(value),
            } if value.inner().len() < MIN_PASSPHRASE_LEN => {
                let mut errors = ValidationErrors::new();
                errors.add(
                    "passphrase",
                    ValidationError::new("length").with_message(
                        format!("passphrase must be at least {MIN_PASSPHRASE_LEN} characters")
                            .into(),
                    ),
                );
                Err(errors)
            }
            AgeEncryptorConfig::Passphrase { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::finish::Finish;
    use crate::backup::result_error::class::ErrorClass;
    use std::io::Read;

    fn passphrase(value: &str) -> AgeEncryptorConfig {
        AgeEncryptorConfig::Passphrase {
            passphrase: SecretRef::Value(value.into()),
        }
    }

    #[test]
    fn test_age_encryptor_config_validation() {
        assert!(passphrase("valid_passphrase_123").validate().is_ok());
        assert!(passphrase("short").validate().is_err());
        let env = AgeEncryptorConfig::Passphrase {
            passphrase: SecretRef::Env("BACKUP_PASSPHRASE".into()),
        };
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_age_encryptor_config_serialization_redacts() {
        let serialized = serde_json::to_string(&passphrase("secret_password")).unwrap();
        assert!(!serialized.contains("secret_password"));
        assert!(serialized.contains("\"secret_type\":\"passphrase\""));
    }

    #[test]
    fn test_age_encryptor_config_deserialization() {
        let json = r#"{"secret_type":"passphrase","passphrase":{"env":"AGE_PASS"}}"#;
        let config: AgeEncryptorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            AgeEncryptorConfig::Passphrase {
                passphrase: SecretRef::Env("AGE_PASS".into())
            }
        );
    }

    #[test]
    fn test_missing_passphrase_is_permanent() {
        let config = AgeEncryptorConfig::Passphrase {
            passphrase: SecretRef::Env("DB_BACKUP_TEST_UNSET_AGE_PASSPHRASE".into()),
        };
        let err = config.build_encryptor(Vec::new()).err().unwrap();
        assert_eq!(err.class(), ErrorClass::PermanentConfig);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let mut encryptor = passphrase("test_passphrase_123")
            .build_encryptor(Vec::new())
            .unwrap();
        encryptor.write_all(b"secret dump").unwrap();
        let ciphertext = encryptor.finish().unwrap();

        let decryptor = age::Decryptor::new(ciphertext.as_slice()).unwrap();
        let identity =
            age::scrypt::Identity::new(SecretString::from("test_passphrase_123".to_string()));
        let mut reader = decryptor
            .decrypt(std::iter::once(&identity as &dyn age::Identity))
            .unwrap();
        let mut plain = String::new();
        reader.read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "secret dump");
    }
}
