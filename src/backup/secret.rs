//! References to credentials that are resolved only when a job needs them.

use crate::backup::redacted::RedactedString;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a secret comes from.
///
/// ```yaml
/// password: { env: DB_PASSWORD }
/// password: { file: /run/secrets/db_password }
/// password: { value: hunter22 }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SecretRef {
    Value(RedactedString),
    Env(String),
    File(PathBuf),
}

impl SecretRef {
    /// Resolves the secret. An absent or empty secret is a configuration
    /// failure; the error names the source, never the value.
    pub fn resolve(&self) -> Result<RedactedString> {
        let secret = match self {
            SecretRef::Value(v) => v.clone(),
            SecretRef::Env(var) => std::env::var(var)
                .map(RedactedString::from)
                .map_err(|_| Error::MissingCredential(format!("environment variable {var}")))?,
            SecretRef::File(path) => std::fs::read_to_string(path)
                .map(|s| RedactedString::from(s.trim_end_matches(['\r', '\n'])))
                .map_err(|e| Error::MissingCredential(format!("file {path:?}: {e}")))?,
        };

        if secret.inner().is_empty() {
            return Err(Error::MissingCredential(self.describe()));
        }
        Ok(secret)
    }

    fn describe(&self) -> String {
        match self {
            SecretRef::Value(_) => "inline value is empty".to_string(),
            SecretRef::Env(var) => format!("environment variable {var} is empty"),
            SecretRef::File(path) => format!("file {path:?} is empty"),
        }
    }
}
