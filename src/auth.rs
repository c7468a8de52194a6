use std::fmt;

use http::HeaderValue;

use crate::config::AuthConfig;
use crate::error::ChatError;

/// Bearer credential attached to every request.
///
/// Passed explicitly into each client call; nothing reads it from ambient
/// state. `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    token: Box<str>,
}

impl Credential {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let token: String = token.into();
        Self {
            token: token.trim().into(),
        }
    }

    /// Read the credential from an environment variable, if set and non-empty.
    #[must_use]
    pub fn from_env(var: &str) -> Option<Self> {
        let value = std::env::var(var).ok()?;
        let credential = Self::new(value);
        if credential.is_empty() {
            None
        } else {
            Some(credential)
        }
    }

    /// Resolve the credential from config: explicit `api_key` first, then the
    /// `api_key_env` variable.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Config`] when neither source yields a key.
    pub fn resolve(config: &AuthConfig) -> Result<Self, ChatError> {
        if let Some(key) = config.api_key.as_deref() {
            let credential = Self::new(key);
            if !credential.is_empty() {
                return Ok(credential);
            }
        }
        if let Some(var) = config.api_key_env.as_deref() {
            if let Some(credential) = Self::from_env(var) {
                return Ok(credential);
            }
            return Err(ChatError::Config(format!(
                "no API key configured and environment variable {var} is unset"
            )));
        }
        Err(ChatError::Config("no API key configured".to_string()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.token.is_empty()
    }

    /// `Authorization: Bearer <token>` header value, marked sensitive.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::InvalidRequest`] when the token contains bytes
    /// that are not valid in a header value.
    pub fn authorization_header(&self) -> Result<HeaderValue, ChatError> {
        let mut value = HeaderValue::try_from(format!("Bearer {}", self.token))
            .map_err(|_| ChatError::InvalidRequest("API key is not a valid header value".into()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.token.is_empty() {
            f.write_str("Credential(<empty>)")
        } else {
            f.write_str("Credential(***)")
        }
    }
}
