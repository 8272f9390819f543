use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use std::fmt;

/// Wrapper for secret strings (e.g., tokens, passwords) that prints a "<REDACTED, length {length of the secret}>" string for Debug/Display
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    /// Access the raw secret if explicitly needed
    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

/// Username sent with a token that was configured without one, as Docker does
/// for identity tokens.
static TOKEN_USERNAME: &str = "<token>";

/// Auth material for one registry host. The token is the password, also when
/// exchanged for a bearer token at the registry's token service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub token: SecretString,
}

impl Credentials {
    pub fn new(username: Option<String>, token: SecretString) -> Self {
        Self { username, token }
    }

    pub fn registry_auth(&self) -> RegistryAuth {
        RegistryAuth::Basic(
            self.username
                .clone()
                .unwrap_or_else(|| TOKEN_USERNAME.to_string()),
            self.token.expose_secret().to_string(),
        )
    }
}
