//! Peer authentication with the shared cluster token.

mod extractor;

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

pub use extractor::ClusterAuth;

/// Shared secret nodes present to each other.
///
/// `Debug` prints `[REDACTED]`; the value is zeroized on drop.
#[derive(Clone)]
pub struct ClusterToken(Option<SecretString>);

impl ClusterToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()).map(SecretString::from))
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    /// Constant-time comparison with a presented token.
    ///
    /// Always false when no token is configured.
    pub fn verify(&self, provided: &str) -> bool {
        match &self.0 {
            Some(secret) => secret
                .expose_secret()
                .as_bytes()
                .ct_eq(provided.as_bytes())
                .into(),
            None => false,
        }
    }

    /// Value to send on outgoing peer requests.
    pub(crate) fn header_value(&self) -> Option<&str> {
        self.0.as_ref().map(|s| s.expose_secret())
    }
}

impl std::fmt::Debug for ClusterToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(_) => write!(f, "ClusterToken([REDACTED])"),
            None => write!(f, "ClusterToken(None)"),
        }
    }
}
