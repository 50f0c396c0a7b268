use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::SecretString;

/// Session credentials, injected into the chat session.
pub trait AuthContext: Send + Sync {
    fn bearer_token(&self) -> Option<SecretString>;
    /// Drop the session after the backend rejected our credentials.
    fn force_logout(&self);
}

static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(401|403|unauthori[sz]ed|forbidden|(invalid|expired) token|token (is )?(invalid|expired))\b")
        .expect("auth failure pattern is valid")
});

/// True when a transport error text indicates rejected credentials.
pub fn is_auth_failure(text: &str) -> bool {
    AUTH_FAILURE.is_match(text)
}

/// Fixed token; logout just clears it for the rest of the process.
#[derive(Debug, Default)]
pub struct StaticAuth {
    token: Option<SecretString>,
    logged_out: AtomicBool,
}

impl StaticAuth {
    pub fn new(token: Option<SecretString>) -> Self {
        Self {
            token,
            logged_out: AtomicBool::new(false),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Blank tokens count as no token.
    pub fn from_token(token: Option<String>) -> Self {
        Self::new(
            token
                .filter(|t| !t.trim().is_empty())
                .map(|t| SecretString::new(t.into())),
        )
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out.load(Ordering::SeqCst)
    }
}

impl AuthContext for StaticAuth {
    fn bearer_token(&self) -> Option<SecretString> {
        if self.is_logged_out() {
            return None;
        }
        self.token.clone()
    }

    fn force_logout(&self) {
        if !self.logged_out.swap(true, Ordering::SeqCst) {
            tracing::warn!("credentials rejected, session logged out");
        }
    }
}
