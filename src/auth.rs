//! Cookies from a saved browser storage-state file, so pages load as the
//! logged-in account that produced it.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default = "root_path")]
    pub path: String,
    /// Unix seconds; zero or negative for session cookies.
    #[serde(default = "session_expiry")]
    pub expires: f64,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

fn root_path() -> String {
    "/".to_string()
}

fn session_expiry() -> f64 {
    -1.0
}

impl StoredCookie {
    fn is_expired(&self, now: i64) -> bool {
        self.expires > 0.0 && self.expires < now as f64
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let domain = self.domain.trim_start_matches('.');
        let domain_ok = host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()));
        domain_ok
            && url.path().starts_with(&self.path)
            && (!self.secure || url.scheme() == "https")
    }
}

#[derive(Deserialize)]
struct StorageState {
    #[serde(default)]
    cookies: Vec<StoredCookie>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthState {
    cookies: Vec<StoredCookie>,
}

impl AuthState {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Auth state file not found: {:?}", path))?;
        Self::from_json(&raw).with_context(|| format!("Failed to parse auth state {:?}", path))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let state: StorageState = serde_json::from_str(raw)?;
        Ok(Self {
            cookies: state.cookies,
        })
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    /// Unexpired cookies the browser would send to `url`.
    pub fn cookies_for(&self, url: &str) -> Vec<&StoredCookie> {
        let Ok(url) = Url::parse(url) else {
            return Vec::new();
        };
        let now = chrono::Utc::now().timestamp();
        self.cookies
            .iter()
            .filter(|c| !c.is_expired(now) && c.matches(&url))
            .collect()
    }

    /// `Cookie` header value for `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &str) -> Option<String> {
        let pairs: Vec<String> = self
            .cookies_for(url)
            .into_iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }
}
