use crate::models::Settings;
use reqwest::Client;
use std::time::Duration;
use urlencoding::encode;

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(15);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Optional forwarding relay placed in front of every outbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relay {
    base: Option<String>,
    key: Option<String>,
}

impl Relay {
    #[cfg(test)]
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let base = settings
            .relay_url
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('?').to_string());
        let key = settings
            .relay_key
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Self { base, key }
    }

    pub fn wrap(&self, target: &str) -> String {
        match (&self.base, &self.key) {
            (None, _) => target.to_string(),
            (Some(base), Some(key)) => format!("{base}?key={key}&url={}", encode(target)),
            (Some(base), None) => format!("{base}?{}", encode(target)),
        }
    }
}
