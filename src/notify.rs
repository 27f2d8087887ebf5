//! Letting an external monitor know a run finished.

use std::time::Duration;

use reqwest::Client;
use url::Url;

use crate::config::NotifyConfig;
use crate::errors::BackupError;

const PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Pings a dead man's switch (e.g. healthchecks.io) after a successful run,
/// so silent failures get noticed.
#[derive(Debug, Clone)]
pub struct Notifier {
    client: Client,
    url: Url,
}

impl Notifier {
    pub fn new(url: Url) -> Notifier {
        Notifier {
            client: Client::new(),
            url,
        }
    }

    pub fn with_config(cfg: &NotifyConfig) -> Notifier {
        Notifier::new(cfg.ping_url.clone())
    }

    pub async fn ping(&self) -> Result<(), BackupError> {
        debug!("Pinging {}", self.url);

        let failed = |reason: String| BackupError::Notification {
            url: self.url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(self.url.clone())
            .timeout(PING_TIMEOUT)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!("Ping acknowledged ({})", status);
            Ok(())
        } else {
            Err(failed(format!("Request failed with {}", status)))
        }
    }
}
