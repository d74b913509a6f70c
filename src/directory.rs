// =============================================================================
// SERVENT CORE - directory.rs
// Bootstrap directory client
// =============================================================================
//
// The directory keeps a list of reliable servents (nodes that stayed up long
// enough) and hands out candidates to newcomers. It lives elsewhere; this
// module only talks to it.
// =============================================================================

use crate::constants::DIRECTORY_TIMEOUT;
use crate::error::{Result, ServentError};
use crate::peer::PeerRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait BootstrapDirectory: Send + Sync {
    /// Stable name, used to avoid notifying the same directory twice.
    fn endpoint(&self) -> String;

    /// Declares the caller reliable, reachable at its own address + `data_port`.
    async fn add_reliable(&self, data_port: u16) -> Result<()>;

    /// Asks for `signal_reliable_servent` notifications at `callback`.
    async fn subscribe(&self, callback: &str) -> Result<()>;

    async fn reliable_servents(&self, max: usize) -> Result<Vec<PeerRecord>>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReliableRequest {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub callback: String,
}

// -----------------------------------------------------------------------------
// HttpDirectory
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HttpDirectory {
    base: String,
    client: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(DIRECTORY_TIMEOUT).build()?;
        Ok(HttpDirectory {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn failure(&self, reason: impl ToString) -> ServentError {
        ServentError::Directory {
            endpoint: self.base.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl BootstrapDirectory for HttpDirectory {
    fn endpoint(&self) -> String {
        self.base.clone()
    }

    async fn add_reliable(&self, data_port: u16) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/v1/reliable"))
            .json(&ReliableRequest { port: data_port })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.failure(format!("addReliable answered {}", resp.status())));
        }
        Ok(())
    }

    async fn subscribe(&self, callback: &str) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/v1/subscribe"))
            .json(&SubscribeRequest { callback: callback.to_string() })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.failure(format!("subscribe answered {}", resp.status())));
        }
        Ok(())
    }

    async fn reliable_servents(&self, max: usize) -> Result<Vec<PeerRecord>> {
        let resp = self
            .client
            .get(self.url("/v1/reliable"))
            .query(&[("max", max)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.failure(format!("getReliableServents answered {}", resp.status())));
        }
        let mut peers: Vec<PeerRecord> = resp.json().await?;
        peers.truncate(max);
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_normalized() {
        let d = HttpDirectory::new("http://10.0.0.1:8080/").unwrap();
        assert_eq!(d.endpoint(), "http://10.0.0.1:8080");
        assert_eq!(d.url("/v1/reliable"), "http://10.0.0.1:8080/v1/reliable");
    }

    #[tokio::test]
    async fn test_unreachable_directory_errors() {
        // Nothing listens on port 9 of the loopback.
        let d = HttpDirectory::new("http://127.0.0.1:9").unwrap();
        assert!(d.add_reliable(6346).await.is_err());
        assert!(d.reliable_servents(4).await.is_err());
    }
}
