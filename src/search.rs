use crate::message::{MessageId, QueryHit};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// One file offered by one responder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Identity of the query (and of the hit that answered it).
    pub search_id: MessageId,
    pub address: IpAddr,
    pub transfer_port: u16,
    pub file_name: String,
    pub firewalled: bool,
}

impl SearchResult {
    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.transfer_port)
    }
}

/// Results of a running search. Lives until `Servent::stop_search`.
#[derive(Debug)]
pub struct SearchSession {
    id: MessageId,
    keywords: Vec<String>,
    results: Mutex<Vec<SearchResult>>,
    arrived: Notify,
}

impl SearchSession {
    pub fn new(id: MessageId, keywords: Vec<String>) -> Self {
        SearchSession {
            id,
            keywords,
            results: Mutex::new(Vec::new()),
            arrived: Notify::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    /// One result per matched file name. A hit without a resolved address is
    /// ignored: nobody could download from it.
    pub async fn add_hit(&self, id: MessageId, hit: &QueryHit) -> usize {
        let Some(address) = hit.address else {
            return 0;
        };
        let mut results = self.results.lock().await;
        for file_name in &hit.matches {
            results.push(SearchResult {
                search_id: id,
                address,
                transfer_port: hit.transfer_port,
                file_name: file_name.clone(),
                firewalled: hit.firewalled,
            });
        }
        drop(results);
        self.arrived.notify_waiters();
        hit.matches.len()
    }

    pub async fn results(&self) -> Vec<SearchResult> {
        self.results.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.lock().await.len()
    }

    /// Waits until at least `count` results arrived or `limit` elapsed.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<SearchResult> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let notified = self.arrived.notified();
            {
                let results = self.results.lock().await;
                if results.len() >= count {
                    return results.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.results().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(matches: &[&str], firewalled: bool) -> QueryHit {
        QueryHit {
            matches: matches.iter().map(|s| s.to_string()).collect(),
            transfer_port: 6348,
            firewalled,
            address: Some("10.0.0.2".parse().unwrap()),
        }
    }

    #[tokio::test]
    async fn test_one_result_per_match() {
        let id = MessageId::random();
        let session = SearchSession::new(id, vec!["foo".into()]);
        assert_eq!(session.add_hit(id, &hit(&["foo.txt", "foo.mp3"], false)).await, 2);

        let results = session.results().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].file_name, "foo.txt");
        assert_eq!(results[1].source(), "10.0.0.2:6348".parse().unwrap());
        assert!(results.iter().all(|r| r.search_id == id && !r.firewalled));
    }

    #[tokio::test]
    async fn test_hit_without_address_ignored() {
        let id = MessageId::random();
        let session = SearchSession::new(id, vec![]);
        let mut h = hit(&["x"], true);
        h.address = None;
        assert_eq!(session.add_hit(id, &h).await, 0);
        assert_eq!(session.len().await, 0);
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_hit() {
        let id = MessageId::random();
        let session = std::sync::Arc::new(SearchSession::new(id, vec![]));
        let s = std::sync::Arc::clone(&session);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            s.add_hit(id, &hit(&["late.txt"], false)).await;
        });
        let results = session.wait_for(1, Duration::from_secs(5)).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        let session = SearchSession::new(MessageId::random(), vec![]);
        let results = session.wait_for(1, Duration::from_millis(20)).await;
        assert!(results.is_empty());
    }
}
