use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{config::DiscoveryConfig, error::Error, room_manager::RoomManager};

/// One heartbeat to the routing registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Announcement {
    pub id: String,
    pub region: String,
    pub url: String,
    pub load: usize,
}

/// Periodically tells the registry where this instance is and how many peers it serves.
#[derive(Debug, Clone)]
pub struct DiscoveryReporter {
    config: DiscoveryConfig,
    rooms: RoomManager,
    client: reqwest::Client,
}

impl DiscoveryReporter {
    pub fn new(config: DiscoveryConfig, rooms: RoomManager) -> Self {
        Self {
            config,
            rooms,
            client: reqwest::Client::new(),
        }
    }

    pub async fn announcement(&self) -> Announcement {
        Announcement {
            id: self.config.id.clone(),
            region: self.config.region.clone(),
            url: self.config.public_url.clone(),
            load: self.rooms.peer_count().await,
        }
    }

    pub async fn report(&self) -> Result<(), Error> {
        let announcement = self.announcement().await;
        let mut request = self.client.post(&self.config.registry_url).json(&announcement);
        if let Some(token) = self.config.token.as_deref() {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()?;
        tracing::trace!("reported load {} to registry", announcement.load);
        Ok(())
    }

    /// Reports on every tick until `cancel` fires. Failures are logged and retried next tick.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = self.report().await {
                            tracing::warn!("failed to report to {}: {}", self.config.registry_url, err);
                        }
                    }
                }
            }
            tracing::debug!("discovery loop has finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{peer::tests::test_peer, permissions::Permissions};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            registry_url: "http://127.0.0.1:9/registry".to_string(),
            token: Some("registry-token".to_string()),
            id: "sfu-1".to_string(),
            region: "eu".to_string(),
            public_url: "wss://sfu-1.example.com/socket".to_string(),
            interval: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_announcement_reports_connected_peers() {
        let rooms = RoomManager::new();
        let reporter = DiscoveryReporter::new(config(), rooms.clone());
        assert_eq!(reporter.announcement().await.load, 0);

        let (peer, _rx) = test_peer("1", Permissions::CONNECT).await;
        let room = rooms.get_or_create("42").await;
        room.add_peer(peer.clone()).await.unwrap();

        let announcement = reporter.announcement().await;
        assert_eq!(
            serde_json::to_value(&announcement).unwrap(),
            json!({
                "id": "sfu-1",
                "region": "eu",
                "url": "wss://sfu-1.example.com/socket",
                "load": 1,
            })
        );
        peer.transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let reporter = DiscoveryReporter::new(config(), RoomManager::new());
        let cancel = CancellationToken::new();
        let handle = reporter.spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
