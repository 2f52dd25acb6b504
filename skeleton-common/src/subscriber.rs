use async_trait::async_trait;
use tracing::{debug, warn};

use crate::messaging::{MessageHandler, MessagingClient, MessagingError, Subscription};
use crate::probes::{PingEnvelope, ServiceStats};

/// Answers health pings with the stats of this process, so that status
/// pages can count the live replicas of the service.
pub struct HealthResponder {
    client: MessagingClient,
    app_version: String,
}

impl HealthResponder {
    pub fn new(client: MessagingClient, app_version: &str) -> Self {
        Self {
            client,
            app_version: app_version.to_owned(),
        }
    }
}

#[async_trait]
impl MessageHandler<PingEnvelope> for HealthResponder {
    async fn handle(&self, ping: PingEnvelope) {
        if ping.reply_inbox.is_empty() {
            warn!("health ping without a reply inbox, dropping it");
            return;
        }

        let stats = ServiceStats::collect(&self.app_version).with_reply_inbox(&ping.reply_inbox);
        match self.client.publish(&ping.reply_inbox, &stats).await {
            Ok(()) => debug!(reply_inbox = %ping.reply_inbox, "answered health ping"),
            Err(err) => warn!(
                reply_inbox = %ping.reply_inbox,
                error = %err,
                "failed to answer health ping"
            ),
        }
    }
}

/// Subscribes this process to the health pings sent on `subject`.
pub async fn subscribe_health(
    client: &MessagingClient,
    subject: &str,
    app_version: &str,
) -> Result<Subscription, MessagingError> {
    client
        .subscribe(subject, HealthResponder::new(client.clone(), app_version))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MemoryTransport;
    use crate::probes::MessagingProbe;
    use futures::StreamExt;
    use health::{Probe, ProbeStatus};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn replies_on_the_ping_inbox() {
        let client = MessagingClient::new(Arc::new(MemoryTransport::new()));
        let _subscription = subscribe_health(&client, "api.health", "3.2.1").await.unwrap();

        let mut replies = client.subscribe_raw("_INBOX.test").await.unwrap();
        client
            .publish(
                "api.health",
                &PingEnvelope {
                    reply_inbox: "_INBOX.test".to_owned(),
                },
            )
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .unwrap()
            .unwrap();
        let stats: ServiceStats = reply.decode().unwrap();
        assert_eq!(stats.app_version, "3.2.1");
        assert_eq!(stats.reply_inbox, "_INBOX.test");
        assert!(!stats.hostname.is_empty());
    }

    #[tokio::test]
    async fn probe_counts_subscribed_replicas() {
        let client = MessagingClient::new(Arc::new(MemoryTransport::new()));
        let mut subscriptions = Vec::new();
        for _ in 0..3 {
            subscriptions.push(
                subscribe_health(&client, "scheduler.health", "1.0.0")
                    .await
                    .unwrap(),
            );
        }

        let probe = MessagingProbe::new(Some(client.clone()), "scheduler.health")
            .with_window(Duration::from_millis(200));
        let result = probe.run().await;
        assert_eq!(result.status(), ProbeStatus::Healthy);
        assert_eq!(result.instance_count(), 3);

        // One replica goes away.
        if let Some(subscription) = subscriptions.pop() {
            subscription.unsubscribe();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = probe.run().await;
        assert_eq!(result.instance_count(), 2);
    }

    #[tokio::test]
    async fn pings_without_inbox_are_dropped() {
        let transport = Arc::new(MemoryTransport::new());
        let client = MessagingClient::new(transport.clone());
        let subscription = subscribe_health(&client, "api.health", "1.0.0").await.unwrap();

        client
            .publish(
                "api.health",
                &PingEnvelope {
                    reply_inbox: String::new(),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(subscription.is_active());
    }
}
