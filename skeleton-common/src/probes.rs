use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use health::{Probe, ProbeResult};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::messaging::MessagingClient;

const MEGABYTE: u64 = 1 << 20;

pub const DEFAULT_DB_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REPLY_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Published on a service health subject; every live replica answers on `reply_inbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingEnvelope {
    pub reply_inbox: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemStats {
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
    pub virtual_bytes: u64,
}

impl MemStats {
    /// Zeroes where `/proc` is not available.
    pub fn read() -> Self {
        std::fs::read_to_string("/proc/self/status")
            .map(|status| Self::parse(&status))
            .unwrap_or_default()
    }

    fn parse(status: &str) -> Self {
        let mut stats = MemStats::default();
        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let slot = match key {
                "VmRSS" => &mut stats.rss_bytes,
                "VmHWM" => &mut stats.peak_rss_bytes,
                "VmSize" => &mut stats.virtual_bytes,
                _ => continue,
            };
            let kilobytes = value
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse::<u64>()
                .unwrap_or(0);
            *slot = kilobytes * 1024;
        }
        stats
    }
}

/// What a replica reports about itself when pinged. The JSON field names
/// are shared with the rest of the fleet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceStats {
    pub app_version: String,
    /// Alive tokio tasks.
    #[serde(rename = "go_routines")]
    pub tasks: u64,
    #[serde(rename = "go_version")]
    pub runtime: String,
    pub hostname: String,
    pub cpu_cores: u32,
    pub mem_stats: MemStats,
    pub reply_inbox: String,
}

impl ServiceStats {
    pub fn collect(app_version: &str) -> Self {
        let (tasks, runtime) = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let metrics = handle.metrics();
                (
                    metrics.num_alive_tasks() as u64,
                    format!("tokio, {} workers", metrics.num_workers()),
                )
            }
            Err(_) => (0, "no runtime".to_owned()),
        };

        Self {
            app_version: app_version.to_owned(),
            tasks,
            runtime,
            hostname: hostname(),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| u32::try_from(n.get()).unwrap_or(u32::MAX))
                .unwrap_or(1),
            mem_stats: MemStats::read(),
            reply_inbox: String::new(),
        }
    }

    pub fn with_reply_inbox(mut self, reply_inbox: &str) -> Self {
        self.reply_inbox = reply_inbox.to_owned();
        self
    }
}

impl fmt::Display for ServiceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), {}, mem: {}M, peak: {}M, tasks: {}",
            self.app_version,
            self.runtime,
            self.hostname,
            self.mem_stats.rss_bytes / MEGABYTE,
            self.mem_stats.peak_rss_bytes / MEGABYTE,
            self.tasks,
        )
    }
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_owned())
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Reports on the local process. Never fails.
pub struct ProcessStatsProbe {
    app_version: String,
}

impl ProcessStatsProbe {
    pub fn new(app_version: &str) -> Self {
        Self {
            app_version: app_version.to_owned(),
        }
    }
}

#[async_trait]
impl Probe for ProcessStatsProbe {
    async fn run(&self) -> ProbeResult {
        ProbeResult::healthy(ServiceStats::collect(&self.app_version).to_string())
    }
}

pub type PoolAccessor = Arc<dyn Fn() -> Option<PgPool> + Send + Sync>;

/// Checks a Postgres server and reports its version, connections and uptime.
///
/// The pool is looked up when the probe runs, so that probes can be built
/// before the database is connected.
pub struct PostgresProbe {
    pool: PoolAccessor,
    timeout: Duration,
}

#[derive(Debug, sqlx::FromRow)]
struct Diagnostics {
    version: String,
    num_connections: i64,
    max_connections: i64,
    connected_apps: String,
    uptime_secs: i64,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PostgreSQL v{}, conns: {}/{} ({}), uptime: {}",
            self.version,
            self.num_connections,
            self.max_connections,
            self.connected_apps,
            format_uptime(self.uptime_secs),
        )
    }
}

impl PostgresProbe {
    pub fn new<F>(pool: F) -> Self
    where
        F: Fn() -> Option<PgPool> + Send + Sync + 'static,
    {
        Self {
            pool: Arc::new(pool),
            timeout: DEFAULT_DB_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

async fn diagnostics(pool: &PgPool) -> Result<Diagnostics, sqlx::Error> {
    sqlx::query_as::<_, Diagnostics>(
        r#"
SELECT
    split_part(version(), ' ', 2) AS version,
    COALESCE((SELECT SUM(numbackends) FROM pg_stat_database), 0)::bigint AS num_connections,
    (SELECT setting FROM pg_settings WHERE name = 'max_connections')::bigint AS max_connections,
    array_to_string(array(
        SELECT application_name || ': ' || COUNT(state = 'active' OR NULL) || '/' || COUNT(1)
        FROM pg_stat_activity
        WHERE application_name <> ''
        GROUP BY application_name
        ORDER BY lower(application_name)
    ), ', ') AS connected_apps,
    extract(epoch FROM current_timestamp - pg_postmaster_start_time())::bigint AS uptime_secs
        "#,
    )
    .fetch_one(pool)
    .await
}

#[async_trait]
impl Probe for PostgresProbe {
    async fn run(&self) -> ProbeResult {
        let Some(pool) = (self.pool)() else {
            return ProbeResult::error("database is not initialised");
        };

        match tokio::time::timeout(self.timeout, diagnostics(&pool)).await {
            Ok(Ok(diagnostics)) => ProbeResult::healthy(diagnostics.to_string()),
            Ok(Err(err)) => ProbeResult::error(err.to_string()),
            Err(_) => ProbeResult::error(format!(
                "database did not answer within {}ms",
                self.timeout.as_millis()
            )),
        }
    }
}

/// `26h3m4s`, `3m4s` or `4s`.
pub fn format_uptime(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let (hours, minutes, seconds) = (seconds / 3600, seconds / 60 % 60, seconds % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Counts the live replicas of a service by pinging its health subject and
/// collecting the replies for a fixed window after the ping.
pub struct MessagingProbe {
    client: Option<MessagingClient>,
    subject: String,
    window: Duration,
    ping_timeout: Duration,
}

impl MessagingProbe {
    pub fn new(client: Option<MessagingClient>, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_owned(),
            window: DEFAULT_REPLY_WINDOW,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Bound on the broker round trip made before pinging the replicas.
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }
}

#[async_trait]
impl Probe for MessagingProbe {
    async fn run(&self) -> ProbeResult {
        let Some(client) = &self.client else {
            return ProbeResult::error("messaging is not configured");
        };
        if !client.is_connected() {
            return ProbeResult::error("failed to ping nats: not connected to the message broker");
        }
        match tokio::time::timeout(self.ping_timeout, client.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return ProbeResult::error(format!("failed to ping nats: {err}")),
            Err(_) => {
                return ProbeResult::error(format!(
                    "failed to ping nats: no answer within {}ms",
                    self.ping_timeout.as_millis()
                ))
            }
        }

        let reply_inbox = client.new_inbox();
        let mut replies = match client.subscribe_raw(&reply_inbox).await {
            Ok(replies) => replies,
            Err(err) => return ProbeResult::error(format!("failed to subscribe to inbox: {err}")),
        };

        let ping = PingEnvelope {
            reply_inbox: reply_inbox.clone(),
        };
        if let Err(err) = client.publish(&self.subject, &ping).await {
            return ProbeResult::error(format!("failed to send ping request: {err}"));
        }

        let window = tokio::time::sleep(self.window);
        tokio::pin!(window);
        let started = Instant::now();

        let mut summaries = Vec::new();
        loop {
            tokio::select! {
                _ = &mut window => break,
                reply = replies.next() => {
                    let Some(reply) = reply else {
                        warn!(
                            subject = %self.subject,
                            "reply inbox closed before the end of the window"
                        );
                        break;
                    };
                    match reply.decode::<ServiceStats>() {
                        Ok(stats) => summaries.push(stats.to_string()),
                        Err(err) => {
                            return ProbeResult::error(format!("failed to decode reply: {err}"));
                        }
                    }
                }
            }
        }

        tracing::debug!(
            subject = %self.subject,
            replies = summaries.len(),
            waited_ms = started.elapsed().as_millis() as u64,
            "collected health replies"
        );

        let count = u32::try_from(summaries.len()).unwrap_or(u32::MAX);
        ProbeResult::healthy_instances(summaries.join("<br>"), count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{MemoryTransport, MessageHandler, Subscription};
    use health::ProbeStatus;

    fn memory() -> (Arc<MemoryTransport>, MessagingClient) {
        let transport = Arc::new(MemoryTransport::new());
        (transport.clone(), MessagingClient::new(transport))
    }

    struct Replica {
        client: MessagingClient,
        hostname: String,
    }

    #[async_trait]
    impl MessageHandler<PingEnvelope> for Replica {
        async fn handle(&self, ping: PingEnvelope) {
            let stats = ServiceStats {
                app_version: "1.0.0".to_owned(),
                hostname: self.hostname.clone(),
                ..Default::default()
            }
            .with_reply_inbox(&ping.reply_inbox);
            self.client.publish(&ping.reply_inbox, &stats).await.unwrap();
        }
    }

    async fn replicas(client: &MessagingClient, subject: &str, count: usize) -> Vec<Subscription> {
        let mut subscriptions = Vec::new();
        for i in 0..count {
            let replica = Replica {
                client: client.clone(),
                hostname: format!("replica-{i}"),
            };
            subscriptions.push(client.subscribe(subject, replica).await.unwrap());
        }
        subscriptions
    }

    #[tokio::test]
    async fn no_replies_is_an_error_with_zero_instances() {
        let (_, client) = memory();
        let probe = MessagingProbe::new(Some(client), "api.health")
            .with_window(Duration::from_millis(50));

        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Error);
        assert_eq!(result.instance_count(), 0);
    }

    #[tokio::test]
    async fn three_replicas_are_counted() {
        let (_, client) = memory();
        let _replicas = replicas(&client, "scheduler.health", 3).await;
        let probe = MessagingProbe::new(Some(client), "scheduler.health")
            .with_window(Duration::from_millis(200));

        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Healthy);
        assert_eq!(result.instance_count(), 3);
        assert_eq!(result.info().matches("<br>").count(), 2);
        for i in 0..3 {
            assert!(result.info().contains(&format!("replica-{i}")));
        }
    }

    #[tokio::test]
    async fn undecodable_reply_fails_without_waiting_out_the_window() {
        let (_, client) = memory();
        let mut pings = client.subscribe_raw("api.health").await.unwrap();
        let responder = client.clone();
        tokio::spawn(async move {
            while let Some(ping) = pings.next().await {
                let ping: PingEnvelope = ping.decode().unwrap();
                responder.publish(&ping.reply_inbox, "garbage").await.unwrap();
            }
        });

        let probe =
            MessagingProbe::new(Some(client), "api.health").with_window(Duration::from_secs(5));
        let started = Instant::now();
        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Error);
        assert!(result.info().starts_with("failed to decode reply"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn broker_down_fails_immediately() {
        let (transport, client) = memory();
        transport.set_connected(false);
        let probe =
            MessagingProbe::new(Some(client), "api.health").with_window(Duration::from_secs(5));

        let started = Instant::now();
        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Error);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn half_open_connection_fails_at_the_ping_timeout() {
        let (transport, client) = memory();
        let _replicas = replicas(&client, "api.health", 2).await;
        transport.set_stalled(true);
        assert!(client.is_connected());
        let probe = MessagingProbe::new(Some(client), "api.health")
            .with_window(Duration::from_secs(5))
            .with_ping_timeout(Duration::from_millis(50));

        let started = Instant::now();
        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Error);
        assert_eq!(result.instance_count(), 0);
        assert_eq!(result.info(), "failed to ping nats: no answer within 50ms");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn missing_client_is_an_error() {
        let result = MessagingProbe::new(None, "api.health").run().await;
        assert_eq!(result.status(), ProbeStatus::Error);
        assert_eq!(result.info(), "messaging is not configured");
    }

    #[tokio::test]
    async fn process_stats_are_always_healthy() {
        let result = ProcessStatsProbe::new("2.1.0").run().await;

        assert!(result.is_healthy());
        assert_eq!(result.instance_count(), 1);
        assert!(result.info().starts_with("2.1.0 (tokio, "));
        assert!(result.info().contains("tasks: "));
    }

    #[tokio::test]
    async fn postgres_probe_without_pool() {
        let result = PostgresProbe::new(|| None).run().await;
        assert_eq!(result.status(), ProbeStatus::Error);
        assert_eq!(result.info(), "database is not initialised");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn postgres_probe_reports_server_stats(db: PgPool) {
        let probe = PostgresProbe::new(move || Some(db.clone()));

        let result = probe.run().await;

        assert!(result.is_healthy(), "{}", result.info());
        assert_eq!(result.instance_count(), 1);
        assert!(result.info().starts_with("PostgreSQL v"));
        assert!(result.info().contains("conns: "));
        assert!(result.info().contains("uptime: "));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn postgres_probe_on_closed_pool(db: PgPool) {
        db.close().await;
        let probe = PostgresProbe::new(move || Some(db.clone()));

        let result = probe.run().await;

        assert_eq!(result.status(), ProbeStatus::Error);
    }

    #[test]
    fn uptime_formatting() {
        assert_eq!(format_uptime(4), "4s");
        assert_eq!(format_uptime(184), "3m4s");
        assert_eq!(format_uptime(93_784), "26h3m4s");
        assert_eq!(format_uptime(3_600), "1h0m0s");
        assert_eq!(format_uptime(-5), "0s");
    }

    #[test]
    fn proc_status_parsing() {
        let status = concat!(
            "Name:\tskeleton\n",
            "VmHWM:\t  20480 kB\n",
            "VmRSS:\t  10240 kB\n",
            "VmSize:\t 409600 kB\n",
            "Threads:\t9\n",
        );
        let stats = MemStats::parse(status);
        assert_eq!(stats.rss_bytes, 10 * MEGABYTE);
        assert_eq!(stats.peak_rss_bytes, 20 * MEGABYTE);
        assert_eq!(stats.virtual_bytes, 400 * MEGABYTE);
    }

    #[test]
    fn service_stats_wire_format() {
        let stats = ServiceStats {
            app_version: "1.4.0".to_owned(),
            tasks: 12,
            runtime: "tokio, 4 workers".to_owned(),
            hostname: "api-7f9c".to_owned(),
            cpu_cores: 4,
            mem_stats: MemStats {
                rss_bytes: 64 * MEGABYTE,
                peak_rss_bytes: 80 * MEGABYTE,
                virtual_bytes: 512 * MEGABYTE,
            },
            reply_inbox: "_INBOX.abc".to_owned(),
        };

        let encoded = serde_json::to_value(&stats).unwrap();
        assert_json_diff::assert_json_include!(
            actual: encoded,
            expected: serde_json::json!({
                "app_version": "1.4.0",
                "go_routines": 12,
                "go_version": "tokio, 4 workers",
                "hostname": "api-7f9c",
                "cpu_cores": 4,
                "reply_inbox": "_INBOX.abc",
            })
        );
        assert_eq!(
            stats.to_string(),
            "1.4.0 (tokio, 4 workers), api-7f9c, mem: 64M, peak: 80M, tasks: 12"
        );

        // A ping is a reply with nothing but the inbox filled in.
        let ping: ServiceStats =
            serde_json::from_value(serde_json::json!({"reply_inbox": "_INBOX.xyz"})).unwrap();
        assert_eq!(ping.reply_inbox, "_INBOX.xyz");
        assert_eq!(ping.tasks, 0);
    }
}
