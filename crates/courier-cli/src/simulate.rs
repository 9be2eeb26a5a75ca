//! In-memory delivery simulation
//!
//! Runs two gateways, the directory coordinator, delivery workers and the
//! offline store against one [`MemoryQueue`]. Half of the simulated users are
//! connected when messages are pushed; the other half connect afterwards and
//! receive their offline backlog.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{
    ClientFrame, CourierConfig, CourierError, CourierResult, Identity, MessageOptions, Platform,
    PlatformFilter, ServerFrame, SystemTimeSource, TimeSource, Uid,
};
use courier_runtime::{
    Authenticator, Credentials, DeliveryContext, DeliveryService, DirectoryCoordinator, Gateway,
    GatewayTable, MemoryDirectory, MemoryOfflineStore, MemoryQueue, PushRequest, PushService,
    SessionDirectory,
};

use crate::error::{CliError, Result};

const GATEWAY_COUNT: usize = 2;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// Authentication
// ----------------------------------------------------------------------------

/// Accepts tokens of the form `uid:platform`
struct TokenAuthenticator;

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> CourierResult<Identity> {
        let token = credentials
            .get("token")
            .ok_or_else(|| CourierError::unauthenticated("missing token"))?;
        match token.split_once(':') {
            Some((uid, platform)) if !uid.is_empty() && !platform.is_empty() => {
                Ok(Identity::new(uid, platform))
            }
            _ => Err(CourierError::unauthenticated("malformed token")),
        }
    }
}

// ----------------------------------------------------------------------------
// Simulated Client
// ----------------------------------------------------------------------------

/// A connected client that counts messages and acknowledges frames
struct SimulatedClient {
    uid: Uid,
    received: Arc<AtomicUsize>,
    serve: JoinHandle<CourierResult<()>>,
    inbound: mpsc::UnboundedSender<CourierResult<Vec<u8>>>,
}

impl SimulatedClient {
    fn connect(gateway: &Gateway, uid: Uid, platform: &Platform) -> Self {
        let (inbound, inbound_rx) = mpsc::unbounded::<CourierResult<Vec<u8>>>();
        let (outbound, mut outbound_rx) = mpsc::unbounded::<Vec<u8>>();
        let sink = outbound.sink_map_err(|_| CourierError::unavailable("client disconnected"));

        let credentials = Credentials::new().with("token", format!("{}:{}", uid, platform));
        let serving = gateway.clone();
        let serve = tokio::spawn(async move { serving.serve(credentials, inbound_rx, sink).await });

        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        let mut acks = inbound.clone();
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.next().await {
                match ServerFrame::decode(&bytes) {
                    Ok(ServerFrame::Messages {
                        seq,
                        need_ack,
                        messages,
                    }) => {
                        counter.fetch_add(messages.len(), Ordering::SeqCst);
                        if !need_ack {
                            continue;
                        }
                        let Ok(ack) = (ClientFrame::Ack { seq }).encode() else {
                            break;
                        };
                        if acks.send(Ok(ack)).await.is_err() {
                            break;
                        }
                    }
                    Ok(ServerFrame::Kickout { reason }) => {
                        debug!(reason = %reason, "simulated client kicked out");
                    }
                    Ok(ServerFrame::Pong) => {}
                    Err(err) => warn!(error = %err, "simulated client got a bad frame"),
                }
            }
        });

        Self {
            uid,
            received,
            serve,
            inbound,
        }
    }

    fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    /// Close the inbound stream and wait for the gateway to finish the session
    async fn disconnect(self) {
        self.inbound.close_channel();
        match self.serve.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(uid = %self.uid, error = %err, "session ended with error"),
            Err(err) => warn!(uid = %self.uid, error = %err, "session task failed"),
        }
    }
}

// ----------------------------------------------------------------------------
// Report
// ----------------------------------------------------------------------------

/// Delivery statistics of one simulation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub users: usize,
    pub online_users: usize,
    pub messages_per_user: usize,
    pub delivered_live: usize,
    pub stored_offline: usize,
    pub delivered_from_backlog: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub elapsed_ms: u64,
}

// ----------------------------------------------------------------------------
// Simulation
// ----------------------------------------------------------------------------

pub struct Simulation {
    config: CourierConfig,
    users: usize,
    messages: usize,
    phase_timeout: Duration,
}

struct Cluster {
    queue: MemoryQueue,
    directory: Arc<MemoryDirectory>,
    offline: Arc<MemoryOfflineStore>,
    gateways: Vec<Gateway>,
    push: PushService,
    delivery: DeliveryService,
}

impl Simulation {
    pub fn new(config: CourierConfig, users: usize, messages: usize) -> Self {
        Self {
            config,
            users,
            messages,
            phase_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_phase_timeout(mut self, phase_timeout: Duration) -> Self {
        self.phase_timeout = phase_timeout;
        self
    }

    fn start_cluster(&self) -> Cluster {
        let config = &self.config;
        let clock: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
        let queue = MemoryQueue::new();
        let directory = Arc::new(MemoryDirectory::new());
        let offline = Arc::new(MemoryOfflineStore::new(clock.clone()));
        let table = Arc::new(GatewayTable::new());

        let coordinator = Arc::new(DirectoryCoordinator::new(
            Arc::new(TokenAuthenticator),
            directory.clone(),
            Arc::new(queue.clone()),
            config.directory.topic.clone(),
            clock.clone(),
        ));
        let gateways: Vec<Gateway> = (1..=GATEWAY_COUNT)
            .map(|index| {
                let id = format!("{}-{}", config.gateway.name_prefix, index);
                let gateway = Gateway::new(id.into(), config.gateway.clone(), coordinator.clone());
                table.register(gateway.id().clone(), Arc::new(gateway.clone()));
                gateway
            })
            .collect();

        let context = DeliveryContext::new(
            config,
            directory.clone(),
            offline.clone(),
            table,
            clock.clone(),
        );
        let delivery = DeliveryService::start(
            Arc::new(context),
            Arc::new(queue.consumer(&config.delivery.topic)),
            Arc::new(queue.consumer(&config.delivery.retry_topic)),
            Arc::new(queue.clone()),
            CancellationToken::new(),
        );
        let push = PushService::new(
            Arc::new(queue.clone()),
            config.directory.topic.clone(),
            clock,
        );

        Cluster {
            queue,
            directory,
            offline,
            gateways,
            push,
            delivery,
        }
    }

    /// Offline entries one user should hold for `platform` after the push
    fn expected_backlog(&self, platform: &Platform) -> usize {
        let cap = self
            .config
            .platforms
            .iter()
            .find(|p| &p.name == platform)
            .map_or(-1, |p| p.max_offline_count);
        match usize::try_from(cap) {
            Ok(cap) => self.messages.min(cap),
            Err(_) => self.messages,
        }
    }

    async fn wait_until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        tokio::time::timeout(self.phase_timeout, async {
            while !check().await {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .map_err(|_| CliError::Simulation(format!("timed out waiting for {}", what)))
    }

    async fn connect_all(
        &self,
        cluster: &Cluster,
        users: &[(Uid, Platform)],
    ) -> Result<Vec<SimulatedClient>> {
        let clients: Vec<SimulatedClient> = users
            .iter()
            .enumerate()
            .map(|(index, (uid, platform))| {
                let gateway = &cluster.gateways[index % cluster.gateways.len()];
                SimulatedClient::connect(gateway, uid.clone(), platform)
            })
            .collect();

        let directory = cluster.directory.clone();
        self.wait_until("sessions to register", || {
            let directory = directory.clone();
            let uids: Vec<Uid> = users.iter().map(|(uid, _)| uid.clone()).collect();
            async move {
                for uid in &uids {
                    match directory.sessions(uid, None).await {
                        Ok(sessions) if !sessions.is_empty() => {}
                        _ => return false,
                    }
                }
                true
            }
        })
        .await?;
        Ok(clients)
    }

    /// Run the scenario and collect delivery statistics
    pub async fn run(self) -> Result<SimulationReport> {
        if self.users == 0 || self.messages == 0 {
            return Err(CliError::Config(
                "simulation needs at least one user and one message".to_string(),
            ));
        }
        let platforms = self.config.platform_names();
        if platforms.is_empty() {
            return Err(CliError::Config("no platforms configured".to_string()));
        }
        let started = Instant::now();
        let cluster = self.start_cluster();

        let users: Vec<(Uid, Platform)> = (0..self.users)
            .map(|index| {
                let uid = Uid::from(format!("user-{:04}", index));
                // Pairs of users share a platform so both halves cover every platform.
                (uid, platforms[(index / 2) % platforms.len()].clone())
            })
            .collect();
        let (online, offline): (Vec<_>, Vec<_>) = users
            .iter()
            .cloned()
            .enumerate()
            .partition(|(index, _)| index % 2 == 0);
        let online: Vec<(Uid, Platform)> = online.into_iter().map(|(_, user)| user).collect();
        let offline: Vec<(Uid, Platform)> = offline.into_iter().map(|(_, user)| user).collect();
        info!(
            users = users.len(),
            online = online.len(),
            messages = self.messages,
            "starting simulation"
        );

        // Phase 1: connect half of the users and push to everyone.
        let live_clients = self.connect_all(&cluster, &online).await?;
        let exclusive_platforms: HashMap<Uid, PlatformFilter> = users
            .iter()
            .map(|(uid, platform)| (uid.clone(), PlatformFilter::Only(vec![platform.clone()])))
            .collect();
        cluster
            .push
            .push(PushRequest {
                uids: users.iter().map(|(uid, _)| uid.clone()).collect(),
                bodies: (0..self.messages)
                    .map(|index| format!("message {}", index).into_bytes())
                    .collect(),
                options: MessageOptions::NEED_ACK | MessageOptions::NEED_OFFLINE,
                exclusive_platforms,
                ..Default::default()
            })
            .await?;

        let expected_live = self.messages;
        self.wait_until("live deliveries", || {
            let done = live_clients.iter().all(|c| c.received() >= expected_live);
            async move { done }
        })
        .await?;

        let store = cluster.offline.clone();
        let backlog_targets: Vec<(Uid, Platform, usize)> = offline
            .iter()
            .map(|(uid, platform)| (uid.clone(), platform.clone(), self.expected_backlog(platform)))
            .collect();
        self.wait_until("offline writes", || {
            let store = store.clone();
            let targets = backlog_targets.clone();
            async move {
                for (uid, platform, expected) in &targets {
                    if store.index_len(uid, platform).await < *expected {
                        return false;
                    }
                }
                true
            }
        })
        .await?;
        let mut stored_offline = 0;
        for (uid, platform, _) in &backlog_targets {
            stored_offline += cluster.offline.index_len(uid, platform).await;
        }

        // Phase 2: the remaining users connect and drain their backlog.
        let late_clients = self.connect_all(&cluster, &offline).await?;
        let expected: Vec<usize> = backlog_targets.iter().map(|(_, _, n)| *n).collect();
        self.wait_until("backlog deliveries", || {
            let done = late_clients
                .iter()
                .zip(&expected)
                .all(|(client, expected)| client.received() >= *expected);
            async move { done }
        })
        .await?;

        let report = SimulationReport {
            users: users.len(),
            online_users: online.len(),
            messages_per_user: self.messages,
            delivered_live: live_clients.iter().map(SimulatedClient::received).sum(),
            stored_offline,
            delivered_from_backlog: late_clients.iter().map(SimulatedClient::received).sum(),
            retried: cluster
                .queue
                .published(&self.config.delivery.retry_topic)
                .len(),
            dead_lettered: cluster
                .queue
                .published(&self.config.delivery.dlq_topic)
                .len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        for client in live_clients.into_iter().chain(late_clients) {
            client.disconnect().await;
        }
        cluster.delivery.stop().await;
        for gateway in &cluster.gateways {
            gateway.shutdown().await;
        }
        info!(elapsed_ms = report.elapsed_ms, "simulation finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_authenticator() {
        let identity = TokenAuthenticator
            .authenticate(&Credentials::new().with("token", "u1:ios"))
            .await
            .unwrap();
        assert_eq!(identity, Identity::new("u1", "ios"));

        for token in ["u1", ":ios", "u1:"] {
            let err = TokenAuthenticator
                .authenticate(&Credentials::new().with("token", token))
                .await
                .unwrap_err();
            assert!(matches!(err, CourierError::Unauthenticated { .. }));
        }
        assert!(TokenAuthenticator
            .authenticate(&Credentials::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_simulation_delivers_live_and_backlog() {
        let mut config = CourierConfig::testing();
        config.platforms = vec![
            courier_core::PlatformConfig::new("ios", 3),
            courier_core::PlatformConfig::new("web", -1),
        ];
        let report = Simulation::new(config, 8, 5)
            .with_phase_timeout(Duration::from_secs(5))
            .run()
            .await
            .unwrap();

        assert_eq!(report.users, 8);
        assert_eq!(report.online_users, 4);
        assert_eq!(report.delivered_live, 4 * 5);
        // Offline users alternate ios (capped at 3) and web (unbounded).
        assert_eq!(report.stored_offline, 2 * 3 + 2 * 5);
        assert_eq!(report.delivered_from_backlog, report.stored_offline);
        assert_eq!(report.dead_lettered, 0);
    }

    #[tokio::test]
    async fn test_empty_simulation_is_rejected() {
        let err = Simulation::new(CourierConfig::testing(), 0, 5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }
}
