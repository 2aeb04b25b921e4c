//! Master server network layer handling the out-of-band UDP protocol

use crate::registry::ServerRegistry;
use crate::subscribers::SubscriberSet;
use log::{debug, error, info, warn};
use shared::{
    encode_server_list, frame, generate_challenge, parse_info_string, unframe, Command,
    ServerEntry, MASTER_PORT, MAX_PACKET,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, RwLock};

/// Errors surfaced by the master server network layer
#[derive(Debug, Error)]
pub enum MasterError {
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("could not resolve host {0}")]
    UnresolvedHost(String),
    #[error("refusing site-local address {0}")]
    SiteLocalAddress(String),
}

/// Runtime tunables for the master server
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address the UDP socket binds to
    pub bind_addr: String,
    /// How often the periodic sweep runs
    pub prune_interval: Duration,
    /// Server records older than this are pruned
    pub server_expiry: Duration,
    /// Subscribers silent longer than this are dropped
    pub subscriber_expiry: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{}", MASTER_PORT),
            prune_interval: Duration::from_secs(30),
            server_expiry: Duration::from_secs(180),
            subscriber_expiry: Duration::from_secs(600),
        }
    }
}

/// Events sent from network tasks to the main run loop
#[derive(Debug)]
pub enum ServerEvent {
    PacketReceived { data: Vec<u8>, addr: SocketAddr },
    Shutdown,
}

/// Cloneable handle that requests a run-loop shutdown
///
/// Signaling more than once is harmless; the run loop exits on the
/// first event it sees and later signals go nowhere.
#[derive(Clone)]
pub struct ShutdownHandle {
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ShutdownHandle {
    pub fn signal(&self) {
        let _ = self.event_tx.send(ServerEvent::Shutdown);
    }
}

/// Master server coordinating the receive loop, dispatch and pruning
pub struct MasterServer {
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<ServerRegistry>>,
    subscribers: Arc<RwLock<SubscriberSet>>,
    config: MasterConfig,

    // Communication channel from network tasks to the run loop
    event_tx: mpsc::UnboundedSender<ServerEvent>,
    event_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl MasterServer {
    pub async fn new(config: MasterConfig) -> Result<Self, MasterError> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Master server listening on {}", config.bind_addr);

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Ok(MasterServer {
            socket,
            registry: Arc::new(RwLock::new(ServerRegistry::new())),
            subscribers: Arc::new(RwLock::new(SubscriberSet::new())),
            config,
            event_tx,
            event_rx,
        })
    }

    /// Returns the bound socket address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Returns a handle that can stop the run loop from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            event_tx: self.event_tx.clone(),
        }
    }

    /// Registers a permanent seed entry before or during operation
    pub async fn add_seed(&self, host: &str, port: u16) {
        let mut registry = self.registry.write().await;
        registry.add_permanent(host, port);
    }

    /// Returns a snapshot of every listed server
    pub async fn list_servers(&self) -> Vec<ServerEntry> {
        self.registry.read().await.snapshot()
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) -> tokio::task::JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let data = buffer[..len].to_vec();
                        if let Err(e) = event_tx.send(ServerEvent::PacketReceived { data, addr }) {
                            error!("Failed to forward packet to run loop: {}", e);
                            break;
                        }
                    }
                    // A send to a vanished peer can surface here as a
                    // connection reset; only the socket itself failing is
                    // fatal to the service.
                    Err(e)
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::ConnectionReset
                                | std::io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        debug!("Ignoring transient receive error: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    Err(e) => {
                        error!("Socket fault, stopping master: {}", e);
                        let _ = event_tx.send(ServerEvent::Shutdown);
                        break;
                    }
                }
            }
        })
    }

    /// Spawns task that periodically expires servers and subscribers
    async fn spawn_pruner(&self) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let subscribers = Arc::clone(&self.subscribers);
        let prune_interval = self.config.prune_interval;
        let server_expiry = self.config.server_expiry;
        let subscriber_expiry = self.config.subscriber_expiry;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(prune_interval);

            loop {
                interval.tick().await;

                let pruned = {
                    let mut registry = registry.write().await;
                    registry.prune(server_expiry)
                };
                let dropped = {
                    let mut subscribers = subscribers.write().await;
                    subscribers.prune(subscriber_expiry)
                };

                if pruned > 0 || dropped > 0 {
                    debug!("Sweep removed {} servers, {} subscribers", pruned, dropped);
                }
            }
        })
    }

    /// Frames a payload and sends it, logging instead of retrying on failure
    async fn send_oob(&self, payload: &[u8], addr: SocketAddr) {
        let data = frame(payload);
        if let Err(e) = self.socket.send_to(&data, addr).await {
            error!("Failed to send to {}: {}", addr, e);
        }
    }

    /// Pushes an incremental update for one changed record to every subscriber
    async fn notify_subscribers(&self, entry: &ServerEntry) {
        let addrs = {
            let subscribers = self.subscribers.read().await;
            subscribers.addrs()
        };

        if addrs.is_empty() {
            return;
        }

        let update = encode_server_list(std::slice::from_ref(entry));
        for addr in addrs {
            self.send_oob(&update, addr).await;
        }
    }

    /// Sends the current server list to one address
    async fn send_snapshot(&self, addr: SocketAddr) {
        let snapshot = {
            let registry = self.registry.read().await;
            registry.snapshot()
        };

        self.send_oob(&encode_server_list(&snapshot), addr).await;
    }

    async fn touch_subscriber(&self, addr: SocketAddr) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.touch(addr);
    }

    /// Classifies an incoming datagram and dispatches it
    async fn handle_packet(&self, data: &[u8], addr: SocketAddr) {
        let msg = match unframe(data) {
            Some(msg) => msg,
            None => {
                warn!("Discarding packet without out-of-band prefix from {}", addr);
                return;
            }
        };

        match Command::parse(&msg) {
            Command::Heartbeat => {
                debug!("Heartbeat from {}", addr);
                let challenge = generate_challenge();
                let payload = format!("getinfo {}", challenge);
                self.send_oob(payload.as_bytes(), addr).await;
            }

            Command::GetServers { query } => {
                debug!("getservers from {} (query: {})", addr, query);
                self.send_snapshot(addr).await;
                self.touch_subscriber(addr).await;
            }

            Command::Subscribe => {
                self.touch_subscriber(addr).await;
                self.send_snapshot(addr).await;
            }

            Command::InfoResponse { payload } => {
                let info = parse_info_string(&payload);
                let entry = {
                    let mut registry = self.registry.write().await;
                    registry.upsert(&addr.ip().to_string(), addr.port(), info)
                };
                self.notify_subscribers(&entry).await;
            }

            Command::StatusResponse => {
                debug!("Ignoring statusResponse from {}", addr);
            }

            Command::Unknown(cmd) => {
                let head = cmd.lines().next().unwrap_or("");
                warn!("Unrecognized command from {}: {:?}", addr, head);
            }
        }
    }

    /// Trusted ingestion path: registers an operator-supplied address
    ///
    /// The host is resolved first and rejected when it falls in a
    /// site-local, loopback or link-local range, so the directory cannot
    /// be tricked into listing addresses its clients can never reach.
    /// Accepted addresses go through the same upsert and notification
    /// path as a UDP `infoResponse`.
    pub async fn manual_refresh(
        &self,
        host: &str,
        port: u16,
        info: HashMap<String, String>,
    ) -> Result<SocketAddr, MasterError> {
        let target = format!("{}:{}", host, port);

        let addr = lookup_host(&target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| MasterError::UnresolvedHost(target.clone()))?;

        if is_site_local(addr.ip()) {
            return Err(MasterError::SiteLocalAddress(target));
        }

        info!("Manual refresh of {}", target);
        let entry = {
            let mut registry = self.registry.write().await;
            registry.upsert(&addr.ip().to_string(), addr.port(), info)
        };
        self.notify_subscribers(&entry).await;

        Ok(addr)
    }

    /// Main run loop dispatching network events until shutdown
    pub async fn run(&mut self) {
        let receiver = self.spawn_network_receiver().await;
        let pruner = self.spawn_pruner().await;

        info!("Master server started successfully");

        while let Some(event) = self.event_rx.recv().await {
            match event {
                ServerEvent::PacketReceived { data, addr } => {
                    self.handle_packet(&data, addr).await;
                }
                ServerEvent::Shutdown => {
                    info!("Master server shutting down");
                    break;
                }
            }
        }

        receiver.abort();
        pruner.abort();
    }
}

/// Returns true for addresses a public directory must not hand out
fn is_site_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local, fe80::/10 link-local
            v6.is_loopback()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
