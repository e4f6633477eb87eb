use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use rand::seq::IteratorRandom;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::concurrency::{Flight, lock};
use crate::settings::{HostSettings, HostsSettings};

use super::error::SmtpError;
use super::message::Message;
use super::reconnect::ReconnectingConnection;
use super::types::{Connect, ConnectionEvent, SmtpConnection};

type Slot = Flight<Result<Arc<dyn SmtpConnection>, SmtpError>>;

/// Stand-in for hosts that accept any recipient: never touches the network,
/// accepts everything and reports itself unreliable.
#[derive(Debug)]
pub struct UnreliableConnection {
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for UnreliableConnection {
    fn default() -> Self {
        let (events, _) = broadcast::channel(1);
        Self { events }
    }
}

#[async_trait]
impl SmtpConnection for UnreliableConnection {
    fn hostname(&self) -> &str {
        "unreliable"
    }

    async fn send_verify_recipient(&self, _address: &str) -> Result<Message, SmtpError> {
        Ok(Message::accepted())
    }

    async fn is_reliable(&self) -> Result<bool, SmtpError> {
        Ok(false)
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

/// Per-host pool of reconnecting connections.
///
/// At most `max_connections` live connections exist per host; past that a
/// random existing one is shared. Hosts found (or configured) unreliable get
/// the shared [`UnreliableConnection`] for the rest of the process.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    connector: Arc<dyn Connect>,
    settings: Arc<HostsSettings>,
    hosts: Mutex<HashMap<String, HostSlots>>,
    unreliable: Mutex<HashSet<String>>,
    stub: Arc<UnreliableConnection>,
}

#[derive(Default)]
struct HostSlots {
    next: u64,
    live: HashMap<u64, Slot>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connect>, settings: Arc<HostsSettings>) -> Self {
        let unreliable = settings
            .unreliable_hosts()
            .map(str::to_string)
            .collect::<HashSet<_>>();
        Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                hosts: Mutex::new(HashMap::new()),
                unreliable: Mutex::new(unreliable),
                stub: Arc::new(UnreliableConnection::default()),
            }),
        }
    }

    /// Live (or connecting) slots for `hostname`.
    pub fn live_connections(&self, hostname: &str) -> usize {
        lock(&self.inner.hosts)
            .get(&hostname.to_lowercase())
            .map_or(0, |host| host.live.len())
    }

    pub fn is_unreliable(&self, hostname: &str) -> bool {
        lock(&self.inner.unreliable).contains(&hostname.to_lowercase())
    }

    fn slot(&self, hostname: &str, settings: Arc<HostSettings>) -> Slot {
        let mut hosts = lock(&self.inner.hosts);
        let host = hosts.entry(hostname.to_string()).or_default();
        // the watcher may not have seen the close yet
        host.live.retain(|_, slot| {
            !matches!(slot.peek(), Some(Ok(connection)) if connection.is_closed())
        });
        if host.live.len() < settings.max_connections {
            let key = host.next;
            host.next += 1;
            debug!(hostname, slot = key, "connection - create");
            let opening = tokio::spawn(open_slot(
                Arc::clone(&self.inner),
                hostname.to_string(),
                key,
                settings,
            ));
            let slot = opening
                .map(|joined| {
                    joined.unwrap_or_else(|err| {
                        Err(SmtpError::closed(format!("connection task failed: {err}")))
                    })
                })
                .boxed()
                .shared();
            host.live.insert(key, slot.clone());
            return slot;
        }

        debug!(hostname, "connection - reuse busy");
        match host.live.values().choose(&mut rand::thread_rng()) {
            Some(slot) => slot.clone(),
            None => futures_util::future::ready(Err(SmtpError::closed("no pooled connection")))
                .boxed()
                .shared(),
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("hosts", &lock(&self.inner.hosts).len())
            .field("unreliable", &lock(&self.inner.unreliable).len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connect for ConnectionPool {
    async fn connect(&self, hostname: &str) -> Result<Arc<dyn SmtpConnection>, SmtpError> {
        let hostname = hostname.to_lowercase();
        if self.is_unreliable(&hostname) {
            return Ok(self.inner.stub.clone());
        }
        let settings = self.inner.settings.find_for_hostname(&hostname);
        self.slot(&hostname, settings).await
    }
}

impl PoolInner {
    fn remove_slot(&self, hostname: &str, key: u64) {
        let mut hosts = lock(&self.hosts);
        if let Some(host) = hosts.get_mut(hostname) {
            host.live.remove(&key);
            if host.live.is_empty() {
                hosts.remove(hostname);
            }
        }
    }
}

async fn open_slot(
    pool: Arc<PoolInner>,
    hostname: String,
    key: u64,
    settings: Arc<HostSettings>,
) -> Result<Arc<dyn SmtpConnection>, SmtpError> {
    let opened = match pool.connector.connect(&hostname).await {
        Ok(connection) => connection,
        Err(err) => {
            pool.remove_slot(&hostname, key);
            return Err(err);
        }
    };
    let connection: Arc<dyn SmtpConnection> = Arc::new(ReconnectingConnection::new(
        opened,
        Arc::clone(&pool.connector),
        settings.max_reconnects,
    ));

    match connection.is_reliable().await {
        Ok(true) => {}
        Ok(false) => {
            info!(hostname = %hostname, "unreliable server, addresses cannot be verified");
            lock(&pool.unreliable).insert(hostname.clone());
            pool.remove_slot(&hostname, key);
            connection.close();
            return Ok(pool.stub.clone());
        }
        Err(err) => {
            pool.remove_slot(&hostname, key);
            connection.close();
            return Err(err);
        }
    }

    watch(
        Arc::downgrade(&pool),
        hostname,
        key,
        &connection,
        settings.inactivity(),
    );
    Ok(connection)
}

/// Drop the slot once the connection closes or fails, and close it after
/// `idle` without activity.
fn watch(
    pool: Weak<PoolInner>,
    hostname: String,
    key: u64,
    connection: &Arc<dyn SmtpConnection>,
    idle: Option<Duration>,
) {
    let mut events = connection.subscribe();
    if connection.is_closed() {
        if let Some(pool) = pool.upgrade() {
            pool.remove_slot(&hostname, key);
        }
        return;
    }
    let connection = Arc::downgrade(connection);
    tokio::spawn(async move {
        let mut deadline = idle.map(|limit| Instant::now() + limit);
        loop {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, events.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        debug!(hostname = %hostname, "connection activity timeout");
                        if let Some(connection) = connection.upgrade() {
                            connection.close();
                        }
                        break;
                    }
                },
                None => events.recv().await,
            };
            match received {
                Ok(ConnectionEvent::Active) => {
                    deadline = idle.map(|limit| Instant::now() + limit);
                }
                Ok(ConnectionEvent::Unsolicited(_)) | Err(RecvError::Lagged(_)) => {}
                Ok(ConnectionEvent::Error(_) | ConnectionEvent::Closed) | Err(RecvError::Closed) => {
                    break;
                }
            }
        }
        debug!(hostname = %hostname, slot = key, "MX connection closed");
        if let Some(pool) = pool.upgrade() {
            pool.remove_slot(&hostname, key);
        }
    });
}
