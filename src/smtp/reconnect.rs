use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::concurrency::{Flight, lock};

use super::error::SmtpError;
use super::message::Message;
use super::types::{Connect, ConnectionEvent, EVENT_CAPACITY, SmtpConnection};

type Pending = Flight<Result<Arc<dyn SmtpConnection>, SmtpError>>;

/// Keeps a pooled connection usable across server hang-ups.
///
/// A call failing with [`SmtpError::ConnectionClosed`] opens a fresh
/// connection and is retried on it. Concurrent failures share a single
/// reconnect. `max_reconnects` bounds consecutive reconnects (0 = no limit);
/// only a successful call resets the count, failures unrelated to the
/// connection leave it untouched. Past the bound, when a reconnect itself
/// fails, or when the session ends on anything but a hang-up (an unexpected
/// reply), the wrapper closes for good and reports it as `Error` then
/// `Closed`.
#[derive(Clone)]
pub struct ReconnectingConnection {
    shared: Arc<Shared>,
}

struct Shared {
    hostname: String,
    connector: Arc<dyn Connect>,
    max_reconnects: u32,
    events: broadcast::Sender<ConnectionEvent>,
    state: Mutex<State>,
}

struct State {
    current: Pending,
    generation: u64,
    reconnects: u32,
    successful_calls: u64,
    failure: Option<SmtpError>,
    forward: Option<JoinHandle<()>>,
}

impl ReconnectingConnection {
    /// Must be called inside a tokio runtime.
    pub fn new(
        connection: Arc<dyn SmtpConnection>,
        connector: Arc<dyn Connect>,
        max_reconnects: u32,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let current = futures_util::future::ready(Ok(Arc::clone(&connection)))
            .boxed()
            .shared();
        let shared = Arc::new(Shared {
            hostname: connection.hostname().to_string(),
            connector,
            max_reconnects,
            events,
            state: Mutex::new(State {
                current,
                generation: 0,
                reconnects: 0,
                successful_calls: 0,
                failure: None,
                forward: None,
            }),
        });
        shared.forward_from(connection.as_ref());
        Self { shared }
    }

    pub fn reconnects(&self) -> u32 {
        lock(&self.shared.state).reconnects
    }

    async fn call<T, F, Fut>(&self, op: F) -> Result<T, SmtpError>
    where
        F: Fn(Arc<dyn SmtpConnection>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, SmtpError>> + Send,
        T: Send,
    {
        loop {
            let (generation, pending) = {
                let state = lock(&self.shared.state);
                if let Some(failure) = &state.failure {
                    return Err(failure.clone());
                }
                (state.generation, state.current.clone())
            };

            let connection = match pending.await {
                Ok(connection) => connection,
                Err(err) => {
                    self.shared.abandon(err.clone(), true);
                    return Err(err);
                }
            };

            match op(Arc::clone(&connection)).await {
                Ok(value) => {
                    let mut state = lock(&self.shared.state);
                    state.reconnects = 0;
                    state.successful_calls += 1;
                    return Ok(value);
                }
                Err(err) if err.is_connection_closed() => {
                    if !self.reconnect(generation) {
                        self.shared.abandon(err.clone(), true);
                        return Err(err);
                    }
                }
                Err(err) => {
                    // session ended on something other than a hang-up
                    if let Some(failure) = connection
                        .terminal_failure()
                        .filter(|failure| !failure.is_connection_closed())
                    {
                        self.shared.abandon(failure, true);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Start a reconnect unless one already replaced `generation`. Returns
    /// `false` when the wrapper is closed or out of reconnects.
    fn reconnect(&self, generation: u64) -> bool {
        let mut state = lock(&self.shared.state);
        if state.failure.is_some() {
            return false;
        }
        if state.generation != generation {
            return true;
        }
        let limit = self.shared.max_reconnects;
        if limit > 0 && state.reconnects >= limit {
            warn!(hostname = %self.shared.hostname, limit, "reconnect limit reached");
            return false;
        }

        state.reconnects += 1;
        state.generation += 1;
        warn!(
            hostname = %self.shared.hostname,
            attempt = state.reconnects,
            after_calls = state.successful_calls,
            "reconnecting"
        );
        state.successful_calls = 0;
        if let Some(forward) = state.forward.take() {
            forward.abort();
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let connector = Arc::clone(&self.shared.connector);
        let hostname = self.shared.hostname.clone();
        state.current = async move {
            let connection = connector.connect(&hostname).await;
            if let (Ok(connection), Some(shared)) = (&connection, weak.upgrade()) {
                shared.forward_from(connection.as_ref());
            }
            connection
        }
        .boxed()
        .shared();
        true
    }
}

impl Shared {
    /// Republish activity of the current inner connection. Its close and
    /// error events stay internal: a hang-up makes the next call reconnect,
    /// any other terminal failure is reported by `abandon`.
    fn forward_from(&self, connection: &dyn SmtpConnection) {
        let mut inner_events = connection.subscribe();
        let events = self.events.clone();
        let forward = tokio::spawn(async move {
            loop {
                match inner_events.recv().await {
                    Ok(ConnectionEvent::Active) => {
                        let _ = events.send(ConnectionEvent::Active);
                    }
                    Ok(ConnectionEvent::Unsolicited(message)) => {
                        let _ = events.send(ConnectionEvent::Unsolicited(message));
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = lock(&self.state).forward.replace(forward) {
            previous.abort();
        }
    }

    fn abandon(&self, failure: SmtpError, report: bool) {
        let (pending, forward) = {
            let mut state = lock(&self.state);
            if state.failure.is_some() {
                return;
            }
            state.failure = Some(failure.clone());
            (state.current.clone(), state.forward.take())
        };
        if let Some(forward) = forward {
            forward.abort();
        }
        let settled = pending.peek().cloned();
        match settled {
            Some(Ok(connection)) => connection.close(),
            Some(Err(_)) => {}
            None => {
                tokio::spawn(async move {
                    if let Ok(connection) = pending.await {
                        connection.close();
                    }
                });
            }
        }
        debug!(hostname = %self.hostname, reason = %failure, "pooled connection closed");
        if report {
            let _ = self.events.send(ConnectionEvent::Error(failure));
        }
        let _ = self.events.send(ConnectionEvent::Closed);
    }
}

impl fmt::Debug for ReconnectingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectingConnection")
            .field("hostname", &self.shared.hostname)
            .field("max_reconnects", &self.shared.max_reconnects)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SmtpConnection for ReconnectingConnection {
    fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    async fn send_verify_recipient(&self, address: &str) -> Result<Message, SmtpError> {
        self.call(|connection| {
            let address = address.to_string();
            async move { connection.send_verify_recipient(&address).await }
        })
        .await
    }

    async fn is_reliable(&self) -> Result<bool, SmtpError> {
        self.call(|connection| async move { connection.is_reliable().await })
            .await
    }

    fn close(&self) {
        self.shared
            .abandon(SmtpError::closed("connection closed"), false);
    }

    fn is_closed(&self) -> bool {
        lock(&self.shared.state).failure.is_some()
    }

    fn terminal_failure(&self) -> Option<SmtpError> {
        lock(&self.shared.state).failure.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }
}
