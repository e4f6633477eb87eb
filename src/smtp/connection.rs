use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::concurrency::{CallableOnce, ConcurrencyQueue, Flight, lock};
use crate::settings::HostSettings;
use crate::validator::is_valid_email;

use super::command::Command;
use super::error::SmtpError;
use super::message::{
    CODE_ACTION_NOT_TAKEN, CODE_ADDRESS_INACTIVE, CODE_OK, CODE_SERVICE_READY, Message,
    ReplyAssembler,
};
use super::types::{
    ConnectionEvent, ConnectionId, EVENT_CAPACITY, Lane, LaneKey, SmtpConnection,
};

const READ_CHUNK: usize = 4096;
const VERIFY_CODES: [u16; 3] = [CODE_OK, CODE_ACTION_NOT_TAKEN, CODE_ADDRESS_INACTIVE];

type ReplySender = oneshot::Sender<Result<Message, SmtpError>>;

/// One SMTP session with an MX server.
///
/// Commands are serialized on the connection's `Commands` lane so at most one
/// awaits its reply; verifications are serialized on the `Verifications`
/// lane so the QUIT/greeting/reset preamble of one probe never interleaves
/// with another. The first reply the server sends is the greeting.
///
/// Once the session fails, every call fails with the same error and nothing
/// more is written.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: ConnectionId,
    hostname: String,
    remote: String,
    settings: Arc<HostSettings>,
    queue: Arc<ConcurrencyQueue<LaneKey>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    state: Mutex<State>,
    greeting: Flight<Result<Message, SmtpError>>,
    reliability: CallableOnce<Result<bool, SmtpError>>,
    events: broadcast::Sender<ConnectionEvent>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct State {
    failure: Option<SmtpError>,
    closed: bool,
    greeting: Option<ReplySender>,
    awaiting: Option<ReplySender>,
    initialized: bool,
    enqueued: u32,
    reset_due: bool,
    reliable: Option<bool>,
}

impl Connection {
    /// Wrap an established stream. Must be called inside a tokio runtime.
    pub fn new<S>(
        stream: S,
        hostname: &str,
        remote: &str,
        settings: Arc<HostSettings>,
        queue: Arc<ConcurrencyQueue<LaneKey>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (greeting_tx, greeting_rx) = oneshot::channel();
        let greeting = greeting_rx
            .map(|received| {
                received.unwrap_or_else(|_| Err(SmtpError::closed("closed before greeting")))
            })
            .boxed()
            .shared();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            Inner {
                id: ConnectionId::next(),
                hostname: hostname.to_lowercase(),
                remote: remote.to_string(),
                settings,
                queue,
                outbound: Mutex::new(Some(outbound_tx)),
                state: Mutex::new(State {
                    greeting: Some(greeting_tx),
                    ..State::default()
                }),
                greeting,
                reliability: CallableOnce::new(move || {
                    let weak = weak.clone();
                    async move {
                        match weak.upgrade() {
                            Some(inner) => Connection { inner }.probe().await,
                            None => Err(SmtpError::closed("connection dropped")),
                        }
                    }
                }),
                events,
                reader: Mutex::new(None),
            }
        });

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(write_commands(
            Arc::downgrade(&inner),
            write_half,
            outbound_rx,
        ));
        let reader = tokio::spawn(read_replies(Arc::downgrade(&inner), read_half));
        *lock(&inner.reader) = Some(reader);

        debug!(id = %inner.id, hostname = %inner.hostname, remote = %inner.remote, "SMTP connection opened");
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote(&self) -> &str {
        &self.inner.remote
    }

    /// The server greeting, resolved once.
    pub async fn opening_message(&self) -> Result<Message, SmtpError> {
        self.inner.greeting.clone().await
    }

    /// Send one command and wait for its reply.
    pub async fn send_command(&self, command: Command) -> Result<Message, SmtpError> {
        let key = LaneKey::new(self.inner.id, Lane::Commands);
        self.inner
            .queue
            .enqueue(key, || self.exchange(command))
            .await
    }

    async fn exchange(&self, command: Command) -> Result<Message, SmtpError> {
        let reply = {
            let mut state = lock(&self.inner.state);
            if let Some(failure) = &state.failure {
                return Err(failure.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.awaiting = Some(tx);
            rx
        };

        let outbound = lock(&self.inner.outbound).clone();
        debug!(remote = %self.inner.remote, %command, "SMTP >");
        let sent = outbound.is_some_and(|tx| tx.send(command.serialize()).is_ok());
        if !sent {
            lock(&self.inner.state).awaiting = None;
            return Err(self.failure_or_closed());
        }
        self.emit(ConnectionEvent::Active);

        match reply.await {
            Ok(result) => result,
            Err(_) => Err(self.failure_or_closed()),
        }
    }

    async fn verify_once(&self, address: &str) -> Result<Message, SmtpError> {
        self.check_open()?;
        let key = LaneKey::new(self.inner.id, Lane::Verifications);
        self.inner
            .queue
            .enqueue(key, || self.run_verification(address))
            .await
    }

    async fn run_verification(&self, address: &str) -> Result<Message, SmtpError> {
        self.check_open()?;
        let settings = &self.inner.settings;
        let (quit, init, reset) = {
            let mut state = lock(&self.inner.state);
            let quit = settings.close_after > 0 && state.enqueued >= settings.close_after;
            let init = !state.initialized;
            let reset = std::mem::take(&mut state.reset_due);
            state.enqueued += 1;
            state.reset_due =
                settings.reset_after > 0 && state.enqueued % settings.reset_after == 0;
            (quit, init, reset)
        };

        if quit {
            return Err(self.quit().await);
        }
        if init {
            self.init().await?;
            lock(&self.inner.state).initialized = true;
        }
        if reset {
            self.reset(true).await?;
        }
        if !is_valid_email(address) {
            return Err(SmtpError::InvalidRecipient {
                address: address.to_string(),
            });
        }

        debug!(remote = %self.inner.remote, address, "verifying");
        let reply = self
            .send_command(Command::RcptTo {
                to: address.to_string(),
            })
            .await?;
        self.validate_reply(reply, &VERIFY_CODES)
    }

    async fn init(&self) -> Result<(), SmtpError> {
        let greeting = self.opening_message().await?;
        self.validate_reply(greeting, &[CODE_SERVICE_READY])?;
        self.reset(false).await
    }

    async fn reset(&self, rset: bool) -> Result<(), SmtpError> {
        if rset {
            let reply = self.send_command(Command::Rset).await?;
            self.validate_reply(reply, &[CODE_OK])?;
        }
        let reply = self
            .send_command(Command::Helo {
                hostname: self.inner.settings.from_host.clone(),
            })
            .await?;
        self.validate_reply(reply, &[CODE_OK])?;
        let reply = self
            .send_command(Command::MailFrom {
                from: self.inner.settings.from_email.clone(),
            })
            .await?;
        self.validate_reply(reply, &[CODE_OK])?;
        Ok(())
    }

    async fn quit(&self) -> SmtpError {
        let count = self.inner.settings.close_after;
        debug!(remote = %self.inner.remote, count, "closing after verification limit");
        if let Err(err) = self.send_command(Command::Quit).await {
            debug!(remote = %self.inner.remote, error = %err, "QUIT failed");
        }
        let reason = format!("closed after {count} verifications");
        self.finish(SmtpError::closed(reason), false);
        self.failure_or_closed()
    }

    async fn probe(&self) -> Result<bool, SmtpError> {
        let address = format!(
            "{}@{}",
            self.inner.settings.random_user, self.inner.hostname
        );
        let reply = self.send_verify_recipient(&address).await?;
        let reliable = reply.code() != CODE_OK;
        lock(&self.inner.state).reliable = Some(reliable);
        debug!(hostname = %self.inner.hostname, reliable, "reliability probe");
        Ok(reliable)
    }

    fn validate_reply(&self, reply: Message, expected: &[u16]) -> Result<Message, SmtpError> {
        if reply.is_about_to_close() {
            self.shutdown();
        }
        if let Some(failure) = reply.failure() {
            return Err(failure);
        }
        if !expected.contains(&reply.code()) {
            let failure = SmtpError::UnexpectedReply {
                message: reply,
                expected: expected.to_vec(),
            };
            self.finish(failure.clone(), true);
            return Err(failure);
        }
        Ok(reply)
    }

    fn check_open(&self) -> Result<(), SmtpError> {
        match &lock(&self.inner.state).failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        }
    }

    fn failure_or_closed(&self) -> SmtpError {
        self.terminal_failure()
            .unwrap_or_else(|| SmtpError::closed("connection closed"))
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn dispatch(&self, raw: String) {
        debug!(remote = %self.inner.remote, reply = %raw, "SMTP <");
        let parsed = Message::parse(&raw);
        let waiter = {
            let mut state = lock(&self.inner.state);
            state.greeting.take().or_else(|| state.awaiting.take())
        };
        self.emit(ConnectionEvent::Active);
        match (waiter, parsed) {
            (Some(waiter), parsed) => {
                let _ = waiter.send(parsed);
            }
            (None, Ok(message)) => {
                debug!(remote = %self.inner.remote, reply = %message, "unsolicited reply");
                self.emit(ConnectionEvent::Unsolicited(message));
            }
            (None, Err(err)) => {
                warn!(remote = %self.inner.remote, error = %err, "dropping unsolicited reply");
            }
        }
    }

    /// Record `failure` as terminal (first one wins), reject the waiters and
    /// release the socket.
    fn finish(&self, failure: SmtpError, report: bool) {
        let first = {
            let mut state = lock(&self.inner.state);
            let first = state.failure.is_none();
            if first {
                state.failure = Some(failure.clone());
            }
            first
        };
        if first && report {
            self.emit(ConnectionEvent::Error(failure));
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        let (failure, waiters) = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let failure = state
                .failure
                .get_or_insert_with(|| SmtpError::closed("connection closed"))
                .clone();
            let waiters = [state.greeting.take(), state.awaiting.take()];
            (failure, waiters)
        };

        lock(&self.inner.outbound).take();
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Err(failure.clone()));
        }
        debug!(id = %self.inner.id, remote = %self.inner.remote, reason = %failure, "SMTP connection closed");
        self.emit(ConnectionEvent::Closed);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("hostname", &self.inner.hostname)
            .field("remote", &self.inner.remote)
            .finish_non_exhaustive()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl SmtpConnection for Connection {
    fn hostname(&self) -> &str {
        &self.inner.hostname
    }

    async fn send_verify_recipient(&self, address: &str) -> Result<Message, SmtpError> {
        match self.verify_once(address).await {
            Err(SmtpError::TooManyRecipients(reply)) => {
                debug!(remote = %self.inner.remote, reply = %reply, "too many recipients, resetting");
                lock(&self.inner.state).reset_due = true;
                self.verify_once(address).await
            }
            other => other,
        }
    }

    async fn is_reliable(&self) -> Result<bool, SmtpError> {
        let known = lock(&self.inner.state).reliable;
        match known {
            Some(reliable) => Ok(reliable),
            None => self.inner.reliability.call().await,
        }
    }

    fn close(&self) {
        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    fn terminal_failure(&self) -> Option<SmtpError> {
        lock(&self.inner.state).failure.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

async fn read_replies<R>(inner: Weak<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = ReplyAssembler::default();
    let mut buf = vec![0u8; READ_CHUNK];
    let (failure, report) = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break (SmtpError::closed("connection closed by server"), false),
            Ok(n) => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let connection = Connection { inner };
                for reply in assembler.feed(&buf[..n]) {
                    connection.dispatch(reply);
                }
            }
            Err(err) => break (SmtpError::broken("connection error", err), true),
        }
    };
    if let Some(inner) = inner.upgrade() {
        Connection { inner }.finish(failure, report);
    }
}

async fn write_commands<W>(
    inner: Weak<Inner>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbound.recv().await {
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if let Some(inner) = inner.upgrade() {
                Connection { inner }.finish(SmtpError::broken("write failed", err), true);
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}
