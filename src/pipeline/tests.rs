use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Semaphore, broadcast};

use super::*;
use crate::smtp::{Connect, ConnectionEvent, Message, SmtpConnection};

#[derive(Debug, Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Accepts `user<even>@...`, rejects `user<odd>@...`.
#[derive(Debug)]
struct EvenOdd {
    gauge: Arc<Gauge>,
    gate: Option<Arc<Semaphore>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl EvenOdd {
    fn new(gate: Option<Arc<Semaphore>>) -> Self {
        let (events, _) = broadcast::channel(1);
        Self {
            gauge: Arc::default(),
            gate,
            events,
        }
    }
}

fn index_of(address: &str) -> usize {
    address
        .strip_prefix("user")
        .and_then(|rest| rest.split('@').next())
        .and_then(|digits| digits.parse().ok())
        .expect("synthetic address")
}

#[async_trait]
impl SmtpConnection for EvenOdd {
    fn hostname(&self) -> &str {
        "example.com"
    }

    async fn send_verify_recipient(&self, address: &str) -> Result<Message, SmtpError> {
        let now = self.gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);

        let reply = if index_of(address) % 2 == 0 {
            "250 2.1.5 Ok"
        } else {
            "550 5.1.1 No such user"
        };
        Ok(Message::parse(reply).unwrap())
    }

    async fn is_reliable(&self) -> Result<bool, SmtpError> {
        Ok(true)
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

struct FakeConnector {
    connection: Arc<EvenOdd>,
}

#[async_trait]
impl Connect for FakeConnector {
    async fn connect(&self, _hostname: &str) -> Result<Arc<dyn SmtpConnection>, SmtpError> {
        Ok(self.connection.clone())
    }
}

struct FailingConnector {
    error: SmtpError,
}

#[async_trait]
impl Connect for FailingConnector {
    async fn connect(&self, _hostname: &str) -> Result<Arc<dyn SmtpConnection>, SmtpError> {
        Err(self.error.clone())
    }
}

#[derive(Default)]
struct MemorySink {
    written: Vec<(EmailRecord, VerifyStatus)>,
    closed: bool,
}

#[async_trait]
impl AddressSink<EmailRecord> for MemorySink {
    async fn write(&mut self, record: EmailRecord, status: VerifyStatus) -> Result<(), BoxError> {
        self.written.push((record, status));
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.closed = true;
        Ok(())
    }
}

fn records(count: usize) -> Vec<Result<EmailRecord, io::Error>> {
    (0..count)
        .map(|i| Ok(EmailRecord::new(format!("user{i}@example.com"))))
        .collect()
}

fn options(max_concurrent: usize) -> PipelineOptions {
    PipelineOptions {
        max_concurrent: NonZeroUsize::new(max_concurrent).unwrap(),
        ..PipelineOptions::default()
    }
}

fn even_odd(gate: Option<Arc<Semaphore>>) -> (Verifier, Arc<Gauge>) {
    let connection = Arc::new(EvenOdd::new(gate));
    let gauge = connection.gauge.clone();
    (Verifier::new(Arc::new(FakeConnector { connection })), gauge)
}

#[tokio::test(start_paused = true)]
async fn verifies_a_hundred_addresses_with_bounded_concurrency() {
    let (verifier, gauge) = even_odd(None);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let progress = seen.clone();
    let pipeline = Pipeline::new(verifier, options(10))
        .on_progress(move |p| progress.lock().unwrap().push(p.processed));
    let mut sink = MemorySink::default();

    let report = pipeline
        .run(stream::iter(records(100)), &mut sink)
        .await
        .unwrap();

    assert_eq!(report.processed, 100);
    assert_eq!(report.count(VerifyStatus::SmtpVerified), 50);
    assert_eq!(report.count(VerifyStatus::SmtpUserNotFound), 50);
    assert!(report.in_flight_peak <= 10);
    assert!(gauge.peak.load(Ordering::SeqCst) <= 10);
    assert!(gauge.peak.load(Ordering::SeqCst) > 1);

    assert_eq!(sink.written.len(), 100);
    for (record, status) in &sink.written {
        let expected = if index_of(&record.address) % 2 == 0 {
            VerifyStatus::SmtpVerified
        } else {
            VerifyStatus::SmtpUserNotFound
        };
        assert_eq!(*status, expected, "{}", record.address);
        assert_eq!(record.status, expected);
    }
    let mut addresses: Vec<_> = sink.written.iter().map(|(r, _)| index_of(&r.address)).collect();
    addresses.sort_unstable();
    assert_eq!(addresses, (0..100).collect::<Vec<_>>());
    assert!(sink.closed);
    assert_eq!(*seen.lock().unwrap(), (1..=100).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn stops_pulling_while_at_capacity() {
    let gate = Arc::new(Semaphore::new(0));
    let (verifier, _) = even_odd(Some(gate.clone()));
    let pipeline = Pipeline::new(verifier, options(3));
    let pulled = Arc::new(AtomicUsize::new(0));
    let counter = pulled.clone();
    let source = stream::iter(records(20)).inspect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut sink = MemorySink::default();

    let release = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pulled.load(Ordering::SeqCst), 3);
        gate.add_permits(20);
    };
    let (report, ()) = tokio::join!(pipeline.run(source, &mut sink), release);

    assert_eq!(report.unwrap().processed, 20);
    assert_eq!(pulled.load(Ordering::SeqCst), 20);
}

#[tokio::test(start_paused = true)]
async fn min_interval_spaces_out_pulls() {
    let (verifier, _) = even_odd(None);
    let pipeline = Pipeline::new(
        verifier,
        PipelineOptions {
            min_interval: Some(Duration::from_millis(100)),
            ..options(10)
        },
    );
    let mut sink = MemorySink::default();

    let report = pipeline
        .run(stream::iter(records(5)), &mut sink)
        .await
        .unwrap();
    assert_eq!(report.processed, 5);
    assert!(report.elapsed >= Duration::from_millis(400));
    assert!(report.in_flight_peak <= 2);
}

#[tokio::test]
async fn proxy_failure_aborts_the_run() {
    let verifier = Verifier::new(Arc::new(FailingConnector {
        error: SmtpError::proxy("127.0.0.1:1080", "connection refused"),
    }));
    let pipeline = Pipeline::new(verifier, options(4));
    let mut sink = MemorySink::default();

    let err = pipeline
        .run(stream::iter(records(10)), &mut sink)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Verify(ref e) if e.is_proxy_failure()));
    assert!(sink.written.is_empty());
    assert!(sink.closed);
}

#[tokio::test]
async fn source_error_stops_the_run() {
    let (verifier, _) = even_odd(None);
    let pipeline = Pipeline::new(verifier, options(4));
    let mut sink = MemorySink::default();
    let source = stream::iter(vec![
        Ok(EmailRecord::new("user0@example.com")),
        Err(io::Error::other("disk gone")),
    ]);

    let err = pipeline.run(source, &mut sink).await.unwrap_err();
    assert!(matches!(err, PipelineError::Source { .. }));
    assert!(sink.closed);
}

#[tokio::test]
async fn unknown_outcome_keeps_previous_status() {
    let verifier = Verifier::new(Arc::new(FailingConnector {
        error: SmtpError::Unreachable {
            hostname: "example.com".to_string(),
            last: Box::new(SmtpError::closed("refused")),
        },
    }));
    let pipeline = Pipeline::new(verifier, options(4));
    let mut sink = MemorySink::default();
    let mut record = EmailRecord::new("user0@example.com");
    record.status = VerifyStatus::SmtpVerified;

    let report = pipeline
        .run(stream::iter(vec![Ok::<_, io::Error>(record)]), &mut sink)
        .await
        .unwrap();
    assert_eq!(report.count(VerifyStatus::Unknown), 1);
    let (record, status) = &sink.written[0];
    assert_eq!(*status, VerifyStatus::Unknown);
    assert_eq!(record.status, VerifyStatus::SmtpVerified);
}

#[tokio::test]
async fn invalid_addresses_are_written_too() {
    let (verifier, gauge) = even_odd(None);
    let pipeline = Pipeline::new(verifier, options(4));
    let mut sink = MemorySink::default();
    let source = stream::iter(vec![
        Ok::<_, io::Error>(EmailRecord::new("nope")),
        Ok(EmailRecord::new("user2@example.com")),
    ]);

    let report = pipeline.run(source, &mut sink).await.unwrap();
    assert_eq!(report.count(VerifyStatus::Invalid), 1);
    assert_eq!(report.count(VerifyStatus::SmtpVerified), 1);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}
