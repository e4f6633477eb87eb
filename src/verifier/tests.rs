use std::sync::Arc;

use trust_dns_resolver::error::ResolveError;

use super::*;
use crate::settings::HostSettings;
use crate::smtp::MxRecord;
use crate::smtp::tests::{Endpoint, FakeDialer, ScriptedServer, StubResolver};

fn verifier_for(server: &ScriptedServer) -> (Verifier, Arc<FakeDialer>) {
    verifier_with(server, HostsSettings::default())
}

fn verifier_with(server: &ScriptedServer, settings: HostsSettings) -> (Verifier, Arc<FakeDialer>) {
    let dialer = Arc::new(
        FakeDialer::default().with("mx.example.com", Endpoint::Smtp(server.clone())),
    );
    let verifier = Verifier::builder()
        .with_settings(settings)
        .with_resolver(Arc::new(StubResolver::example(vec![MxRecord::new(
            10,
            "mx.example.com",
        )])))
        .with_dialer(dialer.clone())
        .build()
        .unwrap();
    (verifier, dialer)
}

/// Accepts `alice`, answers `bob` with `reply`, rejects everyone else.
fn bob_gets(reply: &'static str) -> ScriptedServer {
    ScriptedServer::answering(move |address| {
        let reply = match address.split('@').next() {
            Some("alice") => "250 2.1.5 Ok",
            Some("bob") => reply,
            _ => "550 5.1.1 No such user",
        };
        Some(reply.to_string())
    })
}

#[tokio::test]
async fn invalid_address_needs_no_network() {
    let (verifier, dialer) = verifier_for(&ScriptedServer::new());
    for address in ["not-an-email", "a@b@example.com", "@example.com", "alice@"] {
        assert_eq!(verifier.verify(address).await.unwrap(), VerifyStatus::Invalid);
    }
    assert!(dialer.dialed().is_empty());
}

#[tokio::test]
async fn domain_without_mx_records() {
    let (verifier, dialer) = verifier_for(&ScriptedServer::new());
    let status = verifier.verify("user@nomx.example").await.unwrap();
    assert_eq!(status, VerifyStatus::NoMxRecords);
    assert!(dialer.dialed().is_empty());
}

#[tokio::test]
async fn existing_and_missing_users() {
    let (verifier, dialer) = verifier_for(&ScriptedServer::new());
    assert_eq!(
        verifier.verify("alice@example.com").await.unwrap(),
        VerifyStatus::SmtpVerified
    );
    assert_eq!(
        verifier.verify("bob@Example.com").await.unwrap(),
        VerifyStatus::SmtpUserNotFound
    );
    assert_eq!(dialer.dialed().len(), 1);
}

#[tokio::test]
async fn catch_all_host_is_checked_once() {
    let server = ScriptedServer::answering(|_| Some("250 2.1.5 Ok".to_string()));
    let (verifier, dialer) = verifier_for(&server);

    for address in ["alice@example.com", "bob@example.com", "carol@example.com"] {
        assert_eq!(
            verifier.verify(address).await.unwrap(),
            VerifyStatus::SmtpCheckImpossible
        );
    }
    assert_eq!(dialer.dialed().len(), 1);
    let probes = server
        .transcript()
        .into_iter()
        .filter(|line| line.starts_with("RCPT"))
        .count();
    assert_eq!(probes, 1);
}

#[tokio::test]
async fn server_conditions_map_to_statuses() {
    let cases = [
        (
            "530 5.7.0 Sender verify failed",
            VerifyStatus::SmtpCheckImpossible,
        ),
        ("452 4.2.2 Mailbox over quota", VerifyStatus::SmtpRetryLater),
        (
            "554 5.7.1 Service unavailable; client host blocked using spamhaus",
            VerifyStatus::SmtpRetryLater,
        ),
        ("452 4.5.3 Too many recipients", VerifyStatus::SmtpRetryLater),
        (
            "251 User not local; will forward",
            VerifyStatus::SmtpUnexpectedReply,
        ),
    ];

    for (reply, expected) in cases {
        let (verifier, _) = verifier_for(&bob_gets(reply));
        let status = verifier.verify("bob@example.com").await.unwrap();
        assert_eq!(status, expected, "reply {reply:?}");
    }
}

#[tokio::test]
async fn unexpected_reply_does_not_stick_to_the_domain() {
    let server = bob_gets("251 User not local; will forward");
    let (verifier, dialer) = verifier_for(&server);

    assert_eq!(
        verifier.verify("bob@example.com").await.unwrap(),
        VerifyStatus::SmtpUnexpectedReply
    );
    for _ in 0..3 {
        assert_eq!(
            verifier.verify("alice@example.com").await.unwrap(),
            VerifyStatus::SmtpVerified
        );
    }
    assert_eq!(dialer.dialed().len(), 2);
    let rcpts = server
        .transcript()
        .into_iter()
        .filter(|line| line.starts_with("RCPT TO:<alice@"))
        .count();
    assert_eq!(rcpts, 3);
}

#[tokio::test]
async fn repeated_hang_ups_mean_retry_later() {
    let server = ScriptedServer::answering(|address| {
        (!address.starts_with("bob@")).then(|| "550 5.1.1 No such user".to_string())
    });
    let settings = HostsSettings::new(
        HostSettings {
            max_reconnects: 1,
            ..HostSettings::default()
        },
        [],
    )
    .unwrap();
    let (verifier, _) = verifier_with(&server, settings);

    let status = verifier.verify("bob@example.com").await.unwrap();
    assert_eq!(status, VerifyStatus::SmtpRetryLater);
}

#[tokio::test]
async fn unreachable_host_is_unknown() {
    let verifier = Verifier::builder()
        .with_resolver(Arc::new(StubResolver::example(vec![MxRecord::new(
            10,
            "mx.example.com",
        )])))
        .with_dialer(Arc::new(FakeDialer::default()))
        .build()
        .unwrap();
    assert_eq!(
        verifier.verify("alice@example.com").await.unwrap(),
        VerifyStatus::Unknown
    );
}

#[tokio::test]
async fn dns_failure_is_unknown() {
    let verifier = Verifier::builder()
        .with_resolver(Arc::new(StubResolver::new(|_| {
            Err(ResolveError::from("SERVFAIL"))
        })))
        .with_dialer(Arc::new(FakeDialer::default()))
        .build()
        .unwrap();
    assert_eq!(
        verifier.verify("alice@example.com").await.unwrap(),
        VerifyStatus::Unknown
    );
}

#[tokio::test]
async fn proxy_failure_is_propagated() {
    let verifier = Verifier::builder()
        .with_resolver(Arc::new(StubResolver::example(vec![MxRecord::new(
            10,
            "mx.example.com",
        )])))
        .with_dialer(Arc::new(
            FakeDialer::default().with("mx.example.com", Endpoint::ProxyDown),
        ))
        .build()
        .unwrap();

    let err = verifier.verify("alice@example.com").await.unwrap_err();
    assert!(err.is_proxy_failure());
}
