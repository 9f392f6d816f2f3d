mod support;

use sbcli::verify::verify_sas;
use std::time::Duration;
use support::FakeBus;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const CONNECTION_STRING: &str = "Endpoint=sb://contoso.servicebus.windows.net/;\
SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=c2VjcmV0";

#[tokio::test]
async fn valid_key_reports_host_and_policy() {
    let bus = FakeBus::new();
    let report = verify_sas(
        &bus,
        CONNECTION_STRING,
        5671,
        Duration::from_secs(4),
        &CancellationToken::new(),
    )
    .await;

    assert!(report.ok);
    assert_eq!(
        report.message,
        "AMQP SAS connected to contoso.servicebus.windows.net as RootManageSharedAccessKey."
    );
    assert_eq!(report.host.as_deref(), Some("contoso.servicebus.windows.net"));
    assert_eq!(report.policy.as_deref(), Some("RootManageSharedAccessKey"));
}

#[tokio::test]
async fn incomplete_string_is_reported_without_connecting() {
    let bus = FakeBus::new();
    let report = verify_sas(
        &bus,
        "Endpoint=sb://contoso.servicebus.windows.net/",
        5671,
        Duration::from_secs(4),
        &CancellationToken::new(),
    )
    .await;

    assert!(!report.ok);
    assert_eq!(
        report.message,
        "Invalid connection string (missing Endpoint/KeyName/Key)."
    );
    assert!(bus.sasl_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_key_fails_fast() {
    let bus = FakeBus::new();
    bus.reject_plain();
    let started = Instant::now();

    let report = verify_sas(
        &bus,
        CONNECTION_STRING,
        5671,
        Duration::from_millis(100),
        &CancellationToken::new(),
    )
    .await;

    assert!(!report.ok);
    assert!(report.message.contains("Unauthorized"));
    assert_eq!(bus.sasl_log().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}
