mod support;

use futures::StreamExt;
use hvctl_esxi::error::EsxiErrorKind;
use hvctl_esxi::status::{OverallStatus, PowerState};
use hvctl_esxi::types::{EndpointId, ObjectRef, SessionState};
use hvctl_esxi::{CallOptions, InventoryService, ServiceConfig};
use std::sync::Arc;
use std::time::Duration;
use support::{endpoint, vm_spec, CreateBehavior, FakeEsxi, LoginBehavior};
use tokio::time::Instant;

fn register(fake: FakeEsxi) -> (InventoryService, EndpointId, Arc<FakeEsxi>) {
    register_with(fake, ServiceConfig::default())
}

fn register_with(fake: FakeEsxi, config: ServiceConfig) -> (InventoryService, EndpointId, Arc<FakeEsxi>) {
    let fake = Arc::new(fake);
    let service = InventoryService::new(config);
    let id = service.add_endpoint(endpoint(), fake.clone()).unwrap();
    (service, id, fake)
}

fn opts() -> CallOptions {
    CallOptions::with_timeout(Duration::from_secs(10))
}

// ── Host info ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_host_info() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    let info = service.get_host_info(&id, &opts()).await.unwrap();
    assert_eq!(info.name, "esx01.lab");
    assert_eq!(info.overall_status, OverallStatus::Normal);
    assert_eq!(info.power_state, PowerState::PoweredOn);
    assert_eq!(info.cpu_mhz, 2394);
    assert_eq!(info.datastore_refs.len(), 3);
    assert!(!info.stale);

    assert_eq!(fake.logins(), 1);
    assert_eq!(service.session_state(&id).unwrap(), SessionState::Authenticated);
}

#[tokio::test]
async fn test_host_info_served_from_cache() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    service.get_host_info(&id, &opts()).await.unwrap();
    service.get_host_info(&id, &opts()).await.unwrap();
    assert_eq!(fake.fetches(&ObjectRef::host("ha-host")), 1);

    service.refresh_host(&id, &opts()).await.unwrap();
    assert_eq!(fake.fetches(&ObjectRef::host("ha-host")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_host_reads_share_one_fetch() {
    let (service, id, fake) = register(FakeEsxi::standalone().with_fetch_delay(Duration::from_millis(200)));

    let call_opts = opts();
    let reads = (0..8).map(|_| service.get_host_info(&id, &call_opts));
    let results = futures::future::join_all(reads).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(fake.fetches(&ObjectRef::host("ha-host")), 1);
    assert_eq!(fake.logins(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_endpoint_fails_after_three_logins() {
    let (service, id, fake) = register(FakeEsxi::standalone().with_login(LoginBehavior::Unreachable));

    let started = Instant::now();
    let err = service.get_host_info(&id, &opts()).await.unwrap_err();

    assert_eq!(err.kind, EsxiErrorKind::ConnectionError);
    assert_eq!(fake.logins(), 3);
    // 500ms + 1000ms of backoff between the three attempts
    assert_eq!(started.elapsed(), Duration::from_millis(1500));
    assert_eq!(service.session_state(&id).unwrap(), SessionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_bad_credentials_are_not_retried() {
    let (service, id, fake) = register(FakeEsxi::standalone().with_login(LoginBehavior::Deny));

    let err = service.get_host_info(&id, &opts()).await.unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::AuthError);
    assert_eq!(fake.logins(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_fetch_times_out_and_reconnects() {
    let mut config = ServiceConfig::default();
    config.retry.max_attempts = 2;
    let (service, id, fake) = register_with(
        FakeEsxi::standalone().with_fetch_delay(Duration::from_secs(60)),
        config,
    );

    let started = Instant::now();
    let err = service.get_host_info(&id, &opts()).await.unwrap_err();

    assert_eq!(err.kind, EsxiErrorKind::Timeout);
    // two 10s timeouts with 500ms of backoff in between
    assert_eq!(started.elapsed(), Duration::from_millis(20_500));
    // the timed-out session is suspect, so the retry logs in again
    assert_eq!(fake.logins(), 2);
    assert_eq!(fake.fetches(&ObjectRef::host("ha-host")), 2);

    // cancelled fetches never finish, even once their delay has passed
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(fake.completed_fetches(), 0);
}

#[tokio::test]
async fn test_endpoint_without_host_is_not_found() {
    let (service, id, _fake) = register(FakeEsxi::standalone().without_hosts());

    let err = service.get_host_info(&id, &opts()).await.unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_stale_host_served_when_refresh_fails() {
    let (service, id, fake) = register(FakeEsxi::standalone());
    service.get_host_info(&id, &opts()).await.unwrap();

    tokio::time::advance(Duration::from_secs(31)).await;
    fake.set_offline(true);

    let err = service.get_host_info(&id, &opts()).await.unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ConnectionError);

    let info = service
        .get_host_info(&id, &opts().allow_stale(None))
        .await
        .unwrap();
    assert!(info.stale);
    assert_eq!(info.name, "esx01.lab");

    let err = service
        .get_host_info(&id, &opts().allow_stale(Some(Duration::from_secs(10))))
        .await
        .unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::StaleData);
}

// ── Datastores ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_list_datastores() {
    let (service, id, _fake) = register(FakeEsxi::standalone());

    let listing = service.collect_datastores(&id, None, &opts()).await.unwrap();
    assert!(listing.failures.is_empty());
    let names: Vec<&str> = listing.datastores.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["datastore1", "datastore2", "datastore3"]);
    assert_eq!(listing.datastores[1].used_bytes(), 120 * 1024 * 1024 * 1024);
}

#[tokio::test]
async fn test_failed_datastore_does_not_abort_listing() {
    let (service, id, _fake) = register(FakeEsxi::standalone().with_broken_datastore("ds-2"));

    let items: Vec<_> = service
        .list_datastores(&id, None, &opts())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(items.len(), 3);
    assert!(items[0].result.is_ok());
    assert_eq!(items[1].reference, ObjectRef::datastore("ds-2"));
    assert_eq!(items[1].result.as_ref().unwrap_err().kind, EsxiErrorKind::NotFound);
    assert!(items[2].result.is_ok());

    let listing = service.collect_datastores(&id, None, &opts()).await.unwrap();
    assert_eq!(listing.datastores.len(), 2);
    assert_eq!(listing.failures.len(), 1);
    assert_eq!(listing.failures[0].0, ObjectRef::datastore("ds-2"));
}

#[tokio::test]
async fn test_datastore_stream_fetches_lazily() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    let mut items = service.list_datastores(&id, None, &opts()).await.unwrap();
    let first = items.next().await.unwrap();
    assert!(first.result.is_ok());

    assert_eq!(fake.fetches(&ObjectRef::datastore("ds-1")), 1);
    assert_eq!(fake.fetches(&ObjectRef::datastore("ds-2")), 0);
    assert_eq!(fake.fetches(&ObjectRef::datastore("ds-3")), 0);
}

#[tokio::test]
async fn test_list_datastores_rejects_non_host() {
    let (service, id, _fake) = register(FakeEsxi::standalone());

    let err = service
        .list_datastores(&id, Some(&ObjectRef::vm("vm-1")), &opts())
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);
}

// ── VM creation ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_vm_validates_before_any_remote_call() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    let mut spec = vm_spec("web/01");
    let err = service.create_vm(&id, &spec, &opts()).await.unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);

    spec.name = "web-01".into();
    spec.cpu_count = 1024;
    let err = service.create_vm(&id, &spec, &opts()).await.unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);

    assert_eq!(fake.logins(), 0);
    assert!(fake.created().is_empty());
}

#[tokio::test]
async fn test_create_vm_places_on_default_host() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    let handle = service.create_vm(&id, &vm_spec("web-01"), &opts()).await.unwrap();
    assert_eq!(handle.name, "web-01");
    assert_eq!(handle.reference, ObjectRef::vm("1"));

    let created = fake.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].host, Some(ObjectRef::host("ha-host")));
}

#[tokio::test]
async fn test_create_vm_rejects_duplicate_name() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    service.create_vm(&id, &vm_spec("web-01"), &opts()).await.unwrap();
    let err = service
        .create_vm(&id, &vm_spec("web-01"), &opts())
        .await
        .unwrap_err();

    assert_eq!(err.kind, EsxiErrorKind::ValidationError);
    assert_eq!(fake.created().len(), 1);
}

#[tokio::test]
async fn test_create_vm_rejects_name_already_on_host() {
    let (service, id, fake) = register(FakeEsxi::standalone().with_vm("web-01"));

    let err = service
        .create_vm(&id, &vm_spec("web-01"), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);
    assert_eq!(fake.create_calls(), 0);

    // the existing VM's name is cached now; the retry is refused locally
    let err = service
        .create_vm(&id, &vm_spec("web-01"), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);
    assert_eq!(fake.fetches(&ObjectRef::vm("1")), 1);

    let handle = service.create_vm(&id, &vm_spec("web-02"), &opts()).await.unwrap();
    assert_eq!(handle.reference, ObjectRef::vm("2"));
    assert_eq!(fake.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_with_lost_reply_finds_created_vm() {
    let (service, id, fake) = register(
        FakeEsxi::standalone().with_create(CreateBehavior::ReplyLost(Duration::from_secs(60))),
    );

    let handle = service.create_vm(&id, &vm_spec("web-01"), &opts()).await.unwrap();
    assert_eq!(handle.reference, ObjectRef::vm("1"));
    assert_eq!(handle.name, "web-01");
    assert_eq!(fake.create_calls(), 1);
    assert_eq!(fake.logins(), 2);

    let err = service
        .create_vm(&id, &vm_spec("web-01"), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ValidationError);
    assert_eq!(fake.create_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_with_lost_request_is_a_connection_error() {
    let (service, id, fake) = register(
        FakeEsxi::standalone().with_create(CreateBehavior::RequestLost(Duration::from_secs(60))),
    );

    let err = service
        .create_vm(&id, &vm_spec("web-01"), &opts())
        .await
        .unwrap_err();
    assert_eq!(err.kind, EsxiErrorKind::ConnectionError);
    assert_eq!(fake.create_calls(), 1);
    assert!(fake.created().is_empty());

    // nothing was created, so the name is free again
    let handle = service.create_vm(&id, &vm_spec("web-01"), &opts()).await.unwrap();
    assert_eq!(handle.reference, ObjectRef::vm("1"));
    assert_eq!(fake.create_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_create_vm_retries_busy_endpoint() {
    let (service, id, fake) = register(FakeEsxi::standalone().with_create(CreateBehavior::BusyOnce));

    let started = Instant::now();
    let handle = service.create_vm(&id, &vm_spec("web-01"), &opts()).await.unwrap();

    assert_eq!(handle.reference, ObjectRef::vm("1"));
    assert_eq!(fake.create_calls(), 2);
    assert_eq!(fake.created().len(), 1);
    assert_eq!(started.elapsed(), Duration::from_millis(500));
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_check_session_and_shutdown() {
    let (service, id, fake) = register(FakeEsxi::standalone());
    assert!(!service.check_session(&id, &opts()).await.unwrap());

    service.get_host_info(&id, &opts()).await.unwrap();
    assert!(service.check_session(&id, &opts()).await.unwrap());

    service.shutdown().await;
    assert_eq!(fake.logouts(), 1);
    assert!(service.endpoints().is_empty());
}

#[tokio::test]
async fn test_invalidate_endpoint_forces_refetch() {
    let (service, id, fake) = register(FakeEsxi::standalone());

    service.get_host_info(&id, &opts()).await.unwrap();
    service.invalidate_endpoint(&id).unwrap();
    service.get_host_info(&id, &opts()).await.unwrap();

    assert_eq!(fake.fetches(&ObjectRef::host("ha-host")), 2);
    assert_eq!(fake.logins(), 1);
}
