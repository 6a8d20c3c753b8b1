//! Integration tests for the cloud manager over the in-process bus.

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use cloudrpc::FaultKind;
use cloudrun::Error;
use cloudrun::ObjectId;
use cloudrun::bind::CloudStub;
use cloudrun::cloud_stub;
use cloudrun::config::FieldWritePolicy;
use cloudrun::config::RuntimeConfig;
use cloudrun::host::Host;
use cloudrun::launcher::LocalLauncher;
use cloudrun::manager::CloudManager;
use cloudrun::manager::Lifecycle;
use cloudrun::policy::HostPerObjectPolicy;
use cloudrun::policy::ObjectDescriptor;
use cloudrun::policy::ScalingPolicy;
use cloudrun::policy::SingleHostPolicy;
use cloudrun::policy::TypeAffinityPolicy;
use cloudrun::pool::HostPool;
use cloudrun::reference::CallbackObject;
use cloudrun::server::HostServer;
use cloudrun::telemetry::MemorySink;
use cloudrun::telemetry::NullSink;

use common::cloud;
use common::cloud_with;
use common::config;

// --- Test 1: Create, Invoke, Destroy, Scale Down ---

#[tokio::test]
async fn test_single_host_lifecycle() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;

    let handle = manager.create_object("Counter", (5i64,)).await?;
    assert_eq!(manager.hosts_count(), 1);
    assert_eq!(manager.count_cloud_objects(), 1);
    assert_eq!(manager.host_of(handle.id)?, handle.host);
    assert_eq!(manager.object_state(handle.id), Some(Lifecycle::Live));

    let sum: i64 = manager.invoke(handle.id, "add", (2i64,)).await?;
    assert_eq!(sum, 7);
    let value: i64 = manager.get_field(handle.id, "value").await?;
    assert_eq!(value, 7);
    let me: Option<ObjectId> = manager.invoke(handle.id, "whoami", ()).await?;
    assert_eq!(me, Some(handle.id));

    manager.destroy(handle.id).await?;
    assert_eq!(manager.count_cloud_objects(), 0);
    assert_eq!(manager.hosts_count(), 0);
    assert_eq!(cloud.launcher.terminated(), 1);
    assert_eq!(manager.object_state(handle.id), Some(Lifecycle::Destroyed));

    assert_eq!(cloud.sink.count("object_created"), 1);
    assert_eq!(cloud.sink.count("object_destroyed"), 1);
    assert_eq!(cloud.sink.count("host_terminated"), 1);
    Ok(())
}

// --- Test 2: Destroy Is Idempotent ---

#[tokio::test]
async fn test_destroy_twice_and_use_after_destroy() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;

    let handle = manager.create_object("Counter", ()).await?;
    manager.destroy(handle.id).await?;
    manager.destroy(handle.id).await?;

    let result: Result<i64, Error> = manager.invoke(handle.id, "get", ()).await;
    assert!(matches!(result, Err(Error::DestroyedObject(id)) if id == handle.id));
    let field: Result<i64, Error> = manager.get_field(handle.id, "value").await;
    assert!(matches!(field, Err(Error::DestroyedObject(_))));
    assert_eq!(cloud.sink.count("object_destroyed"), 1);
    Ok(())
}

#[tokio::test]
async fn test_unknown_object() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let stranger = ObjectId::new();

    let result: Result<i64, Error> = cloud.manager.invoke(stranger, "get", ()).await;
    assert!(matches!(result, Err(Error::UnknownObject(id)) if id == stranger));
    assert!(matches!(cloud.manager.host_of(stranger), Err(Error::UnknownObject(_))));
    assert_eq!(cloud.manager.object_state(stranger), None);

    // Destroying an id nobody created is a no-op.
    cloud.manager.destroy(stranger).await?;
    Ok(())
}

// --- Test 3: Remote Failures Are Reported, Not Lost ---

#[tokio::test]
async fn test_remote_construction_failures() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;

    let raised = manager.create_object("Faulty", ()).await;
    assert!(matches!(
        raised,
        Err(Error::RemoteConstruction { ref fault, .. }) if fault.kind == FaultKind::Raised
    ));

    let missing = manager.create_object("Nope", ()).await;
    assert!(matches!(
        missing,
        Err(Error::RemoteConstruction { ref fault, .. }) if fault.kind == FaultKind::NoSuchClass
    ));

    let wrong_args = manager.create_object("Counter", ("five".to_string(),)).await;
    assert!(matches!(
        wrong_args,
        Err(Error::RemoteConstruction { ref fault, .. }) if fault.kind == FaultKind::NoSuchConstructor
    ));

    assert_eq!(manager.count_cloud_objects(), 0);
    assert_eq!(manager.hosts_count(), 0);
    assert_eq!(manager.creations_in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn test_remote_invocation_failures() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;
    let handle = manager.create_object("Counter", (1i64,)).await?;

    let raised: Result<i64, Error> = manager.invoke(handle.id, "fail", ()).await;
    match raised {
        Err(Error::RemoteInvocation { fault, operation, .. }) => {
            assert_eq!(fault.kind, FaultKind::Raised);
            assert_eq!(operation, "fail");
            assert!(fault.message.contains("counter refused"));
        }
        other => panic!("expected remote invocation error, got {:?}", other),
    }

    let panicked: Result<i64, Error> = manager.invoke(handle.id, "explode", ()).await;
    assert!(matches!(
        panicked,
        Err(Error::RemoteInvocation { ref fault, .. }) if fault.kind == FaultKind::Panicked
    ));

    let no_method: Result<i64, Error> = manager.invoke(handle.id, "add", ("1".to_string(),)).await;
    assert!(matches!(
        no_method,
        Err(Error::RemoteInvocation { ref fault, .. }) if fault.kind == FaultKind::NoSuchMethod
    ));

    let no_field: Result<i64, Error> = manager.get_field(handle.id, "missing").await;
    assert!(matches!(
        no_field,
        Err(Error::RemoteInvocation { ref fault, .. }) if fault.kind == FaultKind::NoSuchField
    ));

    // The object survives all of the above.
    let value: i64 = manager.invoke(handle.id, "get", ()).await?;
    assert_eq!(value, 1);
    Ok(())
}

// --- Test 4: Fields ---

#[tokio::test]
async fn test_field_get_and_set() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;
    let handle = manager.create_object("Counter", ()).await?;

    manager.set_field(handle.id, "label", "visits").await?;
    manager.set_field(handle.id, "value", &41i64).await?;
    let sum: i64 = manager.invoke(handle.id, "add", (1i64,)).await?;
    assert_eq!(sum, 42);
    let label: String = manager.get_field(handle.id, "label").await?;
    assert_eq!(label, "visits");
    Ok(())
}

#[tokio::test]
async fn test_field_access_on_busy_object_does_not_stall_the_runtime() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = cloud.manager.clone();
    let busy = manager.create_object("Counter", (7i64,)).await?.id;
    let other = manager.create_object("Counter", (1i64,)).await?.id;

    let sleeper = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.invoke::<_, i64>(busy, "sleep", (600u64,)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let reader = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_field::<i64>(busy, "value").await })
    };

    let ticker = tokio::spawn(async {
        let mut worst = Duration::ZERO;
        let mut last = Instant::now();
        for _ in 0..30 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let now = Instant::now();
            worst = worst.max(now - last);
            last = now;
        }
        worst
    });

    // Unrelated traffic is answered while the busy object is locked.
    let started = Instant::now();
    let value: i64 = manager.invoke(other, "get", ()).await?;
    assert_eq!(value, 1);
    assert!(started.elapsed() < Duration::from_millis(300));

    let worst = ticker.await?;
    assert!(worst < Duration::from_millis(150), "runtime stalled for {:?}", worst);
    assert_eq!(reader.await??, 7);
    assert_eq!(sleeper.await??, 7);
    Ok(())
}

// --- Test 5: Timeouts ---

#[tokio::test]
async fn test_slow_invocation_times_out() -> anyhow::Result<()> {
    let config = RuntimeConfig {
        request_timeout_ms: 200,
        ..config()
    };
    let cloud = cloud_with(SingleHostPolicy::new(), config, Duration::ZERO).await;
    let manager = &cloud.manager;
    let handle = manager.create_object("Counter", (3i64,)).await?;

    let slow: Result<i64, Error> = manager.invoke(handle.id, "sleep", (1_000u64,)).await;
    assert!(matches!(slow, Err(Error::RemoteTimeout { .. })));

    // The invocation finishes on the host; the object stays usable.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let value: i64 = manager.invoke(handle.id, "get", ()).await?;
    assert_eq!(value, 3);
    Ok(())
}

// --- Test 6: Keep-Alive and Reclamation ---

#[tokio::test]
async fn test_keep_alive_prevents_reclamation() -> anyhow::Result<()> {
    let config = RuntimeConfig {
        keep_alive_interval_ms: 50,
        ..config()
    };
    let cloud = cloud_with(SingleHostPolicy::new(), config, Duration::ZERO).await;
    let handle = cloud.manager.create_object("Counter", (8i64,)).await?;

    tokio::time::sleep(Duration::from_millis(600)).await;
    let value: i64 = cloud.manager.invoke(handle.id, "get", ()).await?;
    assert_eq!(value, 8);
    assert_eq!(cloud.sink.count("object_reclaimed"), 0);
    Ok(())
}

#[tokio::test]
async fn test_idle_objects_are_reclaimed_without_keep_alive() -> anyhow::Result<()> {
    let transport = Arc::new(cloudrun::local_transport::LocalTransport::new());
    let sink = Arc::new(MemorySink::new());
    let host_config = RuntimeConfig {
        keep_alive_interval_ms: 50,
        ..config()
    }
    .host_config();
    let launcher = Arc::new(LocalLauncher::new(transport.clone(), common::catalog(), host_config).with_event_sink(sink.clone()));
    // The client never sends keep-alives.
    let manager = CloudManager::builder(transport, launcher.clone())
        .config(config())
        .event_sink(sink.clone())
        .start()
        .await?;

    let handle = manager.create_object("Counter", ()).await?;
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(sink.count("object_reclaimed"), 1);

    let gone: Result<i64, Error> = manager.invoke(handle.id, "get", ()).await;
    assert!(matches!(
        gone,
        Err(Error::RemoteInvocation { ref fault, .. }) if fault.kind == FaultKind::NoSuchObject
    ));

    // Destroy still succeeds and releases the host.
    manager.destroy(handle.id).await?;
    assert_eq!(manager.hosts_count(), 0);
    Ok(())
}

// --- Test 7: Stubs ---

#[tokio::test]
async fn test_stub_buffers_writes_until_created() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let stub = CloudStub::new(&cloud.manager, "Counter");

    stub.set("label", "early").await?;
    stub.set("value", &10i64).await?;
    assert_eq!(stub.pending_writes(), 2);
    let early: Result<i64, Error> = stub.get("value").await;
    assert!(matches!(early, Err(Error::NotRegistered { .. })));

    let id = stub.create(()).await?;
    assert_eq!(stub.id(), Some(id));
    assert_eq!(stub.pending_writes(), 0);
    let label: String = stub.get("label").await?;
    assert_eq!(label, "early");
    let sum: i64 = stub.invoke("add", (5i64,)).await?;
    assert_eq!(sum, 15);

    assert!(matches!(stub.create(()).await, Err(Error::AlreadyCreated(existing)) if existing == id));
    stub.destroy().await?;
    assert_eq!(cloud.manager.count_cloud_objects(), 0);
    Ok(())
}

#[tokio::test]
async fn test_stub_rejects_early_writes_when_configured() -> anyhow::Result<()> {
    let config = RuntimeConfig {
        unregistered_field_writes: FieldWritePolicy::Reject,
        ..config()
    };
    let cloud = cloud_with(SingleHostPolicy::new(), config, Duration::ZERO).await;
    let stub = CloudStub::new(&cloud.manager, "Counter");

    let result = stub.set("label", "early").await;
    assert!(matches!(result, Err(Error::NotRegistered { ref class }) if class == "Counter"));
    assert_eq!(stub.pending_writes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_creates_on_one_stub_place_one_object() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let stub = Arc::new(CloudStub::new(&cloud.manager, "Counter"));

    let mut attempts = Vec::new();
    for _ in 0..4 {
        let stub = stub.clone();
        attempts.push(tokio::spawn(async move { stub.create((1i64,)).await }));
    }
    let mut created = Vec::new();
    let mut refused = 0;
    for attempt in attempts {
        match attempt.await? {
            Ok(id) => created.push(id),
            Err(Error::AlreadyCreated(_)) => refused += 1,
            Err(e) => return Err(e.into()),
        }
    }
    assert_eq!(created.len(), 1);
    assert_eq!(refused, 3);
    assert_eq!(stub.id(), Some(created[0]));
    assert_eq!(cloud.manager.count_cloud_objects(), 1);
    Ok(())
}

cloud_stub! {
    pub struct CounterStub => "Counter" {
        fn add(n: i64) -> i64;
        fn get() -> i64;
    }
}

#[tokio::test]
async fn test_generated_stub() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let counter = CounterStub::create(&cloud.manager, (2i64,)).await?;

    assert_eq!(counter.add(3).await?, 5);
    assert_eq!(counter.get().await?, 5);
    assert_eq!(CounterStub::CLASS, "Counter");

    let id = counter.id().expect("bound");
    counter.destroy().await?;
    assert_eq!(cloud.manager.object_state(id), Some(Lifecycle::Destroyed));
    Ok(())
}

// --- Test 8: Discovery of Pre-Started Hosts ---

#[tokio::test]
async fn test_discover_static_host() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;

    assert!(manager.discover(Duration::from_millis(100)).await?.is_none());

    let server = HostServer::start(
        "cloudrun.host.prestarted",
        cloud.transport.clone(),
        common::catalog(),
        config().host_config(),
        Arc::new(NullSink),
    )
    .await?;

    let host = manager.discover(Duration::from_secs(2)).await?.expect("host answers");
    assert!(host.is_static());
    assert_eq!(host.address().as_deref(), Some(server.address()));

    let handle = manager.create_object("Counter", ()).await?;
    assert_eq!(handle.host, host.id());
    assert_eq!(server.object_count(), 1);
    assert_eq!(cloud.launcher.launched(), 0);

    // Static hosts outlive their last object.
    manager.destroy(handle.id).await?;
    assert_eq!(manager.hosts_count(), 1);
    assert_eq!(server.object_count(), 0);
    Ok(())
}

// --- Test 9: Placement Under Concurrency ---

#[tokio::test]
async fn test_concurrent_creates_share_one_host() -> anyhow::Result<()> {
    for policy in [SingleHostPolicy::new(), SingleHostPolicy::new().starting_async()] {
        let cloud = cloud_with(policy, config(), Duration::from_millis(100)).await;

        let mut tasks = Vec::new();
        for i in 0..5i64 {
            let manager = cloud.manager.clone();
            tasks.push(tokio::spawn(async move { manager.create_object("Counter", (i,)).await }));
        }
        for task in tasks {
            task.await??;
        }

        assert_eq!(cloud.manager.hosts_count(), 1);
        assert_eq!(cloud.launcher.launched(), 1);
        assert_eq!(cloud.manager.count_cloud_objects(), 5);
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_invocations_on_one_object() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let id = cloud.manager.create_object("Counter", ()).await?.id;

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let manager = cloud.manager.clone();
        tasks.push(tokio::spawn(async move { manager.invoke::<_, i64>(id, "add", (1i64,)).await }));
    }
    for task in tasks {
        task.await??;
    }
    let total: i64 = cloud.manager.invoke(id, "get", ()).await?;
    assert_eq!(total, 20);
    Ok(())
}

#[tokio::test]
async fn test_host_per_object_policy() -> anyhow::Result<()> {
    let cloud = cloud(HostPerObjectPolicy).await;
    let manager = &cloud.manager;

    let a = manager.create_object("Counter", ()).await?;
    let b = manager.create_object("Counter", ()).await?;
    let c = manager.create_object("Counter", ()).await?;
    assert_eq!(manager.hosts_count(), 3);
    assert_ne!(a.host, b.host);
    assert_ne!(b.host, c.host);

    manager.destroy(b.id).await?;
    assert_eq!(manager.hosts_count(), 2);
    assert_eq!(manager.count_cloud_objects(), 2);
    Ok(())
}

#[tokio::test]
async fn test_type_affinity_policy() -> anyhow::Result<()> {
    let cloud = cloud(TypeAffinityPolicy).await;
    let manager = &cloud.manager;

    let a1 = manager.create_object("Counter", ()).await?;
    let a2 = manager.create_object("Counter", ()).await?;
    let b = manager.create_object("Pinned", ()).await?;
    assert_eq!(a1.host, a2.host);
    assert_ne!(a1.host, b.host);
    assert_eq!(manager.hosts_count(), 2);
    Ok(())
}

// --- Test 10: Placement Failures ---

#[tokio::test]
async fn test_host_launch_failure() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    cloud.launcher.fail_next_launches(1);

    let failed = cloud.manager.create_object("Counter", ()).await;
    assert!(matches!(failed, Err(Error::HostLaunch(_))));
    assert_eq!(cloud.manager.hosts_count(), 0);
    assert_eq!(cloud.sink.count("host_launch_failed"), 1);

    // The next attempt starts a fresh host.
    cloud.manager.create_object("Counter", ()).await?;
    assert_eq!(cloud.manager.hosts_count(), 1);
    Ok(())
}

struct NowherePolicy;

#[async_trait::async_trait]
impl ScalingPolicy for NowherePolicy {
    async fn select_host(&self, _object: &ObjectDescriptor, _pool: &HostPool) -> cloudrun::Result<Option<Arc<Host>>> {
        Ok(None)
    }

    async fn scale_down(&self, _host: &Arc<Host>, _pool: &HostPool) -> bool {
        false
    }
}

#[tokio::test]
async fn test_policy_without_host() {
    let cloud = cloud(NowherePolicy).await;
    let result = cloud.manager.create_object("Counter", ()).await;
    assert!(matches!(result, Err(Error::NoHostSelected { ref class }) if class == "Counter"));
    assert_eq!(cloud.manager.creations_in_flight(), 0);
}

// --- Test 11: Scale-Down Timer ---

struct KeepUntilTimer;

#[async_trait::async_trait]
impl ScalingPolicy for KeepUntilTimer {
    async fn select_host(&self, object: &ObjectDescriptor, pool: &HostPool) -> cloudrun::Result<Option<Arc<Host>>> {
        SingleHostPolicy::new().select_host(object, pool).await
    }

    async fn scale_down(&self, host: &Arc<Host>, _pool: &HostPool) -> bool {
        host.idle_for() > Duration::from_millis(150)
    }
}

#[tokio::test]
async fn test_scale_down_timer_releases_idle_hosts() -> anyhow::Result<()> {
    let config = RuntimeConfig {
        scale_down_interval_ms: 50,
        ..config()
    };
    let cloud = cloud_with(KeepUntilTimer, config, Duration::ZERO).await;
    let handle = cloud.manager.create_object("Counter", ()).await?;

    // Destroy asks the policy right away; the host was just used, so it stays.
    cloud.manager.destroy(handle.id).await?;
    assert_eq!(cloud.manager.hosts_count(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(cloud.manager.hosts_count(), 0);
    assert_eq!(cloud.launcher.terminated(), 1);
    Ok(())
}

// --- Test 12: Stop ---

#[tokio::test]
async fn test_stop_releases_everything() -> anyhow::Result<()> {
    let cloud = cloud(HostPerObjectPolicy).await;
    let manager = &cloud.manager;
    let a = manager.create_object("Counter", ()).await?;
    manager.create_object("Counter", ()).await?;
    assert_eq!(cloud.launcher.running(), 2);

    manager.stop().await;
    assert!(manager.is_stopped());
    assert_eq!(manager.hosts_count(), 0);
    assert_eq!(cloud.launcher.running(), 0);
    assert_eq!(manager.object_state(a.id), Some(Lifecycle::Destroyed));

    let after = manager.create_object("Counter", ()).await;
    assert!(matches!(after, Err(Error::Stopped)));
    manager.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_stop_with_lost_bus_still_terminates_hosts() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;
    manager.create_object("Counter", ()).await?;
    assert_eq!(cloud.launcher.running(), 1);

    // Shutdown messages cannot be delivered; the launcher still tears down.
    cloud.transport.sever();
    manager.stop().await;
    assert_eq!(manager.hosts_count(), 0);
    assert_eq!(cloud.launcher.running(), 0);
    assert_eq!(cloud.launcher.terminated(), 1);
    Ok(())
}

// --- Test 13: Objects Passed by Reference ---

struct Greeter {
    prefix: String,
    calls: Arc<AtomicUsize>,
}

#[tokio::test]
async fn test_host_calls_back_into_exported_object() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;

    let calls = Arc::new(AtomicUsize::new(0));
    let greeter = CallbackObject::new(Greeter {
        prefix: "hello".into(),
        calls: calls.clone(),
    })
    .method("greet", |g: &Greeter, (name,): (String,)| {
        g.calls.fetch_add(1, Ordering::SeqCst);
        format!("{}, {}", g.prefix, name)
    });
    let reference = manager.export(greeter);
    assert_eq!(reference.class, "Greeter");
    assert_eq!(manager.exported_count(), 1);

    let notifier = manager.create_object("Notifier", ()).await?;
    let reply: String = manager
        .invoke(notifier.id, "relay", (reference.clone(), "world".to_string()))
        .await?;
    assert_eq!(reply, "hello, world");
    let sent: u32 = manager.invoke(notifier.id, "sent", ()).await?;
    assert_eq!(sent, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Released references stop answering; the host sees why.
    assert!(manager.release(&reference));
    assert!(!manager.release(&reference));
    let gone: Result<String, FaultKind> = manager
        .invoke(notifier.id, "try_relay", (reference.clone(), "again".to_string()))
        .await?;
    assert_eq!(gone, Err(FaultKind::NoSuchReference));

    let raised: Result<String, Error> = manager
        .invoke(notifier.id, "relay", (reference, "again".to_string()))
        .await;
    match raised {
        Err(Error::RemoteInvocation { fault, .. }) => {
            assert_eq!(fault.kind, FaultKind::Raised);
            assert!(fault.message.contains("not exported"));
        }
        other => panic!("expected remote invocation error, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.exported_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_callback_failures_reach_the_calling_object() -> anyhow::Result<()> {
    let cloud = cloud(SingleHostPolicy::new()).await;
    let manager = &cloud.manager;
    let notifier = manager.create_object("Notifier", ()).await?;

    let mute = manager.export(CallbackObject::new(()).method("wave", |_: &(), (): ()| true));
    let missing: Result<String, FaultKind> = manager
        .invoke(notifier.id, "try_relay", (mute, "hi".to_string()))
        .await?;
    assert_eq!(missing, Err(FaultKind::NoSuchMethod));

    let grumpy = manager.export(
        CallbackObject::new(()).method("greet", |_: &(), (_name,): (String,)| -> String { panic!("not today") }),
    );
    let panicked: Result<String, FaultKind> = manager
        .invoke(notifier.id, "try_relay", (grumpy, "hi".to_string()))
        .await?;
    assert_eq!(panicked, Err(FaultKind::Panicked));

    // The client keeps serving after a panicking callback.
    let polite = manager.export(CallbackObject::new(()).method("greet", |_: &(), (name,): (String,)| name));
    let echoed: Result<String, FaultKind> = manager
        .invoke(notifier.id, "try_relay", (polite, "still here".to_string()))
        .await?;
    assert_eq!(echoed, Ok("still here".to_string()));

    assert_eq!(manager.exported_count(), 3);
    manager.stop().await;
    assert_eq!(manager.exported_count(), 0);
    Ok(())
}
