//! Shared fixtures: an in-process bus, a local launcher and a few classes.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudrun::CloudManager;
use cloudrpc::FaultKind;
use cloudrpc::Reference;
use cloudrun::ObjectId;
use cloudrun::config::RuntimeConfig;
use cloudrun::context::ObjectContext;
use cloudrun::launcher::LocalLauncher;
use cloudrun::ledger::Catalog;
use cloudrun::ledger::ClassDef;
use cloudrun::local_transport::LocalTransport;
use cloudrun::policy::ScalingPolicy;
use cloudrun::telemetry::MemorySink;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
    pub label: String,
    pub log: Vec<String>,
    #[serde(skip)]
    pub id: Option<ObjectId>,
    #[serde(skip)]
    pub scratch: u32,
}

pub fn counter_class() -> ClassDef {
    ClassDef::builder::<Counter>("Counter")
        .constructor(|(): ()| Counter::default())
        .constructor(|(value,): (i64,)| Counter {
            value,
            ..Counter::default()
        })
        .method("add", |c: &mut Counter, (n,): (i64,)| {
            c.value += n;
            c.value
        })
        .method("get", |c: &mut Counter, (): ()| c.value)
        .method("whoami", |c: &mut Counter, (): ()| c.id)
        .method("scratch", |c: &mut Counter, (): ()| c.scratch)
        .method("sleep", |c: &mut Counter, (ms,): (u64,)| {
            std::thread::sleep(Duration::from_millis(ms));
            c.value
        })
        .try_method("fail", |_c: &mut Counter, (): ()| Err::<i64, String>("counter refused".into()))
        .method("explode", |_c: &mut Counter, (): ()| -> i64 { panic!("kaboom") })
        .field("value", |c: &mut Counter| &mut c.value)
        .field("label", |c: &mut Counter| &mut c.label)
        .field("log", |c: &mut Counter| &mut c.log)
        .object_id_field(|c: &mut Counter| &mut c.id)
        .pre_migration(0, |c: &mut Counter| c.log.push("pre".into()))
        .post_migration(0, |c: &mut Counter| c.log.push("post".into()))
        .transient(|c: &mut Counter| &mut c.scratch, || 99)
        .migratable()
        .build()
}

/// Same shape as `Counter`, but its state never leaves a host.
pub fn pinned_class() -> ClassDef {
    ClassDef::builder::<Counter>("Pinned")
        .constructor(|(): ()| Counter::default())
        .method("get", |c: &mut Counter, (): ()| c.value)
        .build()
}

/// A class whose constructor always raises.
pub fn faulty_class() -> ClassDef {
    ClassDef::builder::<Counter>("Faulty")
        .try_constructor(|(): ()| Err::<Counter, String>("cannot build".into()))
        .build()
}

/// Relays messages to client objects it is handed by reference.
#[derive(Debug, Default)]
pub struct Notifier {
    pub sent: u32,
    pub context: Option<ObjectContext>,
}

pub fn notifier_class() -> ClassDef {
    ClassDef::builder::<Notifier>("Notifier")
        .constructor(|(): ()| Notifier::default())
        .try_method("relay", |n: &mut Notifier, (to, text): (Reference, String)| {
            let context = n.context.as_ref().ok_or("no context")?;
            let reply: String = context.call_back(&to, "greet", (text,)).map_err(|f| f.to_string())?;
            n.sent += 1;
            Ok::<String, String>(reply)
        })
        .method("try_relay", |n: &mut Notifier, (to, text): (Reference, String)| -> Result<String, FaultKind> {
            match &n.context {
                Some(context) => context.call_back(&to, "greet", (text,)).map_err(|f| f.kind),
                None => Err(FaultKind::NoSuchReference),
            }
        })
        .method("sent", |n: &mut Notifier, (): ()| n.sent)
        .context_field(|n: &mut Notifier| &mut n.context)
        .build()
}

pub fn catalog() -> Arc<Catalog> {
    let catalog = Catalog::new();
    catalog.register(counter_class());
    catalog.register(pinned_class());
    catalog.register(faulty_class());
    catalog.register(notifier_class());
    Arc::new(catalog)
}

pub struct Cloud {
    pub manager: CloudManager,
    pub launcher: Arc<LocalLauncher>,
    pub transport: Arc<LocalTransport>,
    pub sink: Arc<MemorySink>,
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig {
        request_timeout_ms: 5_000,
        host_startup_timeout_ms: 5_000,
        ..RuntimeConfig::default()
    }
}

pub async fn cloud(policy: impl ScalingPolicy) -> Cloud {
    cloud_with(policy, config(), Duration::ZERO).await
}

pub async fn cloud_with(policy: impl ScalingPolicy, config: RuntimeConfig, startup_delay: Duration) -> Cloud {
    let transport = Arc::new(LocalTransport::new());
    let sink = Arc::new(MemorySink::new());
    let launcher = Arc::new(
        LocalLauncher::new(transport.clone(), catalog(), config.host_config())
            .with_event_sink(sink.clone())
            .with_startup_delay(startup_delay),
    );
    let manager = CloudManager::builder(transport.clone(), launcher.clone())
        .policy(policy)
        .config(config)
        .event_sink(sink.clone())
        .start()
        .await
        .expect("manager starts");
    Cloud {
        manager,
        launcher,
        transport,
        sink,
    }
}
