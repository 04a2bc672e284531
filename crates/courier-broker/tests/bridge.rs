//! Broker, servers and clients wired together through one hub.

use courier_broker::{Broker, BrokerHandle, HostingConfig, TaskLauncher};
use courier_client::{CallError, Client, ClientError};
use courier_core::{
    ArgType, ConnectionState, Contract, ContractError, ContractRegistry, HostContext, HostKind,
    Hub, RemoteError, RemoteErrorKind,
};
use courier_server::{MethodTable, Server, serve};
use serde_json::{Value, json};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn contracts() -> ContractRegistry {
    ContractRegistry::with_contracts([
        Contract::new("logic", "1.0")
            .with_method("setFrequency", [ArgType::Number])
            .with_method("getFrequency", [])
            .with_method("seekUp", [])
            .with_method("toggleBookmark", []),
        Contract::new("history", "1.0")
            .with_method("save", [ArgType::Number])
            .with_method("restore", []),
        Contract::new("favorites", "1.0")
            .with_method("getAll", [])
            .with_method("add", [ArgType::Number]),
    ])
}

#[derive(Default)]
struct Station {
    frequency: f64,
    log: Vec<String>,
    saved: Vec<f64>,
}

type Shared = Arc<Mutex<Station>>;

fn logic(station: &Shared) -> MethodTable {
    let set = station.clone();
    let get = station.clone();
    let seek = station.clone();
    let bookmark = station.clone();
    MethodTable::new()
        .method("setFrequency", move |args| {
            let result = match args[0].as_f64() {
                Some(f) if f > 0.0 => {
                    let mut station = set.lock().unwrap();
                    station.frequency = f;
                    station.log.push("setFrequency".into());
                    Ok(json!(f))
                }
                _ => Err(RemoteError::handler("frequency out of range")),
            };
            async move { result }
        })
        .method("getFrequency", move |_| {
            let frequency = get.lock().unwrap().frequency;
            async move { Ok(json!(frequency)) }
        })
        .method("seekUp", move |_| {
            let mut station = seek.lock().unwrap();
            station.frequency += 0.2;
            station.log.push("seekUp".into());
            async { Ok(Value::Null) }
        })
        .method("toggleBookmark", move |_| {
            bookmark.lock().unwrap().log.push("toggleBookmark".into());
            async { Ok(json!(true)) }
        })
}

fn history(station: &Shared) -> MethodTable {
    let save = station.clone();
    let restore = station.clone();
    MethodTable::new()
        .method("save", move |args| {
            save.lock().unwrap().saved.push(args[0].as_f64().unwrap_or_default());
            async { Ok(json!(true)) }
        })
        .method("restore", move |_| {
            let last = restore.lock().unwrap().saved.last().copied();
            async move { Ok(json!(last)) }
        })
}

fn favorites() -> MethodTable {
    MethodTable::new()
        .method("getAll", |_| async { Ok(json!([91.1, 98.5])) })
        .method("add", |args| async move { Ok(args[0].clone()) })
}

struct Harness {
    hub: Hub,
    broker: BrokerHandle,
    station: Shared,
    servers: Arc<Mutex<Vec<Server>>>,
    started: Arc<AtomicUsize>,
    alive: Arc<AtomicUsize>,
}

/// Decrements the running-host count when a host body is dropped.
struct Alive(Arc<AtomicUsize>);

impl Drop for Alive {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Harness {
    fn start() -> Self {
        let hub = Hub::new();
        let registry = Arc::new(contracts());
        let station = Shared::default();
        let servers = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(AtomicUsize::new(0));
        let alive = Arc::new(AtomicUsize::new(0));

        let body = {
            let (station, servers) = (station.clone(), servers.clone());
            let (started, alive) = (started.clone(), alive.clone());
            move |ctx: HostContext| {
                let (registry, station, servers) = (registry.clone(), station.clone(), servers.clone());
                started.fetch_add(1, Ordering::SeqCst);
                alive.fetch_add(1, Ordering::SeqCst);
                let guard = Alive(alive.clone());
                async move {
                    let _guard = guard;
                    let hosted = vec![
                        Server::new(ctx.hub.clone(), &registry, "logic", "1.0", logic(&station)).unwrap(),
                        Server::new(ctx.hub.clone(), &registry, "history", "1.0", history(&station))
                            .unwrap(),
                        Server::new(ctx.hub.clone(), &registry, "favorites", "1.0", favorites()).unwrap(),
                    ];
                    servers.lock().unwrap().extend(hosted.iter().cloned());
                    serve(ctx, hosted).await;
                }
            }
        };

        let launcher = TaskLauncher::new(hub.clone()).host("servers/main", body);
        let config = HostingConfig::new().with_host(
            "servers/main",
            HostKind::Worker,
            ["logic", "history", "favorites"],
        );
        let broker = Broker::new(&hub, launcher).with_config(config).spawn();

        Self {
            hub,
            broker,
            station,
            servers,
            started,
            alive,
        }
    }

    fn client(&self, contract: &str) -> Client {
        Client::open(self.hub.clone(), contract, "1.0").unwrap()
    }

    fn server(&self, contract: &str) -> Server {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.name() == contract)
            .cloned()
            .unwrap()
    }
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn calls_made_before_the_host_starts_arrive_in_order() {
    let harness = Harness::start();
    let client = harness.client("logic");

    let calls = vec![
        client.call("setFrequency", vec![json!(91.1)]).unwrap(),
        client.call("seekUp", vec![]).unwrap(),
        client.call("toggleBookmark", vec![]).unwrap(),
    ];
    assert_eq!(client.pending_calls(), 3);

    within(client.connect()).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    for call in calls {
        within(call).await.unwrap();
    }

    assert_eq!(
        harness.station.lock().unwrap().log,
        vec!["setFrequency", "seekUp", "toggleBookmark"]
    );
    assert_eq!(harness.started.load(Ordering::SeqCst), 1);
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn contract_violations_and_handler_failures() {
    let harness = Harness::start();
    let client = harness.client("logic");
    within(client.connect()).await.unwrap();

    assert!(matches!(
        client.call("setFrequency", vec![json!("fm")]),
        Err(ClientError::Contract(ContractError::ArgType { .. }))
    ));
    assert!(matches!(
        client.bound().unwrap().call("scan", vec![]),
        Err(ClientError::Contract(ContractError::UndeclaredMethod { .. }))
    ));

    let out_of_range = client.call("setFrequency", vec![json!(-1)]).unwrap();
    match within(out_of_range).await {
        Err(CallError::Remote(e)) => assert_eq!(e.kind, RemoteErrorKind::Handler),
        other => panic!("expected handler error, got {other:?}"),
    }
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn broadcasts_skip_disconnected_clients() {
    let harness = Harness::start();
    let a = harness.client("favorites");
    let b = harness.client("favorites");
    within(a.connect()).await.unwrap();
    within(b.connect()).await.unwrap();

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    for (client, seen) in [(&a, &seen_a), (&b, &seen_b)] {
        let seen = seen.clone();
        client.add_event_listener("saved", move |data| seen.lock().unwrap().push(data.clone()));
    }

    within(a.disconnect()).await.unwrap();
    assert_eq!(a.state(), ConnectionState::Disconnected);

    let favorites = harness.server("favorites");
    assert_eq!(favorites.clients(), vec![b.id()]);
    assert_eq!(favorites.broadcast("saved", &98.5).unwrap(), 1);

    // The response follows the broadcast on b's channel.
    within(b.call("getAll", vec![]).unwrap()).await.unwrap();
    assert_eq!(*seen_b.lock().unwrap(), vec![json!(98.5)]);
    assert!(seen_a.lock().unwrap().is_empty());
    harness.broker.shutdown().await;
}

#[tokio::test]
async fn co_hosted_contracts_share_a_host_until_the_last_client_leaves() {
    let harness = Harness::start();
    let logic = harness.client("logic");
    let history = harness.client("history");
    within(logic.connect()).await.unwrap();
    within(history.connect()).await.unwrap();
    assert_eq!(harness.started.load(Ordering::SeqCst), 1);

    within(history.call("save", vec![json!(91.1)]).unwrap())
        .await
        .unwrap();
    within(history.disconnect()).await.unwrap();

    // logic keeps the shared host alive.
    within(logic.call("setFrequency", vec![json!(104.3)]).unwrap())
        .await
        .unwrap();
    let frequency = within(logic.call("getFrequency", vec![]).unwrap())
        .await
        .unwrap();
    assert_eq!(frequency, json!(104.3));
    assert_eq!(harness.alive.load(Ordering::SeqCst), 1);

    within(logic.disconnect()).await.unwrap();
    eventually(|| harness.alive.load(Ordering::SeqCst) == 0).await;

    // A new client starts a fresh host; history state lives in the station.
    let again = harness.client("history");
    within(again.connect()).await.unwrap();
    assert_eq!(harness.started.load(Ordering::SeqCst), 2);
    let restored = within(again.call("restore", vec![]).unwrap()).await.unwrap();
    assert_eq!(restored, json!(91.1));

    harness.broker.shutdown().await;
    eventually(|| harness.alive.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn reconnecting_reuses_the_client_identity() {
    let harness = Harness::start();
    let client = harness.client("favorites");
    let id = client.id();
    within(client.connect()).await.unwrap();
    within(client.disconnect()).await.unwrap();

    // Queued while disconnected, delivered after reconnecting.
    let call = client.call("add", vec![json!(88.0)]).unwrap();
    within(client.connect()).await.unwrap();
    assert_eq!(within(call).await.unwrap(), json!(88.0));
    assert_eq!(client.id(), id);
    assert_eq!(harness.server("favorites").clients(), vec![id]);

    harness.broker.shutdown().await;
}
