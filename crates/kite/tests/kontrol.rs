//! Kontrol client against an in-process directory kite.

use kite::types::config::KiteOptions;
use kite::types::{
    EventAction, KiteEvent, KiteIdentity, KiteWithToken, KontrolQuery, RegisterResult, Token,
    TokenClaims,
};
use kite::watch::LIVE_EVENT_CAPACITY;
use kite::{
    Arguments, ClientError, Connection, Function, HandlerError, Kite, Kontrol, MemoryConnection,
    MemoryNetwork, RemoteKite, Request, TransportError,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const KEY: &str = "integration-koding-key";
const KONTROL_HOST: &str = "kontrol.test:4000";
const MATH_HOST: &str = "math.test:3000";

fn options(name: &str, username: &str) -> KiteOptions {
    KiteOptions {
        username: username.to_string(),
        kitename: name.to_string(),
        environment: "test".to_string(),
        region: "localhost".to_string(),
        version: "1.0.0".to_string(),
        port: "61001".to_string(),
        koding_key: KEY.to_string(),
        kontrol_url: Some(format!("ws://{KONTROL_HOST}/dnode").parse().unwrap()),
        ..KiteOptions::default()
    }
}

/// Directory kite with canned answers. Authenticates callers with the
/// koding key and hands out tokens sealed with it.
struct FakeKontrol {
    register: Mutex<RegisterResult>,
    kites: Mutex<Vec<KiteIdentity>>,
    watchers: Mutex<Vec<(Arc<RemoteKite>, Function)>>,
    /// Pushed to a new watcher before its snapshot is returned.
    early_events: Mutex<Vec<Value>>,
    /// Sent verbatim instead of the matching kites.
    kites_answer: Mutex<Option<Value>>,
}

impl FakeKontrol {
    fn start(network: &MemoryNetwork) -> Arc<Self> {
        let fake = Arc::new(Self {
            register: Mutex::new(RegisterResult::allow("", "1.2.3.4")),
            kites: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
            early_events: Mutex::new(Vec::new()),
            kites_answer: Mutex::new(None),
        });
        let kite = Kite::new(options("kontrol", "devrim")).unwrap();

        let state = fake.clone();
        kite.handle_func("register", move |r: Request| {
            let state = state.clone();
            async move {
                let mut result = state.register.lock().unwrap().clone();
                if result.username.is_empty() {
                    result.username = r.username.clone();
                }
                Ok(serde_json::to_value(result)?)
            }
        });

        let state = fake.clone();
        kite.handle_func("getKites", move |r: Request| {
            let state = state.clone();
            async move {
                let query: KontrolQuery = r.args.get(0).ok_or("missing query")?.unmarshal()?;
                if let Some(watcher) = r.args.get(1) {
                    let watcher = watcher.function()?;
                    state
                        .watchers
                        .lock()
                        .unwrap()
                        .push((r.remote_kite.clone(), watcher.clone()));
                    let early: Vec<Value> = state.early_events.lock().unwrap().drain(..).collect();
                    for event in early {
                        r.remote_kite
                            .invoke(&watcher, Arguments::single(event))
                            .await
                            .map_err(anyhow::Error::from)?;
                    }
                }
                if let Some(answer) = state.kites_answer.lock().unwrap().clone() {
                    return Ok(answer);
                }

                let matching: Vec<KiteIdentity> = state
                    .kites
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|kite| query.matches(kite))
                    .cloned()
                    .collect();
                let mut result = Vec::new();
                for kite in matching {
                    let claims =
                        TokenClaims::new(r.username.clone(), kite.id.clone(), "kontrol", 3600);
                    let token = claims.issue(KEY).map_err(anyhow::Error::from)?;
                    result.push(KiteWithToken { kite, token });
                }
                Ok(serde_json::to_value(result)?)
            }
        });

        kite.handle_func("getToken", |r: Request| async move {
            let (kite,): (KiteIdentity,) = r.args.unmarshal()?;
            let token = TokenClaims::new(r.username.clone(), kite.id, "kontrol", 600)
                .issue(KEY)
                .map_err(anyhow::Error::from)?;
            Ok(serde_json::to_value(token)?)
        });

        network.listen(KONTROL_HOST, kite);
        fake
    }

    fn add_kite(&self, kite: KiteIdentity) {
        self.kites.lock().unwrap().push(kite);
    }

    /// Push an event to every watcher.
    async fn push(&self, event: Value) {
        let watchers = self.watchers.lock().unwrap().clone();
        for (remote, watcher) in watchers {
            remote
                .invoke(&watcher, Arguments::single(event.clone()))
                .await
                .unwrap();
        }
    }
}

/// A math kite listening on the network. Returns its identity as Kontrol
/// would list it.
fn start_math(network: &MemoryNetwork, name: &str, host: &str) -> KiteIdentity {
    let math = Kite::new(options(name, "")).unwrap();
    math.handle_func("square", |r: Request| async move {
        let (n,): (f64,) = r.args.unmarshal()?;
        Ok(json!(n * n))
    });
    math.handle_func("whoami", |r: Request| async move {
        Ok::<Value, HandlerError>(json!(r.username))
    });
    math.update_identity(|kite| kite.url = format!("ws://{host}/dnode").parse().unwrap());
    let identity = math.identity();
    network.listen(host, math);
    identity
}

async fn connected_kontrol(network: &MemoryNetwork, client: &Arc<Kite>) -> Kontrol {
    let kontrol = Kontrol::new(client, network);
    kontrol.dial().await.unwrap();
    kontrol
}

fn event(action: EventAction, kite: &KiteIdentity) -> Value {
    serde_json::to_value(KiteEvent {
        action,
        kite: kite.clone(),
        token: None,
    })
    .unwrap()
}

#[tokio::test]
async fn test_register_allow_rewrites_endpoint() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    assert_eq!(client.identity().url.to_string(), "ws://:61001/dnode");

    let kontrol = connected_kontrol(&network, &client).await;
    kontrol.register().await.unwrap();

    let identity = client.identity();
    assert_eq!(identity.username, "devrim");
    assert_eq!(identity.url.to_string(), "ws://1.2.3.4:61001/dnode");
}

#[tokio::test]
async fn test_register_keeps_configured_host() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let mut opts = options("client", "");
    opts.public_ip = "10.0.0.7".to_string();
    let client = Kite::new(opts).unwrap();

    connected_kontrol(&network, &client).await.register().await.unwrap();
    assert_eq!(client.identity().url.host, "10.0.0.7:61001");
}

#[tokio::test]
async fn test_register_reject() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    *fake.register.lock().unwrap() = RegisterResult::reject();
    let client = Kite::new(options("client", "")).unwrap();

    let err = connected_kontrol(&network, &client)
        .await
        .register()
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::KiteRejected));
    assert_eq!(client.identity().username, "");
}

#[tokio::test]
async fn test_register_invalid_result() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    fake.register.lock().unwrap().result = "PermitKite".to_string();
    let client = Kite::new(options("client", "")).unwrap();

    let err = connected_kontrol(&network, &client)
        .await
        .register()
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid result: PermitKite");
}

#[tokio::test]
async fn test_get_kites_empty() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let err = kontrol
        .get_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoKitesAvailable));
}

#[tokio::test]
async fn test_get_kites_null_answer() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    *fake.kites_answer.lock().unwrap() = Some(Value::Null);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let err = kontrol
        .get_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::NoKitesAvailable));

    let watcher = kontrol
        .watch_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap();
    assert_eq!(watcher.snapshot_len(), 0);
}

#[tokio::test]
async fn test_get_kites_with_expired_token() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let math = start_math(&network, "math", MATH_HOST);
    *fake.kites_answer.lock().unwrap() = Some(json!([
        {"kite": math, "token": {"key": "stale", "ttl": -2}}
    ]));
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let kites = kontrol
        .get_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap();
    assert_eq!(kites.len(), 1);
    let auth = kites[0].authentication().unwrap();
    assert_eq!(auth.key, "stale");
    assert!(!auth.is_valid_at(chrono::Utc::now()));
}

#[tokio::test]
async fn test_get_kites_and_call_with_token() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    fake.add_kite(start_math(&network, "math", MATH_HOST));
    fake.add_kite(start_math(&network, "fs", "fs.test:3001"));
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let kites = kontrol.get_kites(KontrolQuery::by_name("math")).await.unwrap();
    assert_eq!(kites.len(), 1);
    let math = &kites[0];
    let auth = math.authentication().unwrap();
    assert_eq!(auth.kind, "token");
    assert!(auth.valid_until.is_some());

    math.dial(&network);
    math.connect().await.unwrap();
    let result = math.tell("square", Arguments::single(json!(7))).await.unwrap();
    assert_eq!(result, json!(49.0));

    // The math kite trusts the username sealed in the token.
    let username = math.tell("whoami", Arguments::default()).await.unwrap();
    assert_eq!(username, json!("devrim"));
}

#[tokio::test]
async fn test_token_for_another_kite_is_rejected() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let math = start_math(&network, "math", MATH_HOST);
    let mut listed = math.clone();
    listed.id = "not-the-math-kite".to_string();
    fake.add_kite(listed);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let kites = kontrol.get_kites(KontrolQuery::by_name("math")).await.unwrap();
    kites[0].dial(&network);
    kites[0].connect().await.unwrap();
    let err = kites[0]
        .tell("square", Arguments::single(json!(2)))
        .await
        .unwrap_err();
    assert!(err.is_remote("authenticationError"));
}

#[tokio::test]
async fn test_get_token() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let math = start_math(&network, "math", MATH_HOST);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let token: Token = kontrol.get_token(&math).await.unwrap();
    assert!(token.ttl > 590 && token.ttl <= 600);
    let claims = TokenClaims::decrypt(&token.key, KEY).unwrap();
    assert_eq!(claims.audience, math.id);
    assert_eq!(claims.username, "devrim");
}

#[tokio::test]
async fn test_watch_empty_snapshot_then_live() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let mut watcher = kontrol
        .watch_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap();
    assert_eq!(watcher.snapshot_len(), 0);
    assert!(watcher.try_next_event().is_none());

    let math = start_math(&network, "math", MATH_HOST);
    fake.push(event(EventAction::Register, &math)).await;

    let received = timeout(Duration::from_secs(5), watcher.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.action, EventAction::Register);
    assert_eq!(received.kite, math);
}

#[tokio::test]
async fn test_watch_snapshot_precedes_live_events() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let first = start_math(&network, "math", MATH_HOST);
    let second = start_math(&network, "math", "math.test:3002");
    fake.add_kite(first.clone());
    fake.add_kite(second.clone());
    // Kontrol pushes a change before it answers the snapshot.
    fake.early_events
        .lock()
        .unwrap()
        .push(event(EventAction::Remove, &first));
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let mut watcher = kontrol
        .watch_kites(KontrolQuery::by_name("math"))
        .await
        .unwrap();
    assert_eq!(watcher.snapshot_len(), 2);

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(
            timeout(Duration::from_secs(5), watcher.next_event())
                .await
                .unwrap()
                .unwrap(),
        );
    }

    assert_eq!(events[0].action, EventAction::Register);
    assert_eq!(events[0].kite, first);
    assert_eq!(events[1].action, EventAction::Register);
    assert_eq!(events[1].kite, second);
    for snapshot in &events[..2] {
        let token = snapshot.token.as_ref().unwrap();
        assert!(token.ttl > 3590 && token.ttl <= 3600);
    }
    assert_eq!(events[2].action, EventAction::Remove);
    assert!(events[2].token.is_none());
}

#[tokio::test]
async fn test_watch_skips_undecodable_events() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;
    let mut watcher = kontrol.watch_kites(KontrolQuery::default()).await.unwrap();

    let math = start_math(&network, "math", MATH_HOST);
    fake.push(json!({"action": "Explode"})).await;
    fake.push(event(EventAction::Update, &math)).await;

    let received = timeout(Duration::from_secs(5), watcher.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.action, EventAction::Update);
    assert!(watcher.try_next_event().is_none());
}

#[tokio::test]
async fn test_slow_watcher_holds_back_pushes() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;
    let mut watcher = kontrol.watch_kites(KontrolQuery::default()).await.unwrap();

    let math = start_math(&network, "math", MATH_HOST);
    for _ in 0..LIVE_EVENT_CAPACITY {
        fake.push(event(EventAction::Update, &math)).await;
    }

    let pusher = fake.clone();
    let removed = math.clone();
    let mut blocked =
        tokio::spawn(async move { pusher.push(event(EventAction::Remove, &removed)).await });
    assert!(timeout(Duration::from_millis(100), &mut blocked).await.is_err());

    let first = watcher.next_event().await.unwrap();
    assert_eq!(first.action, EventAction::Update);
    timeout(Duration::from_secs(5), blocked).await.unwrap().unwrap();

    let mut last = None;
    while let Some(event) = watcher.try_next_event() {
        last = Some(event.action);
    }
    assert_eq!(last, Some(EventAction::Remove));
}

#[tokio::test]
async fn test_watch_with_callback() {
    let network = MemoryNetwork::new();
    let fake = FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = connected_kontrol(&network, &client).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let task = kontrol
        .watch_kites_with(KontrolQuery::default(), move |event| {
            let _ = tx.send(event.kite.name);
        })
        .await
        .unwrap();

    let math = start_math(&network, "math", MATH_HOST);
    fake.push(event(EventAction::Register, &math)).await;
    let name = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, "math");
    task.abort();
}

#[tokio::test]
async fn test_operations_wait_for_first_connect() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = Arc::new(Kontrol::new(&client, &network));
    assert!(!kontrol.is_ready());

    let mut register = tokio::spawn({
        let kontrol = kontrol.clone();
        async move { kontrol.register().await }
    });
    let mut kites = tokio::spawn({
        let kontrol = kontrol.clone();
        async move { kontrol.get_kites(KontrolQuery::default()).await }
    });
    assert!(timeout(Duration::from_millis(50), &mut register).await.is_err());
    assert!(timeout(Duration::from_millis(10), &mut kites).await.is_err());

    kontrol.dial().await.unwrap();
    assert!(kontrol.is_ready());
    register.await.unwrap().unwrap();
    assert!(matches!(
        kites.await.unwrap(),
        Err(ClientError::NoKitesAvailable)
    ));
}

#[tokio::test]
async fn test_dial_refused_leaves_gate_closed() {
    let network = MemoryNetwork::new();
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = Kontrol::new(&client, &network);

    let err = kontrol.dial().await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::ConnectionRefused(_))
    ));
    assert!(!kontrol.is_ready());
}

#[tokio::test]
async fn test_gate_survives_reconnect_cycles() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let math = start_math(&network, "math", MATH_HOST);
    let client = Kite::new(options("client", "")).unwrap();
    let url = client.options().kontrol_url.clone().unwrap();
    let conn: Arc<MemoryConnection> = network.dial(&client, &url);
    let kontrol = Kontrol::with_connection(&client, conn.clone());
    kontrol.dial().await.unwrap();

    for _ in 0..3 {
        conn.disconnect();
        assert!(kontrol.is_ready());

        // The gate is open, so calls fail fast instead of waiting.
        let err = timeout(Duration::from_secs(5), kontrol.get_token(&math))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::NotConnected)
        ));

        kontrol.dial().await.unwrap();
        kontrol.get_token(&math).await.unwrap();
    }
    kontrol.register().await.unwrap();
}

#[tokio::test]
async fn test_kontrol_over_existing_connection_is_ready() {
    let network = MemoryNetwork::new();
    FakeKontrol::start(&network);
    let client = Kite::new(options("client", "")).unwrap();
    let conn = network.dial(&client, &client.options().kontrol_url.clone().unwrap());
    conn.connect().await.unwrap();

    let kontrol = Kontrol::with_connection(&client, conn);
    assert!(kontrol.is_ready());
    kontrol.register().await.unwrap();
}

#[tokio::test]
async fn test_kontrol_identity() {
    let network = MemoryNetwork::new();
    let client = Kite::new(options("client", "")).unwrap();
    let kontrol = Kontrol::new(&client, &network);
    let remote = kontrol.remote_kite();
    assert_eq!(remote.identity().name, "kontrol");
    assert_eq!(remote.identity().url.host, KONTROL_HOST);
    assert_eq!(remote.authentication().unwrap().kind, "kodingKey");
    assert_eq!(remote.authentication().unwrap().key, KEY);
}
