//! End-to-end queue flow through the public API: provision, publish,
//! then hand-deliver the published message the way the push backend
//! would and watch the worker run.

use base64::prelude::{Engine, BASE64_STANDARD};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use gantry::app::App;
use gantry::config::Config;
use gantry::context::{Context, RequestInfo};
use gantry::pubsub::MemoryPubSub;
use gantry::queue::{Queue, Worker};
use gantry::token::{KeySpec, TokenKeys};

struct Fixture {
    app: Arc<App>,
    pubsub: MemoryPubSub,
    ledger: Arc<Mutex<Vec<(String, i64)>>>,
    total: Arc<AtomicI64>,
}

fn fixture() -> Fixture {
    let pubsub = MemoryPubSub::new();
    let ledger: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let total = Arc::new(AtomicI64::new(0));

    let keys = TokenKeys::new(vec![KeySpec::new(1, "integration-secret")]).unwrap();
    let mut config = Config::default();
    config.canonical_host = Some("app.example.com".to_string());
    config.queue_init_key = "init-key".to_string();

    let record = ledger.clone();
    let add = total.clone();
    let app = App::builder(config, keys)
        .pubsub(pubsub.clone())
        .queue(Queue::new("billing"))
        .worker(
            "charge",
            Worker::new2("billing", move |_ctx: &Context, account: String, cents: i64| {
                record.lock().unwrap().push((account, cents));
                Ok(())
            }),
        )
        .worker(
            "tally",
            Worker::new1("billing", move |_ctx: &Context, cents: i64| {
                add.fetch_add(cents, Ordering::SeqCst);
                Ok(())
            }),
        )
        .build()
        .unwrap();
    Fixture { app, pubsub, ledger, total }
}

/// Wrap a published payload in the JSON a push delivery carries
fn push_body(subscription: &str, payload: &[u8]) -> String {
    serde_json::json!({
        "message": {
            "attributes": {},
            "data": BASE64_STANDARD.encode(payload),
            "message_id": "it-1",
        },
        "subscription": subscription,
    })
    .to_string()
}

fn delivery_path(app: &Arc<App>, queue: &str, payload: &[u8]) -> RequestInfo {
    let ctx = Context::background(app.clone());
    let endpoint = app.pubsub().push_config(&ctx, &format!("worker.{queue}")).unwrap().endpoint;
    // Everything after the host is the local delivery path.
    let path = endpoint.split_once("app.example.com").unwrap().1.to_string();
    RequestInfo::post(&path, push_body(&format!("worker.{queue}"), payload))
        .with_host("app.example.com")
}

#[test]
fn publish_provision_and_deliver() {
    let fx = fixture();

    // Provision topics and subscriptions.
    let parts = fx
        .app
        .handle(RequestInfo::post("/_queues/init/init-key", "").with_host("app.example.com"));
    assert_eq!(parts.status, 200);
    assert_eq!(parts.body_str(), "ok");
    assert_eq!(fx.pubsub.topics(), vec!["queue.billing".to_string()]);

    // Publish two tasks for different workers on the same queue.
    let ctx = Context::background(fx.app.clone());
    ctx.queue_task(
        "charge",
        vec![serde_json::json!("acct-9"), serde_json::json!(1250)],
    )
    .unwrap();
    ctx.queue_task("tally", vec![serde_json::json!(1250)]).unwrap();

    // Deliver them back the way the push backend would.
    for (topic, payload) in fx.pubsub.take_published() {
        assert_eq!(topic, "queue.billing");
        let parts = fx.app.handle(delivery_path(&fx.app, "billing", &payload));
        assert_eq!(parts.status, 200);
        assert_eq!(parts.body_str(), "ok");
    }

    assert_eq!(*fx.ledger.lock().unwrap(), vec![("acct-9".to_string(), 1250)]);
    assert_eq!(fx.total.load(Ordering::SeqCst), 1250);
}

#[test]
fn misaddressed_deliveries_are_consumed_not_run() {
    let fx = fixture();
    fx.app
        .handle(RequestInfo::post("/_queues/init/init-key", "").with_host("app.example.com"));

    let payload =
        serde_json::to_vec(&serde_json::json!({"Worker": "charge", "Args": ["acct-9", 1]}))
            .unwrap();

    // Wrong delivery key.
    let body = push_body("worker.billing", &payload);
    let parts = fx.app.handle(
        RequestInfo::post("/_queues/handle/billing/00ff", body).with_host("app.example.com"),
    );
    assert_eq!(parts.status, 204);

    // Deliveries addressed to a non-canonical host never reach the
    // queue endpoint at all.
    let body = push_body("worker.billing", &payload);
    let parts = fx.app.handle(RequestInfo::post("/_queues/handle/billing/00ff", body));
    assert_eq!(parts.status, 301);

    // Right key, unknown queue in the path.
    let key = {
        let request = delivery_path(&fx.app, "billing", &payload);
        request.path.rsplit('/').next().unwrap().to_string()
    };
    let body = push_body("worker.billing", &payload);
    let parts = fx.app.handle(
        RequestInfo::post(&format!("/_queues/handle/other/{key}"), body)
            .with_host("app.example.com"),
    );
    assert_eq!(parts.status, 204);

    assert!(fx.ledger.lock().unwrap().is_empty());
}

#[test]
fn failing_worker_requests_redelivery_then_succeeds() {
    let pubsub = MemoryPubSub::new();
    let keys = TokenKeys::new(vec![KeySpec::new(1, "integration-secret")]).unwrap();
    let mut config = Config::default();
    config.queue_init_key = "init-key".to_string();

    let attempts = Arc::new(AtomicI64::new(0));
    let seen = attempts.clone();
    let app = App::builder(config, keys)
        .pubsub(pubsub.clone())
        .queue(Queue::new("billing"))
        .worker(
            "flaky",
            Worker::new0("billing", move |_ctx: &Context| {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("transient backend failure");
                }
                Ok(())
            }),
        )
        .build()
        .unwrap();
    app.handle(RequestInfo::post("/_queues/init/init-key", ""));

    let ctx = Context::background(app.clone());
    ctx.queue_task("flaky", vec![]).unwrap();
    let (_, payload) = pubsub.take_published().pop().unwrap();

    let key = {
        let push = app.pubsub().push_config(&ctx, "worker.billing").unwrap();
        push.endpoint.rsplit('/').next().unwrap().to_string()
    };
    let deliver = || {
        let body = push_body("worker.billing", &payload);
        app.handle(RequestInfo::post(&format!("/_queues/handle/billing/{key}"), body))
    };

    // First delivery fails, so the platform would redeliver; the
    // second attempt succeeds and acks.
    assert_eq!(deliver().status, 500);
    assert_eq!(deliver().status, 200);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
