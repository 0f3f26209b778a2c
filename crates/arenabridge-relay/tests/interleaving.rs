//! Many concurrent correlations with randomly interleaved worker frames.

use std::sync::Arc;
use std::time::Duration;

use arenabridge_core::BusyPolicy;
use arenabridge_pool::{Mode, ModelKind, SessionPool};
use arenabridge_relay::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::mpsc;

const WORKERS: usize = 6;
const DELTAS: usize = 40;

fn chat() -> ChatCommand {
    ChatCommand {
        turns: vec![],
        session_id: "s".into(),
        message_id: "m".into(),
        target_model_id: None,
        mode: Mode::DirectChat,
        kind: ModelKind::Text,
    }
}

fn frame(kind: &str, key: &str, payload: serde_json::Value) -> Envelope {
    Envelope::parse(&json!({"type": kind, "correlation_key": key, "payload": payload}).to_string())
        .unwrap()
}

#[tokio::test]
async fn interleaved_events_keep_per_correlation_order() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(SessionPool::load(&dir.path().join("id_pool.json"), true).unwrap());
    let registry = Arc::new(RelayRegistry::new(
        pool,
        RelayOptions {
            busy_policy: BusyPolicy::FailFast,
            first_event_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            ..RelayOptions::default()
        },
    ));

    let mut outboxes = Vec::new();
    for _ in 0..WORKERS {
        let (tx, rx) = mpsc::unbounded_channel();
        outboxes.push((registry.register(tx), rx));
    }

    let mut correlations = Vec::new();
    for _ in 0..WORKERS {
        correlations.push(
            registry
                .dispatch(DispatchTarget::AnyAvailable, chat())
                .await
                .unwrap(),
        );
    }
    assert_eq!(registry.correlation_count(), WORKERS);

    // Each worker answers its own command; the frames of all workers are
    // shuffled globally but stay ordered per worker.
    let mut streams: Vec<(WorkerId, Vec<Envelope>)> = Vec::new();
    for (id, rx) in outboxes.iter_mut() {
        let command = rx.recv().await.unwrap();
        let key = command.correlation_key.unwrap();
        let mut frames: Vec<Envelope> = (0..DELTAS)
            .map(|i| frame("text-delta", &key, json!({"text": format!("{}:{}", key, i)})))
            .collect();
        frames.push(frame("finish", &key, json!({"reason": "stop"})));
        frames.reverse();
        streams.push((*id, frames));
    }

    let mut rng = StdRng::seed_from_u64(42);
    let readers: Vec<_> = correlations
        .into_iter()
        .map(|mut corr| {
            tokio::spawn(async move {
                let key = corr.key().to_string();
                let mut texts = Vec::new();
                while let Some(event) = corr.next_event().await {
                    match event.unwrap() {
                        RelayEvent::TextDelta(t) => texts.push(t),
                        RelayEvent::Finish { reason } => assert_eq!(reason.as_deref(), Some("stop")),
                        other => panic!("unexpected {:?}", other),
                    }
                }
                (key, texts)
            })
        })
        .collect();

    loop {
        let live: Vec<usize> = (0..streams.len()).filter(|i| !streams[*i].1.is_empty()).collect();
        let Some(&pick) = live.choose(&mut rng) else {
            break;
        };
        let (worker, frames) = &mut streams[pick];
        let env = frames.pop().unwrap();
        registry.handle_incoming(*worker, env).unwrap();
        if rng.gen_bool(0.1) {
            tokio::task::yield_now().await;
        }
    }

    for reader in futures::future::join_all(readers).await {
        let (key, texts) = reader.unwrap();
        let expected: Vec<String> = (0..DELTAS).map(|i| format!("{}:{}", key, i)).collect();
        assert_eq!(texts, expected);
    }

    assert_eq!(registry.correlation_count(), 0);
    for (id, _) in &outboxes {
        assert!(!registry.is_busy(*id));
    }
}

#[tokio::test]
async fn protocol_violation_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let pool = Arc::new(SessionPool::load(&dir.path().join("id_pool.json"), true).unwrap());
    let registry = RelayRegistry::new(pool, RelayOptions::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let id = registry.register(tx);

    let no_key = Envelope::parse(r#"{"type": "text-delta", "payload": {"text": "x"}}"#).unwrap();
    assert!(registry.handle_incoming(id, no_key).is_err());

    let register = Envelope::parse(r#"{"type": "register", "payload": {"client": "tampermonkey", "version": "2.1"}}"#)
        .unwrap();
    registry.handle_incoming(id, register).unwrap();
    assert_eq!(
        registry.status().workers[0].client.as_deref(),
        Some("tampermonkey 2.1")
    );
}
