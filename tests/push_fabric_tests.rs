use careerllm::agent::AgentRegistry;
use careerllm::config::RuntimeConfig;
use careerllm::orchestrator::{Orchestrator, TurnRequest};
use careerllm::providers::ScriptedProvider;
use careerllm::push::{PushFabric, TokenAuth};
use careerllm::tool_registry::ToolRegistry;
use std::sync::Arc;

fn stack() -> (Orchestrator, PushFabric, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new());
    let fabric = PushFabric::new(
        Arc::new(TokenAuth::new(&[("u1", "token-1"), ("u2", "token-2")])),
        RuntimeConfig::default().push,
    );
    let orchestrator = Orchestrator::builder(
        provider.clone(),
        Arc::new(AgentRegistry::default_catalog()),
        Arc::new(ToolRegistry::new()),
        fabric.clone(),
    )
    .build();
    (orchestrator, fabric, provider)
}

fn push_direct_turn(provider: &ScriptedProvider, answer: &str) {
    provider.push_structured(
        "{\"intent\": \"general\", \"agents\": [], \"confidence\": 0.9, \
         \"direct_response\": true}",
    );
    provider.push_structured(answer);
}

#[tokio::test]
async fn test_turn_events_fan_out_to_the_owning_user_only() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (orchestrator, fabric, provider) = stack();
    let mut mine = fabric.subscribe("u1", "token-1").unwrap();
    let mut other = fabric.subscribe("u2", "token-2").unwrap();

    push_direct_turn(&provider, "Hello!");
    let _ = orchestrator
        .run_turn(TurnRequest::new("u1", "hello"))
        .unwrap()
        .drain()
        .await;

    let mut kinds = Vec::new();
    let mut seqs = Vec::new();
    while let Some(envelope) = mine.try_next_event() {
        seqs.push(envelope.seq);
        kinds.push(envelope.event.kind());
    }

    // The subscription saw the whole turn in order, sequenced from 1.
    assert_eq!(seqs, (1..=seqs.len() as u64).collect::<Vec<u64>>());
    assert_eq!(kinds.first().copied(), Some("conversation_id"));
    assert_eq!(kinds.last().copied(), Some("done"));

    // The other user observed nothing.
    assert!(other.try_next_event().is_none());
}

#[tokio::test]
async fn test_two_subscriptions_both_receive_the_turn() {
    let (orchestrator, fabric, provider) = stack();
    let mut a = fabric.subscribe("u1", "token-1").unwrap();
    let mut b = fabric.subscribe("u1", "token-1").unwrap();

    push_direct_turn(&provider, "Hi there");
    let _ = orchestrator
        .run_turn(TurnRequest::new("u1", "hello"))
        .unwrap()
        .drain()
        .await;

    for sub in [&mut a, &mut b].iter_mut() {
        let mut kinds = Vec::new();
        while let Some(envelope) = sub.try_next_event() {
            kinds.push(envelope.event.kind());
        }
        assert!(kinds.contains(&"content"));
        assert_eq!(kinds.last().copied(), Some("done"));
    }
}

#[tokio::test]
async fn test_heartbeat_interleaves_with_turn_events() {
    let (orchestrator, fabric, provider) = stack();
    let mut sub = fabric.subscribe("u1", "token-1").unwrap();

    fabric.heartbeat("u1", &sub.id).await;
    push_direct_turn(&provider, "Hello!");
    let _ = orchestrator
        .run_turn(TurnRequest::new("u1", "hello"))
        .unwrap()
        .drain()
        .await;
    fabric.heartbeat("u1", &sub.id).await;

    let mut kinds = Vec::new();
    let mut seqs = Vec::new();
    while let Some(envelope) = sub.try_next_event() {
        seqs.push(envelope.seq);
        kinds.push(envelope.event.kind());
    }
    assert_eq!(kinds.first().copied(), Some("pong"));
    assert_eq!(kinds.last().copied(), Some("pong"));
    // Still a single strictly increasing sequence.
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}
