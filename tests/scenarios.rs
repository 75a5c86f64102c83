//! End-to-end turn scenarios against scripted models and in-memory stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    ASSESS_COMPLEX, ASSESS_SIMPLE, capture_events, registry_with_provider, registry_with_replies,
    settle,
};
use taskweft::events::{AgentEvent, BoardEventKind, StreamEventKind};
use taskweft::executor::{ExecutorError, TurnOutcome};
use taskweft::gateway::{GenerateRequest, Generated, LanguageModel, ProviderError, StaticModel};
use taskweft::memory::{MemoryRollup, MemoryTier, RecallFilter};
use taskweft::message::MessageRole;

fn board_kinds(events: &[AgentEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Board(board) => Some(board.kind.label().to_string()),
            _ => None,
        })
        .collect()
}

fn chunk_text(events: &[AgentEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Stream(stream) => match &stream.kind {
                StreamEventKind::Chunk { content } => Some(content.clone()),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

// S1: direct answer.
#[tokio::test]
async fn s1_direct_answer() {
    let registry = registry_with_replies(&[ASSESS_SIMPLE, "4"]);
    let runtime = registry.get_or_create("s1").await;
    let events = capture_events(&runtime);

    let outcome = runtime
        .executor
        .process_message("what is 2+2?", vec![])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Complete {
            response: "4".to_string()
        }
    );
    settle().await;

    let captured = events.snapshot();
    assert_eq!(chunk_text(&captured), "4");
    assert!(captured.iter().any(|event| matches!(
        event,
        AgentEvent::Stream(stream) if matches!(&stream.kind, StreamEventKind::Complete { response } if response == "4")
    )));

    // Archive ends with exactly (user, model); no board was created.
    runtime.coordinator.sync().await.unwrap();
    let messages = registry.services().archive.messages("s1").await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Model);
    assert_eq!(messages[1].content, "4");
    assert!(
        runtime
            .orchestrator
            .board_snapshot()
            .await
            .unwrap()
            .is_none()
    );
}

const BLOG_PLAN: &str = r#"{
  "tasks": [
    {"id": "w1", "name": "Research", "type": "work", "workerRole": "researcher", "instruction": "gather sources"},
    {"id": "c1", "name": "Review", "type": "checkpoint", "checkpointMessage": "Happy with the research?"},
    {"id": "w2", "name": "Write", "type": "work", "workerRole": "writer", "instruction": "draft the post", "dependencies": ["w1"]}
  ],
  "summary": "research then write",
  "estimatedTime": "10m",
  "checkpointCount": 1
}"#;

// S2: checkpoint suspension and resume.
#[tokio::test]
async fn s2_checkpoint_suspend_and_resume() {
    let registry = registry_with_replies(&[
        ASSESS_COMPLEX,
        BLOG_PLAN,
        "TASK COMPLETE: research notes",
        "TASK COMPLETE: draft post",
    ]);
    let runtime = registry.get_or_create("s2").await;
    let events = capture_events(&runtime);

    let outcome = runtime
        .executor
        .process_message("write a blog about foo", vec![])
        .await
        .unwrap();
    let TurnOutcome::Checkpoint { task } = outcome else {
        panic!("expected a checkpoint, got {outcome:?}");
    };
    assert_eq!(task.id, "c1");
    assert_eq!(
        task.checkpoint_message.as_deref(),
        Some("Happy with the research?")
    );
    settle().await;

    let kinds = board_kinds(&events.snapshot());
    assert_eq!(
        kinds,
        vec![
            "plan_created",
            "task_started",
            "task_progress",
            "task_completed",
            "checkpoint_reached",
        ]
    );
    let captured = events.snapshot();
    let plan_event = captured
        .iter()
        .find_map(|event| match event {
            AgentEvent::Board(board) if board.kind.label() == "plan_created" => Some(board),
            _ => None,
        })
        .unwrap();
    assert!(matches!(
        &plan_event.kind,
        BoardEventKind::PlanCreated {
            task_count: 3,
            checkpoint_count: 1,
            ..
        }
    ));

    // No model message persisted while suspended.
    runtime.coordinator.sync().await.unwrap();
    let messages = registry.services().archive.messages("s2").await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, MessageRole::User);

    // Resume with approval; the remaining task runs and the board
    // synthesises both work outputs.
    events.clear();
    let outcome = runtime
        .executor
        .process_message("continue", vec![])
        .await
        .unwrap();
    let TurnOutcome::Complete { response } = outcome else {
        panic!("expected completion");
    };
    assert!(response.contains("## Research"));
    assert!(response.contains("research notes"));
    assert!(response.contains("## Write"));
    assert!(response.contains("draft post"));
    settle().await;

    let kinds = board_kinds(&events.snapshot());
    assert_eq!(
        kinds,
        vec![
            "checkpoint_resumed",
            "task_started",
            "task_progress",
            "task_completed",
            "board_completed",
        ]
    );
}

// S3: failure-driven replan.
#[tokio::test]
async fn s3_failure_triggers_replan() {
    let single_task_plan = r#"{
      "tasks": [{"id": "w1", "name": "Flaky", "type": "work", "workerRole": "coder", "instruction": "do the thing"}],
      "summary": "one step",
      "estimatedTime": "5m",
      "checkpointCount": 0
    }"#;
    let recovery_plan = r#"{
      "tasks": [{"id": "w2", "name": "Recover", "type": "work", "workerRole": "coder", "instruction": "try differently"}],
      "summary": "recovery",
      "estimatedTime": "5m",
      "checkpointCount": 0
    }"#;
    let registry = registry_with_replies(&[
        ASSESS_COMPLEX,
        single_task_plan,
        "TASK BLOCKED: tooling is broken",
        "TASK BLOCKED: tooling is broken",
        "TASK BLOCKED: tooling is broken",
        recovery_plan,
        "TASK COMPLETE: recovered output",
    ]);
    let runtime = registry.get_or_create("s3").await;
    let events = capture_events(&runtime);

    let outcome = runtime
        .executor
        .process_message("do something hard", vec![])
        .await
        .unwrap();
    let TurnOutcome::Complete { response } = outcome else {
        panic!("expected completion after replan");
    };
    assert!(response.contains("recovered output"));
    settle().await;

    let captured = events.snapshot();
    let failures: Vec<bool> = captured
        .iter()
        .filter_map(|event| match event {
            AgentEvent::Board(board) => match &board.kind {
                BoardEventKind::TaskFailed { will_retry, .. } => Some(*will_retry),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![true, true, false]);
    let kinds = board_kinds(&captured);
    assert!(kinds.contains(&"replan_triggered".to_string()));

    // The failed task never completed, so the completed prefix is empty:
    // the new board holds only the recovery task.
    let board = runtime
        .orchestrator
        .board_snapshot()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(board.tasks.len(), 1);
    assert_eq!(board.tasks[0].id, "w2");
}

/// Provider whose embeddings always fail: generation works, so the turn
/// completes while the memory layer (priority 3) keeps erroring.
struct BrokenEmbeddings {
    inner: StaticModel,
}

#[async_trait::async_trait]
impl LanguageModel for BrokenEmbeddings {
    async fn generate(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<tokio::sync::mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError> {
        self.inner.generate(request, chunk_tx).await
    }

    async fn embed(&self, _model: &str, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Upstream {
            message: "embedding backend down".to_string(),
        })
    }
}

// S4: storage priority: a memory-layer failure never blocks the turn.
#[tokio::test]
async fn s4_memory_layer_failure_does_not_block_completion() {
    let provider = BrokenEmbeddings {
        inner: StaticModel::new(vec![
            Generated {
                text: ASSESS_SIMPLE.to_string(),
                tool_calls: vec![],
            },
            Generated {
                text: "still fine".to_string(),
                tool_calls: vec![],
            },
        ]),
    };
    let registry = registry_with_provider(Arc::new(provider));
    let runtime = registry.get_or_create("s4").await;

    let outcome = runtime
        .executor
        .process_message("hello there", vec![])
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Complete {
            response: "still fine".to_string()
        }
    );

    runtime.coordinator.sync().await.unwrap();
    let messages = registry.services().archive.messages("s4").await.unwrap();
    assert_eq!(messages.len(), 2);

    // The metrics surface the failing layer.
    let metrics = runtime.coordinator.metrics();
    let memory_layer = metrics
        .layers
        .iter()
        .find(|(name, _)| name == "memory")
        .map(|(_, m)| m.clone())
        .unwrap();
    assert!(memory_layer.failures >= 1);
    assert!(memory_layer.last_error.is_some());
}

// S5: cached-answer hit streams the stored answer verbatim.
#[tokio::test]
async fn s5_cached_answer_replay() {
    let registry = registry_with_replies(&["should never be called"]);
    let runtime = registry.get_or_create("s5").await;
    let events = capture_events(&runtime);

    runtime
        .memory
        .add_long_term(&MemoryRollup::new(
            "how do I deploy".into(),
            String::new(),
            "use the deploy CLI".into(),
            vec![],
        ))
        .await
        .unwrap();

    let outcome = runtime
        .executor
        .process_message("how do I deploy", vec![])
        .await
        .unwrap();
    let expected = "[Based on similar past query]\n\nuse the deploy CLI";
    assert_eq!(
        outcome,
        TurnOutcome::Complete {
            response: expected.to_string()
        }
    );
    settle().await;

    // Chunks reconstruct the literal answer, word by word.
    assert_eq!(chunk_text(&events.snapshot()), expected);

    // The rollup's access statistics advanced by exactly one.
    let vector = runtime
        .memory
        .embed_cached("how do I deploy", 9)
        .await
        .unwrap();
    let hits = registry
        .services()
        .index
        .query(&vector, 1, &RecallFilter::new("s5", MemoryTier::LongTerm))
        .await
        .unwrap();
    assert_eq!(hits[0].metadata["interactions"], 1);
}

/// Provider that delays generation long enough to observe the busy gate.
struct SlowProvider {
    inner: StaticModel,
    delay: Duration,
}

#[async_trait::async_trait]
impl LanguageModel for SlowProvider {
    async fn generate(
        &self,
        request: &GenerateRequest,
        chunk_tx: Option<tokio::sync::mpsc::Sender<String>>,
    ) -> Result<Generated, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.generate(request, chunk_tx).await
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.inner.embed(model, texts).await
    }
}

// S6: a second in-flight turn is rejected as busy; ordering is preserved.
#[tokio::test]
async fn s6_concurrent_turn_is_rejected_busy() {
    let provider = SlowProvider {
        inner: StaticModel::new(vec![
            Generated {
                text: ASSESS_SIMPLE.to_string(),
                tool_calls: vec![],
            },
            Generated {
                text: "first answer".to_string(),
                tool_calls: vec![],
            },
        ]),
        delay: Duration::from_millis(150),
    };
    let registry = registry_with_provider(Arc::new(provider));
    let runtime = registry.get_or_create("s6").await;

    let first = {
        let executor = Arc::clone(&runtime.executor);
        tokio::spawn(async move { executor.process_message("first question", vec![]).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = runtime.executor.process_message("second", vec![]).await;
    assert!(matches!(second, Err(ExecutorError::Busy)));

    let outcome = first.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Complete {
            response: "first answer".to_string()
        }
    );

    // Only the accepted turn reached storage, in acceptance order.
    runtime.coordinator.sync().await.unwrap();
    let messages = registry.services().archive.messages("s6").await.unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first question", "first answer"]);
}
