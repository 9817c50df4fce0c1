// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests for the otto facade using the mock chat clients.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use otto::{
    AgentEventKind, AgentLoop, Checkpoint, CheckpointStore, CoreConfig, MessageContent,
    MockClient, ScriptedMockClient, ToolSet, TurnOutcome,
};

#[tokio::test]
async fn loop_returns_mock_response() {
    let mut agent = AgentLoop::builder("otto", Arc::new(MockClient))
        .tools(Arc::new(ToolSet::empty()))
        .build()
        .unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = agent.run_turn(Some("hello"), tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);

    let mut got_text = false;
    while let Ok(event) = rx.try_recv() {
        if let AgentEventKind::TextDelta { text } = event.kind {
            assert!(text.contains("MOCK"));
            got_text = true;
        }
    }
    assert!(got_text, "expected at least one TextDelta event");
}

#[tokio::test]
async fn conversation_accumulates_across_turns() {
    let client = ScriptedMockClient::new(vec![
        vec![otto::ResponseEvent::TextDelta("first reply".into()), otto::ResponseEvent::Done],
        vec![otto::ResponseEvent::TextDelta("second reply".into()), otto::ResponseEvent::Done],
    ]);
    let requests = Arc::clone(&client.requests);
    let mut agent = AgentLoop::builder("otto", Arc::new(client)).build().unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    agent.run_turn(Some("one"), tx).await.unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    agent.run_turn(Some("two"), tx).await.unwrap();

    // The second turn's payload carries the whole first turn.
    let reqs = requests.lock().unwrap();
    assert_eq!(reqs[0].messages.len(), 1);
    assert_eq!(reqs[1].messages.len(), 3);
    assert_eq!(agent.state().current_messages.len(), 4);
}

/// Minimal file-backed checkpoint writer: one JSON document per session,
/// latest wins.  Stands in for the external persistence collaborators.
struct JsonFileStore {
    dir: PathBuf,
}

#[async_trait]
impl CheckpointStore for JsonFileStore {
    async fn save(&self, checkpoint: &Checkpoint) -> anyhow::Result<()> {
        let path = self.dir.join(format!("{}.json", checkpoint.session_id));
        tokio::fs::write(path, checkpoint.to_json()?).await?;
        Ok(())
    }

    async fn load_latest(&self, session_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let path = self.dir.join(format!("{session_id}.json"));
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(Some(Checkpoint::from_json(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[tokio::test]
async fn checkpoints_survive_a_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore { dir: dir.path().to_path_buf() });

    let config = CoreConfig {
        checkpointing: otto::CheckpointingConfig { enabled: true, required: true },
        ..Default::default()
    };
    let client = ScriptedMockClient::always_text("persisted");
    let mut agent = AgentLoop::builder("otto", Arc::new(client))
        .conversation_id("file-session")
        .config(config)
        .checkpoint_store(store.clone())
        .build()
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    agent.run_turn(Some("save me"), tx).await.unwrap();

    let loaded = store.load_latest("file-session").await.unwrap().unwrap();
    assert_eq!(loaded.session_id, "file-session");
    assert_eq!(loaded.execution_state.current_messages.len(), 2);
    assert_eq!(
        loaded.execution_state.current_messages[1].as_text(),
        Some("persisted")
    );
}

#[tokio::test]
async fn tool_call_visible_through_the_facade() {
    use otto::{ToolCall, ToolDescriptor, ToolHandler, ToolOutput, ToolSetBuilder};
    use tokio_util::sync::CancellationToken;

    struct Greeter;

    #[async_trait]
    impl ToolHandler for Greeter {
        async fn execute(&self, call: &ToolCall, _cancel: CancellationToken) -> ToolOutput {
            let name = call.args.get("name").and_then(|v| v.as_str()).unwrap_or("world");
            ToolOutput::ok(&call.id, format!("hello {name}"))
        }
    }

    let tools = Arc::new(
        ToolSetBuilder::new()
            .register(
                ToolDescriptor::new(
                    "greet",
                    "greets someone",
                    json!({
                        "type": "object",
                        "properties": { "name": { "type": "string" } },
                        "required": ["name"]
                    }),
                ),
                Arc::new(Greeter),
            )
            .build()
            .unwrap(),
    );
    let client = ScriptedMockClient::tool_then_text("c1", "greet", r#"{"name":"otto"}"#, "greeted");
    let mut agent = AgentLoop::builder("otto", Arc::new(client))
        .tools(tools)
        .build()
        .unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = agent.run_turn(Some("say hi"), tx).await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert!(agent.state().current_messages.iter().any(|m| matches!(&m.content,
        MessageContent::ToolResult { content, .. } if content == "hello otto")));
}
