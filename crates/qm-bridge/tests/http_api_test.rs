//! HTTP API integration: CRUD, control verbs, kanban endpoints, artifact
//! download, and SSE filtering against a real server on an OS-assigned port.

use std::sync::Arc;
use std::time::Duration;

use qm_agents::{AgentRegistry, ScriptedAgent, ScriptedBehavior, ScriptedResult};
use qm_bridge::{api_router, ApiState};
use qm_core::config::QuorumConfig;
use qm_core::store::WorkflowStore;
use qm_engine::plan::{render_plan_doc, PlanTask};
use qm_engine::{EngineContext, KanbanEngine, WorkflowEngine};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn plan_doc() -> String {
    render_plan_doc(
        "plan",
        &[PlanTask {
            id: "task-01".into(),
            name: "do the work".into(),
            agent: "claude".into(),
            depends_on: vec![],
            timeout_s: 600,
        }],
    )
}

fn planner_agent() -> ScriptedAgent {
    ScriptedAgent::new(
        "claude",
        ScriptedBehavior {
            delay: Duration::ZERO,
            result: ScriptedResult::succeed(plan_doc()),
        },
    )
}

fn single_agent_config() -> serde_json::Value {
    serde_json::json!({
        "execution_mode": "single_agent",
        "single_agent_name": "claude",
    })
}

struct TestServer {
    base: String,
    _dir: tempfile::TempDir,
}

async fn spawn_server(agent: ScriptedAgent) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = QuorumConfig::default();
    config.general.data_dir = dir.path().to_string_lossy().into_owned();

    let store = Arc::new(WorkflowStore::open_in_memory().await.unwrap());
    let mut registry = AgentRegistry::new();
    registry.register("claude", 2, Arc::new(agent)).unwrap();

    let ctx = EngineContext::new(config, store, Arc::new(registry));
    let engine = WorkflowEngine::new(ctx.clone());
    let kanban = Arc::new(KanbanEngine::new(ctx, engine.clone()));
    let state = Arc::new(ApiState::new(engine, kanban));

    let router = api_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        _dir: dir,
    }
}

async fn create_workflow(client: &reqwest::Client, base: &str, prompt: &str) -> serde_json::Value {
    client
        .post(format!("{base}/api/v1/workflows"))
        .json(&serde_json::json!({
            "prompt": prompt,
            "config": single_agent_config(),
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_status(
    client: &reqwest::Client,
    base: &str,
    id: &str,
    expected: &str,
) -> serde_json::Value {
    for _ in 0..400 {
        let wf: serde_json::Value = client
            .get(format!("{base}/api/v1/workflows/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if wf["status"] == expected {
            return wf;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("workflow {id} never reached status {expected}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn workflow_crud_and_filters() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();

    let wf = create_workflow(&client, &server.base, "build a parser").await;
    let id = wf["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("wf-"));
    assert_eq!(wf["status"], "pending");
    assert_eq!(wf["kanban_column"], "todo");
    assert_eq!(wf["title"], "build a parser");

    // List with ANDed filters.
    let listed: Vec<serde_json::Value> = client
        .get(format!(
            "{}/api/v1/workflows?status=pending&kanban=todo&q=parser",
            server.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let listed: Vec<serde_json::Value> = client
        .get(format!("{}/api/v1/workflows?q=compiler", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());

    // Patch the kanban column.
    let patched: serde_json::Value = client
        .patch(format!("{}/api/v1/workflows/{id}", server.base))
        .json(&serde_json::json!({ "kanban_column": "refinement" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(patched["kanban_column"], "refinement");

    // Unknown workflow is a structured 404.
    let resp = client
        .get(format!("{}/api/v1/workflows/wf-missing", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "not_found");

    // Delete a non-running workflow.
    let resp = client
        .delete(format!("{}/api/v1/workflows/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let resp = client
        .get(format!("{}/api/v1/workflows/{id}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn control_ops_reject_wrong_states_over_http() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();
    let wf = create_workflow(&client, &server.base, "something").await;
    let id = wf["id"].as_str().unwrap();

    for verb in ["pause", "resume", "stop", "plan", "execute"] {
        let resp = client
            .post(format!("{}/api/v1/workflows/{id}/{verb}", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409, "verb {verb}");
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["kind"], "conflict");
    }
}

#[tokio::test]
async fn full_run_tasks_and_download() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();
    let wf = create_workflow(&client, &server.base, "ship the feature").await;
    let id = wf["id"].as_str().unwrap().to_string();

    let resp = client
        .post(format!("{}/api/v1/workflows/{id}/start", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let started: serde_json::Value = resp.json().await.unwrap();
    // The scripted agents are instant, so the run may already have finished
    // by the time the response snapshot is taken.
    assert!(
        started["status"] == "running" || started["status"] == "completed",
        "unexpected status {}",
        started["status"]
    );

    let done = wait_for_status(&client, &server.base, &id, "completed").await;
    assert_eq!(done["current_phase"], "execute");

    let tasks: Vec<serde_json::Value> = client
        .get(format!("{}/api/v1/workflows/{id}/tasks", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["status"], "completed");

    let task: serde_json::Value = client
        .get(format!(
            "{}/api/v1/workflows/{id}/tasks/task-01",
            server.base
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(task["id"], "task-01");
    assert!(task["output_file"].as_str().unwrap().contains("execute-phase"));

    // Artifact tarball.
    let resp = client
        .get(format!("{}/api/v1/workflows/{id}/download", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/gzip"
    );
    let body = resp.bytes().await.unwrap();
    assert!(!body.is_empty());
}

#[tokio::test]
async fn kanban_board_and_engine_endpoints() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();
    let wf = create_workflow(&client, &server.base, "board me").await;
    let id = wf["id"].as_str().unwrap();

    let board: serde_json::Value = client
        .get(format!("{}/api/v1/kanban/board", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let columns = board["columns"].as_array().unwrap();
    assert_eq!(columns.len(), 5);
    assert_eq!(columns[0]["column"], "refinement");
    assert_eq!(columns[1]["column"], "todo");
    assert_eq!(columns[1]["workflows"].as_array().unwrap().len(), 1);

    // Manual move.
    let moved: serde_json::Value = client
        .post(format!("{}/api/v1/kanban/move", server.base))
        .json(&serde_json::json!({ "workflow_id": id, "column": "done" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(moved["kanban_column"], "done");

    // Engine controls.
    let status: serde_json::Value = client
        .post(format!("{}/api/v1/kanban/engine/enable", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["enabled"], true);
    let status: serde_json::Value = client
        .post(format!("{}/api/v1/kanban/engine/disable", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["enabled"], false);
    let status: serde_json::Value = client
        .post(format!("{}/api/v1/kanban/engine/reset", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["circuit_open"], false);
}

#[tokio::test]
async fn health_endpoints() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let deep: serde_json::Value = client
        .get(format!("{}/health/deep", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(deep["status"], "ok");
    assert_eq!(deep["agents"], serde_json::json!(["claude"]));
}

#[tokio::test]
async fn sse_filter_delivers_only_the_selected_workflow() {
    let server = spawn_server(planner_agent()).await;
    let client = reqwest::Client::new();

    let a = create_workflow(&client, &server.base, "workflow a").await;
    let b = create_workflow(&client, &server.base, "workflow b").await;
    let a_id = a["id"].as_str().unwrap().to_string();
    let b_id = b["id"].as_str().unwrap().to_string();

    // Connect the filtered stream before any events flow.
    let resp = client
        .get(format!(
            "{}/api/v1/sse/events?workflow={a_id}",
            server.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let mut stream = resp.bytes_stream();

    // Run both workflows concurrently.
    for id in [&a_id, &b_id] {
        client
            .post(format!("{}/api/v1/workflows/{id}/start", server.base))
            .send()
            .await
            .unwrap();
    }
    wait_for_status(&client, &server.base, &a_id, "completed").await;
    wait_for_status(&client, &server.base, &b_id, "completed").await;

    // Read frames until the filtered workflow's run is fully observed.
    use futures_util::StreamExt;
    let mut buffer = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let chunk = tokio::time::timeout_at(deadline, stream.next())
            .await
            .expect("timed out waiting for SSE frames")
            .expect("stream ended early")
            .unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if buffer.contains("workflow.status_changed")
            && buffer.contains("\"completed\"")
        {
            break;
        }
    }

    let mut data_frames = 0;
    for line in buffer.lines() {
        if let Some(json) = line.strip_prefix("data: ") {
            // The final line may be a partially-read frame; skip it.
            let Ok(event) = serde_json::from_str::<serde_json::Value>(json) else {
                continue;
            };
            assert_eq!(
                event["workflow_id"], a_id,
                "event leaked through the filter: {event}"
            );
            data_frames += 1;
        }
    }
    assert!(data_frames > 0, "no events observed for workflow {a_id}");
    assert!(
        !buffer.contains(&b_id),
        "workflow B events leaked into the filtered stream"
    );
}
