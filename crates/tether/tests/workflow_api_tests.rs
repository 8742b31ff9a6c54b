//! Workflow API integration tests: hash binding, approval gates, the
//! proposal pipeline, and trace paging.

use axum::http::StatusCode;
use serde_json::{json, Value};

mod common;
use common::{get, post, test_app};

fn approval_definition() -> Value {
    json!({
        "name": "release",
        "steps": [
            {"id": "approve", "type": "approval", "prompt": "Ship?"}
        ]
    })
}

async fn create_workflow(app: &axum::Router, slug: &str, definition: Value) -> (String, String) {
    let (status, body) = post(
        app,
        "/api/workflows",
        json!({"slug": slug, "name": slug, "definition": definition}),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "workflow create failed: {body}");
    (
        body["workflow"]["id"].as_str().unwrap().to_string(),
        body["workflow"]["current_hash"].as_str().unwrap().to_string(),
    )
}

#[tokio::test]
async fn empty_steps_rejected_at_create() {
    let app = test_app().await;
    let (status, body) = post(
        &app,
        "/api/workflows",
        json!({"slug": "empty", "name": "empty", "definition": {"steps": []}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn run_with_wrong_hash_is_rejected_without_traces() {
    let app = test_app().await;
    let (workflow_id, _hash) = create_workflow(&app, "release", approval_definition()).await;

    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/run"),
        json!({"workflowHash": "sha256:deadbeef", "executionId": "ex_reject"}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "HASH_MISMATCH");
    assert!(body["error"].as_str().unwrap().contains("Workflow hash mismatch"));
    assert!(body["detail"].as_str().unwrap().contains("sha256:"));

    // No execution, no trace rows.
    let (status, _) = get(&app, "/api/executions/ex_reject").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approval_gate_suspends_then_approve_finishes() {
    let app = test_app().await;
    let (workflow_id, hash) = create_workflow(&app, "release", approval_definition()).await;

    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/run"),
        json!({"workflowHash": hash, "executionId": "ex_1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "needs_approval");
    let token = body["resumeToken"].as_str().unwrap().to_string();
    assert!(token.starts_with("wrf_rt_"));

    let (_, body) = get(&app, "/api/executions/ex_1").await;
    assert_eq!(body["execution"]["status"], "needs_approval");

    let (_, body) = get(&app, "/api/executions/ex_1/steps").await;
    let steps = body["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["step_id"], "approve");
    assert_eq!(steps[0]["status"], "awaiting");

    // Wrong token is refused and the gate stays open.
    let (status, body) = post(
        &app,
        "/api/executions/ex_1/approve",
        json!({"approve": true, "resumeToken": "wrf_rt_bogus"}),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "INVALID_TOKEN");

    let (status, body) = post(
        &app,
        "/api/executions/ex_1/approve",
        json!({"approve": true, "resumeToken": token}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["status"], "succeeded");

    // The spent token cannot be replayed.
    let (status, body) = post(
        &app,
        "/api/executions/ex_1/approve",
        json!({"approve": true, "resumeToken": token}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}

#[tokio::test]
async fn deny_cancels_the_execution() {
    let app = test_app().await;
    let (workflow_id, hash) = create_workflow(&app, "release", approval_definition()).await;

    let (_, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/run"),
        json!({"workflowHash": hash, "executionId": "ex_deny"}),
    )
    .await;
    let token = body["resumeToken"].as_str().unwrap().to_string();

    let (status, body) = post(
        &app,
        "/api/executions/ex_deny/approve",
        json!({"approve": false, "resumeToken": token, "reason": "not this week"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (_, body) = get(&app, "/api/executions/ex_deny").await;
    assert_eq!(body["execution"]["status"], "cancelled");
    assert_eq!(body["execution"]["error"], "not this week");
    assert!(body["execution"]["resume_token"].is_null());
}

#[tokio::test]
async fn steps_limit_is_hard_capped_at_500() {
    let app = test_app().await;
    let (workflow_id, hash) = create_workflow(&app, "release", approval_definition()).await;
    post(
        &app,
        &format!("/api/workflows/{workflow_id}/run"),
        json!({"workflowHash": hash, "executionId": "ex_page"}),
    )
    .await;

    let (status, _) = get(&app, "/api/executions/ex_page/steps?limit=500").await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get(&app, "/api/executions/ex_page/steps?limit=501").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn proposal_race_second_apply_is_stale() {
    let app = test_app().await;
    let (workflow_id, base_hash) = create_workflow(&app, "evolve", approval_definition()).await;

    let revision = |marker: &str| {
        json!({
            "name": "release",
            "steps": [
                {"id": "approve", "type": "approval", "prompt": format!("Ship {marker}?")}
            ]
        })
    };

    let mut proposal_ids = Vec::new();
    for marker in ["one", "two"] {
        let (status, body) = post(
            &app,
            &format!("/api/workflows/{workflow_id}/proposals"),
            json!({"baseWorkflowHash": base_hash, "proposal": revision(marker)}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["proposal"]["status"], "draft");
        proposal_ids.push(body["proposal"]["id"].as_str().unwrap().to_string());
    }

    for pid in &proposal_ids {
        let (status, body) = post(
            &app,
            &format!("/api/workflows/{workflow_id}/proposals/{pid}/review"),
            json!({"approve": true, "notes": "lgtm"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["proposal"]["status"], "approved");
    }

    // First apply wins and advances the hash.
    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{}/apply", proposal_ids[0]),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_hash = body["newWorkflowHash"].as_str().unwrap().to_string();
    assert_ne!(new_hash, base_hash);
    assert_eq!(body["version"], 2);

    // Second apply observes the moved base and mutates nothing.
    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{}/apply", proposal_ids[1]),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "STALE_BASE");

    let (_, body) = get(&app, &format!("/api/workflows/{workflow_id}")).await;
    assert_eq!(body["workflow"]["current_hash"], new_hash.as_str());
    assert_eq!(body["workflow"]["current_version"], 2);
}

#[tokio::test]
async fn stale_execution_cannot_resume_across_apply() {
    let app = test_app().await;
    let (workflow_id, base_hash) = create_workflow(&app, "moving", approval_definition()).await;

    // Suspend an execution at the gate.
    let (_, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/run"),
        json!({"workflowHash": base_hash, "executionId": "ex_stale"}),
    )
    .await;
    let token = body["resumeToken"].as_str().unwrap().to_string();

    // Advance the definition underneath it.
    let (_, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals"),
        json!({
            "baseWorkflowHash": base_hash,
            "proposal": {"steps": [{"id": "approve", "type": "approval", "prompt": "v2?"}]}
        }),
    )
    .await;
    let pid = body["proposal"]["id"].as_str().unwrap().to_string();
    post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{pid}/review"),
        json!({"approve": true}),
    )
    .await;
    let (status, _) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{pid}/apply"),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // The suspended execution is pinned to the old hash; resume refuses to
    // straddle the definition change.
    let (status, body) = post(
        &app,
        "/api/executions/ex_stale/approve",
        json!({"approve": true, "resumeToken": token}),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "HASH_MISMATCH");
}

#[tokio::test]
async fn rollback_requires_history() {
    let app = test_app().await;
    let (workflow_id, base_hash) = create_workflow(&app, "undoable", approval_definition()).await;

    // Unknown hash is refused.
    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/rollback"),
        json!({"targetWorkflowHash": "sha256:0000"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");

    // Apply a change, then roll back to the original.
    let (_, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals"),
        json!({
            "baseWorkflowHash": base_hash,
            "proposal": {"steps": [{"id": "approve", "type": "approval", "prompt": "v2?"}]}
        }),
    )
    .await;
    let pid = body["proposal"]["id"].as_str().unwrap().to_string();
    post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{pid}/review"),
        json!({"approve": true}),
    )
    .await;
    post(
        &app,
        &format!("/api/workflows/{workflow_id}/proposals/{pid}/apply"),
        json!({}),
    )
    .await;

    let (status, body) = post(
        &app,
        &format!("/api/workflows/{workflow_id}/rollback"),
        json!({"targetWorkflowHash": base_hash}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflowHash"], base_hash.as_str());

    let (_, body) = get(&app, &format!("/api/workflows/{workflow_id}")).await;
    assert_eq!(body["workflow"]["current_hash"], base_hash.as_str());
}
