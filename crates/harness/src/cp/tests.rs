use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::models::*;
use super::*;
use crate::error::ErrorKind;
use crate::tests::fake_http::serve;

#[derive(Default)]
struct FakeCp {
    credential_names: Vec<String>,
    deployment_lookups: u32,
    job_polls: u32,
    restore_polls: u32,
    requests: Vec<String>,
}

type Shared = Arc<Mutex<FakeCp>>;

fn page(items: Value) -> Json<Value> {
    Json(json!({ "data": items, "pagination": null }))
}

async fn accounts() -> Json<Value> {
    page(json!([{ "id": "acc-0", "name": "Other" }, { "id": "acc-1", "name": "Portworx" }]))
}

async fn tenants(Path(account): Path<String>) -> Json<Value> {
    assert_eq!(account, "acc-1");
    page(json!([{ "id": "ten-1", "name": "Default", "account_id": "acc-1" }]))
}

async fn projects(Path(tenant): Path<String>) -> Json<Value> {
    assert_eq!(tenant, "ten-1");
    page(json!([{ "id": "prj-1", "name": "Default" }]))
}

async fn create_credentials(
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, String)> {
    let mut state = state.lock().unwrap();
    let name = body["name"].as_str().unwrap_or_default().to_string();
    if state.credential_names.contains(&name) {
        return Err((
            StatusCode::CONFLICT,
            format!("backup credentials {:?} already exist", name),
        ));
    }
    state.credential_names.push(name.clone());
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": format!("cred-{}", state.credential_names.len()), "name": name })),
    ))
}

async fn get_deployment(
    State(state): State<Shared>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let mut state = state.lock().unwrap();
    state.deployment_lookups += 1;
    if state.deployment_lookups >= 3 {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "id": id, "name": "cas-abc", "cluster_resource_name": "cas-abc" })))
}

async fn project_jobs(
    State(state): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.job_polls += 1;
    state
        .requests
        .push(format!("backup_id={}", query.get("backup_id").cloned().unwrap_or_default()));
    let succeeded = state.job_polls as usize;
    let mut jobs: Vec<Value> = (0..succeeded)
        .map(|i| json!({ "id": format!("job-{}", i), "status": "Succeeded", "backup_id": "b1" }))
        .collect();
    jobs.push(json!({ "id": "job-active", "status": "Active", "backup_id": "b1" }));
    page(Value::Array(jobs))
}

async fn delete_backup(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    state.lock().unwrap().requests.push(format!(
        "delete {} local_only={}",
        id,
        query.get("local_only").cloned().unwrap_or_default()
    ));
    StatusCode::NO_CONTENT
}

async fn get_restore(State(state): State<Shared>, Path(id): Path<String>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.restore_polls += 1;
    if state.restore_polls < 2 {
        Json(json!({ "id": id, "status": "Pending" }))
    } else {
        Json(json!({
            "id": id,
            "status": "Failed",
            "error_code": PX_CLOUD_CREDENTIALS_NOT_FOUND,
        }))
    }
}

async fn fake_control_plane() -> (ControlPlane, Shared) {
    let state = Shared::default();
    let router = Router::new()
        .route("/api/accounts", get(accounts))
        .route("/api/accounts/{id}/tenants", get(tenants))
        .route("/api/tenants/{id}/projects", get(projects))
        .route("/api/tenants/{id}/backup-credentials", post(create_credentials))
        .route("/api/deployments/{id}", get(get_deployment))
        .route("/api/projects/{id}/backup-jobs", get(project_jobs))
        .route("/api/backups/{id}", delete(delete_backup))
        .route("/api/restores/{id}", get(get_restore))
        .with_state(state.clone());
    let base = serve(router).await;

    let api = ApiClient::new(
        reqwest::Client::new(),
        &base,
        Arc::new(StaticToken::new("test-token")),
    )
    .unwrap();
    let cp = ControlPlane::connect(api, "Portworx", "Default", "Default")
        .await
        .unwrap()
        .with_policy(WaitPolicy::new(Duration::from_secs(5), Duration::from_millis(10)));
    (cp, state)
}

#[tokio::test]
async fn connect_resolves_names_to_ids() {
    let (cp, _) = fake_control_plane().await;
    assert_eq!(cp.account_id(), "acc-1");
    assert_eq!(cp.tenant_id(), "ten-1");
    assert_eq!(cp.project_id(), "prj-1");
}

#[tokio::test]
async fn unknown_tenant_is_not_found() {
    let state = Shared::default();
    let router = Router::new()
        .route("/api/accounts", get(accounts))
        .route("/api/accounts/{id}/tenants", get(tenants))
        .with_state(state);
    let base = serve(router).await;
    let api =
        ApiClient::new(reqwest::Client::new(), &base, Arc::new(StaticToken::new("t"))).unwrap();

    let err = ControlPlane::connect(api, "Portworx", "Nope", "Default")
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
    assert!(err.to_string().contains("Nope"));
}

#[tokio::test]
async fn duplicate_credentials_conflict() {
    let (cp, _) = fake_control_plane().await;
    let azure = BackupCredentialsSpec::Azure {
        account_name: "pdsbackups".into(),
        account_key: "c2VjcmV0".into(),
    };

    cp.create_backup_credentials("azure-dup", &azure).await.unwrap();
    let err = cp
        .create_backup_credentials("azure-dup", &azure)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    match err {
        HarnessError::Api(api) => assert_eq!(api.status(), Some(409)),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn wait_removed_treats_404_as_success() {
    let (cp, state) = fake_control_plane().await;
    cp.wait_deployment_removed(&CancellationToken::new(), "dep-1")
        .await
        .unwrap();
    assert_eq!(state.lock().unwrap().deployment_lookups, 3);
}

#[tokio::test]
async fn ensure_n_jobs_counts_only_successes_of_backup() {
    let (cp, state) = fake_control_plane().await;
    let policy = WaitPolicy::new(Duration::from_secs(5), Duration::from_millis(10));

    let jobs = cp
        .ensure_n_backup_jobs_succeeded(&CancellationToken::new(), policy, "b1", 2)
        .await
        .unwrap();

    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(BackupJob::succeeded));
    let state = state.lock().unwrap();
    assert_eq!(state.job_polls, 2);
    assert!(state.requests.iter().all(|r| r == "backup_id=b1"));
}

#[tokio::test]
async fn delete_backup_passes_local_only() {
    let (cp, state) = fake_control_plane().await;
    cp.delete_backup("b7", true).await.unwrap();
    cp.delete_backup("b8", false).await.unwrap();
    assert_eq!(
        state.lock().unwrap().requests,
        vec!["delete b7 local_only=true", "delete b8 local_only="]
    );
}

#[tokio::test]
async fn wait_restore_failed_returns_error_code() {
    let (cp, _) = fake_control_plane().await;
    let restore = cp
        .wait_restore_failed(&CancellationToken::new(), "r1")
        .await
        .unwrap();
    assert_eq!(restore.status, Some(RestoreStatus::Failed));
    assert_eq!(restore.error_code.as_deref(), Some(PX_CLOUD_CREDENTIALS_NOT_FOUND));
}

#[tokio::test]
async fn failed_restore_stops_waiting_for_success() {
    let (cp, state) = fake_control_plane().await;
    let started = std::time::Instant::now();
    let err = cp
        .wait_restore_successful(&CancellationToken::new(), "r2")
        .await
        .unwrap_err();

    assert_ne!(err.kind(), ErrorKind::Timeout);
    assert!(err.to_string().contains(PX_CLOUD_CREDENTIALS_NOT_FOUND));
    assert_eq!(state.lock().unwrap().restore_polls, 2);
    assert!(started.elapsed() < cp.policy().timeout);
}
