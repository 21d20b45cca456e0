//! HTTP API of the manager, driven through the router without a socket

#![cfg(feature = "server")]

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Notify;
use tower::ServiceExt;

use bivac::core::client::BivacClient;
use bivac::core::engine::{CommandOutput, CommandRunner};
use bivac::core::envelope::{Envelope, Step, StepOutput};
use bivac::core::filters::Filters;
use bivac::core::manager::{Manager, ManagerConfig};
use bivac::core::providers::Providers;
use bivac::core::volume::{BackupStatus, MountedVolume, Volume};
use bivac::orchestrators::Orchestrator;
use bivac::server::{create_router, AppState};
use bivac::Result;

const PSK: &str = "s3cret";

/// One volume on one host. Agents succeed, optionally after the test
/// releases them.
struct OneVolume {
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

#[async_trait]
impl Orchestrator for OneVolume {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn path(&self, _v: &Volume) -> String {
        "node-1".to_string()
    }

    async fn get_volumes(&self, filters: &Filters) -> Result<Vec<Volume>> {
        let mut v = Volume::new("0123abcd", "data");
        v.host_bind = "node-1".to_string();
        v.hostname = "node-1".to_string();
        Ok(vec![v]
            .into_iter()
            .filter(|v| filters.is_accepted(&v.name, &v.labels))
            .collect())
    }

    async fn get_containers_mounting_volume(&self, _v: &Volume) -> Result<Vec<MountedVolume>> {
        Ok(vec![])
    }

    async fn container_exec(&self, _m: &MountedVolume, _argv: &[String]) -> Result<String> {
        Ok(String::new())
    }

    async fn deploy_agent(
        &self,
        _image: &str,
        argv: &[String],
        _env: &[(String, String)],
        _v: &Volume,
    ) -> Result<(bool, String)> {
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        let step = if argv[1] == "restic" { Step::Raw } else { Step::Backup };
        let env = Envelope::single(
            step,
            StepOutput {
                stdout: "snapshot 1a2b3c4d saved".to_string(),
                rc: 0,
            },
        );
        Ok((true, env.to_json()))
    }
}

struct NoRestic;

#[async_trait]
impl CommandRunner for NoRestic {
    async fn run(&self, _program: &str, _args: &[String]) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            output: "repository does not exist".to_string(),
            rc: 1,
        })
    }
}

async fn app_with(orchestrator: OneVolume) -> (Router, Arc<Manager>) {
    let manager = Arc::new(
        Manager::new(
            Arc::new(orchestrator),
            Providers::default(),
            Filters::default(),
            ManagerConfig {
                target_url: "s3:s3.amazonaws.com/bucket".to_string(),
                seed_from_repository: false,
                ..Default::default()
            },
            Arc::new(NoRestic),
        )
        .unwrap(),
    );
    manager.refresh().await.unwrap();
    let app = create_router(AppState {
        manager: manager.clone(),
        psk: PSK.to_string(),
    });
    (app, manager)
}

async fn app() -> (Router, Arc<Manager>) {
    app_with(OneVolume { gate: None }).await
}

fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {}", PSK))
        .header("Content-Type", "application/json")
        .body(body)
        .unwrap()
}

async fn json_body(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_ping_requires_psk() {
    let (app, _) = app().await;

    let resp = app
        .clone()
        .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app
        .clone()
        .oneshot(
            Request::get("/ping")
                .header("Authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = app.oneshot(request("GET", "/ping", Body::empty())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({ "type": "pong" }));
}

#[tokio::test]
async fn test_unknown_route() {
    let (app, _) = app().await;
    let resp = app.oneshot(request("GET", "/nope", Body::empty())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_are_public() {
    let (app, _) = app().await;
    let resp = app
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("bivac_last_backup_status{"));
    assert!(text.contains("volume_name=\"data\""));
}

#[tokio::test]
async fn test_backup_then_list() {
    let (app, _) = app().await;

    let resp = app
        .clone()
        .oneshot(request("POST", "/backup/data?force=true", Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await, json!({ "type": "success" }));

    let resp = app.oneshot(request("GET", "/volumes", Body::empty())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let volumes: Vec<Volume> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].last_backup_status, BackupStatus::Success);
    assert_eq!(volumes[0].logs["backup"], "[0] snapshot 1a2b3c4d saved");
    assert!(volumes[0].last_backup_date.is_some());
}

#[tokio::test]
async fn test_backup_unknown_volume() {
    let (app, _) = app().await;
    let resp = app
        .oneshot(request("POST", "/backup/missing", Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_backup_pending_while_running() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (app, _) = app_with(OneVolume {
        gate: Some((started.clone(), release.clone())),
    })
    .await;

    let first = tokio::spawn(
        app.clone()
            .oneshot(request("POST", "/backup/0123abcd", Body::empty())),
    );
    started.notified().await;

    let resp = app
        .clone()
        .oneshot(request("POST", "/backup/0123abcd", Body::empty()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(resp).await, json!({ "type": "pending" }));

    release.notify_one();
    let resp = first.await.unwrap().unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_log_receiver() {
    let (app, _) = app().await;

    let bare = Envelope::single(
        Step::TestInit,
        StepOutput {
            stdout: "".to_string(),
            rc: 1,
        },
    );
    let resp = app
        .clone()
        .oneshot(request("POST", "/backup/0123abcd/logs", Body::from(bare.to_json())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let wrapped = format!(r#"{{"data":{}}}"#, bare.to_json());
    let resp = app
        .clone()
        .oneshot(request("POST", "/restore/0123abcd/logs", Body::from(wrapped)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(request("POST", "/backup/0123abcd/logs", Body::from("not json")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = app
        .oneshot(request("POST", "/backup/missing/logs", Body::from(bare.to_json())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_restic_command() {
    let (app, _) = app().await;
    let resp = app
        .oneshot(request(
            "POST",
            "/restic/0123abcd",
            Body::from(r#"{"cmd":["snapshots"]}"#),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        json_body(resp).await,
        json!({ "type": "success", "data": "snapshot 1a2b3c4d saved" })
    );
}

#[tokio::test]
async fn test_info() {
    let (app, _) = app().await;
    let resp = app.oneshot(request("GET", "/info", Body::empty())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let body = json_body(resp).await;
    assert_eq!(body["type"], "success");
    assert_eq!(body["data"]["orchestrator"], "docker");
    assert_eq!(body["data"]["managed_volumes"], 1);
}

#[tokio::test]
async fn test_client_against_listener() {
    let (app, _) = app().await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move { axum::serve(listener, app).await });

    assert!(BivacClient::new(&address, "wrong").await.is_err());

    let client = BivacClient::new(&address, PSK).await.unwrap();
    let info = client.get_informations().await.unwrap();
    assert_eq!(info.orchestrator, "docker");
    assert_eq!(info.managed_volumes, 1);

    assert!(client.backup_volume("data", false).await.unwrap());
    let volumes = client.get_volumes().await.unwrap();
    assert_eq!(volumes[0].last_backup_status, BackupStatus::Success);

    let out = client
        .run_raw_command("0123abcd", &["snapshots".to_string()])
        .await
        .unwrap();
    assert_eq!(out, "snapshot 1a2b3c4d saved");
}
