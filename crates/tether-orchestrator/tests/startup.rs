//! Startup sequence tests
//!
//! A stand-in backend binary records its arguments and sleeps; the test then
//! serves an axum mock of the backend API on the port it was given, so the
//! orchestrator sees a healthy backend and runs the full post-start sequence.

#![cfg(unix)]

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

use tether_core::config::{FunctionCallSpec, TetherConfig};
use tether_core::error::{ControlPlaneError, TetherError};
use tether_orchestrator::{EnvSource, Orchestrator};

/// Requests seen by the mock backend, in arrival order
#[derive(Default)]
struct Recorded {
    env_names: Vec<Vec<String>>,
    env_values: BTreeMap<String, String>,
    functions: Vec<String>,
}

type Shared = Arc<Mutex<Recorded>>;

async fn update_env(State(recorded): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let changes = body["changes"].as_array().cloned().unwrap_or_default();
    let mut recorded = recorded.lock().unwrap();
    recorded.env_names.push(
        changes
            .iter()
            .map(|c| c["name"].as_str().unwrap_or_default().to_string())
            .collect(),
    );
    for change in &changes {
        recorded.env_values.insert(
            change["name"].as_str().unwrap_or_default().to_string(),
            change["value"].as_str().unwrap_or_default().to_string(),
        );
    }
    if changes.iter().any(|c| c["name"] == "REJECTED") {
        return (StatusCode::BAD_REQUEST, "invalid environment variable").into_response();
    }
    StatusCode::OK.into_response()
}

async fn function(State(recorded): State<Shared>, Json(body): Json<Value>) -> impl IntoResponse {
    let path = body["path"].as_str().unwrap_or_default().to_string();
    recorded.lock().unwrap().functions.push(path.clone());
    if path == "broken:fn" {
        return (StatusCode::BAD_REQUEST, "Function not found").into_response();
    }
    Json(json!({ "status": "success", "value": null })).into_response()
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// Paths of the stand-in backend and deploy command
struct Harness {
    _tools: TempDir,
    project: TempDir,
    args: PathBuf,
    deploys: PathBuf,
    config: TetherConfig,
}

impl Harness {
    /// `deploy_exit` is the exit status of the stand-in deploy command
    fn new(deploy_exit: i32) -> Self {
        let tools = TempDir::new().unwrap();
        let project = TempDir::new().unwrap();
        let args = tools.path().join("backend-args");
        let deploys = tools.path().join("deploys");

        let backend = tools.path().join("backend");
        write_script(
            &backend,
            &format!(
                "printf '%s\\n' \"$@\" > {tmp:?}\nmv {tmp:?} {args:?}\nexec sleep 30",
                tmp = tools.path().join("backend-args.tmp"),
                args = args,
            ),
        );
        let deploy = tools.path().join("deploy");
        write_script(
            &deploy,
            &format!(
                "echo \"$@\" >> {:?}\necho 'pushing functions'\necho 'push rejected' >&2\nexit {}",
                deploys, deploy_exit
            ),
        );

        let mut config = TetherConfig::default();
        config.binary.path = Some(backend);
        config.backend.health_timeout = Duration::from_secs(10);
        config.state.branch_timeout = Duration::from_secs(2);
        config.deploy.command = vec![deploy.to_string_lossy().into_owned()];
        config.deploy.timeout = Duration::from_secs(10);

        Self {
            _tools: tools,
            project,
            args,
            deploys,
            config,
        }
    }

    fn deploy_runs(&self) -> Vec<String> {
        std::fs::read_to_string(&self.deploys)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Wait for the stand-in backend to report its port, then serve the mock API there
async fn serve_on_backend_port(args: &Path) -> (u16, Shared) {
    let port = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(contents) = tokio::fs::read_to_string(args).await {
                let lines: Vec<&str> = contents.lines().collect();
                let port = lines
                    .windows(2)
                    .find(|pair| pair[0] == "--port")
                    .and_then(|pair| pair[1].parse::<u16>().ok());
                if let Some(port) = port {
                    return port;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("backend never started");

    let recorded = Shared::default();
    let app = Router::new()
        .route("/version", get(|| async { "1.2.3\n" }))
        .route("/api/v1/update_environment_variables", post(update_env))
        .route("/api/function", post(function))
        .with_state(Arc::clone(&recorded));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, recorded)
}

#[tokio::test]
async fn test_startup_sequence_survives_failed_deploy_and_function() {
    let mut harness = Harness::new(1);
    harness.config.functions = vec![
        FunctionCallSpec::new("seed:first"),
        FunctionCallSpec::new("broken:fn"),
        FunctionCallSpec::new("seed:last").with_arg("count", json!(3)),
    ];
    let env = EnvSource::computed(|context| {
        BTreeMap::from([
            ("ALPHA".to_string(), "1".to_string()),
            ("BACKEND_URL".to_string(), context.backend_url.clone()),
            (
                "DEV_SERVER".to_string(),
                context.dev_server_address.clone().unwrap_or_default(),
            ),
        ])
    });
    let orchestrator =
        Orchestrator::new(harness.project.path(), harness.config.clone()).with_env(env);

    let (started, (port, recorded)) =
        tokio::join!(orchestrator.start(), serve_on_backend_port(&harness.args));
    let endpoint = started.unwrap();
    assert_eq!(endpoint.port, port);
    assert_eq!(orchestrator.endpoint(), Some(endpoint));

    orchestrator
        .dev_server_listening(Some("http://localhost:5173"))
        .await
        .unwrap();

    {
        let recorded = recorded.lock().unwrap();
        assert_eq!(
            recorded.env_names,
            vec![
                vec!["ALPHA".to_string()],
                vec!["BACKEND_URL".to_string()],
                vec!["DEV_SERVER".to_string()],
            ]
        );
        assert_eq!(recorded.env_values["BACKEND_URL"], endpoint.url());
        assert_eq!(recorded.env_values["DEV_SERVER"], "http://localhost:5173");
        assert_eq!(recorded.functions, vec!["seed:first", "broken:fn", "seed:last"]);
    }

    let runs = harness.deploy_runs();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].contains(&format!("--url {}", endpoint.url())));

    orchestrator.shutdown().await.unwrap();
    assert!(orchestrator.endpoint().is_none());
}

#[tokio::test]
async fn test_rejected_env_var_aborts_startup_sequence() {
    let mut harness = Harness::new(0);
    harness.config.functions = vec![FunctionCallSpec::new("seed:first")];
    harness.config.env = BTreeMap::from([
        ("ALPHA".to_string(), "1".to_string()),
        ("REJECTED".to_string(), "2".to_string()),
        ("ZULU".to_string(), "3".to_string()),
    ]);
    let orchestrator = Orchestrator::new(harness.project.path(), harness.config.clone());

    let (started, (_, recorded)) =
        tokio::join!(orchestrator.start(), serve_on_backend_port(&harness.args));
    started.unwrap();

    let err = orchestrator.dev_server_listening(None).await.unwrap_err();
    assert!(matches!(
        err,
        TetherError::ControlPlane(ControlPlaneError::Status { status: 400, .. })
    ));

    {
        let recorded = recorded.lock().unwrap();
        assert_eq!(
            recorded.env_names,
            vec![vec!["ALPHA".to_string()], vec!["REJECTED".to_string()]]
        );
        assert!(recorded.functions.is_empty());
    }
    assert!(harness.deploy_runs().is_empty());

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_successful_startup_deploys_once() {
    let harness = Harness::new(0);
    let orchestrator = Orchestrator::new(harness.project.path(), harness.config.clone());

    let (started, _) = tokio::join!(orchestrator.start(), serve_on_backend_port(&harness.args));
    started.unwrap();
    orchestrator.dev_server_listening(None).await.unwrap();

    let runs = harness.deploy_runs();
    assert_eq!(runs.len(), 1);
    let admin_key = orchestrator.credentials().unwrap().admin_key;
    assert!(runs[0].ends_with(&format!("--admin-key {}", admin_key)));

    orchestrator.shutdown().await.unwrap();
}
