//! End-to-end tests for the reconcile/supervise/serve loop

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use switchyard::admin::AdminServer;
use switchyard::config::{Config, PortRange, ProxyConfig, RespawnConfig, WorkerConfig};
use switchyard::meta::{MetaState, META_FILE};
use switchyard::reconcile::Reconciler;
use switchyard::supervisor::{Supervisor, WorkerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Build an orchestrator config over temp directories
fn build_config(root: &Path, conf_dir: &Path) -> Config {
    Config {
        path: root.to_path_buf(),
        admin_port: 0,
        proxy: ProxyConfig {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            name: "app".to_string(),
            conf_dir: conf_dir.to_path_buf(),
            app_conf_dir: None,
            template_dir: None,
            reload_command: "true".to_string(),
        },
        port_range: PortRange { min: 9000, max: 9010 },
        worker: WorkerConfig {
            command: "sh run.sh".to_string(),
        },
        respawn: RespawnConfig {
            interval_secs: 0,
            limit: 3,
            limit_interval_secs: 60,
            reset_after_secs: 60,
        },
    }
}

/// Create a version folder with a worker entry point
fn write_version(root: &Path, name: &str, script: &str) {
    let dir = root.join(name);
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("run.sh"), script).unwrap();
}

struct Orchestrator {
    reconciler: Arc<Reconciler>,
    supervisor: Arc<Supervisor>,
    stop_tx: watch::Sender<bool>,
}

/// Wire up supervisor, exit loop, and reconciler the way main does
fn start_orchestrator(config: Config) -> Orchestrator {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (supervisor, exit_rx) =
        Supervisor::new(&config.worker.command, config.respawn, stop_rx).unwrap();
    let (respawn_tx, respawn_rx) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&supervisor).run_exit_loop(exit_rx, respawn_tx));

    let reconciler = Arc::new(Reconciler::new(config, Arc::clone(&supervisor)).unwrap());
    tokio::spawn(Arc::clone(&reconciler).run_respawn_loop(respawn_rx));

    Orchestrator {
        reconciler,
        supervisor,
        stop_tx,
    }
}

/// Poll until the condition holds or the timeout expires
async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Send a simple HTTP request and return the raw response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n",
        path
    );
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_example_scenario_add_and_remove_versions() {
    let root = tempfile::tempdir().unwrap();
    let conf = tempfile::tempdir().unwrap();
    write_version(root.path(), "v1", "exec sleep 60\n");

    let orchestrator = start_orchestrator(build_config(root.path(), conf.path()));

    // First pass: v1 gets the first port in range and a running worker
    let instances = orchestrator.reconciler.reconcile().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances["v1"].port, 9000);
    assert_eq!(
        orchestrator.supervisor.get_state("v1"),
        Some(WorkerState::Running)
    );
    let v1_pid = orchestrator.supervisor.get_pid("v1");
    assert!(v1_pid.is_some());

    // Add v2: v1 is untouched, v2 gets the next port and its own worker
    write_version(root.path(), "v2", "exec sleep 60\n");
    let instances = orchestrator.reconciler.reconcile().await.unwrap();
    assert_eq!(instances["v1"].port, 9000);
    assert_eq!(instances["v2"].port, 9001);
    assert_eq!(orchestrator.supervisor.get_pid("v1"), v1_pid);
    assert_eq!(
        orchestrator.supervisor.get_state("v2"),
        Some(WorkerState::Running)
    );

    // Remove v1: its meta entry, config, and process all go away
    std::fs::remove_dir_all(root.path().join("v1")).unwrap();
    let instances = orchestrator.reconciler.reconcile().await.unwrap();
    assert!(!instances.contains_key("v1"));
    assert_eq!(instances["v2"].port, 9001);
    assert!(
        wait_for(
            || orchestrator.supervisor.get_state("v1").is_none(),
            Duration::from_secs(5)
        )
        .await,
        "obsolete v1 worker was not discarded"
    );

    // Its port is free for the next arrival
    write_version(root.path(), "v3", "exec sleep 60\n");
    let instances = orchestrator.reconciler.reconcile().await.unwrap();
    assert_eq!(instances["v3"].port, 9000);

    orchestrator.stop_tx.send(true).unwrap();
    orchestrator.supervisor.terminate_all();
}

#[tokio::test]
async fn test_crashing_worker_respawns_and_meta_tracks_pid() {
    let root = tempfile::tempdir().unwrap();
    let conf = tempfile::tempdir().unwrap();
    // Worker exits immediately; respawn interval is 0 in the test config
    write_version(root.path(), "flappy", "exit 1\n");

    let orchestrator = start_orchestrator(build_config(root.path(), conf.path()));
    let instances = orchestrator.reconciler.reconcile().await.unwrap();
    let first_pid = instances["flappy"].last_pid.unwrap();

    // The supervisor keeps respawning; the persisted pid moves past the first
    let meta_path = root.path().join(META_FILE);
    assert!(
        wait_for(
            || {
                MetaState::load(&meta_path)
                    .ok()
                    .and_then(|m| m.instances.get("flappy").and_then(|i| i.last_pid))
                    .map(|pid| pid != first_pid)
                    .unwrap_or(false)
            },
            Duration::from_secs(10)
        )
        .await,
        "respawn never recorded a new pid"
    );

    orchestrator.stop_tx.send(true).unwrap();
    orchestrator.supervisor.terminate_all();
}

#[tokio::test]
async fn test_stop_suppresses_respawn() {
    let root = tempfile::tempdir().unwrap();
    let conf = tempfile::tempdir().unwrap();
    write_version(root.path(), "v1", "exec sleep 60\n");

    let orchestrator = start_orchestrator(build_config(root.path(), conf.path()));
    orchestrator.reconciler.reconcile().await.unwrap();

    orchestrator.stop_tx.send(true).unwrap();
    orchestrator.supervisor.terminate_all();

    assert!(
        wait_for(
            || {
                orchestrator.supervisor.get_state("v1") == Some(WorkerState::Terminated)
            },
            Duration::from_secs(5)
        )
        .await,
        "worker never reached Terminated after stop"
    );

    // Nothing comes back
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        orchestrator.supervisor.get_state("v1"),
        Some(WorkerState::Terminated)
    );
}

#[tokio::test]
async fn test_admin_api_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let conf = tempfile::tempdir().unwrap();
    write_version(root.path(), "v1", "exec sleep 60\n");

    let admin_port = 18931;
    let orchestrator = start_orchestrator(build_config(root.path(), conf.path()));
    orchestrator.reconciler.reconcile().await.unwrap();

    let bind_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], admin_port));
    let admin = AdminServer::new(
        bind_addr,
        Arc::clone(&orchestrator.reconciler),
        orchestrator.stop_tx.clone(),
    );
    let admin_task = tokio::spawn(admin.run());

    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    // Default route: instance map
    let response = http_get(admin_port, "/").await.unwrap();
    assert!(response.contains("200 OK"));
    assert!(response.contains("\"v1\""));
    assert!(response.contains("\"port\":9000"));

    // Process listing
    let response = http_get(admin_port, "/processes").await.unwrap();
    assert!(response.contains("\"name\":\"v1\""));
    assert!(response.contains("\"state\":\"running\""));
    assert!(response.contains("\"pid\""));

    // Reload with a pinned version writes the marker and the default route
    let response = http_get(admin_port, "/reload?version=v1").await.unwrap();
    assert!(response.contains("200 OK"));
    let marker = std::fs::read_to_string(root.path().join("current")).unwrap();
    assert_eq!(marker.trim(), "v1");
    let default_conf = conf.path().join("app").join("default.conf");
    assert!(default_conf.exists());
    assert!(std::fs::read_to_string(&default_conf)
        .unwrap()
        .contains("9000"));

    // Resize against a version with no live process is a 500
    let response = http_get(admin_port, "/resize?version=ghost&size=2")
        .await
        .unwrap();
    assert!(response.contains("500"));
    assert!(response.contains("\"error\""));

    // Stop terminates workers and closes the listener
    let response = http_get(admin_port, "/stop").await.unwrap();
    assert!(response.contains("\"stopping\":true"));

    let result = tokio::time::timeout(Duration::from_secs(5), admin_task).await;
    assert!(result.is_ok(), "admin server did not shut down");

    assert!(
        wait_for(
            || {
                orchestrator.supervisor.get_state("v1") == Some(WorkerState::Terminated)
            },
            Duration::from_secs(5)
        )
        .await
    );
}

#[tokio::test]
async fn test_reload_with_new_version_on_disk() {
    let root = tempfile::tempdir().unwrap();
    let conf = tempfile::tempdir().unwrap();
    write_version(root.path(), "v1", "exec sleep 60\n");

    let admin_port = 18932;
    let orchestrator = start_orchestrator(build_config(root.path(), conf.path()));
    orchestrator.reconciler.reconcile().await.unwrap();

    let bind_addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], admin_port));
    let admin = AdminServer::new(
        bind_addr,
        Arc::clone(&orchestrator.reconciler),
        orchestrator.stop_tx.clone(),
    );
    tokio::spawn(admin.run());
    assert!(wait_for_port(admin_port, Duration::from_secs(5)).await);

    // Drop a new version in and reconcile over HTTP
    write_version(root.path(), "v2", "exec sleep 60\n");
    let response = http_get(admin_port, "/reload").await.unwrap();
    assert!(response.contains("\"v2\""));
    assert!(response.contains("\"port\":9001"));
    assert_eq!(
        orchestrator.supervisor.get_state("v2"),
        Some(WorkerState::Running)
    );

    orchestrator.stop_tx.send(true).unwrap();
    orchestrator.supervisor.terminate_all();
}
