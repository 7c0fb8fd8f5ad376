use std::net::SocketAddr;

use renderfarm_manager::{AppState, MediaStore, app};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tempfile::TempDir;

async fn spawn_manager(tmp: &TempDir) -> SocketAddr {
    let media = MediaStore::new(tmp.path().join("media")).unwrap();
    let state = AppState::new(media);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn registration_round_trips_the_capability_payload() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({
            "hostname": "gpu-box",
            "ip_address": "10.0.0.7",
            "os": "linux x86_64",
            "available_tools": {
                "blender_versions": ["4.5.1", "4.1.0"],
                "gpu_backends": ["OPTIX", "CUDA"],
                "gpu_devices": [
                    { "index": 0, "name": "NVIDIA GeForce RTX 3090", "type": "OPTIX" },
                    { "index": 1, "name": "NVIDIA GeForce GTX 1070 Ti", "type": "CUDA" }
                ],
                "cpu_threads": 24
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let worker: Value = res.json().await.unwrap();
    assert!(worker["id"].as_u64().is_some());
    assert_eq!(worker["is_active"], true);

    let listed: Vec<Value> = client
        .get(format!("http://{addr}/api/heartbeat"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let tools = &listed[0]["available_tools"];
    assert_eq!(tools["cpu_threads"], 24);
    assert_eq!(tools["gpu_backends"], json!(["OPTIX", "CUDA"]));
    assert_eq!(tools["gpu_devices"][1]["type"], "CUDA");
}

#[tokio::test]
async fn bare_heartbeat_touches_known_workers_and_404s_unknown() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    // Unknown hostname with no capability payload: must re-register.
    let unknown = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({ "hostname": "never-seen" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let registered: Value = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({
            "hostname": "cpu-box",
            "available_tools": { "blender_versions": ["4.5.1"], "cpu_threads": 4 }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let first_seen = registered["last_seen"].as_str().unwrap().to_string();

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let touched: Value = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({ "hostname": "cpu-box" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(touched["id"], registered["id"]);
    let before = chrono::DateTime::parse_from_rfc3339(&first_seen).unwrap();
    let after =
        chrono::DateTime::parse_from_rfc3339(touched["last_seen"].as_str().unwrap()).unwrap();
    assert!(after > before);
}

#[tokio::test]
async fn re_registration_updates_capabilities_in_place() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    let first: Value = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({
            "hostname": "upgraded-box",
            "available_tools": { "blender_versions": ["4.5.1"], "cpu_threads": 8 }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let second: Value = client
        .post(format!("http://{addr}/api/heartbeat"))
        .json(&json!({
            "hostname": "upgraded-box",
            "available_tools": { "blender_versions": ["4.5.1", "4.5.3"], "cpu_threads": 16 }
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Same identity, refreshed capabilities, no duplicate record.
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["available_tools"]["cpu_threads"], 16);

    let listed: Vec<Value> = client
        .get(format!("http://{addr}/api/heartbeat"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}
