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

async fn upload_asset(client: &reqwest::Client, addr: SocketAddr, project: &str, name: &str) -> u64 {
    let form = reqwest::multipart::Form::new()
        .text("name", name.to_string())
        .text("project", project.to_string())
        .part(
            "blend_file",
            reqwest::multipart::Part::bytes(b"scene".to_vec()).file_name("scene.blend"),
        );
    let res = client
        .post(format!("http://{addr}/api/assets"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json::<Value>().await.unwrap()["id"].as_u64().unwrap()
}

#[tokio::test]
async fn project_names_are_validated_and_unique() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    let too_short = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "abc" }))
        .send()
        .await
        .unwrap();
    assert_eq!(too_short.status(), StatusCode::BAD_REQUEST);

    let too_long = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "p".repeat(41) }))
        .send()
        .await
        .unwrap();
    assert_eq!(too_long.status(), StatusCode::BAD_REQUEST);

    let ok = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "Feature Film" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::CREATED);

    let duplicate = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "Feature Film" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn asset_blob_is_downloadable_and_protected_while_referenced() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    let project: Value = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "Asset Lifecycle" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let project_id = project["id"].as_str().unwrap();

    let referenced = upload_asset(&client, addr, project_id, "referenced-scene").await;
    let loose = upload_asset(&client, addr, project_id, "loose-scene").await;

    let asset: Value = client
        .get(format!("http://{addr}/api/assets/{referenced}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let blob_url = asset["blend_file"].as_str().unwrap();
    assert!(blob_url.starts_with("/media/assets/"));
    assert!(blob_url.ends_with(".blend"));

    let blob = client
        .get(format!("http://{addr}{blob_url}"))
        .send()
        .await
        .unwrap();
    assert_eq!(blob.bytes().await.unwrap().to_vec(), b"scene".to_vec());

    let download = client
        .get(format!("http://{addr}/api/assets/{referenced}/download"))
        .send()
        .await
        .unwrap();
    assert_eq!(download.bytes().await.unwrap().to_vec(), b"scene".to_vec());

    client
        .post(format!("http://{addr}/api/jobs"))
        .json(&json!({
            "name": "Pinning Job",
            "asset_id": referenced,
            "output_file_pattern": "pin_####",
        }))
        .send()
        .await
        .unwrap();

    let blocked = client
        .delete(format!("http://{addr}/api/assets/{referenced}"))
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), StatusCode::CONFLICT);

    let allowed = client
        .delete(format!("http://{addr}/api/assets/{loose}"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::NO_CONTENT);
    let gone = client
        .get(format!("http://{addr}/api/assets/{loose}"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_a_project_cascades_to_its_work() {
    let tmp = TempDir::new().unwrap();
    let addr = spawn_manager(&tmp).await;
    let client = reqwest::Client::new();

    let project: Value = client
        .post(format!("http://{addr}/api/projects"))
        .json(&json!({ "name": "Short Lived" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let project_id = project["id"].as_str().unwrap().to_string();
    let asset = upload_asset(&client, addr, &project_id, "doomed-scene").await;

    let animation: Value = client
        .post(format!("http://{addr}/api/animations"))
        .json(&json!({
            "name": "Doomed Frames",
            "asset_id": asset,
            "output_file_pattern": "d_####",
            "start_frame": 1,
            "end_frame": 2,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let removed = client
        .delete(format!("http://{addr}/api/projects/{project_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(removed.status(), StatusCode::NO_CONTENT);

    let jobs: Vec<Value> = client
        .get(format!("http://{addr}/api/jobs"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(jobs.is_empty());

    let animation_gone = client
        .get(format!(
            "http://{addr}/api/animations/{}",
            animation["id"].as_u64().unwrap()
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(animation_gone.status(), StatusCode::NOT_FOUND);

    let asset_gone = client
        .get(format!("http://{addr}/api/assets/{asset}"))
        .send()
        .await
        .unwrap();
    assert_eq!(asset_gone.status(), StatusCode::NOT_FOUND);
}
