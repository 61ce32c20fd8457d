//! End-to-end tests of the HTTP surface, driven in-process.

mod common;

use std::fs;
use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::{
    app, body_bytes, get, json, multipart_body, send, settings, small_ova, upload_request,
    BOUNDARY,
};
use futures_util::{stream, StreamExt};
use ovacat_core::scan::QUARANTINE;
use ovacat_server::api::appliance::appliance_path;
use ovacat_server::api::inventory::TEST_CONNECTION_MESSAGE;
use tempfile::TempDir;

fn delete_request(filename: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(format!("/appliances/{}", filename))
        .body(Body::empty())
        .unwrap()
}

/// Every path under `root`, relative and sorted.
fn tree(root: &std::path::Path) -> Vec<String> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir).unwrap() {
            let path = entry.unwrap().path();
            paths.push(path.strip_prefix(root).unwrap().display().to_string());
            if path.is_dir() {
                pending.push(path);
            }
        }
    }
    paths.sort();
    paths
}

#[tokio::test]
async fn test_empty_catalog() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let (status, body) = json(send(&app, get("/appliances")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));

    let (status, body) = json(send(&app, get("/vms")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn test_upload_then_list() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let (status, info) = json(send(&app, upload_request("small.ova", &small_ova())).await).await;
    assert_eq!(status, StatusCode::OK, "{}", info);
    assert_eq!(info["file"], "small.ova");
    assert_eq!(info["source"], "vmware");
    let systems = info["virtualSystems"].as_array().unwrap();
    assert_eq!(systems.len(), 1);
    assert_eq!(systems[0]["name"], "vm1");
    let id = systems[0]["id"].as_str().unwrap();
    assert_eq!(id.len(), 36);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let stored = appliance_path(catalog.path(), "small.ova");
    assert_eq!(fs::read(&stored).unwrap(), small_ova());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&stored).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    let (status, vms) = json(send(&app, get("/vms")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vms.as_array().unwrap().len(), 1);
    assert_eq!(vms[0]["Name"], "vm1");
    assert_eq!(vms[0]["UUID"], id);
    assert_eq!(vms[0]["Disks"][0]["Capacity"], 10737418240u64);

    let (_, listed) = json(send(&app, get("/appliances")).await).await;
    assert_eq!(listed[0]["file"], "small.ova");
    assert_eq!(listed[0]["virtualSystems"][0]["id"], id);
    assert!(listed[0]["modified"].as_str().is_some());

    let (_, disks) = json(send(&app, get("/disks")).await).await;
    assert_eq!(disks[0]["Name"], "disk1.vmdk");
    let (_, networks) = json(send(&app, get("/networks")).await).await;
    assert_eq!(networks[0]["Name"], "VM Network");
}

#[tokio::test]
async fn test_upload_conflict_leaves_catalog_untouched() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let response = send(&app, upload_request("small.ova", &small_ova())).await;
    assert_eq!(response.status(), StatusCode::OK);
    let before = tree(catalog.path());

    let (status, body) = json(send(&app, upload_request("small.ova", b"different")).await).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, serde_json::json!({"error": "a file by that name already exists"}));

    assert_eq!(tree(catalog.path()), before);
    let stored = appliance_path(catalog.path(), "small.ova");
    assert_eq!(fs::read(stored).unwrap(), small_ova());
}

#[tokio::test]
async fn test_bad_upload_is_rolled_back() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let (status, body) = json(send(&app, upload_request("fake.ova", &[0x42u8; 128])).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert!(tree(catalog.path()).is_empty());
}

#[tokio::test]
async fn test_abandoned_upload_releases_name() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    // Headers and the first KiB arrive, then the client goes quiet.
    let mut head = multipart_body("appliance", "small.ova", &[0u8; 1024]);
    head.truncate(head.len() - format!("\r\n--{BOUNDARY}--\r\n").len());
    let body = stream::iter(vec![Ok::<_, io::Error>(head)])
        .chain(stream::pending::<Result<Vec<u8>, io::Error>>());
    let request = Request::builder()
        .method("POST")
        .uri("/appliances")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from_stream(body))
        .unwrap();

    let stalled = tokio::time::timeout(Duration::from_millis(500), send(&app, request)).await;
    assert!(stalled.is_err());
    assert!(tree(catalog.path()).is_empty());

    let (status, info) = json(send(&app, upload_request("small.ova", &small_ova())).await).await;
    assert_eq!(status, StatusCode::OK, "{}", info);
    assert_eq!(
        fs::read(appliance_path(catalog.path(), "small.ova")).unwrap(),
        small_ova()
    );
}

#[tokio::test]
async fn test_upload_reports_settled_mtime() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let before = chrono::Utc::now();
    let (status, info) = json(send(&app, upload_request("small.ova", &small_ova())).await).await;
    assert_eq!(status, StatusCode::OK);
    let modified: chrono::DateTime<chrono::Utc> =
        info["modified"].as_str().unwrap().parse().unwrap();
    let quarantine = chrono::Duration::from_std(QUARANTINE).unwrap();
    assert!(modified <= chrono::Utc::now() - quarantine);
    assert!(modified >= before - quarantine - chrono::Duration::seconds(1));
}

#[tokio::test]
async fn test_upload_without_multipart_body() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let request = Request::builder()
        .method("POST")
        .uri("/appliances")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from(small_ova()))
        .unwrap();
    let (status, body) = json(send(&app, request).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert!(tree(catalog.path()).is_empty());
}

#[tokio::test]
async fn test_unsupported_method() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let request = Request::builder()
        .method("PUT")
        .uri("/vms")
        .body(Body::empty())
        .unwrap();
    let (status, body) = json(send(&app, request).await).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"], "PUT is not allowed on /vms");
}

#[tokio::test]
async fn test_upload_requires_ova_extension() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let (status, body) = json(send(&app, upload_request("small.tar", &small_ova())).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "filename must end with .ova extension");
    assert!(tree(catalog.path()).is_empty());
}

#[tokio::test]
async fn test_upload_without_field() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let request = Request::builder()
        .method("POST")
        .uri("/appliances")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", common::BOUNDARY),
        )
        .body(Body::from(common::multipart_body("other", "small.ova", b"x")))
        .unwrap();
    let (status, _) = json(send(&app, request).await).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));

    let response = send(&app, delete_request("missing.ova")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    send(&app, upload_request("small.ova", &small_ova())).await;
    assert!(appliance_path(catalog.path(), "small.ova").exists());

    for _ in 0..2 {
        let response = send(&app, delete_request("small.ova")).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(body_bytes(response).await.is_empty());
    }
    assert!(tree(catalog.path()).is_empty());
}

#[tokio::test]
async fn test_broken_entry_is_listed_with_error() {
    let catalog = TempDir::new().unwrap();
    let path = appliance_path(catalog.path(), "broken.ova");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, [0x42u8; 128]).unwrap();

    let app = app(settings(catalog.path()));
    let (status, listed) = json(send(&app, get("/appliances")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed[0]["file"], "broken.ova");
    assert_eq!(listed[0]["size"], 128);
    assert_eq!(listed[0]["virtualSystems"], serde_json::json!([]));
    assert!(listed[0]["error"].as_str().is_some());
}

#[tokio::test]
async fn test_out_of_band_copy_is_quarantined() {
    let catalog = TempDir::new().unwrap();
    let dir = catalog.path().join("copied");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("small.ova"), small_ova()).unwrap();

    let app = app(settings(catalog.path()));
    let (status, vms) = json(send(&app, get("/vms")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vms, serde_json::json!([]));
}

#[tokio::test]
async fn test_auth_disabled() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));
    let response = send(&app, get("/appliances")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_auth_enabled() {
    let catalog = TempDir::new().unwrap();
    let mut settings = settings(catalog.path());
    settings.auth_required = true;
    settings.auth_token = "s3cret".to_string();
    let app = app(settings);

    let response = send(&app, get("/appliances")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(body_bytes(response).await.is_empty());

    let wrong = Request::builder()
        .uri("/vms")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.status(), StatusCode::UNAUTHORIZED);

    let right = Request::builder()
        .uri("/appliances")
        .header(header::AUTHORIZATION, "Bearer s3cret")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, right).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_test_connection() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));
    let (status, body) = json(send(&app, get("/test_connection")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, TEST_CONNECTION_MESSAGE);
}

#[tokio::test]
async fn test_unknown_route() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));
    let (status, body) = json(send(&app, get("/nope")).await).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test]
async fn test_catalog_status_empty() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(catalog.path()));
    let (status, body) = json(send(&app, get("/catalog")).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!([]));
}

#[tokio::test]
async fn test_missing_catalog_root_is_internal_error() {
    let catalog = TempDir::new().unwrap();
    let app = app(settings(&catalog.path().join("absent")));
    let (status, body) = json(send(&app, get("/appliances")).await).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().is_some());
}
