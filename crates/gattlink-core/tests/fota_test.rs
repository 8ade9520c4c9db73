//! Firmware pipeline behavior: serial delivery, dedupe, the download
//! cache, and artifact packaging.

mod common;

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::MockDfu;
use gattlink_ble::{DfuDriver, UpdateArtifact, UpdateStatus};
use gattlink_core::fota::{FotaEvent, FotaJob, FotaPipeline};

fn pipeline_with(dfu: &Arc<MockDfu>) -> FotaPipeline {
    FotaPipeline::new(Arc::clone(dfu) as Arc<dyn DfuDriver>, reqwest::Client::new())
}

fn job(device: &str, job_id: &str, server: &MockServer, files: &[&str]) -> FotaJob {
    FotaJob {
        device_id: device.into(),
        job_id: job_id.into(),
        uris: files
            .iter()
            .map(|f| format!("{}/{f}", server.uri()))
            .collect(),
    }
}

async fn serve(server: &MockServer, file: &str, body: &[u8]) {
    Mock::given(method("GET"))
        .and(path(format!("/{file}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(server)
        .await;
}

/// Wait for the next terminal pipeline event.
async fn next_terminal(rx: &mut tokio::sync::broadcast::Receiver<FotaEvent>) -> FotaEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await.expect("pipeline event stream open") {
                event @ (FotaEvent::Succeeded { .. } | FotaEvent::Failed { .. }) => {
                    return event;
                }
                _ => {}
            }
        }
    })
    .await
    .expect("terminal event within timeout")
}

fn read_zip_entry(artifact: &UpdateArtifact, name: &str) -> Vec<u8> {
    let cursor = std::io::Cursor::new(artifact.zip.to_vec());
    let mut archive = zip::ZipArchive::new(cursor).expect("valid zip");
    let mut entry = archive.by_name(name).expect("entry present");
    let mut contents = Vec::new();
    entry.read_to_end(&mut contents).expect("read entry");
    contents
}

#[tokio::test]
async fn job_downloads_packages_and_succeeds() {
    let server = MockServer::start().await;
    serve(&server, "app.bin", b"binary-image").await;
    serve(&server, "app.dat", b"init-packet").await;

    let dfu = Arc::new(MockDfu::new());
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();

    assert!(pipeline.enqueue(job("AA:BB", "job1", &server, &["app.bin", "app.dat"])).await);
    let terminal = next_terminal(&mut events).await;
    assert!(matches!(terminal, FotaEvent::Succeeded { .. }));

    let artifacts = dfu.artifacts.lock().expect("lock");
    let (device, artifact) = &artifacts[0];
    assert_eq!(device, "AA:BB");
    assert_eq!(artifact.files, vec!["app.bin", "app.dat", "manifest.json"]);

    assert_eq!(read_zip_entry(artifact, "app.bin"), b"binary-image");
    let manifest: serde_json::Value =
        serde_json::from_slice(&read_zip_entry(artifact, "manifest.json")).expect("manifest json");
    assert_eq!(manifest["manifest"]["application"]["bin_file"], "app.bin");
    assert_eq!(manifest["manifest"]["application"]["dat_file"], "app.dat");
}

#[tokio::test]
async fn duplicate_jobs_are_dropped_while_queued() {
    let server = MockServer::start().await;
    serve(&server, "a.bin", b"a").await;
    serve(&server, "a.dat", b"d").await;

    let dfu = Arc::new(MockDfu::new());
    dfu.hold_updates();
    let pipeline = pipeline_with(&dfu);

    // First job goes in flight and stays there.
    assert!(pipeline.enqueue(job("AA:BB", "job1", &server, &["a.bin", "a.dat"])).await);
    // Wait until it is actually picked up.
    let mut current = pipeline.current_device();
    tokio::time::timeout(Duration::from_secs(5), current.wait_for(Option::is_some))
        .await
        .expect("job picked up within timeout")
        .expect("watch open");

    assert!(pipeline.enqueue(job("CC:DD", "job2", &server, &["a.bin", "a.dat"])).await);
    assert!(
        !pipeline.enqueue(job("CC:DD", "job2", &server, &["a.bin", "a.dat"])).await,
        "same (device, job) already queued"
    );
    assert_eq!(pipeline.queued_jobs().await.len(), 1);

    // Same job id on another device is distinct.
    assert!(pipeline.enqueue(job("EE:FF", "job2", &server, &["a.bin", "a.dat"])).await);
    assert_eq!(pipeline.queued_jobs().await.len(), 2);
}

#[tokio::test]
async fn download_cache_is_shared_across_jobs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shared.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"image".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    serve(&server, "one.dat", b"one").await;
    serve(&server, "two.dat", b"two").await;

    let dfu = Arc::new(MockDfu::new());
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();

    pipeline.enqueue(job("AA:BB", "job1", &server, &["shared.bin", "one.dat"])).await;
    assert!(matches!(next_terminal(&mut events).await, FotaEvent::Succeeded { .. }));

    pipeline.enqueue(job("AA:BB", "job2", &server, &["shared.bin", "two.dat"])).await;
    assert!(matches!(next_terminal(&mut events).await, FotaEvent::Succeeded { .. }));

    // wiremock's expect(1) verifies shared.bin was fetched once.
    server.verify().await;
    assert_eq!(dfu.artifacts.lock().expect("lock").len(), 2);
}

#[tokio::test]
async fn aborted_update_fails_the_job_and_advances_the_queue() {
    let server = MockServer::start().await;
    serve(&server, "a.bin", b"a").await;
    serve(&server, "a.dat", b"d").await;
    serve(&server, "b.bin", b"b").await;
    serve(&server, "b.dat", b"d").await;

    let dfu = Arc::new(MockDfu::new());
    dfu.push_script(vec![MockDfu::terminal(UpdateStatus::DfuAborted)]);
    dfu.push_script(vec![MockDfu::terminal(UpdateStatus::DfuCompleted)]);
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();

    pipeline.enqueue(job("AA:BB", "job1", &server, &["a.bin", "a.dat"])).await;
    pipeline.enqueue(job("CC:DD", "job2", &server, &["b.bin", "b.dat"])).await;

    match next_terminal(&mut events).await {
        FotaEvent::Failed { job, .. } => assert_eq!(job.job_id, "job1"),
        other => panic!("expected job1 to fail, got {other:?}"),
    }
    match next_terminal(&mut events).await {
        FotaEvent::Succeeded { job } => assert_eq!(job.job_id, "job2"),
        other => panic!("expected job2 to succeed, got {other:?}"),
    }
}

#[tokio::test]
async fn update_error_field_terminates_the_job() {
    let server = MockServer::start().await;
    serve(&server, "a.bin", b"a").await;
    serve(&server, "a.dat", b"d").await;

    let dfu = Arc::new(MockDfu::new());
    dfu.push_script(vec![gattlink_ble::DfuUpdate {
        id: "update".into(),
        error: Some(4),
        message: Some("flash verification failed".into()),
        ..gattlink_ble::DfuUpdate::default()
    }]);
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();

    pipeline.enqueue(job("AA:BB", "job1", &server, &["a.bin", "a.dat"])).await;
    match next_terminal(&mut events).await {
        FotaEvent::Failed { message, .. } => {
            assert_eq!(message, "flash verification failed");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_download_fails_the_job() {
    let server = MockServer::start().await;
    serve(&server, "a.dat", b"d").await;
    // a.bin is never mounted; the server answers 404.

    let dfu = Arc::new(MockDfu::new());
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();

    pipeline.enqueue(job("AA:BB", "job1", &server, &["a.bin", "a.dat"])).await;
    assert!(matches!(next_terminal(&mut events).await, FotaEvent::Failed { .. }));
    assert!(dfu.artifacts.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn current_device_clears_when_the_queue_drains() {
    let server = MockServer::start().await;
    serve(&server, "a.bin", b"a").await;
    serve(&server, "a.dat", b"d").await;

    let dfu = Arc::new(MockDfu::new());
    let pipeline = pipeline_with(&dfu);
    let mut events = pipeline.subscribe();
    let mut current = pipeline.current_device();

    pipeline.enqueue(job("AA:BB", "job1", &server, &["a.bin", "a.dat"])).await;
    assert!(matches!(next_terminal(&mut events).await, FotaEvent::Succeeded { .. }));

    tokio::time::timeout(Duration::from_secs(5), current.wait_for(Option::is_none))
        .await
        .expect("gate clears within timeout")
        .expect("watch open");
}
