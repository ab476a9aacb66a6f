use httpmock::prelude::*;
use rdi_updater::engine::{
    ArtifactDescriptor, FailureKind, FetchError, FetchProgress, Fetcher, HttpFetcher, Outcome,
    ProgressEvent, ReplaceStrategy, UpdateCoordinator, build_client,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(build_client("rdi-updater-tests", Duration::from_secs(10)).unwrap())
}

fn sha256_hex(b: &[u8]) -> String {
    hex::encode(Sha256::digest(b))
}

fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut v: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    v.sort();
    v
}

#[test]
fn downloads_body_and_reports_progress() {
    let server = MockServer::start();
    let body = vec![7u8; 300 * 1024];
    let m = server.mock(|when, then| {
        when.method(GET).path("/rdi-5-ui.jar");
        then.status(200).body(&body);
    });

    let td = tempdir().unwrap();
    let dest = td.path().join("out");
    let mut seen: Vec<FetchProgress> = Vec::new();
    fetcher()
        .fetch(&server.url("/rdi-5-ui.jar"), &dest, &mut |p: &FetchProgress| {
            seen.push(*p);
            ControlFlow::Continue(())
        })
        .unwrap();

    m.assert();
    assert_eq!(fs::read(&dest).unwrap(), body);
    let last = seen.last().unwrap();
    assert_eq!(last.bytes_transferred, body.len() as u64);
    assert_eq!(last.total_bytes, Some(body.len() as u64));
    assert_eq!(last.percent(), Some(100.0));
    assert!(seen.windows(2).all(|w| w[0].bytes_transferred <= w[1].bytes_transferred));
}

#[test]
fn http_error_status_is_a_network_failure() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/missing.jar");
        then.status(404);
    });

    let td = tempdir().unwrap();
    let err = fetcher()
        .fetch(&server.url("/missing.jar"), &td.path().join("out"), &mut |_: &FetchProgress| {
            ControlFlow::Continue(())
        })
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { status: 404, .. }));
    assert_eq!(err.kind(), FailureKind::NetworkError);
}

#[test]
fn break_from_progress_aborts() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/ui.jar");
        then.status(200).body("payload");
    });

    let td = tempdir().unwrap();
    let err = fetcher()
        .fetch(&server.url("/ui.jar"), &td.path().join("out"), &mut |_: &FetchProgress| {
            ControlFlow::Break(())
        })
        .unwrap_err();
    assert!(matches!(err, FetchError::Aborted));
    assert_eq!(err.kind(), FailureKind::Cancelled);
}

#[test]
fn unreachable_host_is_a_network_failure() {
    let td = tempdir().unwrap();
    let err = fetcher()
        .fetch("http://127.0.0.1:9/ui.jar", &td.path().join("out"), &mut |_: &FetchProgress| {
            ControlFlow::Continue(())
        })
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::NetworkError);
}

#[test]
fn end_to_end_update_over_http() {
    let server = MockServer::start();
    let new_body = b"rdi ui build 2".to_vec();
    let m = server.mock(|when, then| {
        when.method(GET).path("/rdi-5-ui.jar");
        then.status(200).body(&new_body);
    });

    let td = tempdir().unwrap();
    let target = td.path().join("rdi-5-ui.jar");
    fs::write(&target, b"rdi ui build 1").unwrap();

    let coordinator = UpdateCoordinator::new(Arc::new(fetcher()));
    let d = ArtifactDescriptor::new(
        "ui",
        &target,
        server.url("/rdi-5-ui.jar"),
        sha256_hex(&new_body).to_uppercase(),
    );
    let events = Mutex::new(Vec::new());
    let sink = |e: &ProgressEvent| events.lock().unwrap().push(e.to_string());

    assert!(coordinator.needs_update(&d).unwrap());
    let out = coordinator.check_and_update(&d, &sink);
    assert_eq!(
        out,
        Outcome::Updated {
            strategy: ReplaceStrategy::AtomicMove
        }
    );
    assert_eq!(fs::read(&target).unwrap(), new_body);
    assert_eq!(entries(td.path()), vec!["rdi-5-ui.jar".to_string()]);
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.starts_with("downloading: 100.0%"))
    );

    // idempotent: nothing is fetched the second time
    assert_eq!(coordinator.check_and_update(&d, &|_: &ProgressEvent| {}), Outcome::AlreadyCurrent);
    m.assert_hits(1);
}

#[test]
fn corrupted_download_never_reaches_target() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/rdi-5-ui.jar");
        then.status(200).body("tampered");
    });

    let td = tempdir().unwrap();
    let target = td.path().join("rdi-5-ui.jar");
    fs::write(&target, b"rdi ui build 1").unwrap();

    let coordinator = UpdateCoordinator::new(Arc::new(fetcher()));
    let d = ArtifactDescriptor::new(
        "ui",
        &target,
        server.url("/rdi-5-ui.jar"),
        sha256_hex(b"rdi ui build 2"),
    );
    let out = coordinator.check_and_update(&d, &|_: &ProgressEvent| {});

    assert_eq!(out.failure_kind(), Some(FailureKind::HashMismatch));
    assert!(out.is_retryable());
    assert_eq!(fs::read(&target).unwrap(), b"rdi ui build 1");
    assert_eq!(entries(td.path()), vec!["rdi-5-ui.jar".to_string()]);
}
