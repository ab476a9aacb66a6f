use httpmock::prelude::*;
use rdi_updater::engine::{FailureKind, Outcome, ReplaceStrategy};
use rdi_updater::{HOME_ENV, UpdateOptions, cmd_update, paths, run_update, updater_home};
use serde_json::json;
use serial_test::serial;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn sha256_hex(b: &[u8]) -> String {
    hex::encode(Sha256::digest(b))
}

fn write_config(dir: &Path, body: &str) -> PathBuf {
    let p = dir.join("config.toml");
    fs::write(&p, body).unwrap();
    p
}

fn opts(config: PathBuf) -> UpdateOptions {
    UpdateOptions {
        config: Some(config),
        ..Default::default()
    }
}

fn outcome<'a>(report: &'a rdi_updater::UpdateReport, name: &str) -> &'a Outcome {
    &report.outcomes.iter().find(|(n, _)| n == name).unwrap().1
}

#[test]
fn updates_artifacts_listed_in_manifest() {
    let server = MockServer::start();
    let ui = b"ui v2".to_vec();
    let mc = b"mc v2".to_vec();
    server.mock(|when, then| {
        when.method(GET).path("/ui.jar");
        then.status(200).body(&ui);
    });
    server.mock(|when, then| {
        when.method(GET).path("/mc.jar");
        then.status(200).body(&mc);
    });
    let manifest = server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(200).json_body(json!({
            "artifacts": [
                { "name": "ui", "url": server.url("/ui.jar"), "sha256": sha256_hex(&ui) },
                { "name": "mc", "url": server.url("/mc.jar"), "sha256": sha256_hex(&mc) }
            ]
        }));
    });

    let td = tempdir().unwrap();
    fs::write(td.path().join("ui.jar"), "ui v1").unwrap();
    fs::create_dir_all(td.path().join("mods")).unwrap();
    let cfg = write_config(
        td.path(),
        &format!(
            r#"
            [remote]
            manifest_url = "{}"

            [[artifacts]]
            name = "ui"
            target = "ui.jar"

            [[artifacts]]
            name = "mc"
            target = "mods/mc.jar"
            "#,
            server.url("/manifest.json")
        ),
    );

    let report = run_update(&opts(cfg.clone())).unwrap();
    manifest.assert();
    assert_eq!(report.failures(), 0);
    assert_eq!(
        outcome(&report, "ui"),
        &Outcome::Updated {
            strategy: ReplaceStrategy::AtomicMove
        }
    );
    assert!(outcome(&report, "mc").is_success());
    assert_eq!(fs::read(td.path().join("ui.jar")).unwrap(), ui);
    assert_eq!(fs::read(td.path().join("mods/mc.jar")).unwrap(), mc);

    let again = run_update(&opts(cfg)).unwrap();
    assert!(again.outcomes.iter().all(|(_, o)| *o == Outcome::AlreadyCurrent));
}

#[test]
fn pinned_artifact_skips_manifest() {
    let server = MockServer::start();
    let body = b"pinned v2".to_vec();
    server.mock(|when, then| {
        when.method(GET).path("/pinned.jar");
        then.status(200).body(&body);
    });
    let manifest = server.mock(|when, then| {
        when.method(GET).path("/manifest.json");
        then.status(500);
    });

    let td = tempdir().unwrap();
    let cfg = write_config(
        td.path(),
        &format!(
            r#"
            [remote]
            manifest_url = "{}"

            [[artifacts]]
            name = "pinned"
            target = "pinned.jar"
            url = "{}"
            sha256 = "{}"
            "#,
            server.url("/manifest.json"),
            server.url("/pinned.jar"),
            sha256_hex(&body)
        ),
    );

    cmd_update(&opts(cfg)).unwrap();
    manifest.assert_hits(0);
    assert_eq!(fs::read(td.path().join("pinned.jar")).unwrap(), body);
}

#[test]
fn failures_make_the_command_fail() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/ui.jar");
        then.status(200).body("not what was published");
    });

    let td = tempdir().unwrap();
    fs::write(td.path().join("ui.jar"), "ui v1").unwrap();
    let cfg = write_config(
        td.path(),
        &format!(
            r#"
            [[artifacts]]
            name = "ui"
            target = "ui.jar"
            url = "{}"
            sha256 = "{}"

            [[artifacts]]
            name = "orphan"
            target = "orphan.jar"
            "#,
            server.url("/ui.jar"),
            sha256_hex(b"ui v2")
        ),
    );

    let mut o = opts(cfg.clone());
    o.retries = 2;
    let report = run_update(&o).unwrap();
    assert_eq!(
        outcome(&report, "ui").failure_kind(),
        Some(FailureKind::HashMismatch)
    );
    assert_eq!(report.unpublished, vec!["orphan".to_string()]);
    assert_eq!(report.failures(), 2);
    assert_eq!(fs::read(td.path().join("ui.jar")).unwrap(), b"ui v1");

    let err = cmd_update(&opts(cfg)).unwrap_err();
    assert!(err.to_string().contains("2 of 2 artifacts failed"));
}

#[test]
fn retries_are_bounded_by_the_caller() {
    let server = MockServer::start();
    let m = server.mock(|when, then| {
        when.method(GET).path("/ui.jar");
        then.status(503);
    });

    let td = tempdir().unwrap();
    let cfg = write_config(
        td.path(),
        &format!(
            r#"
            [[artifacts]]
            name = "ui"
            target = "ui.jar"
            url = "{}"
            sha256 = "{}"
            "#,
            server.url("/ui.jar"),
            sha256_hex(b"ui v2")
        ),
    );

    let mut o = opts(cfg);
    o.retries = 2;
    let report = run_update(&o).unwrap();
    assert_eq!(
        outcome(&report, "ui").failure_kind(),
        Some(FailureKind::NetworkError)
    );
    m.assert_hits(3);
    assert!(!td.path().join("ui.jar").exists());
}

#[test]
fn unknown_only_name_is_an_error() {
    let td = tempdir().unwrap();
    let cfg = write_config(
        td.path(),
        r#"
        [[artifacts]]
        name = "ui"
        target = "ui.jar"
        url = "http://127.0.0.1:9/ui.jar"
        "#,
    );
    let mut o = opts(cfg);
    o.only = Some("nope".into());
    let err = run_update(&o).unwrap_err();
    assert!(err.to_string().contains("no artifact named nope"));
}

#[test]
#[serial]
fn home_env_takes_precedence() {
    let td = tempdir().unwrap();
    unsafe {
        std::env::set_var(HOME_ENV, td.path());
    }
    assert_eq!(updater_home().unwrap(), td.path());
    assert_eq!(paths(None).unwrap().config, td.path().join("config.toml"));
    unsafe {
        std::env::remove_var(HOME_ENV);
    }
}

#[test]
#[serial]
fn xdg_config_home_is_used_without_override() {
    let td = tempdir().unwrap();
    let prev = std::env::var_os("XDG_CONFIG_HOME");
    unsafe {
        std::env::remove_var(HOME_ENV);
        std::env::set_var("XDG_CONFIG_HOME", td.path());
    }
    assert_eq!(updater_home().unwrap(), td.path().join("rdi-updater"));
    unsafe {
        match prev {
            Some(v) => std::env::set_var("XDG_CONFIG_HOME", v),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
    }
}
