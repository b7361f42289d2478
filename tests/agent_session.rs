// tests/agent_session.rs

mod common;
use crate::common::builders::write_plugin;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};

use shield::agent::{
    prepare, spawn_execution, status_frames, AgentStatus, AuthorizedKeys, ChannelFrame,
    PluginResolver, Prepared,
};
use shield::errors::ShieldError;
use shield::model::Task;
use shield::types::Operation;

type TestResult = Result<(), Box<dyn Error>>;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn backup_payload(target: &str, store: &str) -> String {
    format!(
        r#"{{"operation":"backup","target_plugin":"{target}","target_endpoint":"{{}}","store_plugin":"{store}","store_endpoint":"{{}}"}}"#
    )
}

fn prepare_task(payload: &str, resolver: &PluginResolver) -> Result<Task, Box<dyn Error>> {
    prepare(payload.as_bytes(), resolver)?
        .into_task()
        .ok_or_else(|| "expected a pipeline request".into())
}

async fn collect(mut frames: mpsc::Receiver<ChannelFrame>) -> Vec<ChannelFrame> {
    let mut out = Vec::new();
    while let Some(frame) = frames.recv().await {
        out.push(frame);
    }
    out
}

fn data_lines(frames: &[ChannelFrame]) -> Vec<&str> {
    frames
        .iter()
        .filter_map(|f| match f {
            ChannelFrame::Data(text) => Some(text.as_str()),
            ChannelFrame::ExitStatus(_) => None,
        })
        .collect()
}

#[test]
fn prepare_resolves_plugins_from_search_paths() -> TestResult {
    let first = TempDir::new()?;
    let second = TempDir::new()?;
    write_plugin(second.path(), "fs", "echo fs")?;
    let webdav_first = write_plugin(first.path(), "webdav", "echo first")?;
    write_plugin(second.path(), "webdav", "echo second")?;

    let resolver = PluginResolver::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
    let task = prepare_task(&backup_payload("fs", "webdav"), &resolver)?;

    assert_eq!(task.op, Operation::Backup);
    assert_eq!(task.target.plugin, second.path().join("fs").display().to_string());
    assert_eq!(task.store.plugin, webdav_first.display().to_string());
    Ok(())
}

#[test]
fn prepare_rejects_unknown_plugin() -> TestResult {
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "fs", "true")?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let err = prepare(backup_payload("fs", "nosuch").as_bytes(), &resolver).unwrap_err();
    match err {
        ShieldError::Validation(msg) => assert!(msg.contains("'nosuch'"), "{msg}"),
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[test]
fn prepare_reports_payload_errors_before_resolution() {
    let resolver = PluginResolver::default();
    let payload = br#"{"operation":"restore","target_plugin":"t","target_endpoint":"e","store_plugin":"s","store_endpoint":"se"}"#;
    match prepare(payload, &resolver) {
        Err(ShieldError::Validation(msg)) => assert_eq!(
            msg,
            "missing required 'restore_key' value in payload (for restore operation)"
        ),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn resolver_skips_directories_and_non_executables() -> TestResult {
    let first = TempDir::new()?;
    let second = TempDir::new()?;
    std::fs::create_dir(first.path().join("fs"))?;
    std::fs::write(second.path().join("fs"), "#!/bin/sh\n")?;
    let resolver = PluginResolver::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);
    assert!(resolver.resolve("fs").is_err());

    let third = TempDir::new()?;
    let good = write_plugin(third.path(), "fs", "true")?;
    let resolver = PluginResolver::new(vec![
        first.path().to_path_buf(),
        second.path().to_path_buf(),
        third.path().to_path_buf(),
    ]);
    assert_eq!(resolver.resolve("fs")?, good);

    // Paths are checked as given, never searched.
    assert_eq!(resolver.resolve(&good.display().to_string())?, good);
    assert!(resolver.resolve("/definitely/not/here").is_err());
    Ok(())
}

#[test]
fn plugin_paths_outside_the_search_paths_are_refused() -> TestResult {
    let root = TempDir::new()?;
    let plugins = root.path().join("plugins");
    std::fs::create_dir(&plugins)?;
    write_plugin(&plugins, "fs", "true")?;
    write_plugin(root.path(), "escape", "true")?;
    let resolver = PluginResolver::new(vec![plugins.clone()]);

    let payload = backup_payload("/bin/sh", "/usr/bin/env");
    match prepare(payload.as_bytes(), &resolver) {
        Err(ShieldError::Validation(msg)) => assert!(msg.contains("outside the plugin paths"), "{msg}"),
        other => panic!("unexpected result {other:?}"),
    }

    let sneaky = format!("{}/../escape", plugins.display());
    assert!(resolver.resolve(&sneaky).is_err());

    let inside = plugins.join("fs").display().to_string();
    let task = prepare_task(&backup_payload(&inside, "fs"), &resolver)?;
    assert_eq!(task.target.plugin, inside);
    Ok(())
}

#[test]
fn status_request_needs_no_plugin_fields() -> TestResult {
    let resolver = PluginResolver::new(vec![PathBuf::from("/nonexistent/plugins")]);
    let prepared = prepare(br#"{"operation":"status"}"#, &resolver)?;
    assert!(matches!(prepared, Prepared::Status), "{prepared:?}");
    Ok(())
}

#[tokio::test]
async fn status_reports_name_version_and_plugins() -> TestResult {
    let first = TempDir::new()?;
    let second = TempDir::new()?;
    let fs_first = write_plugin(first.path(), "fs", "true")?;
    write_plugin(second.path(), "fs", "true")?;
    let webdav = write_plugin(second.path(), "webdav", "true")?;
    std::fs::write(second.path().join("README"), "not a plugin")?;
    let resolver = PluginResolver::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);

    let status = AgentStatus::collect("db-host-1", &resolver);
    let frames = with_timeout(collect(status_frames(&status))).await;

    assert_eq!(frames.last(), Some(&ChannelFrame::ExitStatus(0)));
    let lines = data_lines(&frames);
    let json = lines
        .iter()
        .find_map(|l| l.strip_prefix("O:"))
        .ok_or("no stdout line")?;
    let reported: AgentStatus = serde_json::from_str(json.trim_end())?;

    assert_eq!(reported.name, "db-host-1");
    assert_eq!(reported.version, env!("CARGO_PKG_VERSION"));
    assert_eq!(reported.health, "ok");
    assert_eq!(reported.plugins.len(), 2);
    assert_eq!(reported.plugins["fs"], fs_first.display().to_string());
    assert_eq!(reported.plugins["webdav"], webdav.display().to_string());
    Ok(())
}

#[tokio::test]
async fn execution_streams_framed_lines_then_exit_zero() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "fs", "echo 'fs: reading' >&2; echo row")?;
    write_plugin(dir.path(), "webdav", r#"cat >/dev/null; echo '{"key":"k1"}'"#)?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let task = prepare_task(&backup_payload("fs", "webdav"), &resolver)?;
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let frames = with_timeout(collect(spawn_execution(task, None, cancel_rx))).await;

    assert_eq!(frames.last(), Some(&ChannelFrame::ExitStatus(0)));
    assert_eq!(
        frames.iter().filter(|f| matches!(f, ChannelFrame::ExitStatus(_))).count(),
        1
    );
    let lines = data_lines(&frames);
    assert!(lines.contains(&"E:fs: reading\n"), "{lines:?}");
    assert!(lines.contains(&"O:{\"key\":\"k1\"}\n"), "{lines:?}");
    Ok(())
}

#[tokio::test]
async fn execution_reports_real_exit_code() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "fs", "echo data")?;
    write_plugin(dir.path(), "webdav", "cat >/dev/null; echo 'no space' >&2; exit 4")?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let task = prepare_task(&backup_payload("fs", "webdav"), &resolver)?;
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let frames = with_timeout(collect(spawn_execution(task, None, cancel_rx))).await;

    assert_eq!(frames.last(), Some(&ChannelFrame::ExitStatus(4)));
    assert_eq!(data_lines(&frames), vec!["E:no space\n"]);
    Ok(())
}

#[tokio::test]
async fn concurrent_executions_do_not_share_state() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "slow", "sleep 0.3; echo slow-data")?;
    write_plugin(dir.path(), "fast", "echo fast-data")?;
    write_plugin(dir.path(), "ok", "cat")?;
    write_plugin(dir.path(), "bad", "cat; exit 2")?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let slow = prepare_task(&backup_payload("slow", "ok"), &resolver)?;
    let fast = prepare_task(&backup_payload("fast", "bad"), &resolver)?;
    let (_c1, r1) = oneshot::channel();
    let (_c2, r2) = oneshot::channel();

    let (slow_frames, fast_frames) = with_timeout(async {
        tokio::join!(
            collect(spawn_execution(slow, None, r1)),
            collect(spawn_execution(fast, None, r2))
        )
    })
    .await;

    assert_eq!(data_lines(&slow_frames), vec!["O:slow-data\n"]);
    assert_eq!(slow_frames.last(), Some(&ChannelFrame::ExitStatus(0)));
    assert_eq!(data_lines(&fast_frames), vec!["O:fast-data\n"]);
    assert_eq!(fast_frames.last(), Some(&ChannelFrame::ExitStatus(2)));
    Ok(())
}

#[tokio::test]
async fn canceled_execution_exits_with_130() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "fs", "sleep 30")?;
    write_plugin(dir.path(), "webdav", "cat")?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let task = prepare_task(&backup_payload("fs", "webdav"), &resolver)?;
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let frames = spawn_execution(task, None, cancel_rx);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = cancel_tx.send(());
    let frames = with_timeout(collect(frames)).await;
    assert_eq!(frames.last(), Some(&ChannelFrame::ExitStatus(130)));
    Ok(())
}

#[tokio::test]
async fn deadline_exceeded_exits_with_124() -> TestResult {
    init_tracing();
    let dir = TempDir::new()?;
    write_plugin(dir.path(), "fs", "sleep 30")?;
    write_plugin(dir.path(), "webdav", "cat")?;
    let resolver = PluginResolver::new(vec![dir.path().to_path_buf()]);

    let task = prepare_task(&backup_payload("fs", "webdav"), &resolver)?;
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let frames = with_timeout(collect(spawn_execution(
        task,
        Some(Duration::from_millis(200)),
        cancel_rx,
    )))
    .await;
    assert_eq!(frames.last(), Some(&ChannelFrame::ExitStatus(124)));
    Ok(())
}

#[test]
fn authorized_keys_skip_comments_and_garbage() -> TestResult {
    let client = std::fs::read_to_string(fixture("client_ed25519.pub"))?;
    let content = format!(
        "# agent access\n\n{client}\nssh-ed25519 not-base64!!\nnonsense line here\ncommand=\"/bin/true\",no-pty {client}\n"
    );
    let keys = AuthorizedKeys::parse(&content);
    assert_eq!(keys.len(), 1);
    assert!(!keys.is_empty());

    assert!(AuthorizedKeys::parse("# nothing here\n").is_empty());
    Ok(())
}

#[test]
fn authorized_keys_load_reports_missing_file() {
    let err = AuthorizedKeys::load(&fixture("does-not-exist")).unwrap_err();
    assert!(matches!(err, ShieldError::ConfigError(_)), "{err:?}");
}
