// tests/agent_ssh.rs

mod common;
use crate::common::builders::{backup_task, write_plugin};
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg};
use russh_keys::key::PublicKey;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

use shield::agent::{
    load_private_key, AgentContext, AgentServer, AgentStatus, AuthorizedKeys, PluginResolver,
    RemoteRunner,
};
use shield::errors::ShieldError;
use shield::exec::{OutputLine, Runner, TaskExecutor};

type TestResult = Result<(), Box<dyn Error>>;

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Start an agent on an ephemeral port that trusts the fixture client key
/// and looks plugins up in `plugin_dir`.
async fn start_agent(plugin_dir: &TempDir, task_timeout: Option<Duration>) -> Result<SocketAddr, Box<dyn Error>> {
    let authorized = AuthorizedKeys::load(&fixture("client_ed25519.pub"))?;
    let host_key = load_private_key(&fixture("host_ed25519"))?;
    let context = AgentContext {
        name: "test-agent".to_string(),
        authorized,
        resolver: PluginResolver::new(vec![plugin_dir.path().to_path_buf()]),
        task_timeout,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(AgentServer::new(context, host_key).serve(listener));
    Ok(addr)
}

fn client(key: &str) -> Result<RemoteRunner, ShieldError> {
    RemoteRunner::from_key_file(&fixture(key), "shield")
}

async fn run_remote(
    runner: &RemoteRunner,
    addr: SocketAddr,
    task: &shield::model::Task,
    cancel: oneshot::Receiver<()>,
) -> (shield::errors::Result<()>, Vec<OutputLine>) {
    let (tx, mut rx) = mpsc::channel(16);
    let collect = async {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    };
    let addr = addr.to_string();
    tokio::join!(runner.run(&addr, task, tx, cancel, None), collect)
}

#[tokio::test]
async fn remote_backup_streams_output_and_succeeds() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo 'fs: scanning' >&2; echo blob")?;
    write_plugin(plugins.path(), "webdav", r#"cat >/dev/null; echo '{"key":"remote-1"}'"#)?;
    let addr = start_agent(&plugins, None).await?;

    let runner = client("client_ed25519")?;
    let task = backup_task("fs", "webdav");
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let (res, lines) = with_timeout(run_remote(&runner, addr, &task, cancel_rx)).await;

    res?;
    assert!(lines.contains(&OutputLine::stderr("fs: scanning")), "{lines:?}");
    assert!(lines.contains(&OutputLine::stdout(r#"{"key":"remote-1"}"#)), "{lines:?}");
    Ok(())
}

#[tokio::test]
async fn remote_failure_carries_exit_code() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo blob")?;
    write_plugin(plugins.path(), "webdav", "cat >/dev/null; exit 5")?;
    let addr = start_agent(&plugins, None).await?;

    let runner = client("client_ed25519")?;
    let task = backup_task("fs", "webdav");
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let (res, _lines) = with_timeout(run_remote(&runner, addr, &task, cancel_rx)).await;

    assert!(matches!(res, Err(ShieldError::ProcessFailed { code: Some(5) })), "{res:?}");
    Ok(())
}

#[tokio::test]
async fn agent_rejects_unknown_plugin_without_running_anything() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo blob")?;
    let addr = start_agent(&plugins, None).await?;

    let runner = client("client_ed25519")?;
    let task = backup_task("fs", "missing-store");
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let (res, lines) = with_timeout(run_remote(&runner, addr, &task, cancel_rx)).await;

    assert!(matches!(res, Err(ShieldError::Validation(_))), "{res:?}");
    assert!(lines.is_empty(), "{lines:?}");
    Ok(())
}

#[tokio::test]
async fn unknown_client_key_is_refused() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo blob")?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    // The host key is not in the agent's authorized set.
    let runner = client("host_ed25519")?;
    let task = backup_task("fs", "webdav");
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    let (res, _lines) = with_timeout(run_remote(&runner, addr, &task, cancel_rx)).await;

    assert!(matches!(res, Err(ShieldError::Protocol(_))), "{res:?}");
    Ok(())
}

#[tokio::test]
async fn canceling_remote_task_returns_canceled() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    let marker = plugins.path().join("finished");
    write_plugin(
        plugins.path(),
        "fs",
        &format!("sleep 2; touch '{}'", marker.display()),
    )?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    let runner = client("client_ed25519")?;
    let task = backup_task("fs", "webdav");
    let (cancel_tx, cancel_rx) = oneshot::channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = cancel_tx.send(());
    });

    let (res, _lines) = with_timeout(run_remote(&runner, addr, &task, cancel_rx)).await;
    assert!(matches!(res, Err(ShieldError::Canceled)), "{res:?}");

    // Closing the session kills the remote pipeline.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!marker.exists());
    Ok(())
}

#[tokio::test]
async fn runner_forwards_agent_tasks_over_ssh() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo remote-row")?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    let runner = Runner::new(Some(Duration::from_secs(5))).with_remote(client("client_ed25519")?);
    let mut task = backup_task("fs", "webdav");
    task.agent = Some(addr.to_string());

    let (tx, mut rx) = mpsc::channel(8);
    let (_cancel_tx, cancel_rx) = oneshot::channel();
    with_timeout(runner.execute(&task, tx, cancel_rx)).await?;
    assert_eq!(rx.recv().await, Some(OutputLine::stdout("remote-row")));
    Ok(())
}

// Channel-level behaviour, driven through a bare SSH client.

struct TrustAnyHost;

#[async_trait]
impl client::Handler for TrustAnyHost {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect_raw(addr: SocketAddr) -> Result<client::Handle<TrustAnyHost>, Box<dyn Error>> {
    let mut session = client::connect(Arc::new(client::Config::default()), addr, TrustAnyHost).await?;
    let key = load_private_key(&fixture("client_ed25519"))?;
    if !session.authenticate_publickey("shield", Arc::new(key)).await? {
        return Err("agent refused the client key".into());
    }
    Ok(session)
}

fn backup_payload(target: &str, store: &str) -> String {
    format!(
        r#"{{"operation":"backup","target_plugin":"{target}","target_endpoint":"{{}}","store_plugin":"{store}","store_endpoint":"{{}}"}}"#
    )
}

/// Everything the agent sent on one channel until it closed.
#[derive(Debug, Default)]
struct Transcript {
    successes: usize,
    failures: usize,
    data: String,
    exit_statuses: Vec<u32>,
    closed: bool,
}

async fn transcript(channel: &mut Channel<client::Msg>) -> Transcript {
    let mut t = Transcript::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success => t.successes += 1,
            ChannelMsg::Failure => t.failures += 1,
            ChannelMsg::Data { data } => t.data.push_str(&String::from_utf8_lossy(&data)),
            ChannelMsg::ExitStatus { exit_status } => t.exit_statuses.push(exit_status),
            ChannelMsg::Close => {
                t.closed = true;
                break;
            }
            _ => {}
        }
    }
    t
}

#[tokio::test]
async fn channels_on_one_connection_run_independently() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "slow", "sleep 0.5; echo slow-data")?;
    write_plugin(plugins.path(), "fast", "echo fast-data")?;
    write_plugin(plugins.path(), "ok", "cat")?;
    write_plugin(plugins.path(), "bad", "cat; exit 2")?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut slow = session.channel_open_session().await?;
    let mut fast = session.channel_open_session().await?;
    slow.exec(true, backup_payload("slow", "ok")).await?;
    fast.exec(true, backup_payload("fast", "bad")).await?;

    let (slow_t, fast_t) =
        with_timeout(async { tokio::join!(transcript(&mut slow), transcript(&mut fast)) }).await;

    assert_eq!(slow_t.successes, 1, "{slow_t:?}");
    assert_eq!(slow_t.data, "O:slow-data\n");
    assert_eq!(slow_t.exit_statuses, vec![0]);
    assert!(slow_t.closed);

    assert_eq!(fast_t.successes, 1, "{fast_t:?}");
    assert_eq!(fast_t.data, "O:fast-data\n");
    assert_eq!(fast_t.exit_statuses, vec![2]);
    assert!(fast_t.closed);
    Ok(())
}

#[tokio::test]
async fn shell_and_env_are_refused_but_exec_still_works() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo blob")?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.request_shell(true).await?;
    channel.set_env(true, "LANG", "C").await?;
    channel.exec(true, backup_payload("fs", "webdav")).await?;

    let t = with_timeout(transcript(&mut channel)).await;
    assert_eq!(t.failures, 2, "{t:?}");
    assert_eq!(t.successes, 1, "{t:?}");
    assert_eq!(t.data, "O:blob\n");
    assert_eq!(t.exit_statuses, vec![0]);
    Ok(())
}

#[tokio::test]
async fn second_exec_on_a_channel_is_refused() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "sleep 0.5; echo blob")?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, backup_payload("fs", "webdav")).await?;
    channel.exec(true, backup_payload("fs", "webdav")).await?;

    let t = with_timeout(transcript(&mut channel)).await;
    assert_eq!(t.successes, 1, "{t:?}");
    assert_eq!(t.failures, 1, "{t:?}");
    assert_eq!(t.data, "O:blob\n");
    assert_eq!(t.exit_statuses, vec![0]);
    Ok(())
}

#[tokio::test]
async fn invalid_restore_request_gets_failure_and_no_data() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "echo blob")?;
    write_plugin(plugins.path(), "webdav", "cat")?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel
        .exec(
            true,
            r#"{"operation":"restore","target_plugin":"fs","target_endpoint":"{}","store_plugin":"webdav","store_endpoint":"{}"}"#,
        )
        .await?;

    let t = with_timeout(transcript(&mut channel)).await;
    assert_eq!(t.failures, 1, "{t:?}");
    assert_eq!(t.successes, 0);
    assert!(t.data.is_empty(), "{t:?}");
    assert!(t.exit_statuses.is_empty());
    assert!(t.closed);
    Ok(())
}

#[tokio::test]
async fn rejected_exec_without_reply_closes_the_channel() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.exec(false, r#"{"operation":"purge"}"#).await?;

    let t = with_timeout(transcript(&mut channel)).await;
    assert!(t.closed, "{t:?}");
    assert_eq!(t.failures, 0);
    assert!(t.data.is_empty());
    assert!(t.exit_statuses.is_empty());
    Ok(())
}

#[tokio::test]
async fn status_request_reports_agent_over_ssh() -> TestResult {
    init_tracing();
    let plugins = TempDir::new()?;
    write_plugin(plugins.path(), "fs", "true")?;
    let addr = start_agent(&plugins, None).await?;

    let session = connect_raw(addr).await?;
    let mut channel = session.channel_open_session().await?;
    channel.exec(true, r#"{"operation":"status"}"#).await?;

    let t = with_timeout(transcript(&mut channel)).await;
    assert_eq!(t.successes, 1, "{t:?}");
    assert_eq!(t.exit_statuses, vec![0]);
    let json = t
        .data
        .lines()
        .find_map(|l| l.strip_prefix("O:"))
        .ok_or("no status line")?;
    let status: AgentStatus = serde_json::from_str(json)?;
    assert_eq!(status.name, "test-agent");
    assert_eq!(status.health, "ok");
    assert!(status.plugins.contains_key("fs"), "{status:?}");
    Ok(())
}
