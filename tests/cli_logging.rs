// tests/cli_logging.rs

use clap::Parser;
use tracing::Level;

use shield::cli::{CliArgs, Command, LogLevel};
use shield::logging::effective_level;

#[test]
fn cli_flag_wins_over_environment() {
    assert_eq!(effective_level(Some(LogLevel::Debug), Some("error")), Level::DEBUG);
    assert_eq!(effective_level(None, Some(" WARNING ")), Level::WARN);
    assert_eq!(effective_level(None, Some("chatty")), Level::INFO);
    assert_eq!(effective_level(None, None), Level::INFO);
}

#[test]
fn supervisor_subcommand_defaults() {
    let args = CliArgs::try_parse_from(["shield", "supervisor"]).expect("parse");
    assert!(args.log_level.is_none());
    match args.command {
        Command::Supervisor { config, dry_run } => {
            assert_eq!(config, "shield.toml");
            assert!(!dry_run);
        }
        other => panic!("unexpected command {other:?}"),
    }
}

#[test]
fn global_log_level_after_subcommand() {
    let args = CliArgs::try_parse_from([
        "shield",
        "agent",
        "--config",
        "/etc/shield/agent.toml",
        "--log-level",
        "trace",
    ])
    .expect("parse");
    assert!(matches!(args.log_level, Some(LogLevel::Trace)));
    assert!(matches!(args.command, Command::Agent { ref config } if config == "/etc/shield/agent.toml"));
}

#[test]
fn unknown_subcommand_is_rejected() {
    assert!(CliArgs::try_parse_from(["shield", "restore"]).is_err());
    assert!(CliArgs::try_parse_from(["shield"]).is_err());
}
