//! pbshell
//!
//! Interactive SSH shell with timed privilege-escalation automation.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pbshell::config::default_config_path;
use pbshell::{Config, ConsumerRelay, Notice, ReaderState, Session, StdoutSurface};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Environment variable holding the transport password.
const PASSWORD_ENV: &str = "PBSHELL_PASSWORD";

/// Environment variable holding the escalation password.
const ESCALATION_PASSWORD_ENV: &str = "PBSHELL_ESCALATION_PASSWORD";

/// Usage line for the escalate command.
const ESCALATE_USAGE: &str = "usage: ~escalate <target>";

/// pbshell - interactive SSH shell with privilege escalation.
#[derive(Parser, Debug)]
#[command(name = "pbshell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Open an interactive shell on a remote host
    Connect {
        /// Remote host name or address
        #[arg(long, short = 'H')]
        host: String,

        /// Remote port (defaults to the configured port)
        #[arg(long, short)]
        port: Option<u16>,

        /// Username for authentication
        #[arg(long, short)]
        user: String,

        /// Connect timeout in seconds, 1-300 (defaults to the configured timeout)
        #[arg(long, short, value_parser = clap::value_parser!(u64).range(1..=300))]
        timeout: Option<u64>,

        /// Escalate to this identity right after connecting
        #[arg(long, value_name = "TARGET")]
        escalate_to: Option<String>,
    },

    /// Inspect or create the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

/// A line typed by the user during a session.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    /// Forward to the remote shell.
    Text(String),
    /// `~escalate <target>`
    Escalate(String),
    /// A malformed local command; holds the usage line.
    Usage(&'static str),
    /// `~close`
    Close,
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    if trimmed == "~close" {
        return Input::Close;
    }
    if let Some(rest) = trimmed.strip_prefix("~escalate") {
        // `~escalated` and the like are ordinary text.
        if rest.is_empty() || rest.starts_with(char::is_whitespace) {
            let mut words = rest.split_whitespace();
            return match (words.next(), words.next()) {
                (Some(target), None) => Input::Escalate(target.to_string()),
                _ => Input::Usage(ESCALATE_USAGE),
            };
        }
    }
    Input::Text(format!("{line}\n"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();
    config.validate()?;

    let _log_guard = pbshell::logging::init_logging(&config.logging, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Connect {
            host,
            port,
            user,
            timeout,
            escalate_to,
        } => run_session(&config, &host, port, &user, timeout, escalate_to).await,
        Commands::Config(ConfigCommands::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { force }) => init_config(&config_path, force),
    }
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Config::default().save(path)?;
    eprintln!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Reads a secret from `env_var`, or prompts for it on the terminal.
fn read_secret(env_var: &str, prompt: &str) -> anyhow::Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        return Ok(value);
    }
    eprint!("{prompt}");
    rpassword::read_password().context("Failed to read password")
}

/// Forwards stdin lines from a dedicated thread.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn start_escalation(session: &Session, target: &str, secondary: &str) {
    // Failures are already reported on the output stream.
    if let Err(e) = session.escalate(target, secondary) {
        tracing::warn!(target = %target, error = %e, "Escalation not started");
    }
}

async fn run_session(
    config: &Config,
    host: &str,
    port: Option<u16>,
    user: &str,
    timeout: Option<u64>,
    escalate_to: Option<String>,
) -> anyhow::Result<()> {
    let password = read_secret(PASSWORD_ENV, &format!("{user}@{host}'s password: "))?;
    let secondary = match (&escalate_to, std::env::var(ESCALATION_PASSWORD_ENV)) {
        (_, Ok(value)) => value,
        (Some(target), Err(_)) => read_secret(
            ESCALATION_PASSWORD_ENV,
            &format!("password for {target} (empty for none): "),
        )?,
        (None, Err(_)) => String::new(),
    };

    let session = Session::from_config(config);
    let relay = ConsumerRelay::new(
        session.subscribe("stdout"),
        StdoutSurface::stdout(),
        config.relay_interval(),
    );
    let cancel = CancellationToken::new();
    let relay_task = tokio::spawn(relay.run(cancel.clone()));

    let params = config.connect_params(host, port, user, &password, timeout);
    drop(password);
    if let Err(e) = session.connect(params).await {
        cancel.cancel();
        let _ = relay_task.await;
        return Err(e).with_context(|| format!("Failed to connect to {host}"));
    }

    if let Some(target) = &escalate_to {
        start_escalation(&session, target, &secondary);
    }

    let mut input = spawn_stdin_reader();
    let mut state = session.state_changes();
    loop {
        tokio::select! {
            line = input.recv() => {
                let Some(line) = line else { break };
                match parse_input(&line) {
                    Input::Close => break,
                    Input::Escalate(target) => start_escalation(&session, &target, &secondary),
                    Input::Usage(usage) => {
                        session.output().push_notice(&Notice::error(usage));
                    }
                    Input::Text(text) => {
                        let sink = session.clone();
                        tokio::task::spawn_blocking(move || sink.send(&text)).await?;
                    }
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == ReaderState::Stopped {
                    break;
                }
            }
        }
    }

    let closing = session.clone();
    tokio::task::spawn_blocking(move || closing.close()).await?;

    // Let the relay show the final notices before exiting.
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    relay_task.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use tempfile::TempDir;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_connect_command() {
        let cli =
            Cli::try_parse_from(["pbshell", "connect", "--host", "db01", "--user", "alice"])
                .unwrap();
        match cli.command {
            Commands::Connect {
                host,
                port,
                user,
                timeout,
                escalate_to,
            } => {
                assert_eq!(host, "db01");
                assert_eq!(user, "alice");
                assert!(port.is_none());
                assert!(timeout.is_none());
                assert!(escalate_to.is_none());
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_with_all_options() {
        let cli = Cli::try_parse_from([
            "pbshell",
            "-v",
            "connect",
            "-H",
            "db01",
            "-p",
            "2222",
            "-u",
            "alice",
            "-t",
            "5",
            "--escalate-to",
            "appadm",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Connect {
                port,
                timeout,
                escalate_to,
                ..
            } => {
                assert_eq!(port, Some(2222));
                assert_eq!(timeout, Some(5));
                assert_eq!(escalate_to.as_deref(), Some("appadm"));
            }
            _ => panic!("Expected Connect command"),
        }
    }

    #[test]
    fn test_connect_requires_host_and_user() {
        assert!(Cli::try_parse_from(["pbshell", "connect", "--host", "db01"]).is_err());
        assert!(Cli::try_parse_from(["pbshell", "connect", "--user", "alice"]).is_err());
    }

    #[test]
    fn test_config_commands() {
        let cli = Cli::try_parse_from(["pbshell", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Commands::Config(ConfigCommands::Show)));

        let cli = Cli::try_parse_from(["pbshell", "-c", "/tmp/x.toml", "config", "init", "--force"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/x.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigCommands::Init { force: true })
        ));
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(parse_input("ls -la"), Input::Text("ls -la\n".to_string()));
        assert_eq!(parse_input(""), Input::Text("\n".to_string()));
        assert_eq!(parse_input("~close"), Input::Close);
        assert_eq!(
            parse_input("~escalate appadm"),
            Input::Escalate("appadm".to_string())
        );
        assert_eq!(parse_input("echo ~close"), Input::Text("echo ~close\n".to_string()));
    }

    #[test]
    fn test_escalate_without_target_is_not_forwarded() {
        assert_eq!(parse_input("~escalate"), Input::Usage(ESCALATE_USAGE));
        assert_eq!(parse_input("  ~escalate   "), Input::Usage(ESCALATE_USAGE));
        assert_eq!(parse_input("~escalate app adm"), Input::Usage(ESCALATE_USAGE));
        assert_eq!(
            parse_input("~escalate\tappadm"),
            Input::Escalate("appadm".to_string())
        );
        assert_eq!(
            parse_input("~escalated"),
            Input::Text("~escalated\n".to_string())
        );
    }

    #[test]
    fn test_connect_timeout_must_be_in_range() {
        for bad in ["0", "301", "-1"] {
            assert!(
                Cli::try_parse_from([
                    "pbshell", "connect", "-H", "db01", "-u", "alice", "--timeout", bad
                ])
                .is_err(),
                "timeout {bad} accepted"
            );
        }
        let cli = Cli::try_parse_from([
            "pbshell", "connect", "-H", "db01", "-u", "alice", "--timeout", "300",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Connect {
                timeout: Some(300),
                ..
            }
        ));
    }

    #[test]
    fn test_init_config_refuses_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        init_config(&path, false).unwrap();
        assert!(path.exists());
        assert!(init_config(&path, false).is_err());
        assert!(init_config(&path, true).is_ok());
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }
}
