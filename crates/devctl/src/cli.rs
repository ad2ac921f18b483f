//! Command line entry point for the `devctl` client.
//!
//! # Usage
//!
//! ```text
//! devctl start web --dir ./web --env PORT=3000 -- pnpm dev
//! devctl stop web
//! devctl stop db --dir ./infra -- docker compose down
//! devctl run --dir ./api -- pnpm prisma migrate deploy
//! devctl logs web
//! devctl ls
//! devctl top
//! devctl ping
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use devctl_core::{CommandSpec, EntryId};
use devctl_protocol::DaemonMessage;

use crate::client::{ClientConfig, DaemonClient};
use crate::daemon::ensure_daemon_running;
use crate::format::{format_entries, format_snapshot};

/// Prefix of daemon-authored log lines
const NOTICE_PREFIX: &str = "[devctl]";

/// devctl - run and watch local dev servers
#[derive(Parser, Debug)]
#[command(name = "devctl", version, about)]
struct Args {
    /// Daemon socket (defaults to $DEVCTL_SOCKET or /tmp/devctl.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Do not start the daemon if it is not running
    #[arg(long, global = true)]
    no_autostart: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a supervised service (no-op if it is already running)
    Start {
        /// Service id
        id: String,

        /// Working directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Environment override, KEY=VALUE (repeatable)
        #[arg(short, long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Follow the service's output after starting it
        #[arg(short, long)]
        follow: bool,

        /// Binary and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a service and kill its whole process tree
    Stop {
        /// Service or job id
        id: String,

        /// Directory for the shutdown command
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Shutdown command to run once the tree is dead
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// Run a one-off command and stream its output
    Run {
        /// Working directory
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Print the job id and return without streaming
        #[arg(long)]
        detach: bool,

        /// Binary and arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Follow the live output of a service or job
    Logs {
        /// Service or job id
        id: String,
    },

    /// List services and jobs
    Ls,

    /// Show aggregate memory usage
    Top {
        /// Print one snapshot and exit
        #[arg(long)]
        once: bool,
    },

    /// Check that the daemon answers
    Ping,
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Splits `[binary, args...]` into a command.
fn command_from(words: Vec<String>) -> Option<CommandSpec> {
    let mut words = words.into_iter();
    let binary = words.next()?;
    Some(CommandSpec::new(binary, words))
}

/// Resolves a user-supplied directory against the current one, since the
/// daemon runs elsewhere.
fn absolute(dir: &Path) -> Result<PathBuf> {
    if dir.is_absolute() {
        return Ok(dir.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    Ok(cwd.join(dir))
}

/// Parses arguments and runs the selected subcommand.
pub fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = ClientConfig::from_env();
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    if !args.no_autostart {
        if let Err(e) = ensure_daemon_running(&config.socket_path) {
            bail!("{e}");
        }
    }

    let code = run(config, args.command)?;
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

#[tokio::main]
async fn run(config: ClientConfig, command: Command) -> Result<i32> {
    let mut client = DaemonClient::connect(&config).await?;

    let code = match command {
        Command::Start {
            id,
            dir,
            env,
            follow,
            command,
        } => {
            let spec = command_from(command).context("missing command")?;
            let id = EntryId::new(id);
            let env: BTreeMap<String, String> = env.into_iter().collect();

            if follow {
                client.subscribe(id.clone()).await?;
            }
            client.start(id.clone(), absolute(&dir)?, spec, env).await?;
            println!("started {id}");

            if follow {
                stream_logs(&mut client, None).await?;
            }
            0
        }

        Command::Stop { id, dir, command } => {
            let id = EntryId::new(id);
            let directory = dir.as_deref().map(absolute).transpose()?;
            client.stop(id.clone(), command_from(command), directory).await?;
            println!("stopped {id}");
            0
        }

        Command::Run {
            dir,
            detach,
            command,
        } => {
            let spec = command_from(command).context("missing command")?;
            let job = client
                .run_one_off(absolute(&dir)?, spec, !detach)
                .await?;
            if detach {
                println!("{job}");
                0
            } else {
                stream_logs(&mut client, Some(&job)).await?
            }
        }

        Command::Logs { id } => {
            let id = EntryId::new(id);
            client.subscribe(id.clone()).await?;
            let finish = id.is_job().then_some(&id);
            stream_logs(&mut client, finish).await?
        }

        Command::Ls => {
            let entries = client.list_entries().await?;
            print!("{}", format_entries(&entries, Utc::now()));
            0
        }

        Command::Top { once } => {
            client.watch_resources().await?;
            while let Some(msg) = client.next_message().await? {
                if let DaemonMessage::Resources { snapshot } = msg {
                    if !once {
                        // Clear the screen between frames
                        print!("\x1b[2J\x1b[H");
                    }
                    print!("{}", format_snapshot(&snapshot));
                    std::io::stdout().flush().ok();
                    if once {
                        break;
                    }
                }
            }
            0
        }

        Command::Ping => {
            let rtt = client.ping(1).await?;
            println!("pong from devctld ({} µs, {})", rtt.as_micros(), client.client_id());
            0
        }
    };

    client.disconnect().await;
    Ok(code)
}

/// Prints log lines until the connection closes or, for a job, until its
/// finish notice. Returns 1 if the job did not exit with code 0.
async fn stream_logs(client: &mut DaemonClient, job: Option<&EntryId>) -> Result<i32> {
    let mut stdout = std::io::stdout();

    loop {
        let message = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(130),
            message = client.next_message() => message?,
        };

        match message {
            Some(DaemonMessage::Log { id, text }) => {
                stdout.write_all(text.as_bytes()).ok();
                stdout.flush().ok();

                if job == Some(&id) {
                    if let Some(outcome) = finish_notice(&text) {
                        return Ok(if outcome == "exit code 0" { 0 } else { 1 });
                    }
                }
            }
            Some(_) => {}
            None => return Ok(0),
        }
    }
}

/// Extracts the outcome from a `job finished (...)` notice.
fn finish_notice(text: &str) -> Option<&str> {
    text.trim_end()
        .strip_prefix(NOTICE_PREFIX)?
        .trim_start()
        .strip_prefix("job finished (")?
        .strip_suffix(')')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_pair() {
        assert_eq!(
            parse_env_pair("PORT=3000"),
            Ok(("PORT".to_string(), "3000".to_string()))
        );
        assert_eq!(
            parse_env_pair("URL=a=b"),
            Ok(("URL".to_string(), "a=b".to_string()))
        );
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("PORT").is_err());
    }

    #[test]
    fn test_start_args() {
        let args = Args::try_parse_from([
            "devctl", "start", "web", "--dir", "./web", "-e", "PORT=3000", "--", "pnpm", "dev",
        ])
        .unwrap();

        match args.command {
            Command::Start {
                id, env, command, ..
            } => {
                assert_eq!(id, "web");
                assert_eq!(env, vec![("PORT".to_string(), "3000".to_string())]);
                let spec = command_from(command).unwrap();
                assert_eq!(spec.binary, "pnpm");
                assert_eq!(spec.args, vec!["dev".to_string()]);
            }
            other => panic!("Expected Start, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_without_shutdown_command() {
        let args = Args::try_parse_from(["devctl", "stop", "web"]).unwrap();
        match args.command {
            Command::Stop { command, dir, .. } => {
                assert!(command_from(command).is_none());
                assert!(dir.is_none());
            }
            other => panic!("Expected Stop, got {other:?}"),
        }
    }

    #[test]
    fn test_finish_notice() {
        assert_eq!(
            finish_notice("[devctl] job finished (exit code 2)\n"),
            Some("exit code 2")
        );
        assert_eq!(finish_notice("job finished (exit code 0)"), None);
        assert_eq!(finish_notice("[devctl] stopped\n"), None);
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(absolute(Path::new("/srv/app")).unwrap(), PathBuf::from("/srv/app"));
        assert!(absolute(Path::new("web")).unwrap().is_absolute());
    }
}
