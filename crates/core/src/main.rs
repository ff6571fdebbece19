use std::sync::Arc;
use std::time::Duration;

use doseguard_channel::provider::{AlarmExtra, ChannelEvent, ChannelKind};
use doseguard_core::bus::EventReceiver;
use doseguard_core::config::DoseguardCfg;
use doseguard_core::service::Service;
use doseguard_core::types::AlarmHandle;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;
const LOG_FILE: &str = "/tmp/doseguard.log";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The REPL owns stdout, so logs go to a file when RUST_LOG is set.
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create(LOG_FILE)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let mut startup_notice: Option<String> = None;
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let connect_result = tokio::time::timeout(
                Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
                sqlx::postgres::PgPoolOptions::new()
                    .max_connections(8)
                    .connect(&url),
            )
            .await;

            match connect_result {
                Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
                    Ok(()) => {
                        tracing::info!("database connected and migrations applied");
                        Some(pool)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "database migration failed, falling back to ephemeral mode");
                        startup_notice = Some("note: migrations failed, running in ephemeral mode (nothing is persisted)".into());
                        None
                    }
                },
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "database connection failed, falling back to ephemeral mode");
                    startup_notice = Some("note: cannot reach DATABASE_URL, running in ephemeral mode (nothing is persisted)".into());
                    None
                }
                Err(_) => {
                    tracing::warn!(timeout_secs = DB_CONNECT_TIMEOUT_SECS, "database connection timed out");
                    startup_notice = Some(format!(
                        "note: database connection timed out ({DB_CONNECT_TIMEOUT_SECS}s), running in ephemeral mode"
                    ));
                    None
                }
            }
        }
        Err(_) => None,
    };

    let cfg = match &pool {
        Some(pool) => DoseguardCfg::load(pool).await?,
        None => DoseguardCfg::default(),
    };

    let mut service = Service::new(Arc::new(cfg), pool);
    service.start();
    let token = service.token();
    spawn_sigint_canceler(token.clone());

    if let Some(notice) = startup_notice {
        println!("{notice}");
    }
    let scheduled = service.scheduler.schedule_pending().await;
    println!("doseguard ready: {scheduled} reminder(s) scheduled. /help for commands.");

    let result = run_repl(&service, service.bus.subscribe(), token).await;
    service.shutdown().await;
    result
}

/// One REPL command line.
#[derive(Debug, PartialEq)]
enum Command {
    Sync,
    Test(Option<u64>),
    Cancel(String),
    Pending,
    Perm,
    Request,
    Ack(AlarmHandle, String),
    Stats(Option<i64>),
    State(String),
    Help,
    Quit,
}

impl Command {
    fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let arg = parts.next();
        let cmd = match head {
            "/sync" => Command::Sync,
            "/test" => Command::Test(parse_opt(arg, "seconds")?),
            "/cancel" => Command::Cancel(required(arg, "occurrence id")?),
            "/pending" => Command::Pending,
            "/perm" => Command::Perm,
            "/request" => Command::Request,
            "/ack" => {
                let handle: u32 = required(arg, "handle")?
                    .parse()
                    .map_err(|_| "handle must be a number".to_owned())?;
                let action = parts.next().unwrap_or("tap").to_owned();
                Command::Ack(AlarmHandle(handle), action)
            }
            "/stats" => Command::Stats(parse_opt(arg, "days")?),
            "/state" => Command::State(required(arg, "occurrence id")?),
            "/help" => Command::Help,
            "/q" | "/quit" | "/exit" => Command::Quit,
            other => return Err(format!("unknown command: {other}")),
        };
        Ok(cmd)
    }
}

fn required(arg: Option<&str>, what: &str) -> Result<String, String> {
    arg.map(str::to_owned).ok_or_else(|| format!("missing {what}"))
}

fn parse_opt<T: std::str::FromStr>(arg: Option<&str>, what: &str) -> Result<Option<T>, String> {
    arg.map(|a| a.parse().map_err(|_| format!("{what} must be a number")))
        .transpose()
}

const HELP: &str = "\
/sync                  schedule doses due in the look-ahead window
/test [secs]           schedule a test alarm
/cancel <id>           cancel an occurrence
/pending               list alarms queued on the local channel
/perm                  show channel permissions
/request               request channel permissions
/ack <handle> [action] simulate a user tapping an alarm
/stats [days]          delivery statistics
/state <id>            lifecycle state of an occurrence
/q                     quit";

async fn run_repl(service: &Service, mut domain_rx: EventReceiver, token: CancellationToken) -> anyhow::Result<()> {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = domain_rx.recv() => {
                match event {
                    Ok(event) => println!("\r[event] {}", serde_json::to_string(&event)?),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "domain event printer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line {
                    InputEvent::Line(line) => {
                        let text = line.trim();
                        if !text.is_empty() {
                            match Command::parse(text) {
                                Ok(Command::Quit) => break,
                                Ok(cmd) => execute(service, cmd).await?,
                                Err(msg) => println!("{msg}"),
                            }
                        }
                        request_next_prompt(&ready_tx);
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => break,
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
        }
    }
    drop(ready_tx);
    println!();
    Ok(())
}

async fn execute(service: &Service, cmd: Command) -> anyhow::Result<()> {
    let scheduler = &service.scheduler;
    match cmd {
        Command::Sync => {
            let n = scheduler.schedule_pending().await;
            println!("{n} reminder(s) scheduled");
        }
        Command::Test(secs) => {
            let outcome = scheduler.send_test(secs).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Cancel(id) => {
            scheduler.cancel(&id).await;
            println!("cancelled {id}");
        }
        Command::Pending => {
            let pending = scheduler.pending().await;
            if pending.is_empty() {
                println!("no pending alarms");
            }
            for alarm in pending {
                println!("{:>9}  {}  {}  {}", alarm.handle, alarm.fire_at.to_rfc3339(), alarm.title, alarm.body);
            }
        }
        Command::Perm => {
            let report = scheduler.permissions().check_all().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Request => {
            let report = scheduler.permissions().request_all().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Ack(handle, action_id) => {
            let event = ChannelEvent::Interacted {
                source: ChannelKind::Native,
                handle,
                action_id,
                extra: AlarmExtra::default(),
            };
            service.events().send(event).await?;
        }
        Command::Stats(days) => {
            let days = days.unwrap_or(service.cfg.stats_window_days);
            match service.telemetry.stats(days).await {
                Ok(stats) => println!("{}", serde_json::to_string_pretty(&stats)?),
                Err(e) => println!("stats unavailable: {e}"),
            }
        }
        Command::State(id) => println!("{id}: {}", scheduler.state_of(&id).as_str()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(line_tx: mpsc::UnboundedSender<InputEvent>, ready_rx: std::sync::mpsc::Receiver<()>) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("doseguard> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}

fn spawn_sigint_canceler(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });
}
