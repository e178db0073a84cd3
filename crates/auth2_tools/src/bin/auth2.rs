#![forbid(unsafe_code)]

use std::env;
use std::io::{self, Write};
use std::sync::Arc;

use auth2_adapter::{serve, IngressState};
use auth2_contracts::readiness::{AuthenticationOutcome, GateBlocker, ReadinessState};
use auth2_contracts::token::{NewToken, TokenAlg, TokenId};
use auth2_engines::key_envelope::{EncryptedKeyEnvelope, EnvelopeError};
use auth2_os::config::Auth2Config;
use auth2_os::readiness_gate::{GateError, ReadinessGate};
use auth2_os::runtime::{AppRuntime, MainSession};
use auth2_tools::forward::forward_link;
use auth2_tools::key_cli::execute_key_command;
use auth2_tools::shell::{
    emit_import_reports, format_code_line, format_token_row, parse_command, ShellCommand, HELP,
};
use auth2_tools::terminal::{
    confirm_reset, prompt_line, prompt_secret, read_new_user_key, TerminalAuthenticator,
    RESET_WORD, STDIN_CLOSED,
};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: auth2 <run | open <url> | key status>";

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(2);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("AUTH2_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run() -> Result<(), String> {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = Auth2Config::from_env().map_err(|e| e.to_string())?;
    match args.first().map(String::as_str) {
        Some("run") if args.len() == 1 => run_interactive(&config).await,
        Some("open") => {
            let link = args
                .get(1)
                .ok_or_else(|| "usage: auth2 open <url>".to_string())?;
            let base = config.ingress_base_url();
            let link = link.clone();
            let status = tokio::task::spawn_blocking(move || forward_link(&base, &link))
                .await
                .map_err(|e| e.to_string())??;
            println!("{status}");
            Ok(())
        }
        Some("key") => {
            let subcommand = args
                .get(1)
                .ok_or_else(|| "usage: auth2 key status".to_string())?
                .clone();
            let keystore = config.keystore_dir.clone();
            let output = tokio::task::spawn_blocking(move || {
                execute_key_command(&EncryptedKeyEnvelope::for_dir(keystore), &subcommand)
            })
            .await
            .map_err(|e| e.to_string())??;
            println!("{output}");
            Ok(())
        }
        _ => Err(USAGE.to_string()),
    }
}

async fn run_interactive(config: &Auth2Config) -> Result<(), String> {
    let app = AppRuntime::from_config(config, Arc::new(TerminalAuthenticator));

    // Links are accepted from launch; the buffer holds them until the
    // token list attaches.
    let listener = tokio::net::TcpListener::bind(config.http_bind)
        .await
        .map_err(|e| format!("failed to bind link ingress on {}: {e}", config.http_bind))?;
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let ingress = tokio::spawn(serve(
        listener,
        IngressState::new(app.links().clone(), app.gate().subscribe()),
        async move {
            let _ = stop_rx.await;
        },
    ));

    let result = match drive_gate(app.gate()).await {
        Ok(()) => match app.open_main_session().await {
            Ok(session) => run_shell(&session).await,
            Err(err) => Err(err.to_string()),
        },
        Err(err) => Err(err),
    };

    let _ = stop_tx.send(());
    match ingress.await {
        Ok(Err(err)) => tracing::warn!(error = %err, "link ingress stopped with error"),
        Err(err) => tracing::warn!(error = %err, "link ingress task failed"),
        Ok(Ok(())) => {}
    }
    result
}

async fn drive_gate(gate: &ReadinessGate) -> Result<(), String> {
    loop {
        let status = gate.status();
        match (status.state, status.blocker) {
            (ReadinessState::Ready, _) => return Ok(()),
            (ReadinessState::Migrating, Some(GateBlocker::MigrationFailed { message })) => {
                println!("Database migration failed: {message}");
                println!("Resetting deletes every stored token and cannot be undone.");
                let answer = blocking_prompt(format!(
                    "Type {RESET_WORD} to reset and retry, anything else to quit: "
                ))
                .await?;
                let confirmation = answer
                    .as_deref()
                    .and_then(confirm_reset)
                    .ok_or_else(|| format!("database migration failed: {message}"))?;
                gate.reset_and_migrate(confirmation)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            (ReadinessState::AwaitingAuthentication, _) => {
                match gate.authenticate().await.map_err(|e| e.to_string())? {
                    AuthenticationOutcome::Succeeded => {}
                    AuthenticationOutcome::Failed => println!("Not confirmed. Try again."),
                    AuthenticationOutcome::Error(message) if message == STDIN_CLOSED => {
                        return Err("authentication aborted: input closed".to_string());
                    }
                    AuthenticationOutcome::Error(message) => {
                        println!("Authentication error: {message}. Try again.");
                    }
                }
            }
            (ReadinessState::AwaitingEncryptionKey, Some(GateBlocker::EncryptionKeyRequired)) => {
                println!("Choose the encryption key for your tokens. It cannot be changed later.");
                let key = match tokio::task::spawn_blocking(read_new_user_key)
                    .await
                    .map_err(|e| e.to_string())?
                {
                    Ok(key) => key,
                    Err(err) if err == STDIN_CLOSED => return Err(err),
                    Err(err) => {
                        println!("{err}");
                        continue;
                    }
                };
                match gate.commit_encryption_key(key).await {
                    Ok(()) => {}
                    // Set elsewhere meanwhile; re-resolve from storage.
                    Err(GateError::Envelope(EnvelopeError::AlreadySet)) => {
                        gate.resolve_encryption_key()
                            .await
                            .map_err(|e| e.to_string())?;
                    }
                    Err(err) => return Err(err.to_string()),
                }
            }
            (_, Some(GateBlocker::EnvelopeCorrupt { message })) => {
                return Err(format!(
                    "stored encryption key cannot be read ({message}); tokens are inaccessible"
                ));
            }
            _ => {
                gate.advance().await.map_err(|e| e.to_string())?;
            }
        }
    }
}

async fn run_shell(session: &MainSession) -> Result<(), String> {
    let report_printer = tokio::spawn(emit_import_reports(
        session.consumer.reports(),
        |line| println!("\n{line}"),
    ));

    println!("{HELP}");
    let result = loop {
        let Some(line) = blocking_prompt("auth2> ".to_string()).await? else {
            break Ok(());
        };
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        let outcome = match command {
            ShellCommand::Quit => break Ok(()),
            ShellCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            ShellCommand::List => list_tokens(session).await,
            ShellCommand::Show(id) => show_token(session, id).await,
            ShellCommand::Add => add_token(session).await,
            ShellCommand::Remove(id) => session
                .consumer
                .remove_token(id)
                .await
                .map(|()| println!("removed {id}"))
                .map_err(|e| e.to_string()),
        };
        if let Err(err) = outcome {
            println!("error: {err}");
        }
    };
    report_printer.abort();
    result
}

async fn list_tokens(session: &MainSession) -> Result<(), String> {
    let tokens = session.consumer.reload().await.map_err(|e| e.to_string())?;
    if tokens.is_empty() {
        println!("no tokens yet; add one or open an otpauth:// link");
    }
    for token in &tokens {
        println!("{}", format_token_row(token));
    }
    Ok(())
}

async fn show_token(session: &MainSession, id: TokenId) -> Result<(), String> {
    let detail = session
        .consumer
        .token_detail(id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no token {id}"))?;
    let label = detail.label();

    let view = session.scheduler.activate(id);
    let mut state = view.watch();
    let printer = tokio::spawn(async move {
        loop {
            let line = format_code_line(&label, &state.borrow_and_update());
            print!("\r\x1b[2K{line}  (Enter to close)");
            let _ = io::stdout().flush();
            if state.changed().await.is_err() {
                break;
            }
        }
    });

    let closed = blocking_prompt(String::new()).await;
    printer.abort();
    view.deactivate();
    closed.map(|_| ())
}

async fn add_token(session: &MainSession) -> Result<(), String> {
    let account = blocking_prompt("account: ".to_string())
        .await?
        .ok_or_else(|| STDIN_CLOSED.to_string())?;
    let service = blocking_prompt("service (optional): ".to_string())
        .await?
        .filter(|s| !s.trim().is_empty());
    let secret = tokio::task::spawn_blocking(|| prompt_secret("secret (base32): "))
        .await
        .map_err(|e| e.to_string())??;
    let algorithm = match blocking_prompt("algorithm [SHA1]: ".to_string()).await? {
        Some(raw) if !raw.trim().is_empty() => Some(
            TokenAlg::parse(&raw).ok_or_else(|| format!("unknown algorithm: {}", raw.trim()))?,
        ),
        _ => None,
    };
    let digits = parse_optional::<u8>(blocking_prompt("digits [6]: ".to_string()).await?)?;
    let period = parse_optional::<u32>(blocking_prompt("period [30]: ".to_string()).await?)?;

    let token = NewToken::v1(account, service, secret, algorithm, digits, period)
        .map_err(|e| e.to_string())?;
    let detail = session
        .consumer
        .add_token(token)
        .await
        .map_err(|e| e.to_string())?;
    println!("added token {}: {}", detail.id, detail.label());
    Ok(())
}

fn parse_optional<T: std::str::FromStr>(raw: Option<String>) -> Result<Option<T>, String> {
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("not a number: {s}")),
    }
}

async fn blocking_prompt(prompt: String) -> Result<Option<String>, String> {
    tokio::task::spawn_blocking(move || prompt_line(&prompt))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
}
