#![forbid(unsafe_code)]

use auth2_contracts::token::{TokenId, TokenSummary};
use auth2_os::token_list::LinkImportReport;
use auth2_os::token_refresh::DisplayedTokenState;
use tokio::sync::broadcast::{self, error::RecvError};

pub const HELP: &str = "commands: list | show <id> | add | rm <id> | help | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellCommand {
    List,
    Show(TokenId),
    Add,
    Remove(TokenId),
    Help,
    Quit,
}

/// `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<ShellCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    if parts.next().is_some() {
        return Err(format!("too many arguments. {HELP}"));
    }
    let command = match (verb, arg) {
        ("list" | "ls", None) => ShellCommand::List,
        ("show", Some(id)) => ShellCommand::Show(parse_id(id)?),
        ("add", None) => ShellCommand::Add,
        ("rm", Some(id)) => ShellCommand::Remove(parse_id(id)?),
        ("help" | "?", None) => ShellCommand::Help,
        ("quit" | "exit", None) => ShellCommand::Quit,
        _ => return Err(format!("unknown command: {}. {HELP}", line.trim())),
    };
    Ok(Some(command))
}

fn parse_id(raw: &str) -> Result<TokenId, String> {
    raw.parse::<TokenId>().map_err(|e| e.to_string())
}

pub fn format_token_row(token: &TokenSummary) -> String {
    match token.service.as_deref() {
        Some(service) => format!("{:>4}  {service}: {}", token.id.0, token.account),
        None => format!("{:>4}  {}", token.id.0, token.account),
    }
}

/// Splits a code in two groups for reading: `123 456`.
pub fn group_code(code: &str) -> String {
    if code.len() < 6 || !code.is_ascii() {
        return code.to_string();
    }
    let (head, tail) = code.split_at(code.len() / 2);
    format!("{head} {tail}")
}

pub fn format_code_line(label: &str, state: &DisplayedTokenState) -> String {
    match (&state.current_code, &state.last_error) {
        (_, Some(err)) => format!("{label}  unavailable ({err})"),
        (Some(code), None) => format!(
            "{label}  {}  {:>2}s",
            group_code(code),
            state.seconds_remaining
        ),
        (None, None) => format!("{label}  ..."),
    }
}

pub fn format_import_report(report: &LinkImportReport) -> String {
    match report {
        LinkImportReport::Imported(detail) => {
            format!("imported token {}: {}", detail.id, detail.label())
        }
        LinkImportReport::Rejected { reason } => format!("link not imported: {reason}"),
    }
}

/// Emits every import report until the consumer goes away. Reports lost
/// to a full channel are skipped, not fatal.
pub async fn emit_import_reports(
    mut reports: broadcast::Receiver<LinkImportReport>,
    mut emit: impl FnMut(String),
) {
    loop {
        match reports.recv().await {
            Ok(report) => emit(format_import_report(&report)),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "import reports dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
