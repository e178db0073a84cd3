#![forbid(unsafe_code)]

//! Terminal stand-ins for the platform prompts: presence confirmation for
//! biometrics, typed confirmation for the destructive reset, hidden key
//! entry.

use std::io::{self, BufRead, IsTerminal, Write};

use async_trait::async_trait;
use auth2_contracts::envelope::UserKey;
use auth2_contracts::readiness::AuthenticationOutcome;
use auth2_os::bridge::BiometricAuthenticator;
use auth2_os::readiness_gate::ResetConfirmation;

pub const STDIN_CLOSED: &str = "stdin closed";
pub const RESET_WORD: &str = "RESET";

#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalAuthenticator;

#[async_trait]
impl BiometricAuthenticator for TerminalAuthenticator {
    async fn authenticate(&self) -> AuthenticationOutcome {
        let answer =
            tokio::task::spawn_blocking(|| prompt_line("Confirm presence to unlock [Y/n]: ")).await;
        match answer {
            Ok(Ok(Some(line))) => parse_presence_answer(&line),
            Ok(Ok(None)) => AuthenticationOutcome::Error(STDIN_CLOSED.to_string()),
            Ok(Err(err)) => AuthenticationOutcome::Error(err.to_string()),
            Err(err) => AuthenticationOutcome::Error(err.to_string()),
        }
    }
}

pub fn parse_presence_answer(line: &str) -> AuthenticationOutcome {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => AuthenticationOutcome::Succeeded,
        _ => AuthenticationOutcome::Failed,
    }
}

/// Only the exact word unlocks the reset; anything else declines.
pub fn confirm_reset(answer: &str) -> Option<ResetConfirmation> {
    (answer.trim() == RESET_WORD).then(ResetConfirmation::confirmed_by_user)
}

/// `None` at end of input.
pub fn prompt_line(prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    stdout.write_all(prompt.as_bytes())?;
    stdout.flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Hidden on a terminal; plain line read when stdin is piped.
pub fn prompt_secret(prompt: &str) -> Result<String, String> {
    if io::stdin().is_terminal() {
        rpassword::prompt_password(prompt).map_err(|e| e.to_string())
    } else {
        prompt_line(prompt)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| STDIN_CLOSED.to_string())
    }
}

/// Asks twice; the key can never be changed afterwards.
pub fn read_new_user_key() -> Result<UserKey, String> {
    let first = prompt_secret("New encryption key: ")?;
    let second = prompt_secret("Repeat encryption key: ")?;
    check_key_confirmation(&first, &second)
}

pub fn check_key_confirmation(first: &str, second: &str) -> Result<UserKey, String> {
    if first != second {
        return Err("keys do not match".to_string());
    }
    UserKey::new(first).map_err(|e| format!("invalid encryption key: {e}"))
}

#[cfg(test)]
mod tests {
    use super::{check_key_confirmation, confirm_reset, parse_presence_answer};
    use auth2_contracts::readiness::AuthenticationOutcome;

    #[test]
    fn at_terminal_01_presence_answers() {
        assert!(parse_presence_answer("").is_success());
        assert!(parse_presence_answer(" Yes ").is_success());
        assert_eq!(parse_presence_answer("n"), AuthenticationOutcome::Failed);
        assert_eq!(parse_presence_answer("later"), AuthenticationOutcome::Failed);
    }

    #[test]
    fn at_terminal_02_reset_needs_exact_word() {
        assert!(confirm_reset("RESET").is_some());
        assert!(confirm_reset(" RESET\n").is_some());
        assert!(confirm_reset("reset").is_none());
        assert!(confirm_reset("y").is_none());
        assert!(confirm_reset("").is_none());
    }

    #[test]
    fn at_terminal_03_key_confirmation() {
        assert_eq!(
            check_key_confirmation("abc", "abc").unwrap().expose_secret(),
            "abc"
        );
        assert_eq!(
            check_key_confirmation("abc", "abd").unwrap_err(),
            "keys do not match"
        );
        assert!(check_key_confirmation("  ", "  ").is_err());
    }
}
