#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use auth2_contracts::token::{GeneratedCode, TokenAlg};
use totp_rs::{Algorithm, Secret, TOTP};
use url::Url;

const ENROLLMENT_SCHEME: &str = "otpauth";
const ENROLLMENT_KIND: &str = "totp";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TotpError {
    #[error("invalid TOTP secret: {0}")]
    InvalidSecret(String),

    #[error("unsupported enrollment link: {0}")]
    UnsupportedLink(String),

    #[error("malformed enrollment link: {0}")]
    MalformedLink(String),

    #[error("system clock is before the unix epoch")]
    ClockBeforeEpoch,
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now_unix_secs(&self) -> Result<u64, TotpError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_secs(&self) -> Result<u64, TotpError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .map_err(|_| TotpError::ClockBeforeEpoch)
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn at(unix_secs: u64) -> Self {
        Self {
            now: AtomicU64::new(unix_secs),
        }
    }

    pub fn set(&self, unix_secs: u64) {
        self.now.store(unix_secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix_secs(&self) -> Result<u64, TotpError> {
        Ok(self.now.load(Ordering::SeqCst))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TotpParams {
    pub algorithm: TokenAlg,
    pub digits: u8,
    pub period: u32,
    pub secret_base32: String,
    pub issuer: Option<String>,
    pub account: String,
}

impl fmt::Debug for TotpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TotpParams")
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .field("secret_base32", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("account", &self.account)
            .finish()
    }
}

/// Code for `now` plus the seconds left until the step boundary after it.
pub fn generate_at(params: &TotpParams, now: u64) -> Result<GeneratedCode, TotpError> {
    let totp = build_totp(params)?;
    let code = totp.generate(now);
    let next = totp.next_step(now);
    Ok(GeneratedCode {
        code,
        seconds_until_next_step: next as i64 - now as i64,
    })
}

pub fn generate_current(params: &TotpParams, clock: &dyn Clock) -> Result<GeneratedCode, TotpError> {
    generate_at(params, clock.now_unix_secs()?)
}

/// Parameters carried by an `otpauth://totp/...` enrollment link.
pub fn parse_enrollment_url(raw: &str) -> Result<TotpParams, TotpError> {
    let url = Url::parse(raw.trim()).map_err(|e| TotpError::MalformedLink(e.to_string()))?;
    if url.scheme() != ENROLLMENT_SCHEME {
        return Err(TotpError::UnsupportedLink(format!(
            "scheme must be {ENROLLMENT_SCHEME}, got {}",
            url.scheme()
        )));
    }
    if url.host_str() != Some(ENROLLMENT_KIND) {
        return Err(TotpError::UnsupportedLink(
            "only totp enrollment links are supported".to_string(),
        ));
    }

    let totp =
        TOTP::from_url_unchecked(raw.trim()).map_err(|e| TotpError::MalformedLink(e.to_string()))?;
    let algorithm = match totp.algorithm {
        Algorithm::SHA1 => TokenAlg::Sha1,
        Algorithm::SHA256 => TokenAlg::Sha256,
        Algorithm::SHA512 => TokenAlg::Sha512,
    };
    let digits = u8::try_from(totp.digits)
        .map_err(|_| TotpError::MalformedLink("digits out of range".to_string()))?;
    let period = u32::try_from(totp.step)
        .map_err(|_| TotpError::MalformedLink("period out of range".to_string()))?;
    Ok(TotpParams {
        algorithm,
        digits,
        period,
        secret_base32: totp.get_secret_base32(),
        issuer: totp.issuer.clone().filter(|s| !s.trim().is_empty()),
        account: totp.account_name.clone(),
    })
}

fn build_totp(params: &TotpParams) -> Result<TOTP, TotpError> {
    if params.period == 0 {
        return Err(TotpError::InvalidSecret("period must be positive".to_string()));
    }
    let secret = Secret::Encoded(params.secret_base32.trim().to_string())
        .to_bytes()
        .map_err(|e| TotpError::InvalidSecret(e.to_string()))?;
    Ok(TOTP::new_unchecked(
        match params.algorithm {
            TokenAlg::Sha1 => Algorithm::SHA1,
            TokenAlg::Sha256 => Algorithm::SHA256,
            TokenAlg::Sha512 => Algorithm::SHA512,
        },
        usize::from(params.digits),
        1,
        u64::from(params.period),
        secret,
        params.issuer.clone(),
        params.account.clone(),
    ))
}
