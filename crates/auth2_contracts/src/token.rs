#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{require_non_blank, require_range};
use crate::{ContractViolation, Validate};

pub const DEFAULT_DIGITS: u8 = 6;
pub const DEFAULT_PERIOD_SECS: u32 = 30;
pub const MIN_DIGITS: u8 = 6;
pub const MAX_DIGITS: u8 = 8;
pub const MAX_PERIOD_SECS: u32 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TokenId {
    type Err = ContractViolation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(TokenId)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "token_id",
                reason: "must be an unsigned integer",
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenAlg {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl TokenAlg {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha1 => "SHA1",
            Self::Sha256 => "SHA256",
            Self::Sha512 => "SHA512",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "SHA1" => Some(Self::Sha1),
            "SHA256" => Some(Self::Sha256),
            "SHA512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

impl fmt::Display for TokenAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub id: TokenId,
    pub account: String,
    pub service: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDetail {
    pub id: TokenId,
    pub account: String,
    pub service: Option<String>,
    pub algorithm: TokenAlg,
    pub digits: u8,
    pub period: u32,
}

impl TokenDetail {
    /// `service: account`, or the bare account when no service is recorded.
    pub fn label(&self) -> String {
        match self.service.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(service) => format!("{service}: {}", self.account),
            None => self.account.clone(),
        }
    }

    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            id: self.id,
            account: self.account.clone(),
            service: self.service.clone(),
        }
    }
}

/// Manual token entry. `None` parameters fall back to the TOTP defaults.
#[derive(Clone, PartialEq, Eq)]
pub struct NewToken {
    pub account: String,
    pub service: Option<String>,
    pub secret: String,
    pub algorithm: Option<TokenAlg>,
    pub digits: Option<u8>,
    pub period: Option<u32>,
}

impl NewToken {
    pub fn v1(
        account: impl Into<String>,
        service: Option<String>,
        secret: impl Into<String>,
        algorithm: Option<TokenAlg>,
        digits: Option<u8>,
        period: Option<u32>,
    ) -> Result<Self, ContractViolation> {
        let v = Self {
            account: account.into(),
            service: service.filter(|s| !s.trim().is_empty()),
            secret: secret.into(),
            algorithm,
            digits,
            period,
        };
        v.validate()?;
        Ok(v)
    }

    pub fn algorithm_or_default(&self) -> TokenAlg {
        self.algorithm.unwrap_or_default()
    }

    pub fn digits_or_default(&self) -> u8 {
        self.digits.unwrap_or(DEFAULT_DIGITS)
    }

    pub fn period_or_default(&self) -> u32 {
        self.period.unwrap_or(DEFAULT_PERIOD_SECS)
    }
}

impl Validate for NewToken {
    fn validate(&self) -> Result<(), ContractViolation> {
        require_non_blank("account", &self.account)?;
        require_non_blank("secret", &self.secret)?;
        require_range(
            "digits",
            u64::from(self.digits_or_default()),
            u64::from(MIN_DIGITS),
            u64::from(MAX_DIGITS),
        )?;
        require_range(
            "period",
            u64::from(self.period_or_default()),
            1,
            u64::from(MAX_PERIOD_SECS),
        )?;
        Ok(())
    }
}

// Secrets never reach logs through Debug.
impl fmt::Debug for NewToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewToken")
            .field("account", &self.account)
            .field("service", &self.service)
            .field("secret", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period", &self.period)
            .finish()
    }
}

/// One generator answer: the code valid now and how long it stays valid.
///
/// `seconds_until_next_step` is signed because a slow call or clock skew can
/// yield a boundary that has already passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedCode {
    pub code: String,
    pub seconds_until_next_step: i64,
}

#[cfg(test)]
mod tests {
    use super::{NewToken, TokenAlg, TokenDetail, TokenId};
    use crate::ContractViolation;

    #[test]
    fn at_token_01_defaults_apply_when_parameters_missing() {
        let t = NewToken::v1("alice", None, "JBSWY3DPEHPK3PXP", None, None, None).unwrap();
        assert_eq!(t.algorithm_or_default(), TokenAlg::Sha1);
        assert_eq!(t.digits_or_default(), 6);
        assert_eq!(t.period_or_default(), 30);
    }

    #[test]
    fn at_token_02_out_of_range_digits_fail_closed() {
        let err = NewToken::v1("alice", None, "JBSWY3DPEHPK3PXP", None, Some(4), None)
            .expect_err("digits=4 must be rejected");
        assert!(matches!(
            err,
            ContractViolation::InvalidRange {
                field: "digits",
                ..
            }
        ));
        assert!(NewToken::v1("alice", None, "JBSWY3DPEHPK3PXP", None, None, Some(0)).is_err());
        assert!(NewToken::v1(" ", None, "JBSWY3DPEHPK3PXP", None, None, None).is_err());
    }

    #[test]
    fn at_token_03_debug_output_redacts_secret() {
        let t = NewToken::v1("alice", None, "SUPERSECRETVALUE", None, None, None).unwrap();
        let rendered = format!("{t:?}");
        assert!(!rendered.contains("SUPERSECRETVALUE"));
    }

    #[test]
    fn at_token_04_label_prefers_service() {
        let mut d = TokenDetail {
            id: TokenId(7),
            account: "alice".to_string(),
            service: Some("Example".to_string()),
            algorithm: TokenAlg::Sha1,
            digits: 6,
            period: 30,
        };
        assert_eq!(d.label(), "Example: alice");
        d.service = None;
        assert_eq!(d.label(), "alice");
        assert_eq!(TokenAlg::parse("sha256"), Some(TokenAlg::Sha256));
        assert_eq!("42".parse::<TokenId>().unwrap(), TokenId(42));
    }
}
