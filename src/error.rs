//! Stable error taxonomy surfaced at the API boundary (spec.md §7).
//!
//! Every public operation returns `Result<T, DescriptorLibError>`. Variants
//! are never swallowed or retried internally; callers see the first failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DescriptorLibError>;

#[derive(Debug, Error)]
pub enum DescriptorLibError {
    #[error("checksum error: {0}")]
    Checksum(String),

    #[error("descriptor parse error: {0}")]
    DescriptorParse(String),

    #[error("key expression error: {0}")]
    KeyExpression(String),

    #[error("miniscript sanity error: {0}")]
    MiniscriptSanity(String),

    #[error("script policy error: {0}")]
    ScriptPolicy(String),

    #[error("satisfaction error: {0}")]
    Satisfaction(String),

    #[error("spend path error: {0}")]
    SpendPath(String),

    #[error("taproot error: {0}")]
    Taproot(String),

    #[error("psbt shape error: {0}")]
    PsbtShape(String),

    #[error("range error: {0}")]
    Range(String),

    #[error("number error: {0}")]
    Number(String),

    #[error("signature error: {0}")]
    Signature(String),
}

impl DescriptorLibError {
    pub(crate) fn checksum(msg: impl Into<String>) -> Self {
        Self::Checksum(msg.into())
    }
    pub(crate) fn descriptor_parse(msg: impl Into<String>) -> Self {
        Self::DescriptorParse(msg.into())
    }
    pub(crate) fn key_expression(msg: impl Into<String>) -> Self {
        Self::KeyExpression(msg.into())
    }
    pub(crate) fn miniscript_sanity(msg: impl Into<String>) -> Self {
        Self::MiniscriptSanity(msg.into())
    }
    pub(crate) fn script_policy(msg: impl Into<String>) -> Self {
        Self::ScriptPolicy(msg.into())
    }
    pub(crate) fn satisfaction(msg: impl Into<String>) -> Self {
        Self::Satisfaction(msg.into())
    }
    pub(crate) fn spend_path(msg: impl Into<String>) -> Self {
        Self::SpendPath(msg.into())
    }
    pub(crate) fn taproot(msg: impl Into<String>) -> Self {
        Self::Taproot(msg.into())
    }
    pub(crate) fn psbt_shape(msg: impl Into<String>) -> Self {
        Self::PsbtShape(msg.into())
    }
    pub(crate) fn range(msg: impl Into<String>) -> Self {
        Self::Range(msg.into())
    }
    pub(crate) fn number(msg: impl Into<String>) -> Self {
        Self::Number(msg.into())
    }
    pub(crate) fn signature(msg: impl Into<String>) -> Self {
        Self::Signature(msg.into())
    }
}

/// Non-fatal warnings surfaced through an out-of-band channel (spec.md §7),
/// e.g. "missing txHex may allow fee attacks". Never aborts construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning(pub String);

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
