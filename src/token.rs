//! Bearer tokens and the YAML credential store.
//!
//! Tokens are 64 random bytes, base64-encoded, stored in a YAML file the
//! server loads once at startup. Verification is constant-time over the
//! whole token list.

use std::os::unix::fs::OpenOptionsExt;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use camino::Utf8Path;
use chrono::{SecondsFormat, Utc};
use fn_error_context::context;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Default configuration file name.
pub const DEFAULT_CONFIG: &str = "ostree-publish.yaml";

/// One API token and when it was minted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Token {
    pub token: String,
    pub created: String,
}

impl Token {
    /// Mint a new random token, stamped with the current time.
    pub fn generate() -> Self {
        let mut raw = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        Self {
            token: STANDARD.encode(raw),
            created: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// The credential file contents.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenConfig {
    #[serde(default)]
    pub tokens: Vec<Token>,
}

impl TokenConfig {
    /// Load the credential file; it must exist.
    #[context("Loading configuration from {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Like [`TokenConfig::load`], but a missing file is an empty config.
    pub fn load_or_default(path: &Utf8Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Write the credential file, creating it mode 0600.
    #[context("Saving configuration to {path}")]
    pub fn save(&self, path: &Utf8Path) -> Result<()> {
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        serde_yaml::to_writer(&mut f, self)?;
        Ok(())
    }

    /// Constant-time membership check for a presented token.
    pub fn verify(&self, candidate: &str) -> bool {
        let mut found = subtle::Choice::from(0u8);
        for token in &self.tokens {
            found |= token.token.as_bytes().ct_eq(candidate.as_bytes());
        }
        bool::from(found)
    }
}

/// Generate a token and append it to the credential file, creating the file
/// when needed. Used by the `gentoken` command.
#[context("Generating token")]
pub fn append_new_token(path: &Utf8Path) -> Result<Token> {
    let mut config = TokenConfig::load_or_default(path)
        .with_context(|| format!("Opening configuration file {path}"))?;
    let token = Token::generate();
    config.tokens.push(token.clone());
    config.save(path)?;
    Ok(token)
}
