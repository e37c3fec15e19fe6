//! Table line parsing and reconstruction.
//!
//! ```text
//! <cipher>[-<chainmode>[-<ivmode>[:<ivopts>]]] <key> <iv_offset> <device> <start>
//! ```
//!
//! Two legacy spellings are still accepted: a bare cipher name and
//! `<cipher>-plain` both mean `<cipher>-cbc-plain`.

use std::fmt;

use tracing::warn;

use crate::error::{CryptError, Result};
use common::Sector;
use encryption::{ChainMode, IvMode, KeyMaterial};

/// Number of arguments on a table line.
pub const TABLE_ARGS: usize = 5;

/// The first table argument, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    pub cipher: String,
    pub chain_mode: ChainMode,
    /// IV mode as written, with its options.
    pub iv: Option<IvSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvSpec {
    pub mode: IvMode,
    pub name: String,
    pub opts: Option<String>,
}

impl CipherSpec {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.splitn(4, '-');
        let cipher = parts.next().unwrap_or_default();
        let mut chain_mode = parts.next();
        let iv_part = parts.next();
        if parts.next().is_some() {
            warn!(cipher = text, "Unexpected additional cipher options");
        }

        let (mut iv_name, iv_opts) = match iv_part {
            Some(part) => match part.split_once(':') {
                Some((name, opts)) => (Some(name), Some(opts)),
                None => (Some(part), None),
            },
            None => (None, None),
        };

        if chain_mode.is_none() || (chain_mode == Some("plain") && iv_name.is_none()) {
            chain_mode = Some("cbc");
            iv_name = Some("plain");
        }
        let chain_name = chain_mode.unwrap_or("cbc");

        if chain_name != "ecb" && iv_name.is_none() {
            return Err(CryptError::config(
                "This chaining mode requires an IV mechanism",
            ));
        }

        let chain_mode = ChainMode::parse(chain_name).ok_or_else(|| {
            encryption::EncryptionError::UnsupportedChainMode {
                cipher: cipher.to_string(),
                mode: chain_name.to_string(),
            }
        })?;

        let iv = match iv_name {
            Some(name) => Some(IvSpec {
                mode: IvMode::parse(name, iv_opts)?,
                name: name.to_string(),
                opts: iv_opts.map(str::to_string),
            }),
            None => None,
        };

        Ok(Self {
            cipher: cipher.to_string(),
            chain_mode,
            iv,
        })
    }

    /// Same spec with the IV part dropped.
    pub fn without_iv(mut self) -> Self {
        self.iv = None;
        self
    }
}

impl fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cipher, self.chain_mode)?;
        if let Some(iv) = &self.iv {
            write!(f, "-{}", iv.name)?;
            if let Some(opts) = &iv.opts {
                write!(f, ":{opts}")?;
            }
        }
        Ok(())
    }
}

/// A parsed table line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptTable {
    pub spec: CipherSpec,
    pub key: KeyMaterial,
    pub iv_offset: u64,
    pub device: String,
    pub start: Sector,
}

impl CryptTable {
    pub fn parse(args: &[&str]) -> Result<Self> {
        if args.len() != TABLE_ARGS {
            return Err(CryptError::config("Not enough arguments"));
        }

        let spec = CipherSpec::parse(args[0])?;
        let key = KeyMaterial::from_hex(args[1])?;
        let iv_offset = args[2]
            .parse::<u64>()
            .map_err(|_| CryptError::config("Invalid iv_offset sector"))?;
        let start = args[4]
            .parse::<u64>()
            .map_err(|_| CryptError::config("Invalid device sector"))?;

        Ok(Self {
            spec,
            key,
            iv_offset,
            device: args[3].to_string(),
            start,
        })
    }

    pub fn parse_line(line: &str) -> Result<Self> {
        let args: Vec<&str> = line.split_whitespace().collect();
        Self::parse(&args)
    }
}

impl fmt::Display for CryptTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.spec,
            self.key.to_hex(),
            self.iv_offset,
            self.device,
            self.start
        )
    }
}
