use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::block::Block;
use super::crypto::Address;

/// Default number of leading zero bits stripped from the base target
pub const POW_LEADING_ZEROES: u32 = 15;

/// Gold a miner earns for finding a block, before fees
pub const COINBASE_AMT_ALLOWED: u64 = 25;

/// Fee attached to transactions when the sender does not pick one
pub const DEFAULT_TX_FEE: u64 = 1;

/// Blocks this deep below the tip are treated as final. Same as Bitcoin.
pub const CONFIRMED_DEPTH: u64 = 6;

/// Proof attempts per mining burst before the miner checks its inbox
pub const NUM_ROUNDS_MINING: u64 = 2000;

/// Width of the all-ones base target
pub const TARGET_BITS: u32 = 264;

const TARGET_BYTES: usize = (TARGET_BITS / 8) as usize;

/// Errors raised while building a `ChainConfig` from the environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Proof-of-work threshold: a block hash, read as a big-endian unsigned
/// integer, must be strictly below it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Target([u8; TARGET_BYTES]);

impl Target {
    /// `(2^264 - 1) >> zeroes`
    pub fn from_leading_zero_bits(zeroes: u32) -> Self {
        let mut bytes = [0u8; TARGET_BYTES];
        if zeroes >= TARGET_BITS {
            return Target(bytes);
        }

        let full = (zeroes / 8) as usize;
        for byte in bytes.iter_mut().skip(full) {
            *byte = 0xff;
        }
        bytes[full] = 0xff >> (zeroes % 8);

        Target(bytes)
    }

    /// Checks a raw 256-bit digest against the target
    pub fn is_met_by(&self, digest: &[u8; 32]) -> bool {
        let mut value = [0u8; TARGET_BYTES];
        value[TARGET_BYTES - digest.len()..].copy_from_slice(digest);
        value < self.0
    }

    /// Checks a hex-encoded digest; anything that is not 32 bytes of hex fails
    pub fn is_met_by_hex(&self, digest: &str) -> bool {
        let mut bytes = [0u8; 32];
        match hex::decode_to_slice(digest, &mut bytes) {
            Ok(()) => self.is_met_by(&bytes),
            Err(_) => false,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self)
    }
}

/// Network-wide constants. Every node must run with the same values.
///
/// Built once and shared read-only behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainConfig {
    pub pow_leading_zeroes: u32,
    pub target: Target,
    pub coinbase_reward: u64,
    pub default_tx_fee: u64,
    pub confirmed_depth: u64,
    pub mining_rounds: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        ChainConfig {
            pow_leading_zeroes: POW_LEADING_ZEROES,
            target: Target::from_leading_zero_bits(POW_LEADING_ZEROES),
            coinbase_reward: COINBASE_AMT_ALLOWED,
            default_tx_fee: DEFAULT_TX_FEE,
            confirmed_depth: CONFIRMED_DEPTH,
            mining_rounds: NUM_ROUNDS_MINING,
        }
    }
}

impl ChainConfig {
    /// Returns a copy with a different difficulty; keeps `target` in step
    pub fn with_leading_zeroes(mut self, zeroes: u32) -> Self {
        self.pow_leading_zeroes = zeroes;
        self.target = Target::from_leading_zero_bits(zeroes);
        self
    }

    /// Reads overrides from `GOLDCHAIN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        ChainConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup, falling back to the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = ChainConfig::default();

        let zeroes = read_var(&lookup, "GOLDCHAIN_POW_LEADING_ZEROES", defaults.pow_leading_zeroes)?;
        let config = ChainConfig {
            coinbase_reward: read_var(&lookup, "GOLDCHAIN_COINBASE_REWARD", defaults.coinbase_reward)?,
            default_tx_fee: read_var(&lookup, "GOLDCHAIN_DEFAULT_TX_FEE", defaults.default_tx_fee)?,
            confirmed_depth: read_var(&lookup, "GOLDCHAIN_CONFIRMED_DEPTH", defaults.confirmed_depth)?,
            mining_rounds: read_var(&lookup, "GOLDCHAIN_MINING_ROUNDS", defaults.mining_rounds)?,
            ..defaults
        };

        Ok(config.with_leading_zeroes(zeroes))
    }
}

fn read_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

/// Creates the genesis block holding the starting balances
///
/// Genesis is the only block allowed to declare balances instead of deriving
/// them.
pub fn make_genesis(balances: BTreeMap<Address, u64>, config: &Arc<ChainConfig>) -> Block {
    Block::genesis(balances, Arc::clone(config))
}
