use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{EngineError, EngineResult};

pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;

/// `10^38` is the largest power of ten a `u128` holds.
pub const MAX_TOKEN_DECIMALS: u32 = 38;

/// An amount in raw ledger units. Never converted through floating point.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawAmount(pub u128);

impl RawAmount {
  pub const ZERO: RawAmount = RawAmount(0);

  pub fn is_zero(&self) -> bool {
    self.0 == 0
  }

  pub fn saturating_sub(self, other: RawAmount) -> RawAmount {
    RawAmount(self.0.saturating_sub(other.0))
  }

  pub fn saturating_add(self, other: RawAmount) -> RawAmount {
    RawAmount(self.0.saturating_add(other.0))
  }

  /// Parses a user-entered token amount such as `"12.5"` into raw units.
  ///
  /// Rejects negative values and values with more fractional digits than
  /// the token supports.
  pub fn parse_units(input: &str, decimals: u32) -> EngineResult<RawAmount> {
    let value = Decimal::from_str_exact(input.trim())
      .map_err(|e| EngineError::InvalidInput(format!("{input:?} is not a valid amount ({e})")))?;
    if value.is_sign_negative() && !value.is_zero() {
      return Err(EngineError::InvalidInput(format!("{input:?} is negative")));
    }

    let value = value.normalize();
    if value.scale() > decimals {
      return Err(EngineError::InvalidInput(format!("{input:?} has more than {decimals} decimal places")));
    }

    let mantissa = u128::try_from(value.mantissa()).map_err(|_| EngineError::InvalidInput(format!("{input:?} is negative")))?;
    10u128
      .checked_pow(decimals - value.scale())
      .and_then(|factor| mantissa.checked_mul(factor))
      .map(RawAmount)
      .ok_or_else(|| EngineError::InvalidInput(format!("{input:?} is too large")))
  }

  /// The amount as a decimal number of tokens, when it fits `Decimal`.
  pub fn to_decimal(&self, decimals: u32) -> Option<Decimal> {
    let raw = i128::try_from(self.0).ok()?;
    Decimal::try_from_i128_with_scale(raw, decimals).ok().map(|value| value.normalize())
  }

  /// Display string in whole tokens. Derived only, never fed back into the
  /// ledger.
  pub fn format_units(&self, decimals: u32) -> String {
    if let Some(value) = self.to_decimal(decimals) {
      return value.to_string();
    }

    let decimals = decimals as usize;
    let digits = format!("{:0>width$}", self.0, width = decimals + 1);
    let (whole, fraction) = digits.split_at(digits.len() - decimals);
    match fraction.trim_end_matches('0') {
      "" => whole.to_string(),
      fraction => format!("{whole}.{fraction}"),
    }
  }
}

impl fmt::Display for RawAmount {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<u128> for RawAmount {
  fn from(value: u128) -> Self {
    RawAmount(value)
  }
}

impl FromStr for RawAmount {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    s.trim().parse().map(RawAmount)
  }
}

// Raw amounts overflow JSON numbers, so they travel as decimal strings.
impl Serialize for RawAmount {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&self.0)
  }
}

impl<'de> Deserialize<'de> for RawAmount {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireAmount {
      Number(u64),
      Text(String),
    }

    match WireAmount::deserialize(deserializer)? {
      WireAmount::Number(value) => Ok(RawAmount(u128::from(value))),
      WireAmount::Text(text) => text.parse().map_err(de::Error::custom),
    }
  }
}

/// Balances of one token for one account, in raw units.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
  pub available: RawAmount,
  pub staked: RawAmount,
  pub pending_rewards: RawAmount,
  pub decimals: u32,
}

impl BalanceSnapshot {
  pub fn display_available(&self) -> String {
    self.available.format_units(self.decimals)
  }

  pub fn display_staked(&self) -> String {
    self.staked.format_units(self.decimals)
  }

  pub fn display_pending_rewards(&self) -> String {
    self.pending_rewards.format_units(self.decimals)
  }
}
