use crate::error::{EscrowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milestone amounts are denominated in USD with two decimal places.
pub const USD_DECIMALS: u32 = 2;

/// A USD amount stored as whole cents.
///
/// All arithmetic and conversion is integer fixed-point. Settlement
/// amounts must never pass through floating point, which can silently
/// misround at token precision.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UsdAmount(u64);

impl UsdAmount {
    pub const ZERO: Self = Self(0);

    pub fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub fn to_cents(&self) -> u64 {
        self.0
    }

    pub fn checked_add(&self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(&self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn saturating_add(&self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    /// Convert to the token's smallest units given its on-chain decimal
    /// precision. Requires `decimals >= 2` so that a whole cent maps to a
    /// whole number of units.
    pub fn to_token_units(&self, decimals: u8) -> Result<TokenUnits> {
        if (decimals as u32) < USD_DECIMALS {
            return Err(EscrowError::InvalidArgument(format!(
                "token precision {} below {} decimal places",
                decimals, USD_DECIMALS
            )));
        }
        let scale = 10u128
            .checked_pow(decimals as u32 - USD_DECIMALS)
            .ok_or_else(|| {
                EscrowError::InvalidArgument(format!("token precision {} out of range", decimals))
            })?;
        let units = (self.0 as u128).checked_mul(scale).ok_or_else(|| {
            EscrowError::InvalidArgument(format!(
                "amount {} overflows at {} decimals",
                self, decimals
            ))
        })?;
        Ok(TokenUnits::from_raw(units))
    }
}

impl FromStr for UsdAmount {
    type Err = EscrowError;

    /// Parse a decimal string like `"250.00"`, `"250.5"` or `"250"`.
    /// At most two fractional digits are accepted; parsing is pure
    /// integer work.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EscrowError::InvalidArgument("empty amount".to_string()));
        }
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > USD_DECIMALS as usize {
            return Err(EscrowError::InvalidArgument(format!(
                "amount '{}' has more than {} decimal places",
                s, USD_DECIMALS
            )));
        }
        let whole: u64 = whole
            .parse()
            .map_err(|_| EscrowError::InvalidArgument(format!("malformed amount '{}'", s)))?;
        let mut cents_frac: u64 = 0;
        if !frac.is_empty() {
            cents_frac = frac
                .parse()
                .map_err(|_| EscrowError::InvalidArgument(format!("malformed amount '{}'", s)))?;
            if frac.len() == 1 {
                cents_frac *= 10;
            }
        }
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(cents_frac))
            .ok_or_else(|| EscrowError::InvalidArgument(format!("amount '{}' too large", s)))?;
        Ok(Self(cents))
    }
}

impl fmt::Display for UsdAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// An on-chain token quantity in the contract's smallest units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TokenUnits(u128);

impl TokenUnits {
    pub const ZERO: Self = Self(0);

    pub fn from_raw(units: u128) -> Self {
        Self(units)
    }

    pub fn raw(&self) -> u128 {
        self.0
    }

    /// Convert back to USD cents. Returns `None` when the unit value does
    /// not land on a whole cent or exceeds the USD range.
    pub fn to_usd(&self, decimals: u8) -> Option<UsdAmount> {
        if (decimals as u32) < USD_DECIMALS {
            return None;
        }
        let scale = 10u128.checked_pow(decimals as u32 - USD_DECIMALS)?;
        if self.0 % scale != 0 {
            return None;
        }
        u64::try_from(self.0 / scale).ok().map(UsdAmount::from_cents)
    }
}

impl fmt::Display for TokenUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amounts() {
        assert_eq!("250.00".parse::<UsdAmount>().unwrap().to_cents(), 25_000);
        assert_eq!("250".parse::<UsdAmount>().unwrap().to_cents(), 25_000);
        assert_eq!("250.5".parse::<UsdAmount>().unwrap().to_cents(), 25_050);
        assert_eq!("0.01".parse::<UsdAmount>().unwrap().to_cents(), 1);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("250.001".parse::<UsdAmount>().is_err());
        assert!("".parse::<UsdAmount>().is_err());
        assert!("-1".parse::<UsdAmount>().is_err());
        assert!("12,50".parse::<UsdAmount>().is_err());
        assert!("abc".parse::<UsdAmount>().is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let amount: UsdAmount = "1234.05".parse().unwrap();
        assert_eq!(amount.to_string(), "1234.05");
        assert_eq!(amount.to_string().parse::<UsdAmount>().unwrap(), amount);
    }

    #[test]
    fn test_six_decimal_stablecoin_conversion() {
        // 250.00 of a 6-decimal token is 250_000_000 smallest units.
        let amount: UsdAmount = "250.00".parse().unwrap();
        let units = amount.to_token_units(6).unwrap();
        assert_eq!(units.raw(), 250_000_000);
        assert_eq!(units.to_usd(6).unwrap(), amount);
    }

    #[test]
    fn test_two_decimal_token_is_identity() {
        let amount = UsdAmount::from_cents(9_999);
        let units = amount.to_token_units(2).unwrap();
        assert_eq!(units.raw(), 9_999);
        assert_eq!(units.to_usd(2).unwrap(), amount);
    }

    #[test]
    fn test_precision_below_cents_rejected() {
        let amount = UsdAmount::from_cents(100);
        assert!(amount.to_token_units(1).is_err());
        assert!(amount.to_token_units(0).is_err());
    }

    #[test]
    fn test_inexact_units_do_not_round() {
        // 1 unit of an 18-decimal token is far below a cent.
        assert_eq!(TokenUnits::from_raw(1).to_usd(18), None);
        assert_eq!(TokenUnits::from_raw(10_000_000_000_000_000).to_usd(18), Some(UsdAmount::from_cents(1)));
    }
}
