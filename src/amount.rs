//! Fixed-scale monetary amounts.
//!
//! The ledger carries value as an integer count of minor units (two decimal
//! places) so that balances never accumulate floating-point drift. Free-text
//! exports render the familiar `123.45` form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::str::FromStr;

/// Number of minor units in one major unit.
const SCALE: i64 = 100;

/// A monetary amount in minor units (two-place fixed scale).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// One minor unit (0.01), the smallest representable value.
    pub const MINOR_UNIT: Amount = Amount(1);

    /// Construct from a raw count of minor units.
    pub const fn from_minor(minor: i64) -> Amount {
        Amount(minor)
    }

    /// Construct from whole major units, e.g. `from_major(300)` is `300.00`.
    pub fn from_major(major: i64) -> Amount {
        Amount(major.saturating_mul(SCALE))
    }

    pub const fn minor(self) -> i64 {
        self.0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    pub fn checked_sub(self, rhs: Amount) -> Option<Amount> {
        self.0.checked_sub(rhs.0).map(Amount)
    }

    pub fn saturating_sub(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_sub(rhs.0).max(0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| {
            acc.checked_add(a).unwrap_or(Amount(i64::MAX))
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / SCALE as u64, abs % SCALE as u64)
    }
}

/// Parse error for [`Amount`] text input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid amount literal: {0}")]
pub struct ParseAmountError(String);

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseAmountError(s.to_string());
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() || frac_part.len() > 2 {
            return Err(bad());
        }
        let int: i64 = int_part.parse().map_err(|_| bad())?;
        let frac: i64 = if frac_part.is_empty() {
            0
        } else {
            let padded = format!("{frac_part:0<2}");
            padded.parse().map_err(|_| bad())?
        };
        let minor = int
            .checked_mul(SCALE)
            .and_then(|v| v.checked_add(frac))
            .ok_or_else(bad)?;
        Ok(Amount(if negative { -minor } else { minor }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_two_decimal_places() {
        assert_eq!(Amount::from_minor(12345).to_string(), "123.45");
        assert_eq!(Amount::from_minor(5).to_string(), "0.05");
        assert_eq!(Amount::from_minor(-50).to_string(), "-0.50");
        assert_eq!(Amount::ZERO.to_string(), "0.00");
    }

    #[test]
    fn parses_decimal_literals() {
        assert_eq!("300".parse::<Amount>().unwrap(), Amount::from_major(300));
        assert_eq!("0.4".parse::<Amount>().unwrap(), Amount::from_minor(40));
        assert_eq!("12.34".parse::<Amount>().unwrap(), Amount::from_minor(1234));
        assert!("12.345".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
    }

    #[test]
    fn checked_arithmetic() {
        let a = Amount::from_major(10);
        let b = Amount::from_major(3);
        assert_eq!(a.checked_sub(b), Some(Amount::from_major(7)));
        assert_eq!(b.saturating_sub(a), Amount::ZERO);
        let total: Amount = [a, b, b].into_iter().sum();
        assert_eq!(total, Amount::from_major(16));
    }
}
