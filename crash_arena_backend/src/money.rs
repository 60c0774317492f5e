//! Exact integer money arithmetic in native-token base units.
//!
//! Every amount that can reach the journal is a `BaseUnits`: an
//! arbitrary-precision non-negative integer in the smallest token subunit
//! (18 decimals). Floating point never participates in ledger arithmetic;
//! payouts are computed with `mul_by_ratio` over integer multipliers.

use candid::Nat;
use ic_stable_structures::storable::Bound;
use ic_stable_structures::Storable;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Fractional digits of the settlement token.
pub const TOKEN_DECIMALS: u32 = 18;

fn unit_scale() -> BigUint {
    BigUint::from(10u32).pow(TOKEN_DECIMALS)
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct BaseUnits(BigUint);

impl BaseUnits {
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    pub fn from_u64(v: u64) -> Self {
        Self(BigUint::from(v))
    }

    pub fn from_u128(v: u128) -> Self {
        Self(BigUint::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Addition cannot overflow on an arbitrary-precision value.
    pub fn add(&self, other: &Self) -> Self {
        Self(&self.0 + &other.0)
    }

    /// Fails when the result would be negative.
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        if self.0 < other.0 {
            None
        } else {
            Some(Self(&self.0 - &other.0))
        }
    }

    /// `self * num / den`, rounded down. `None` when `den == 0`.
    ///
    /// This is the only multiplication money ever goes through: the caller
    /// derives an integer ratio from the display multiplier (e.g. 1.50x
    /// becomes 150/100) so no float touches the amount.
    pub fn mul_by_ratio(&self, num: u64, den: u64) -> Option<Self> {
        if den == 0 {
            return None;
        }
        Some(Self(&self.0 * BigUint::from(num) / BigUint::from(den)))
    }

    /// `self * 10_000 / whole` as basis points, saturating at `u64::MAX`.
    pub fn ratio_bps_of(&self, whole: &Self) -> Option<u64> {
        if whole.0.is_zero() {
            return None;
        }
        let bps = &self.0 * BigUint::from(10_000u32) / &whole.0;
        Some(bps.to_u64().unwrap_or(u64::MAX))
    }

    pub fn to_u128(&self) -> Option<u128> {
        self.0.to_u128()
    }

    /// Exact parse of a decimal string with up to 18 fractional digits.
    ///
    /// Accepts `"12"`, `"12.5"`, `"0.000000000000000001"`. Rejects signs,
    /// exponents, empty parts, and fractions beyond the token precision.
    pub fn parse_decimal(s: &str) -> Result<Self, String> {
        let (int_part, frac_part) = match s.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (s, None),
        };

        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("Invalid amount: {:?}", s));
        }

        let mut value = BigUint::parse_bytes(int_part.as_bytes(), 10)
            .ok_or_else(|| format!("Invalid amount: {:?}", s))?
            * unit_scale();

        if let Some(frac) = frac_part {
            if frac.is_empty()
                || frac.len() > TOKEN_DECIMALS as usize
                || !frac.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(format!("Invalid amount: {:?}", s));
            }
            let frac_units = BigUint::parse_bytes(frac.as_bytes(), 10)
                .ok_or_else(|| format!("Invalid amount: {:?}", s))?
                * BigUint::from(10u32).pow(TOKEN_DECIMALS - frac.len() as u32);
            value += frac_units;
        }

        Ok(Self(value))
    }

    /// Canonical decimal rendering: no leading zeros, no trailing
    /// fractional zeros, no decimal point for whole values.
    pub fn format_decimal(&self) -> String {
        let scale = unit_scale();
        let int = &self.0 / &scale;
        let frac = &self.0 % &scale;
        if frac.is_zero() {
            int.to_string()
        } else {
            let digits = format!("{:0>width$}", frac, width = TOKEN_DECIMALS as usize);
            format!("{}.{}", int, digits.trim_end_matches('0'))
        }
    }

    pub fn as_nat(&self) -> Nat {
        Nat(self.0.clone())
    }
}

impl fmt::Display for BaseUnits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_decimal())
    }
}

// Serde carries the canonical decimal string. This is what goes over the
// wire and into serde_json-backed stable storage, so persisted amounts are
// human-auditable and never lose precision through a numeric type.
impl Serialize for BaseUnits {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.format_decimal())
    }
}

impl<'de> Deserialize<'de> for BaseUnits {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse_decimal(&s).map_err(DeError::custom)
    }
}

impl Storable for BaseUnits {
    fn to_bytes(&self) -> Cow<[u8]> {
        let bytes = self.0.to_bytes_be();
        let len = bytes.len() as u32;
        let mut result = len.to_be_bytes().to_vec();
        result.extend_from_slice(&bytes);
        Cow::Owned(result)
    }

    fn into_bytes(self) -> Vec<u8> {
        self.to_bytes().into_owned()
    }

    fn from_bytes(bytes: Cow<[u8]>) -> Self {
        if bytes.len() < 4 {
            return Self::zero();
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            return Self::zero();
        }
        Self(BigUint::from_bytes_be(&bytes[4..4 + len]))
    }

    const BOUND: Bound = Bound::Unbounded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parse_whole_and_fractional() {
        assert_eq!(
            BaseUnits::parse_decimal("1").unwrap(),
            BaseUnits::from_u128(1_000_000_000_000_000_000)
        );
        assert_eq!(
            BaseUnits::parse_decimal("0.5").unwrap(),
            BaseUnits::from_u128(500_000_000_000_000_000)
        );
        assert_eq!(
            BaseUnits::parse_decimal("0.000000000000000001").unwrap(),
            BaseUnits::from_u64(1)
        );
        assert_eq!(
            BaseUnits::parse_decimal("12.25").unwrap(),
            BaseUnits::from_u128(12_250_000_000_000_000_000)
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", ".", "1.", ".5", "-1", "+1", "1e18", "1.0000000000000000001", "0x10", "1 "] {
            assert!(BaseUnits::parse_decimal(bad).is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn format_is_canonical() {
        assert_eq!(BaseUnits::from_u128(1_000_000_000_000_000_000).format_decimal(), "1");
        assert_eq!(BaseUnits::from_u128(1_250_000_000_000_000_000).format_decimal(), "1.25");
        assert_eq!(BaseUnits::from_u64(1).format_decimal(), "0.000000000000000001");
        assert_eq!(BaseUnits::zero().format_decimal(), "0");
    }

    #[test]
    fn checked_sub_fails_negative() {
        let a = BaseUnits::from_u64(5);
        let b = BaseUnits::from_u64(7);
        assert!(a.checked_sub(&b).is_none());
        assert_eq!(b.checked_sub(&a).unwrap(), BaseUnits::from_u64(2));
    }

    #[test]
    fn mul_by_ratio_rounds_down() {
        // 5e17 * 150 / 100 = 7.5e17 exactly
        let stake = BaseUnits::from_u128(500_000_000_000_000_000);
        assert_eq!(
            stake.mul_by_ratio(150, 100).unwrap(),
            BaseUnits::from_u128(750_000_000_000_000_000)
        );
        // 7 * 1 / 2 = 3 (floor)
        assert_eq!(
            BaseUnits::from_u64(7).mul_by_ratio(1, 2).unwrap(),
            BaseUnits::from_u64(3)
        );
        assert!(BaseUnits::from_u64(7).mul_by_ratio(1, 0).is_none());
    }

    #[test]
    fn ratio_bps() {
        let liabilities = BaseUnits::from_u64(95);
        let onchain = BaseUnits::from_u64(100);
        assert_eq!(liabilities.ratio_bps_of(&onchain), Some(9_500));
        assert_eq!(liabilities.ratio_bps_of(&BaseUnits::zero()), None);
    }

    #[test]
    fn storable_round_trip() {
        for v in [0u128, 1, u64::MAX as u128, u128::MAX] {
            let a = BaseUnits::from_u128(v);
            let b = BaseUnits::from_bytes(a.to_bytes());
            assert_eq!(a, b);
        }
    }

    proptest! {
        #[test]
        fn format_parse_bijective(v in any::<u128>()) {
            let a = BaseUnits::from_u128(v);
            let s = a.format_decimal();
            prop_assert_eq!(BaseUnits::parse_decimal(&s).unwrap(), a);
        }

        #[test]
        fn parse_format_canonicalizes(int in 0u64..1_000_000, frac in 0u64..1_000_000_000_000_000_000) {
            let s = format!("{}.{:018}", int, frac);
            let a = BaseUnits::parse_decimal(&s).unwrap();
            let round = BaseUnits::parse_decimal(&a.format_decimal()).unwrap();
            prop_assert_eq!(round, a);
        }
    }
}
