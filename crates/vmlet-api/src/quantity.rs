//! Integer resource quantities.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unit hint for a quantity. Purely informational: arithmetic and
/// comparisons only ever look at the integer value, and the hint is not
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Power-of-ten units (counts, millicpu).
    #[default]
    DecimalSi,
    /// Power-of-two units (memory bytes).
    BinarySi,
}

/// A non-negative integer amount of some resource.
///
/// All arithmetic is exact integer arithmetic. Subtraction is checked so
/// that an allocation can never drive an availability below zero without
/// the caller noticing.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quantity {
    value: u64,
    format: Format,
}

impl Quantity {
    pub const ZERO: Quantity = Quantity {
        value: 0,
        format: Format::DecimalSi,
    };

    /// A decimal-unit quantity (counts, millicpu).
    pub fn decimal(value: u64) -> Self {
        Self {
            value,
            format: Format::DecimalSi,
        }
    }

    /// A binary-unit quantity (memory bytes).
    pub fn binary(value: u64) -> Self {
        Self {
            value,
            format: Format::BinarySi,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0
    }

    /// Subtracts `other`, or returns `None` if the result would be
    /// negative. The unit hint of `self` is kept.
    pub fn checked_sub(&self, other: &Quantity) -> Option<Quantity> {
        self.value.checked_sub(other.value).map(|value| Quantity {
            value,
            format: self.format,
        })
    }

    /// Adds `other`, saturating at `u64::MAX`. The unit hint of `self` is
    /// kept.
    pub fn saturating_add(&self, other: &Quantity) -> Quantity {
        Quantity {
            value: self.value.saturating_add(other.value),
            format: self.format,
        }
    }
}

// Equality and ordering ignore the unit hint: 1024 bytes == 1024 of
// anything as far as accounting is concerned.
impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

// Persisted form is the bare integer; the unit hint is runtime-only.
impl Serialize for Quantity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.value)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        Ok(Quantity::decimal(value))
    }
}
