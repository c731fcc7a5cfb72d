//! Ledger Core Types
//!
//! Identifier newtypes for every ledger entity. All ids are database
//! BIGSERIAL values; ordering on them is meaningful (operations are always
//! locked in ascending `OperationId` order).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Amount in the smallest currency unit (e.g. cents).
///
/// Signed so that balance deltas and balances share one representation;
/// operation and transaction amounts are validated to be strictly positive.
pub type Amount = i64;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw value for SQL binding
            #[inline]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.trim().parse()?))
            }
        }
    };
}

id_type!(
    /// Currency identity
    CurrencyId
);
id_type!(
    /// Account identity
    AccountId
);
id_type!(
    /// Operation identity (lock order key)
    OperationId
);
id_type!(
    /// Transaction identity
    TransactionId
);
id_type!(
    /// Invoice identity
    InvoiceId
);

/// Normalize a user-supplied key: trimmed and lower-cased.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}
