//! Ledger Status Definitions
//!
//! Closed enums for every status-bearing entity plus the operation strategy
//! and provider tags. Ids are stable SMALLINT values for PostgreSQL storage;
//! `as_str` values are the wire representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::LedgerError;

/// Generates `id`/`from_id`/`as_str`/`FromStr`/`Display`/`ALL` for a status enum.
macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $id:literal => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        #[repr(i16)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $id),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Numeric id for PostgreSQL storage
            #[inline]
            pub fn id(&self) -> i16 {
                *self as i16
            }

            /// Convert from PostgreSQL id
            pub fn from_id(id: i16) -> Option<Self> {
                match id {
                    $($id => Some($name::$variant),)+
                    _ => None,
                }
            }

            /// Wire name
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = LedgerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(LedgerError::UnknownStatus(format!(
                        "{}: {:?}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl TryFrom<i16> for $name {
            type Error = LedgerError;

            fn try_from(value: i16) -> Result<Self, Self::Error> {
                $name::from_id(value).ok_or_else(|| {
                    LedgerError::UnknownStatus(format!("{} id {}", stringify!($name), value))
                })
            }
        }
    };
}

status_enum!(
    /// Operation status
    ///
    /// ```text
    /// draft → hold → accepted
    ///   │       └──→ rejected
    ///   ├──────────→ accepted
    ///   └──────────→ rejected
    /// ```
    OperationStatus {
        Draft = 0 => "draft",
        /// Funds parked on the hold account
        Hold = 10 => "hold",
        Accepted = 20 => "accepted",
        Rejected = -10 => "rejected",
    }
);

status_enum!(
    /// Transaction status
    ///
    /// `draft`, `auth`, `accepted`, `rejected`, `failed` are the statuses the
    /// Transaction Processor understands. The `*_wait` and `hold` statuses are
    /// strategy-internal sub-states used while an external provider round trip
    /// is in flight.
    TransactionStatus {
        Draft = 0 => "draft",
        Auth = 10 => "auth",
        AuthWait = 11 => "auth_wait",
        Hold = 20 => "hold",
        HoldWait = 21 => "hold_wait",
        Accepted = 30 => "accepted",
        AcceptedWait = 31 => "accepted_wait",
        Rejected = -10 => "rejected",
        RejectedWait = -11 => "rejected_wait",
        /// Terminal: processing failed, nothing was applied
        Failed = -20 => "failed",
    }
);

status_enum!(
    /// Invoice status
    InvoiceStatus {
        Draft = 0 => "draft",
        Auth = 10 => "auth",
        /// Every child authorized, at least one still holding funds
        Wait = 20 => "wait",
        Accepted = 30 => "accepted",
        Rejected = -10 => "rejected",
        ManualAccepted = 40 => "manual_accepted",
        ManualRejected = -40 => "manual_rejected",
    }
);

status_enum!(
    /// Low-level transfer strategy of an operation
    OperationStrategy {
        /// Move funds from src to dst
        SimpleTransfer = 1 => "simple_transfer",
        /// Credit both sides (funds enter the system)
        Recharge = 2 => "recharge",
        /// Debit both sides (funds leave the system)
        Withdraw = 3 => "withdraw",
    }
);

status_enum!(
    /// Who executes a transaction's money movement
    Provider {
        /// Pure ledger movement, no external party
        Internal = 1 => "internal",
        /// External card-network gateway
        Card = 2 => "card",
    }
);

impl TransactionStatus {
    /// Terminal statuses never change again
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Accepted | TransactionStatus::Rejected | TransactionStatus::Failed
        )
    }

    /// An external provider round trip is in flight
    #[inline]
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            TransactionStatus::AuthWait
                | TransactionStatus::HoldWait
                | TransactionStatus::AcceptedWait
                | TransactionStatus::RejectedWait
        )
    }
}

impl InvoiceStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Accepted
                | InvoiceStatus::Rejected
                | InvoiceStatus::ManualAccepted
                | InvoiceStatus::ManualRejected
        )
    }
}

impl Provider {
    /// Queue topic consumed by this provider's worker
    pub fn topic(&self) -> String {
        format!("provider.{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_id_roundtrip() {
        for status in TransactionStatus::ALL {
            assert_eq!(TransactionStatus::from_id(status.id()), Some(*status));
        }
        for status in InvoiceStatus::ALL {
            assert_eq!(InvoiceStatus::from_id(status.id()), Some(*status));
        }
        for status in OperationStatus::ALL {
            assert_eq!(OperationStatus::from_id(status.id()), Some(*status));
        }
    }

    #[test]
    fn test_invalid_status_id() {
        assert!(TransactionStatus::from_id(999).is_none());
        assert!(OperationStatus::try_from(5).is_err());
    }

    #[test]
    fn test_parse_wire_names() {
        assert_eq!(
            "auth_wait".parse::<TransactionStatus>().unwrap(),
            TransactionStatus::AuthWait
        );
        assert_eq!(
            " Simple_Transfer ".parse::<OperationStrategy>().unwrap(),
            OperationStrategy::SimpleTransfer
        );
        assert!("".parse::<Provider>().is_err());
        assert!("paypal".parse::<Provider>().is_err());
    }

    #[test]
    fn test_serde_uses_wire_names() {
        let json = serde_json::to_string(&TransactionStatus::AcceptedWait).unwrap();
        assert_eq!(json, "\"accepted_wait\"");
        let back: InvoiceStatus = serde_json::from_str("\"manual_rejected\"").unwrap();
        assert_eq!(back, InvoiceStatus::ManualRejected);
    }

    #[test]
    fn test_terminal_and_waiting() {
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(!TransactionStatus::Hold.is_terminal());
        assert!(TransactionStatus::RejectedWait.is_waiting());
        assert!(!TransactionStatus::Auth.is_waiting());
        assert!(InvoiceStatus::ManualAccepted.is_terminal());
        assert!(!InvoiceStatus::Wait.is_terminal());
    }

    #[test]
    fn test_provider_topic() {
        assert_eq!(Provider::Card.topic(), "provider.card");
    }
}
