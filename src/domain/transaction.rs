use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

use crate::phone::CanonicalPhone;

/// Direction and purpose of the money movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Customer payment pulled via STK push.
    StkPush,
    /// Business-initiated payout (supplier payment).
    B2c,
    /// Customer refund, delivered as a B2C payout.
    Refund,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::StkPush => "STK_PUSH",
            TransactionKind::B2c => "B2C",
            TransactionKind::Refund => "REFUND",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STK_PUSH" => Some(TransactionKind::StkPush),
            "B2C" => Some(TransactionKind::B2c),
            "REFUND" => Some(TransactionKind::Refund),
            _ => None,
        }
    }

    /// Collections are settled through the STK callback/query path;
    /// payouts and refunds through the B2C result path.
    pub fn is_collection(&self) -> bool {
        matches!(self, TransactionKind::StkPush)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransactionKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(TransactionStatus::Pending),
            "SUCCESS" => Some(TransactionStatus::Success),
            "FAILED" => Some(TransactionStatus::Failed),
            "CANCELLED" => Some(TransactionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }

    /// The monotonic state machine: Pending may move to any terminal
    /// state; terminal states accept nothing.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        matches!(self, TransactionStatus::Pending) && next.is_terminal()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TransactionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Weak reference to the sale or purchase order a transaction settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkedRecord {
    Sale(Uuid),
    PurchaseOrder(Uuid),
}

/// Correlation identifiers issued by the gateway at initiation. The
/// checkout request id (collections) or conversation id (payouts) is the
/// key later echoed in callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationIds {
    Collection {
        merchant_request_id: String,
        checkout_request_id: String,
    },
    Payout {
        conversation_id: String,
        originator_conversation_id: String,
    },
}

impl CorrelationIds {
    /// The identifier used to match an inbound callback to this entry.
    pub fn matching_key(&self) -> &str {
        match self {
            CorrelationIds::Collection {
                checkout_request_id,
                ..
            } => checkout_request_id,
            CorrelationIds::Payout {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Collections carry checkout/merchant ids, payouts conversation
    /// ids; attaching the wrong pair would route the entry to the wrong
    /// webhook path.
    pub fn matches_kind(&self, kind: TransactionKind) -> bool {
        match self {
            CorrelationIds::Collection { .. } => kind.is_collection(),
            CorrelationIds::Payout { .. } => !kind.is_collection(),
        }
    }
}

/// Input for a new ledger entry. Phone must already be canonical; the
/// ledger rejects non-positive amounts.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub phone: CanonicalPhone,
    pub linked_record: Option<LinkedRecord>,
}

/// A ledger entry tracking one payment attempt through its lifecycle.
/// Created Pending, mutated only by the callback handler, the
/// reconciliation engine, or an operator override; never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub kind: TransactionKind,
    pub amount: BigDecimal,
    pub phone_number: String,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub mpesa_receipt_number: Option<String>,
    pub status: TransactionStatus,
    pub result_desc: Option<String>,
    pub linked_record: Option<LinkedRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(new: NewTransaction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: new.kind,
            amount: new.amount,
            phone_number: new.phone.into_string(),
            merchant_request_id: None,
            checkout_request_id: None,
            conversation_id: None,
            originator_conversation_id: None,
            mpesa_receipt_number: None,
            status: TransactionStatus::Pending,
            result_desc: None,
            linked_record: new.linked_record,
            created_at: now,
            updated_at: now,
        }
    }

    /// The correlation id under which callbacks for this entry arrive,
    /// if initiation got far enough to record one.
    pub fn matching_correlation_id(&self) -> Option<&str> {
        self.checkout_request_id
            .as_deref()
            .or(self.conversation_id.as_deref())
    }
}
