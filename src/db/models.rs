//! Row models and enumerations shared by the repository modules

use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::money::Money;

/// Millisecond precision keeps `created_at` ordering stable for rapid inserts
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Implements string conversion and SQLite TEXT mapping for a fieldless enum
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::InvalidInput(format!(
                        "Invalid {}: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: EngineError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// What produced a bonus-bearing event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Purchase,
    Upgrade,
    Task,
}

text_enum!(SourceType {
    Purchase => "purchase",
    Upgrade => "upgrade",
    Task => "task",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Purchase,
    Upgrade,
    Withdrawal,
}

text_enum!(RequestType {
    Purchase => "purchase",
    Upgrade => "upgrade",
    Withdrawal => "withdrawal",
});

impl RequestType {
    /// Source type used for the bonus cascade on approval, if any
    pub fn bonus_source(&self) -> Option<SourceType> {
        match self {
            RequestType::Purchase => Some(SourceType::Purchase),
            RequestType::Upgrade => Some(SourceType::Upgrade),
            RequestType::Withdrawal => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

text_enum!(RequestStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminLevel {
    High,
    Low,
}

text_enum!(AdminLevel {
    High => "high",
    Low => "low",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarningsEntryType {
    ReferralBonus,
    Task,
}

text_enum!(EarningsEntryType {
    ReferralBonus => "referral_bonus",
    Task => "task",
});

// ============================================================================
// Rows
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub inviter_id: Option<String>,
    pub balance: Money,
    pub total_earnings: Money,
    pub total_referral_bonus: Money,
    pub total_withdrawn: Money,
    pub total_invested: Money,
    pub vip_level: i64,
    /// Downline size at levels 1..=4
    #[serde(default)]
    pub invite_counts: [i64; 4],
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admin {
    pub id: String,
    pub level: AdminLevel,
    pub active: bool,
    pub created_at: String,
}

impl Admin {
    /// Eligible for round-robin assignment
    pub fn in_rotation(&self) -> bool {
        self.active && self.level == AdminLevel::Low
    }

    /// May process requests assigned to other admins
    pub fn can_override(&self) -> bool {
        self.active && self.level == AdminLevel::High
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: String,
    pub request_type: RequestType,
    pub user_id: String,
    pub amount: Money,
    pub status: RequestStatus,
    pub assigned_admin_id: String,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub processed_by: Option<String>,
    pub admin_notes: Option<String>,
    pub metadata_json: Option<String>,
}

impl Request {
    /// Parsed request metadata; absent metadata yields defaults
    pub fn metadata(&self) -> Result<RequestMetadata, EngineError> {
        match self.metadata_json.as_deref() {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(RequestMetadata::default()),
        }
    }
}

/// Recognized request metadata; unknown keys are kept in `extra`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    /// VIP level granted when a purchase/upgrade is approved
    #[serde(default)]
    pub vip_level: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralEdge {
    pub inviter_id: String,
    pub invitee_id: String,
    pub level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BonusRecord {
    pub id: String,
    pub inviter_id: String,
    pub invitee_id: String,
    pub level: u8,
    pub amount: Money,
    pub source_type: SourceType,
    pub source_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarningsEntry {
    pub id: String,
    pub user_id: String,
    pub amount: Money,
    pub entry_type: EarningsEntryType,
    pub source_type: SourceType,
    pub source_id: String,
    pub description: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub actor_id: String,
    pub action: String,
    pub description: String,
    pub metadata_json: Option<String>,
    pub created_at: String,
}
