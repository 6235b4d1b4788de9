// ABOUTME: Versioned interface contracts and their lifecycle registry
// ABOUTME: Defines contract records, statuses, versions and revalidation requests

pub mod comparator;
pub mod error;
pub mod registry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use comparator::{ChangeKind, ChangeReport, SchemaComparator, SpecChange, SpecComparator};
pub use error::ContractError;
pub use registry::ContractRegistry;

/// Registry handle shared between the executor, the gate and callers.
pub type SharedRegistry = Arc<RwLock<ContractRegistry>>;

/// Opaque specification blob; only a [`SpecComparator`] looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractPayload(pub serde_json::Value);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractStatus {
    Draft,
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractVersion {
    pub major: u32,
    pub minor: u32,
}

/// Input to [`ContractRegistry::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractSpec {
    pub name: String,
    pub contract_type: String,
    pub producer: String,
    pub payload: ContractPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub name: String,
    pub version: ContractVersion,
    pub contract_type: String,
    pub payload: ContractPayload,
    pub status: ContractStatus,
    pub producer: String,
    pub consumers: BTreeSet<String>,
    pub supersedes: Option<String>,
    pub superseded_by: Option<String>,
    pub breaking_changes: bool,
    #[serde(default)]
    pub changes: Vec<SpecChange>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// A consumer that must be re-validated because the contract it relied on
/// evolved incompatibly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationRequest {
    pub contract_id: String,
    pub successor_id: String,
    pub consumer: String,
}

/// Answers whether a producing node has reached terminal success in the
/// current run. Lockdown is only allowed once it has.
pub trait ProducerLedger {
    fn has_succeeded(&self, node_id: &str) -> bool;
}

impl ContractVersion {
    pub fn initial() -> Self {
        Self { major: 1, minor: 0 }
    }

    pub fn next(&self, breaking: bool) -> Self {
        if breaking {
            Self {
                major: self.major + 1,
                minor: 0,
            }
        } else {
            Self {
                major: self.major,
                minor: self.minor + 1,
            }
        }
    }
}

impl Contract {
    pub fn contract_id(name: &str, version: ContractVersion) -> String {
        format!("{}@{}", name, version)
    }

    pub fn is_active(&self) -> bool {
        self.status == ContractStatus::Active
    }
}

impl ContractSpec {
    pub fn new(name: &str, contract_type: &str, producer: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            contract_type: contract_type.to_string(),
            producer: producer.to_string(),
            payload: ContractPayload(payload),
        }
    }
}

impl fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractStatus::Draft => write!(f, "DRAFT"),
            ContractStatus::Active => write!(f, "ACTIVE"),
            ContractStatus::Deprecated => write!(f, "DEPRECATED"),
        }
    }
}

impl<F> ProducerLedger for F
where
    F: Fn(&str) -> bool,
{
    fn has_succeeded(&self, node_id: &str) -> bool {
        self(node_id)
    }
}
