// ABOUTME: Contract registry owning the DRAFT -> ACTIVE -> DEPRECATED lifecycle
// ABOUTME: Handles lockdown, evolution with breaking-change detection and consumer tracking

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::comparator::{SchemaComparator, SpecComparator};
use super::error::{ContractError, Result};
use super::{
    Contract, ContractPayload, ContractSpec, ContractStatus, ContractVersion, ProducerLedger,
    RevalidationRequest,
};

#[derive(Serialize, Deserialize)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, Contract>,
    /// Contract name -> ids in version order
    lineages: BTreeMap<String, Vec<String>>,
    pending_revalidation: Vec<RevalidationRequest>,
    #[serde(skip, default = "default_comparator")]
    comparator: Arc<dyn SpecComparator>,
}

fn default_comparator() -> Arc<dyn SpecComparator> {
    Arc::new(SchemaComparator)
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self {
            contracts: BTreeMap::new(),
            lineages: BTreeMap::new(),
            pending_revalidation: Vec::new(),
            comparator: default_comparator(),
        }
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn SpecComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    /// Start a new lineage at version 1.0 in DRAFT
    pub fn create(&mut self, spec: ContractSpec) -> Result<Contract> {
        if self.lineages.contains_key(&spec.name) {
            return Err(ContractError::DuplicateLineage { name: spec.name });
        }

        let version = ContractVersion::initial();
        let contract = Contract {
            id: Contract::contract_id(&spec.name, version),
            name: spec.name.clone(),
            version,
            contract_type: spec.contract_type,
            payload: spec.payload,
            status: ContractStatus::Draft,
            producer: spec.producer,
            consumers: BTreeSet::new(),
            supersedes: None,
            superseded_by: None,
            breaking_changes: false,
            changes: Vec::new(),
            created_at: Utc::now(),
            activated_at: None,
            deprecated_at: None,
        };

        info!("Created contract {} (producer: {})", contract.id, contract.producer);
        self.lineages
            .insert(spec.name, vec![contract.id.clone()]);
        self.contracts.insert(contract.id.clone(), contract.clone());
        Ok(contract)
    }

    /// Lock a DRAFT contract once its producer has succeeded. Activating a
    /// successor deprecates the version it supersedes.
    pub fn activate(&mut self, contract_id: &str, ledger: &dyn ProducerLedger) -> Result<Contract> {
        let contract = self.get(contract_id).ok_or_else(|| ContractError::NotFound {
            id: contract_id.to_string(),
        })?;

        if contract.status != ContractStatus::Draft {
            return Err(ContractError::NotDraft {
                id: contract_id.to_string(),
                status: contract.status,
            });
        }

        if !ledger.has_succeeded(&contract.producer) {
            return Err(ContractError::ProducerNotSucceeded {
                id: contract_id.to_string(),
                producer: contract.producer.clone(),
            });
        }

        let supersedes = contract.supersedes.clone();
        let breaking = contract.breaking_changes;
        let now = Utc::now();

        let mut inherited = BTreeSet::new();
        if let Some(ref previous_id) = supersedes {
            if let Some(previous) = self.contracts.get_mut(previous_id) {
                previous.status = ContractStatus::Deprecated;
                previous.deprecated_at = Some(now);
                if !breaking {
                    inherited = previous.consumers.clone();
                }
                info!("Deprecated contract {} (superseded by {})", previous_id, contract_id);
            }
        }

        let contract = self
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound {
                id: contract_id.to_string(),
            })?;
        contract.status = ContractStatus::Active;
        contract.activated_at = Some(now);
        contract.consumers.extend(inherited);

        info!("Activated contract {}", contract_id);
        Ok(contract.clone())
    }

    /// Create the next version of an ACTIVE contract in DRAFT. A breaking
    /// change bumps the major version and flags every consumer of the
    /// superseded version for re-validation.
    pub fn evolve(&mut self, old_id: &str, payload: ContractPayload) -> Result<Contract> {
        let old = self
            .get(old_id)
            .cloned()
            .ok_or_else(|| ContractError::NotFound {
                id: old_id.to_string(),
            })?;

        if old.status != ContractStatus::Active {
            return Err(ContractError::NotActive {
                id: old_id.to_string(),
                status: old.status,
            });
        }
        if let Some(ref successor) = old.superseded_by {
            return Err(ContractError::PendingSuccessor {
                id: old_id.to_string(),
                successor: successor.clone(),
            });
        }

        let report = self.comparator.compare(&old.payload, &payload);
        let breaking = report.is_breaking();
        let version = old.version.next(breaking);
        let id = Contract::contract_id(&old.name, version);

        let contract = Contract {
            id: id.clone(),
            name: old.name.clone(),
            version,
            contract_type: old.contract_type.clone(),
            payload,
            status: ContractStatus::Draft,
            producer: old.producer.clone(),
            consumers: BTreeSet::new(),
            supersedes: Some(old_id.to_string()),
            superseded_by: None,
            breaking_changes: breaking,
            changes: report.changes,
            created_at: Utc::now(),
            activated_at: None,
            deprecated_at: None,
        };

        if breaking {
            for consumer in &old.consumers {
                self.pending_revalidation.push(RevalidationRequest {
                    contract_id: old_id.to_string(),
                    successor_id: id.clone(),
                    consumer: consumer.clone(),
                });
            }
            warn!(
                "Breaking evolution {} -> {}: {} consumer(s) flagged for re-validation",
                old_id,
                id,
                old.consumers.len()
            );
        } else {
            debug!("Compatible evolution {} -> {}", old_id, id);
        }

        if let Some(previous) = self.contracts.get_mut(old_id) {
            previous.superseded_by = Some(id.clone());
        }
        self.lineages
            .entry(contract.name.clone())
            .or_default()
            .push(id.clone());
        self.contracts.insert(id, contract.clone());
        Ok(contract)
    }

    pub fn register_consumer(&mut self, contract_id: &str, node_id: &str) -> Result<()> {
        let contract = self
            .contracts
            .get_mut(contract_id)
            .ok_or_else(|| ContractError::NotFound {
                id: contract_id.to_string(),
            })?;

        if contract.status == ContractStatus::Deprecated {
            return Err(ContractError::Deprecated {
                id: contract_id.to_string(),
            });
        }

        if contract.consumers.insert(node_id.to_string()) {
            debug!("Registered consumer {} on {}", node_id, contract_id);
        }
        Ok(())
    }

    pub fn is_active(&self, contract_id: &str) -> bool {
        self.get(contract_id).is_some_and(Contract::is_active)
    }

    pub fn get(&self, contract_id: &str) -> Option<&Contract> {
        self.contracts.get(contract_id)
    }

    /// Every version of a lineage, oldest first
    pub fn lineage(&self, name: &str) -> Vec<&Contract> {
        self.lineages
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.contracts.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn active_version(&self, name: &str) -> Option<&Contract> {
        self.lineage(name).into_iter().find(|c| c.is_active())
    }

    pub fn draft_version(&self, name: &str) -> Option<&Contract> {
        self.lineage(name)
            .into_iter()
            .rev()
            .find(|c| c.status == ContractStatus::Draft)
    }

    pub fn latest(&self, name: &str) -> Option<&Contract> {
        self.lineage(name).into_iter().last()
    }

    pub fn contracts(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values()
    }

    pub fn pending_revalidation(&self) -> &[RevalidationRequest] {
        &self.pending_revalidation
    }

    /// Hand the revalidation flags to whoever schedules the re-runs
    pub fn take_revalidation_requests(&mut self) -> Vec<RevalidationRequest> {
        std::mem::take(&mut self.pending_revalidation)
    }

    /// Drain only the requests matching `filter`; the rest stay flagged
    pub fn take_revalidation_where<F>(&mut self, filter: F) -> Vec<RevalidationRequest>
    where
        F: Fn(&RevalidationRequest) -> bool,
    {
        let (taken, kept) = std::mem::take(&mut self.pending_revalidation)
            .into_iter()
            .partition(|request| filter(request));
        self.pending_revalidation = kept;
        taken
    }
}

impl Default for ContractRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContractRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractRegistry")
            .field("contracts", &self.contracts.len())
            .field("lineages", &self.lineages.keys().collect::<Vec<_>>())
            .field("pending_revalidation", &self.pending_revalidation.len())
            .finish()
    }
}
