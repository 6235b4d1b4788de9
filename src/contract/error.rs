// ABOUTME: Error types for contract lifecycle operations
// ABOUTME: Conflicts are caller sequencing errors and are never retried

use thiserror::Error;

use super::ContractStatus;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractError {
    #[error("Contract not found: {id}")]
    NotFound { id: String },

    #[error("Contract lineage '{name}' already exists; evolve it instead")]
    DuplicateLineage { name: String },

    #[error("Contract {id} cannot be activated from status {status}")]
    NotDraft { id: String, status: ContractStatus },

    #[error("Contract {id} cannot be activated: producer '{producer}' has not succeeded")]
    ProducerNotSucceeded { id: String, producer: String },

    #[error("Contract {id} is deprecated and no longer accepts consumers")]
    Deprecated { id: String },

    #[error("Contract {id} must be active to evolve (status: {status})")]
    NotActive { id: String, status: ContractStatus },

    #[error("Contract {id} already has a pending successor {successor}")]
    PendingSuccessor { id: String, successor: String },
}

pub type Result<T> = std::result::Result<T, ContractError>;
