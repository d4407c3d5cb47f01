//! Governance Module
//! VoteRequest extraction, deduplication and tallying, plus discussion stage classification

pub mod stage;
pub mod vote_requests;

// Re-export main types
pub use stage::{classify_stage, KeywordStageClassifier, StageClassification, StageClassifier, STAGE_LABELS};
pub use vote_requests::{
    dedup_vote_requests, load_vote_requests, voting_threshold, GovernanceSummary, ProposalStatus,
    Vote, VoteRequest, VoteRequestView, VoteTally,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("Event {0} is not a VoteRequest")]
    NotAVoteRequest(String),
    #[error("Missing field '{0}' in VoteRequest payload")]
    MissingField(&'static str),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}
