//! Keyed mailbox both peers use to swap descriptors and candidates before
//! the direct link exists.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::peer::types::{Descriptor, IceCandidate};
use crate::session::{Role, SessionId};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DescriptorField {
    Offer,
    Answer,
}

impl DescriptorField {
    /// The field a participant in `role` writes
    pub fn written_by(role: Role) -> Self {
        match role {
            Role::Caller => DescriptorField::Offer,
            Role::Callee => DescriptorField::Answer,
        }
    }
}

/// Per-session candidate sub-collection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateDirection {
    #[serde(rename = "offerCandidates")]
    Offer,
    #[serde(rename = "answerCandidates")]
    Answer,
}

impl CandidateDirection {
    /// The collection a participant in `role` appends to
    pub fn written_by(role: Role) -> Self {
        match role {
            Role::Caller => CandidateDirection::Offer,
            Role::Callee => CandidateDirection::Answer,
        }
    }

    /// The collection a participant in `role` watches
    pub fn read_by(role: Role) -> Self {
        match role {
            Role::Caller => CandidateDirection::Answer,
            Role::Callee => CandidateDirection::Offer,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<Descriptor>,
}

impl SessionRecord {
    pub fn get(&self, field: DescriptorField) -> Option<&Descriptor> {
        match field {
            DescriptorField::Offer => self.offer.as_ref(),
            DescriptorField::Answer => self.answer.as_ref(),
        }
    }

    pub fn set(&mut self, field: DescriptorField, value: Descriptor) {
        match field {
            DescriptorField::Offer => self.offer = Some(value),
            DescriptorField::Answer => self.answer = Some(value),
        }
    }
}

/// A stored candidate. `sequence` is assigned by the store and increases
/// within one direction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    pub sequence: u64,
    pub payload: IceCandidate,
}

/// Dropping the receiver cancels the watch.
pub type FieldWatch = mpsc::UnboundedReceiver<Descriptor>;
pub type CandidateWatch = mpsc::UnboundedReceiver<CandidateEntry>;

#[async_trait]
pub trait SignalingStore: Send + Sync {
    /// Creates an empty record under `requested`, or under a fresh id
    async fn create_session_record(
        &self,
        requested: Option<&SessionId>,
    ) -> Result<SessionId, SignalingError>;

    /// Merge write: other fields and candidates are left alone
    async fn write_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
        value: &Descriptor,
    ) -> Result<(), SignalingError>;

    async fn read_session_record(&self, id: &SessionId) -> Result<SessionRecord, SignalingError>;

    /// Returns the sequence the store gave the candidate
    async fn append_candidate(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
        payload: &IceCandidate,
    ) -> Result<u64, SignalingError>;

    async fn list_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<Vec<CandidateEntry>, SignalingError>;

    /// Current value first when already set, then every later write
    async fn watch_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
    ) -> Result<FieldWatch, SignalingError>;

    /// Only appends made after subscribing
    async fn watch_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<CandidateWatch, SignalingError>;

    async fn delete_session_record(&self, id: &SessionId) -> Result<(), SignalingError>;
}
