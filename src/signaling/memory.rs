use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    CandidateDirection, CandidateEntry, CandidateWatch, DescriptorField, FieldWatch,
    SessionRecord, SignalingStore,
};
use crate::error::SignalingError;
use crate::peer::types::{Descriptor, IceCandidate};
use crate::session::SessionId;
use crate::utils::random_id;

#[derive(Default)]
struct Record {
    fields: SessionRecord,
    offer_candidates: Vec<CandidateEntry>,
    answer_candidates: Vec<CandidateEntry>,
    field_watchers: Vec<(DescriptorField, mpsc::UnboundedSender<Descriptor>)>,
    candidate_watchers: Vec<(CandidateDirection, mpsc::UnboundedSender<CandidateEntry>)>,
}

impl Record {
    fn candidates(&mut self, direction: CandidateDirection) -> &mut Vec<CandidateEntry> {
        match direction {
            CandidateDirection::Offer => &mut self.offer_candidates,
            CandidateDirection::Answer => &mut self.answer_candidates,
        }
    }
}

#[derive(Default)]
struct Inner {
    records: HashMap<SessionId, Record>,
    writes: usize,
}

impl Inner {
    fn record(&mut self, id: &SessionId) -> Result<&mut Record, SignalingError> {
        self.records
            .get_mut(id)
            .ok_or_else(|| SignalingError::NotFound(id.to_string()))
    }
}

/// In-process store shared by cloning. Both peers of a local call hold the
/// same instance.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutating calls so far: creates, field writes, appends, deletes
    pub fn write_count(&self) -> usize {
        self.inner.lock().writes
    }

    /// Watches whose receiver is still alive
    pub fn active_watches(&self, id: &SessionId) -> usize {
        let inner = self.inner.lock();
        inner
            .records
            .get(id)
            .map(|r| {
                r.field_watchers.iter().filter(|(_, tx)| !tx.is_closed()).count()
                    + r.candidate_watchers
                        .iter()
                        .filter(|(_, tx)| !tx.is_closed())
                        .count()
            })
            .unwrap_or(0)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().records.contains_key(id)
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn create_session_record(
        &self,
        requested: Option<&SessionId>,
    ) -> Result<SessionId, SignalingError> {
        let mut inner = self.inner.lock();
        let id = match requested {
            Some(id) if inner.records.contains_key(id) => {
                return Err(SignalingError::AlreadyExists(id.to_string()))
            }
            Some(id) => id.clone(),
            None => loop {
                let id = SessionId::new(random_id());
                if !inner.records.contains_key(&id) {
                    break id;
                }
            },
        };
        inner.records.insert(id.clone(), Record::default());
        inner.writes += 1;
        info!(%id, "session record created");
        Ok(id)
    }

    async fn write_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
        value: &Descriptor,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner.record(id)?;
        record.fields.set(field, value.clone());
        record.field_watchers.retain(|(watched, tx)| {
            *watched != field || tx.send(value.clone()).is_ok()
        });
        inner.writes += 1;
        debug!(%id, ?field, "field written");
        Ok(())
    }

    async fn read_session_record(&self, id: &SessionId) -> Result<SessionRecord, SignalingError> {
        let mut inner = self.inner.lock();
        Ok(inner.record(id)?.fields.clone())
    }

    async fn append_candidate(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
        payload: &IceCandidate,
    ) -> Result<u64, SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner.record(id)?;
        let list = record.candidates(direction);
        let entry = CandidateEntry {
            sequence: list.len() as u64,
            payload: payload.clone(),
        };
        list.push(entry.clone());
        record.candidate_watchers.retain(|(watched, tx)| {
            *watched != direction || tx.send(entry.clone()).is_ok()
        });
        inner.writes += 1;
        debug!(%id, ?direction, sequence = entry.sequence, "candidate appended");
        Ok(entry.sequence)
    }

    async fn list_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<Vec<CandidateEntry>, SignalingError> {
        let mut inner = self.inner.lock();
        Ok(inner.record(id)?.candidates(direction).clone())
    }

    async fn watch_field(
        &self,
        id: &SessionId,
        field: DescriptorField,
    ) -> Result<FieldWatch, SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner.record(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(current) = record.fields.get(field) {
            let _ = tx.send(current.clone());
        }
        record.field_watchers.push((field, tx));
        Ok(rx)
    }

    async fn watch_candidates(
        &self,
        id: &SessionId,
        direction: CandidateDirection,
    ) -> Result<CandidateWatch, SignalingError> {
        let mut inner = self.inner.lock();
        let record = inner.record(id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        record.candidate_watchers.push((direction, tx));
        Ok(rx)
    }

    async fn delete_session_record(&self, id: &SessionId) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        if inner.records.remove(id).is_none() {
            return Err(SignalingError::NotFound(id.to_string()));
        }
        inner.writes += 1;
        info!(%id, "session record deleted");
        Ok(())
    }
}
