use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{CallError, TransportError};
use crate::logger::dump_candidate;
use crate::peer::types::{CandidateOrigin, CandidateRecord, IceCandidate};

/// Where remote candidates end up once they may be applied.
#[async_trait]
pub trait CandidateTarget: Send + Sync {
    async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Buffered,
    Applied,
    /// this sequence was already seen
    Duplicate,
    /// the queue is closed
    Dropped,
    Rejected(String),
}

impl CandidateOutcome {
    /// The failure to report when the transport refused the candidate
    pub fn rejection(&self) -> Option<CallError> {
        match self {
            CandidateOutcome::Rejected(reason) => {
                Some(CallError::CandidateApplication(reason.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct RemoteCandidates {
    ready: bool,
    buffered: Vec<CandidateRecord>,
    seen: HashSet<u64>,
}

/// Orders candidates around the remote descriptor: local ones go straight
/// to the relay, remote ones wait until [`CandidateQueue::flush_buffered`].
pub struct CandidateQueue {
    target: Arc<dyn CandidateTarget>,
    outbound: mpsc::UnboundedSender<CandidateRecord>,
    local_sequence: AtomicU64,
    local: parking_lot::Mutex<Vec<IceCandidate>>,
    remote: Mutex<RemoteCandidates>,
    closed: AtomicBool,
}

impl CandidateQueue {
    pub fn new(
        target: Arc<dyn CandidateTarget>,
        outbound: mpsc::UnboundedSender<CandidateRecord>,
    ) -> Self {
        Self {
            target,
            outbound,
            local_sequence: AtomicU64::new(0),
            local: parking_lot::Mutex::new(Vec::new()),
            remote: Mutex::new(RemoteCandidates::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Never blocks; the record is forwarded for relay.
    pub fn enqueue_local(&self, candidate: IceCandidate) -> CandidateRecord {
        dump_candidate("LOCAL", &candidate);
        let record = CandidateRecord {
            origin: CandidateOrigin::Local,
            sequence: self.local_sequence.fetch_add(1, Ordering::SeqCst),
            payload: candidate,
        };
        self.local.lock().push(record.payload.clone());
        if self.outbound.send(record.clone()).is_err() {
            debug!(sequence = record.sequence, "no relay attached for local candidate");
        }
        record
    }

    /// Buffers until the remote descriptor is set, applies afterwards.
    /// `sequence` is the peer-direction store sequence used to drop repeats.
    pub async fn enqueue_remote(&self, sequence: u64, candidate: IceCandidate) -> CandidateOutcome {
        if self.is_closed() {
            debug!(sequence, "queue closed, dropping remote candidate");
            return CandidateOutcome::Dropped;
        }

        let mut remote = self.remote.lock().await;
        if !remote.seen.insert(sequence) {
            debug!(sequence, "duplicate remote candidate ignored");
            return CandidateOutcome::Duplicate;
        }
        let record = CandidateRecord {
            origin: CandidateOrigin::Remote,
            payload: candidate,
            sequence,
        };

        if !remote.ready {
            debug!(sequence, "remote descriptor not set yet, buffering candidate");
            remote.buffered.push(record);
            return CandidateOutcome::Buffered;
        }
        self.apply(&record).await
    }

    /// Applies everything buffered, in arrival order. Only the first call
    /// does anything.
    pub async fn flush_buffered(&self) -> usize {
        let mut remote = self.remote.lock().await;
        if remote.ready {
            return 0;
        }
        remote.ready = true;

        let pending = std::mem::take(&mut remote.buffered);
        let mut applied = 0;
        for record in &pending {
            if self.is_closed() {
                break;
            }
            if self.apply(record).await == CandidateOutcome::Applied {
                applied += 1;
            }
        }
        info!(buffered = pending.len(), applied, "flushed pending remote candidates");
        applied
    }

    async fn apply(&self, record: &CandidateRecord) -> CandidateOutcome {
        dump_candidate("REMOTE", &record.payload);
        match self.target.apply_candidate(&record.payload).await {
            Ok(()) => CandidateOutcome::Applied,
            Err(err) => {
                warn!(sequence = record.sequence, error = %err, "dropping remote candidate");
                CandidateOutcome::Rejected(err.to_string())
            }
        }
    }

    pub async fn buffered_len(&self) -> usize {
        self.remote.lock().await.buffered.len()
    }

    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.local.lock().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        applied: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CandidateTarget for Recorder {
        async fn apply_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
            if !candidate.candidate.starts_with("candidate:") {
                return Err(TransportError::Candidate(candidate.candidate.clone()));
            }
            self.applied.lock().push(candidate.candidate.clone());
            Ok(())
        }
    }

    fn queue() -> (
        CandidateQueue,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<CandidateRecord>,
    ) {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (CandidateQueue::new(recorder.clone(), tx), recorder, rx)
    }

    fn cand(n: u16) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
            5000 + n
        ))
    }

    #[tokio::test]
    async fn local_candidates_are_forwarded_in_order() {
        let (queue, _, mut rx) = queue();
        queue.enqueue_local(cand(1));
        queue.enqueue_local(cand(2));
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.sequence, second.sequence), (0, 1));
        assert_eq!(first.origin, CandidateOrigin::Local);
        assert_eq!(queue.local_candidates().len(), 2);
    }

    #[tokio::test]
    async fn remote_candidates_wait_for_flush() {
        let (queue, recorder, _rx) = queue();
        assert_eq!(queue.enqueue_remote(0, cand(1)).await, CandidateOutcome::Buffered);
        assert_eq!(queue.enqueue_remote(1, cand(2)).await, CandidateOutcome::Buffered);
        assert!(recorder.applied.lock().is_empty());

        assert_eq!(queue.flush_buffered().await, 2);
        assert_eq!(
            *recorder.applied.lock(),
            vec![cand(1).candidate, cand(2).candidate]
        );

        assert_eq!(queue.enqueue_remote(2, cand(3)).await, CandidateOutcome::Applied);
        assert_eq!(recorder.applied.lock().len(), 3);
    }

    #[tokio::test]
    async fn second_flush_applies_nothing() {
        let (queue, recorder, _rx) = queue();
        queue.enqueue_remote(0, cand(1)).await;
        assert_eq!(queue.flush_buffered().await, 1);
        assert_eq!(queue.flush_buffered().await, 0);
        assert_eq!(recorder.applied.lock().len(), 1);
        assert_eq!(queue.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn repeated_sequence_is_applied_once() {
        let (queue, recorder, _rx) = queue();
        queue.flush_buffered().await;
        assert_eq!(queue.enqueue_remote(7, cand(1)).await, CandidateOutcome::Applied);
        assert_eq!(queue.enqueue_remote(7, cand(1)).await, CandidateOutcome::Duplicate);
        assert_eq!(recorder.applied.lock().len(), 1);
    }

    #[tokio::test]
    async fn malformed_candidate_is_dropped_not_fatal() {
        let (queue, recorder, _rx) = queue();
        queue.enqueue_remote(0, IceCandidate::new("bogus")).await;
        queue.enqueue_remote(1, cand(2)).await;
        assert_eq!(queue.flush_buffered().await, 1);
        assert_eq!(*recorder.applied.lock(), vec![cand(2).candidate]);

        let outcome = queue.enqueue_remote(2, IceCandidate::new("also bogus")).await;
        assert!(matches!(outcome, CandidateOutcome::Rejected(_)));
        assert!(matches!(
            outcome.rejection(),
            Some(CallError::CandidateApplication(_))
        ));
        assert!(CandidateOutcome::Applied.rejection().is_none());
    }

    #[tokio::test]
    async fn closed_queue_drops_late_candidates() {
        let (queue, recorder, _rx) = queue();
        queue.flush_buffered().await;
        queue.close();
        assert_eq!(queue.enqueue_remote(0, cand(1)).await, CandidateOutcome::Dropped);
        assert!(recorder.applied.lock().is_empty());
    }
}
