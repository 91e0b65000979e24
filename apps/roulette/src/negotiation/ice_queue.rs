use std::collections::VecDeque;

use crate::transport::{PeerTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    Queued,
    /// The transport refused the candidate; it is not retried.
    Failed,
    /// The transport is closed; the candidate was discarded.
    Discarded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
    pub discarded: usize,
}

/// Remote candidates held back until a remote description exists.
///
/// `flush` takes `&mut self` and awaits each candidate in turn, so one
/// session can never have two drains in flight and arrival order is kept.
#[derive(Debug, Default)]
pub struct IceCandidateQueue {
    backlog: VecDeque<String>,
    remote_ready: bool,
}

impl IceCandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.backlog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backlog.is_empty()
    }

    pub async fn enqueue_or_apply(
        &mut self,
        transport: &dyn PeerTransport,
        candidate: String,
    ) -> CandidateDisposition {
        if transport.is_closed() {
            return CandidateDisposition::Discarded;
        }
        if !self.remote_ready {
            self.backlog.push_back(candidate);
            tracing::trace!(backlog = self.backlog.len(), "queued remote candidate");
            return CandidateDisposition::Queued;
        }
        apply(transport, &candidate).await
    }

    /// Marks the remote description as set and drains the backlog in arrival
    /// order. Call once per successful remote-description assignment.
    pub async fn flush(&mut self, transport: &dyn PeerTransport) -> FlushReport {
        self.remote_ready = true;
        let mut report = FlushReport::default();
        while let Some(candidate) = self.backlog.pop_front() {
            match apply(transport, &candidate).await {
                CandidateDisposition::Applied => report.applied += 1,
                CandidateDisposition::Failed => report.failed += 1,
                CandidateDisposition::Discarded => {
                    report.discarded = 1 + self.backlog.len();
                    self.backlog.clear();
                    break;
                }
                CandidateDisposition::Queued => {}
            }
        }
        if report != FlushReport::default() {
            tracing::debug!(
                applied = report.applied,
                failed = report.failed,
                discarded = report.discarded,
                "flushed candidate backlog"
            );
        }
        report
    }

    pub fn clear(&mut self) {
        self.backlog.clear();
        self.remote_ready = false;
    }
}

async fn apply(transport: &dyn PeerTransport, candidate: &str) -> CandidateDisposition {
    match transport.add_ice_candidate(candidate).await {
        Ok(()) => CandidateDisposition::Applied,
        Err(TransportError::Closed) => CandidateDisposition::Discarded,
        Err(err) => {
            tracing::warn!(error = %err, "skipping remote candidate");
            CandidateDisposition::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        MockTransport, MockTransportFactory, SessionDescription, TransportEventSink,
        TransportFactory,
    };
    use std::sync::Arc;

    async fn transport() -> (Arc<MockTransportFactory>, Arc<MockTransport>) {
        let factory = MockTransportFactory::new();
        factory
            .create(TransportEventSink::new(1, |_, _| {}))
            .await
            .unwrap();
        let mock = factory.last().unwrap();
        (factory, mock)
    }

    #[tokio::test]
    async fn buffers_until_remote_description_then_applies_in_order() {
        let (_factory, mock) = transport().await;
        let mut queue = IceCandidateQueue::new();
        for c in ["c1", "c2", "c3"] {
            assert_eq!(
                queue.enqueue_or_apply(mock.as_ref(), c.to_string()).await,
                CandidateDisposition::Queued
            );
        }
        assert!(mock.applied_candidates().is_empty());

        mock.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        let report = queue.flush(mock.as_ref()).await;
        assert_eq!(report.applied, 3);
        assert_eq!(mock.applied_candidates(), vec!["c1", "c2", "c3"]);
        assert!(mock.rejected_candidates().is_empty());

        assert_eq!(
            queue.enqueue_or_apply(mock.as_ref(), "c4".into()).await,
            CandidateDisposition::Applied
        );
        assert_eq!(mock.applied_candidates(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn bad_candidate_is_skipped_not_fatal() {
        let (factory, mock) = transport().await;
        factory.reject_candidate("bad");
        let mut queue = IceCandidateQueue::new();
        for c in ["c1", "bad", "c3"] {
            queue.enqueue_or_apply(mock.as_ref(), c.to_string()).await;
        }
        mock.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        let report = queue.flush(mock.as_ref()).await;
        assert_eq!(report.applied, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(mock.applied_candidates(), vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn closed_transport_discards() {
        let (_factory, mock) = transport().await;
        let mut queue = IceCandidateQueue::new();
        queue.enqueue_or_apply(mock.as_ref(), "c1".into()).await;
        queue.enqueue_or_apply(mock.as_ref(), "c2".into()).await;
        mock.close().await;
        assert_eq!(
            queue.enqueue_or_apply(mock.as_ref(), "c3".into()).await,
            CandidateDisposition::Discarded
        );
        let report = queue.flush(mock.as_ref()).await;
        assert_eq!(report.discarded, 2);
        assert!(queue.is_empty());
    }
}
