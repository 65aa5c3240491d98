use crate::error::RudpError;
use crate::sequence_number::SequenceNumber;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace};

/// Completion for one transmit-queue entry. It fires exactly once: with the
///  payload size when an incoming cumulative ack removes the entry, or with an
///  error when the queue is torn down.
pub(crate) type SendCompletion = oneshot::Sender<Result<usize, RudpError>>;

struct TransmitEntry {
    sequence: SequenceNumber,
    payload_size: usize,
    completion: Option<SendCompletion>,
    retransmit: Option<JoinHandle<()>>,
}

/// Ordered collection of in-flight outgoing packets for one connection.
///
/// Each entry carries a replayable send closure: pushing invokes it once for
///  the initial wire transmit, and a spawned timer task re-invokes it at the
///  retransmit interval until the entry is removed. Removal happens when an
///  incoming ack covers the entry's sequence number (modular comparison), or
///  on teardown.
pub(crate) struct TransmitQueue {
    entries: Mutex<VecDeque<TransmitEntry>>,
}

impl TransmitQueue {
    pub fn new() -> TransmitQueue {
        TransmitQueue {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a packet and transmit it once inline; retransmits are driven by
    ///  a timer task until [`TransmitQueue::apply_ack`] removes the entry.
    ///
    /// `send_step` must be replayable: every invocation performs one complete
    ///  wire transmit of the same packet.
    pub async fn push<F, Fut>(
        &self,
        sequence: SequenceNumber,
        payload_size: usize,
        retransmit_interval: Duration,
        send_step: F,
        completion: SendCompletion,
    ) where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.entries.lock().unwrap().push_back(TransmitEntry {
            sequence,
            payload_size,
            completion: Some(completion),
            retransmit: None,
        });

        send_step().await;

        let handle = tokio::spawn(async move {
            loop {
                time::sleep(retransmit_interval).await;
                trace!("retransmitting packet {}", sequence);
                send_step().await;
            }
        });

        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter_mut().find(|e| e.sequence == sequence) {
            entry.retransmit = Some(handle);
        }
        else {
            // acked between the initial transmit and here
            handle.abort();
        }
    }

    /// Remove every entry whose sequence number is covered by the cumulative
    ///  ack, cancelling its retransmit timer and firing its completion with
    ///  success. Idempotent: acking an already-removed sequence is a no-op.
    ///
    /// Returns the number of entries removed.
    pub fn apply_ack(&self, ack: SequenceNumber) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut removed = 0;

        let mut i = 0;
        while i < entries.len() {
            if entries[i].sequence.is_covered_by(ack) {
                let mut entry = entries.remove(i).unwrap();
                if let Some(handle) = entry.retransmit.take() {
                    handle.abort();
                }
                if let Some(completion) = entry.completion.take() {
                    let _ = completion.send(Ok(entry.payload_size));
                }
                removed += 1;
            }
            else {
                i += 1;
            }
        }

        if removed > 0 {
            debug!("ack {} cleared {} in-flight packets", ack, removed);
        }
        removed
    }

    /// Fail all pending entries; used on connection teardown.
    pub fn cancel_all(&self, error: RudpError) {
        let mut entries = self.entries.lock().unwrap();
        while let Some(mut entry) = entries.pop_front() {
            if let Some(handle) = entry.retransmit.take() {
                handle.abort();
            }
            if let Some(completion) = entry.completion.take() {
                let _ = completion.send(Err(error.clone()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl Drop for TransmitQueue {
    fn drop(&mut self) {
        self.cancel_all(RudpError::Cancelled);
    }
}
