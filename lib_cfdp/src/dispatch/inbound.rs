//! # Inbound PDU Publisher
//!
//! Entry point for PDUs arriving from outside (network listener, telemetry
//! feed). Oversize PDUs are refused before a sequence is claimed, so they
//! never cost a slot.

use std::sync::Arc;

use thiserror::Error;

use crate::config::BackpressurePolicy;
use crate::events::{InboundPduEvent, PduProvenance, PduTooLarge, THEORETICAL_MAX_PDU_SIZE};
use crate::ring::{RingBuffer, RingBufferError};
use crate::translate::translate_pdu;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PduPublishError {
    #[error(transparent)]
    TooLarge(#[from] PduTooLarge),

    #[error("inbound PDU ring is full, PDU dropped")]
    Dropped,

    #[error(transparent)]
    Ring(#[from] RingBufferError),
}

#[derive(Debug, Clone)]
pub struct InboundPduPublisher {
    ring: Arc<RingBuffer<InboundPduEvent>>,
    policy: BackpressurePolicy,
}

impl InboundPduPublisher {
    pub fn new(ring: Arc<RingBuffer<InboundPduEvent>>, policy: BackpressurePolicy) -> Self {
        Self { ring, policy }
    }

    /// Publishes one PDU. Returns the sequence it was committed at.
    pub fn publish(&self, pdu: &[u8], provenance: PduProvenance) -> Result<u64, PduPublishError> {
        if pdu.len() > THEORETICAL_MAX_PDU_SIZE {
            let err = PduTooLarge {
                length: pdu.len(),
                capacity: THEORETICAL_MAX_PDU_SIZE,
            };
            tracing::warn!(error = %err, "rejecting inbound PDU");
            return Err(err.into());
        }

        let published = match self.policy {
            BackpressurePolicy::Block => self.ring.publish_event(translate_pdu, (pdu, provenance)),
            BackpressurePolicy::Drop => self.ring.try_publish_event(translate_pdu, (pdu, provenance)),
        };
        match published {
            Ok(sequence) => Ok(sequence),
            Err(RingBufferError::Full) => {
                tracing::warn!(length = pdu.len(), "inbound PDU ring full, dropping PDU");
                Err(PduPublishError::Dropped)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn remaining_capacity(&self) -> usize {
        self.ring.remaining_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversize_is_rejected_without_claiming() {
        let ring = Arc::new(RingBuffer::new(2).unwrap());
        let publisher = InboundPduPublisher::new(Arc::clone(&ring), BackpressurePolicy::Block);
        let oversize = vec![0u8; THEORETICAL_MAX_PDU_SIZE + 1];
        assert!(matches!(
            publisher.publish(&oversize, PduProvenance::default()),
            Err(PduPublishError::TooLarge(_))
        ));
        assert_eq!(ring.cursor(), 0);
    }

    #[test]
    fn test_drop_policy_reports_dropped() {
        let ring = Arc::new(RingBuffer::new(1).unwrap());
        let _poller = ring.new_poller().unwrap();
        let publisher = InboundPduPublisher::new(ring, BackpressurePolicy::Drop);
        assert_eq!(publisher.publish(&[1], PduProvenance::default()), Ok(0));
        assert_eq!(publisher.publish(&[2], PduProvenance::default()), Err(PduPublishError::Dropped));
    }
}
