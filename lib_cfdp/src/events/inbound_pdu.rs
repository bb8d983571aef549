//! # Inbound PDU Event Slot
//!
//! A fixed-capacity byte buffer sized for the largest PDU the protocol can
//! express, plus the telemetry provenance that travels with it. The buffer is
//! allocated once when the ring is built and is never resized; only the
//! `length` field changes between occupants.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ring::EventSlot;

/// Fixed PDU header (4) + two entity ids (8 each) + sequence number (8) +
/// the largest data field a 16-bit length can describe.
pub const THEORETICAL_MAX_PDU_SIZE: usize = 4 + 8 + 8 + 8 + u16::MAX as usize;

/// Session and dictionary context of the telemetry stream a PDU arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendedMetadata {
    pub session_id: Option<u64>,
    pub session_name: Option<String>,
    pub fsw_dictionary_dir: Option<PathBuf>,
    pub fsw_version: Option<String>,
    pub venue_type: Option<String>,
    pub testbed_name: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub scid: Option<u16>,
    pub apid: Option<u16>,
    pub product_type: Option<String>,
    pub vcid: Option<u8>,
    pub sequence_id: Option<u32>,
    pub sequence_version: Option<u32>,
    pub command_number: Option<u32>,
    pub relay_scid: Option<u16>,
}

/// Where and when a PDU was received.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PduProvenance {
    pub output_directory: Option<PathBuf>,
    /// Spacecraft clock, kept in its mission-specific textual form.
    pub sclk: Option<String>,
    pub scet: Option<DateTime<Utc>>,
    /// Local solar time, textual.
    pub lst: Option<String>,
    pub ert: Option<DateTime<Utc>>,
    pub source_packet_seq_count: Option<u32>,
    pub metadata: Option<ExtendedMetadata>,
}

#[derive(Debug)]
pub struct InboundPduEvent {
    buffer: Box<[u8]>,
    length: usize,
    pub provenance: PduProvenance,
}

impl Default for InboundPduEvent {
    fn default() -> Self {
        Self {
            buffer: vec![0u8; THEORETICAL_MAX_PDU_SIZE].into_boxed_slice(),
            length: 0,
            provenance: PduProvenance::default(),
        }
    }
}

impl EventSlot for InboundPduEvent {
    fn clear(&mut self) {
        // The stale bytes beyond `length` are never read, so they stay.
        self.length = 0;
        self.provenance = PduProvenance::default();
    }
}

/// Returned by [`InboundPduEvent::copy_in`] when the PDU cannot fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("PDU of {length} bytes exceeds slot capacity of {capacity} bytes")]
pub struct PduTooLarge {
    pub length: usize,
    pub capacity: usize,
}

impl InboundPduEvent {
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The valid prefix of the buffer. Nothing past `length` is ever exposed.
    pub fn pdu(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    /// Copies exactly `pdu.len()` bytes in. The length is checked before a
    /// single byte moves.
    pub fn copy_in(&mut self, pdu: &[u8]) -> Result<(), PduTooLarge> {
        if pdu.len() > self.buffer.len() {
            return Err(PduTooLarge {
                length: pdu.len(),
                capacity: self.buffer.len(),
            });
        }
        self.buffer[..pdu.len()].copy_from_slice(pdu);
        self.length = pdu.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_in_is_bounded_by_length() {
        let mut event = InboundPduEvent::default();
        event.copy_in(&[0xAA; 64]).unwrap();
        event.copy_in(&[1, 2, 3]).unwrap();
        assert_eq!(event.pdu(), &[1, 2, 3]);
        assert_eq!(event.len(), 3);
    }

    #[test]
    fn test_oversize_pdu_is_rejected_untouched() {
        let mut event = InboundPduEvent::default();
        event.copy_in(&[7, 7]).unwrap();
        let oversize = vec![0u8; THEORETICAL_MAX_PDU_SIZE + 1];
        let err = event.copy_in(&oversize).unwrap_err();
        assert_eq!(err.length, THEORETICAL_MAX_PDU_SIZE + 1);
        assert_eq!(event.pdu(), &[7, 7]);
    }

    #[test]
    fn test_clear_resets_length_and_provenance() {
        let mut event = InboundPduEvent::default();
        event.copy_in(&[9; 10]).unwrap();
        event.provenance.sclk = Some("123-456".to_string());
        event.clear();
        assert!(event.is_empty());
        assert_eq!(event.provenance, PduProvenance::default());
        assert_eq!(event.capacity(), THEORETICAL_MAX_PDU_SIZE);
    }
}
