//! # PDU Framing
//!
//! Splits a byte stream of back-to-back CFDP PDUs into individual PDUs using
//! only the fixed header:
//!
//! ```text
//! byte 0      version / type / direction / mode / CRC / large-file flags
//! bytes 1..3  data field length (big endian)
//! byte 3      bit 0 segmentation control, bits 1..3 entity id length - 1,
//!             bit 4 segment metadata, bits 5..7 sequence number length - 1
//! ```
//!
//! followed by two entity ids and a sequence number. Reads may split a PDU at
//! any byte, including inside the header.

/// Length of the part of the header that is always present.
pub const FIXED_HEADER_LEN: usize = 4;

/// Full length of the PDU whose first four bytes are `header`.
pub fn pdu_length(header: &[u8; FIXED_HEADER_LEN]) -> usize {
    let data_length = u16::from_be_bytes([header[1], header[2]]) as usize;
    let entity_id_length = ((header[3] >> 4) & 0x07) as usize + 1;
    let sequence_number_length = (header[3] & 0x07) as usize + 1;
    FIXED_HEADER_LEN + 2 * entity_id_length + sequence_number_length + data_length
}

#[derive(Debug, Default)]
pub struct PduFramer {
    pending: Vec<u8>,
    expected: Option<usize>,
}

impl PduFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds the next chunk of the stream. `emit` is called once per PDU
    /// completed by this chunk; an error from it stops framing and is returned.
    /// On success returns the number of PDUs emitted.
    pub fn push<E>(&mut self, mut chunk: &[u8], mut emit: impl FnMut(&[u8]) -> Result<(), E>) -> Result<usize, E> {
        let mut emitted = 0;
        while !chunk.is_empty() {
            let target = match self.expected {
                Some(length) => length,
                None => FIXED_HEADER_LEN,
            };
            let take = (target - self.pending.len()).min(chunk.len());
            self.pending.extend_from_slice(&chunk[..take]);
            chunk = &chunk[take..];

            if self.expected.is_none() && self.pending.len() == FIXED_HEADER_LEN {
                let mut header = [0u8; FIXED_HEADER_LEN];
                header.copy_from_slice(&self.pending);
                let length = pdu_length(&header);
                tracing::trace!(length, "framing PDU");
                self.expected = Some(length);
            }

            if let Some(length) = self.expected {
                if self.pending.len() == length {
                    let result = emit(&self.pending);
                    self.pending.clear();
                    self.expected = None;
                    result?;
                    emitted += 1;
                }
            }
        }
        Ok(emitted)
    }

    /// Bytes of a PDU that has started but not completed.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Ends the stream, returning a trailing partial PDU if there is one.
    pub fn finish(self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending)
        }
    }
}
