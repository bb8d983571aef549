//! # Event Slot Types
//!
//! The pre-allocated records that move through the rings. Both implement
//! [`crate::ring::EventSlot`], which is how the ring clears a recycled slot
//! before handing it to a translator.

/// Slot for the action and ingest-action rings.
pub mod action;
/// Slot for the inbound PDU ring.
pub mod inbound_pdu;

pub use action::ActionEvent;
pub use inbound_pdu::{ExtendedMetadata, InboundPduEvent, PduProvenance, PduTooLarge, THEORETICAL_MAX_PDU_SIZE};
