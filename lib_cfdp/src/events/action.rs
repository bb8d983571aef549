//! # Action Event Slot
//!
//! The reusable record carried by the action and ingest-action rings. Field
//! groups are populated by the translator that matches the action type; every
//! other field stays at its zero value because the ring clears the slot before
//! any translator runs.

use std::path::PathBuf;

use bytes::Bytes;

use crate::response::ResponseSender;
use crate::ring::EventSlot;
use crate::types::{ActionType, EntityId, IngestSource, RequestId, SelectionMode, SequenceRange};

#[derive(Debug, Default)]
pub struct ActionEvent {
    /// `None` only for a slot that was committed empty (translator failure).
    pub action_type: Option<ActionType>,

    // --- PUT ---
    pub destination_entity: Option<EntityId>,
    pub source_file_name: Option<String>,
    pub destination_file_name: Option<String>,
    /// Also consulted by BY_SERVICE_CLASS selections.
    pub service_class: Option<u8>,
    pub uploaded_file: Option<Bytes>,
    pub session_key: Option<u64>,
    pub messages_to_user: Vec<String>,

    // --- transaction selection ---
    pub selection_mode: Option<SelectionMode>,
    pub remote_entity_id: Option<EntityId>,
    pub transaction_entity_id: Option<EntityId>,
    pub transaction_sequence_numbers: Vec<SequenceRange>,

    // --- INGEST ---
    pub ingest_source: Option<IngestSource>,
    pub ingest_file_name: Option<PathBuf>,

    pub response: Option<ResponseSender>,
    pub request_id: Option<RequestId>,
}

impl EventSlot for ActionEvent {
    fn clear(&mut self) {
        self.action_type = None;

        self.destination_entity = None;
        self.source_file_name = None;
        self.destination_file_name = None;
        self.service_class = None;
        self.uploaded_file = None;
        self.session_key = None;
        // Keeps the allocation for the next occupant.
        self.messages_to_user.clear();

        self.selection_mode = None;
        self.remote_entity_id = None;
        self.transaction_entity_id = None;
        self.transaction_sequence_numbers.clear();

        self.ingest_source = None;
        self.ingest_file_name = None;

        self.response = None;
        self.request_id = None;
    }
}

impl ActionEvent {
    /// True when no field carries a value. Used by tests and by the cycler to
    /// recognise slots committed without content.
    pub fn is_clear(&self) -> bool {
        self.action_type.is_none()
            && self.destination_entity.is_none()
            && self.source_file_name.is_none()
            && self.destination_file_name.is_none()
            && self.service_class.is_none()
            && self.uploaded_file.is_none()
            && self.session_key.is_none()
            && self.messages_to_user.is_empty()
            && self.selection_mode.is_none()
            && self.remote_entity_id.is_none()
            && self.transaction_entity_id.is_none()
            && self.transaction_sequence_numbers.is_empty()
            && self.ingest_source.is_none()
            && self.ingest_file_name.is_none()
            && self.response.is_none()
            && self.request_id.is_none()
    }

    /// Takes the response channel out of the slot. Every completion path goes
    /// through here, so a slot can answer at most once.
    pub fn take_response(&mut self) -> Option<ResponseSender> {
        self.response.take()
    }

    pub fn request_label(&self) -> String {
        match self.request_id {
            Some(id) => id.to_string(),
            None => "<none>".to_string(),
        }
    }
}
