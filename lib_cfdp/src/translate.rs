//! # Translators
//!
//! Functions that write one request into a recycled ring slot. They all have
//! the shape the ring expects, `(slot, sequence, argument)`, and they only
//! ever set fields: the ring has already cleared the slot.

use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::events::{ActionEvent, InboundPduEvent, PduProvenance};
use crate::response::ResponseSender;
use crate::types::{ActionType, EntityId, IngestSource, RequestId, SelectionMode, SequenceRange};

/// A request paired with the channel its result goes back through.
#[derive(Debug)]
pub struct InternalRequest<R> {
    pub request: R,
    pub response: ResponseSender,
    pub request_id: RequestId,
}

impl<R> InternalRequest<R> {
    pub fn new(request: R, response: ResponseSender) -> Self {
        Self {
            request,
            response,
            request_id: RequestId::generate(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutActionRequest {
    pub destination_entity: EntityId,
    pub source_file_name: String,
    /// Defaults to the source file name.
    pub destination_file_name: Option<String>,
    pub service_class: Option<u8>,
    /// File content to store in the uplink directory before sending.
    #[serde(skip)]
    pub uploaded_file: Option<Bytes>,
    pub session_key: Option<u64>,
    #[serde(default)]
    pub messages_to_user: Vec<String>,
}

/// How a transaction-identifying action picks its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionSelector {
    All,
    #[serde(rename_all = "camelCase")]
    ByServiceClass { service_class: u8 },
    #[serde(rename_all = "camelCase")]
    ByRemoteEntity { remote_entity_id: EntityId },
    #[serde(rename_all = "camelCase")]
    ByTransactionIds {
        transaction_entity_id: EntityId,
        transaction_sequence_numbers: Vec<SequenceRange>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionActionRequest {
    pub action: ActionType,
    pub selection: TransactionSelector,
}

/// RESET_STAT, SAVE_STATE, MTU_MAP and CLEAR carry nothing but their type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericActionRequest {
    pub action: ActionType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestActionRequest {
    pub source: IngestSource,
    pub file_name: PathBuf,
}

pub fn translate_put(event: &mut ActionEvent, _sequence: u64, internal: InternalRequest<PutActionRequest>) {
    let InternalRequest {
        request,
        response,
        request_id,
    } = internal;
    event.action_type = Some(ActionType::Put);
    event.destination_entity = Some(request.destination_entity);
    event.source_file_name = Some(request.source_file_name);
    event.destination_file_name = request.destination_file_name;
    event.service_class = request.service_class;
    event.uploaded_file = request.uploaded_file;
    event.session_key = request.session_key;
    event.messages_to_user.extend(request.messages_to_user);
    event.response = Some(response);
    event.request_id = Some(request_id);
}

pub fn translate_transaction_identifying_action(
    event: &mut ActionEvent,
    _sequence: u64,
    internal: InternalRequest<TransactionActionRequest>,
) {
    let InternalRequest {
        request,
        response,
        request_id,
    } = internal;
    event.action_type = Some(request.action);
    match request.selection {
        TransactionSelector::All => {
            event.selection_mode = Some(SelectionMode::All);
        }
        TransactionSelector::ByServiceClass { service_class } => {
            event.selection_mode = Some(SelectionMode::ByServiceClass);
            event.service_class = Some(service_class);
        }
        TransactionSelector::ByRemoteEntity { remote_entity_id } => {
            event.selection_mode = Some(SelectionMode::ByRemoteEntity);
            event.remote_entity_id = Some(remote_entity_id);
        }
        TransactionSelector::ByTransactionIds {
            transaction_entity_id,
            transaction_sequence_numbers,
        } => {
            event.selection_mode = Some(SelectionMode::ByTransactionIds);
            event.transaction_entity_id = Some(transaction_entity_id);
            event.transaction_sequence_numbers.extend(transaction_sequence_numbers);
        }
    }
    event.response = Some(response);
    event.request_id = Some(request_id);
}

pub fn translate_generic_action(event: &mut ActionEvent, _sequence: u64, internal: InternalRequest<GenericActionRequest>) {
    event.action_type = Some(internal.request.action);
    event.response = Some(internal.response);
    event.request_id = Some(internal.request_id);
}

pub fn translate_ingest(event: &mut ActionEvent, _sequence: u64, internal: InternalRequest<IngestActionRequest>) {
    event.action_type = Some(ActionType::Ingest);
    event.ingest_source = Some(internal.request.source);
    event.ingest_file_name = Some(internal.request.file_name);
    event.response = Some(internal.response);
    event.request_id = Some(internal.request_id);
}

/// Copies `pdu` into the slot by its explicit length. Callers check the size
/// before claiming a sequence; a PDU that still does not fit is committed
/// empty.
pub fn translate_pdu(event: &mut InboundPduEvent, sequence: u64, (pdu, provenance): (&[u8], PduProvenance)) {
    if let Err(e) = event.copy_in(pdu) {
        tracing::error!(sequence, error = %e, "PDU did not fit its slot");
        return;
    }
    event.provenance = provenance;
}

/// Moves an INGEST action from an action slot into an ingest-ring slot.
/// Collections are copied; the response channel moves, so the source slot no
/// longer answers for the request.
pub fn copy_ingest(event: &mut ActionEvent, _sequence: u64, source: &mut ActionEvent) {
    event.action_type = source.action_type;
    event.ingest_source = source.ingest_source;
    event.ingest_file_name = source.ingest_file_name.clone();
    event.messages_to_user.extend(source.messages_to_user.iter().cloned());
    event.transaction_sequence_numbers
        .extend(source.transaction_sequence_numbers.iter().copied());
    event.response = source.take_response();
    event.request_id = source.request_id;
}
