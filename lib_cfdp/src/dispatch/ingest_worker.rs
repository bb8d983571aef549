//! # PDU Ingest Worker
//!
//! Consumer of the ingest-action ring. Each INGEST event names a file of
//! concatenated PDUs; the worker reads it in fixed-size chunks, frames the
//! PDUs and publishes each one into the inbound PDU ring, where the cycler
//! picks them up like any PDU off the network. The INGEST result is answered
//! from here, not from the cycler.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::pdu_framer::PduFramer;
use crate::events::{ActionEvent, InboundPduEvent, PduProvenance};
use crate::response::RequestResult;
use crate::ring::{EventHandler, RingBuffer, RingBufferError};
use crate::sync::sleep;
use crate::translate::translate_pdu;
use crate::types::IngestSource;

pub(crate) const SHUTTING_DOWN: &str = "CFDP Processor is shutting down";

#[derive(Debug, Error)]
enum IngestError {
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Ring(#[from] RingBufferError),
}

enum IngestOutcome {
    Complete,
    LastPartial,
}

pub struct PduIngestWorker {
    inbound: Arc<RingBuffer<InboundPduEvent>>,
    read_buffer_size: usize,
    read_interval: Duration,
    cancel: CancellationToken,
}

impl PduIngestWorker {
    pub fn new(inbound: Arc<RingBuffer<InboundPduEvent>>, read_buffer_size: usize, read_interval: Duration) -> Self {
        Self {
            inbound,
            read_buffer_size,
            read_interval,
            cancel: CancellationToken::new(),
        }
    }

    fn publish(&self, pdu: &[u8]) -> Result<(), IngestError> {
        self.inbound.publish_event(translate_pdu, (pdu, PduProvenance::default()))?;
        Ok(())
    }

    fn ingest_file(&self, path: &Path, count: &mut usize) -> Result<IngestOutcome, IngestError> {
        let mut file = File::open(path)?;
        let mut read_buffer = vec![0u8; self.read_buffer_size];
        let mut framer = PduFramer::new();

        loop {
            if self.cancel.is_cancelled() {
                return Err(IngestError::Interrupted);
            }
            let read = match file.read(&mut read_buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            framer.push(&read_buffer[..read], |pdu| {
                self.publish(pdu)?;
                *count += 1;
                if self.read_interval.is_zero() {
                    return Ok(());
                }
                sleep(&self.cancel, self.read_interval).map_err(|_| IngestError::Interrupted)
            })?;
        }

        match framer.finish() {
            Some(partial) => {
                tracing::warn!(
                    file = %path.display(),
                    bytes = partial.len(),
                    "end of file reached with a partially captured PDU, publishing it anyway"
                );
                self.publish(&partial)?;
                *count += 1;
                Ok(IngestOutcome::LastPartial)
            }
            None => Ok(IngestOutcome::Complete),
        }
    }

    fn ingest(&self, event: &ActionEvent) -> RequestResult {
        let Some(path) = event.ingest_file_name.as_deref() else {
            return RequestResult::bad_request("INGEST request has no file name");
        };
        match event.ingest_source {
            Some(IngestSource::File) => {}
            other => {
                let source = other.map_or_else(|| "<none>".to_string(), |s| s.to_string());
                tracing::error!(%source, "ingest source not supported");
                return RequestResult::bad_request(format!("Ingest source of {source} not supported"));
            }
        }

        let file = path.display();
        let mut count = 0;
        match self.ingest_file(path, &mut count) {
            Ok(IngestOutcome::Complete) => {
                tracing::info!(%file, pdus = count, "ingested PDU file");
                RequestResult::ok_with_message(format!("Successfully ingested all {count} PDU(s) from file {file}"))
            }
            Ok(IngestOutcome::LastPartial) => {
                tracing::warn!(%file, pdus = count, "ingested PDU file, last PDU partial");
                RequestResult::ok_with_message(format!(
                    "Ingested {count} PDU(s) from file {file} with last one only partially"
                ))
            }
            Err(IngestError::Interrupted) => {
                tracing::warn!(%file, pdus = count, "PDU file ingestion interrupted");
                RequestResult::internal_error(format!("Ingestion of PDUs file {file} interrupted"))
            }
            Err(e) => {
                tracing::warn!(%file, pdus = count, error = %e, "PDU file ingestion failed");
                RequestResult::internal_error(format!("Ingested {count} PDU(s) from file {file} until exception: {e}"))
            }
        }
    }
}

impl EventHandler<ActionEvent> for PduIngestWorker {
    fn on_start(&mut self, cancel: &CancellationToken) {
        self.cancel = cancel.clone();
    }

    fn on_event(&mut self, event: &mut ActionEvent, sequence: u64, _end_of_batch: bool) {
        let request = event.request_label();
        tracing::debug!(sequence, %request, "processing INGEST");
        let result = self.ingest(event);
        match event.take_response() {
            Some(response) => {
                if !response.send(result) {
                    tracing::warn!(%request, "INGEST requester no longer waiting for its result");
                }
            }
            None => tracing::error!(%request, "INGEST event carried no response channel"),
        }
    }

    fn on_discard(&mut self, event: &mut ActionEvent, _sequence: u64) {
        if let Some(response) = event.take_response() {
            response.send(RequestResult::internal_error(SHUTTING_DOWN));
        }
    }

    fn on_shutdown(&mut self) {
        tracing::info!("PDU ingest worker stopped");
    }
}
