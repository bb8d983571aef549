//! # Dispatch
//!
//! Producers, consumers and rules of the three pipelines:
//!
//! | ring          | producers                        | consumer             |
//! |---------------|----------------------------------|----------------------|
//! | action        | [`ActionClient`], periodic tasks | [`EngineCycler`]     |
//! | inbound PDU   | [`InboundPduPublisher`], ingest  | [`EngineCycler`]     |
//! | ingest action | [`EngineCycler`] (INGEST)        | [`PduIngestWorker`]  |

pub mod action_client;
pub mod cycler;
pub mod inbound;
pub mod ingest_worker;
pub mod pdu_framer;
pub mod put;

pub use action_client::{ActionClient, DispatchError};
pub use cycler::{EngineCycler, CLEARED_MESSAGE};
pub use inbound::{InboundPduPublisher, PduPublishError};
pub use ingest_worker::PduIngestWorker;
pub use pdu_framer::PduFramer;
pub use put::MessagesToUserMap;
