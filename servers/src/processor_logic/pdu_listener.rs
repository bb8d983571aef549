use anyhow::Result;
use chrono::Utc;
use lib_cfdp::events::THEORETICAL_MAX_PDU_SIZE;
use lib_cfdp::{InboundPduPublisher, PduProvenance, PduPublishError};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

/// Counters reported when the listener stops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub received: u64,
    pub published: u64,
    pub dropped: u64,
}

/// Receives one PDU per UDP datagram and publishes it to the inbound ring
/// until shutdown is signalled or the ring stops accepting.
pub async fn run(
    socket: UdpSocket,
    publisher: InboundPduPublisher,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<ListenerStats> {
    let mut stats = ListenerStats::default();
    let mut buffer = vec![0u8; THEORETICAL_MAX_PDU_SIZE];
    tracing::info!(addr = ?socket.local_addr().ok(), "PDU listener started");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("PDU listener received shutdown signal.");
                break;
            }
            received = socket.recv_from(&mut buffer) => {
                let (length, peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };
                stats.received += 1;
                match publish(&publisher, buffer[..length].to_vec(), peer).await {
                    Ok(()) => stats.published += 1,
                    Err(PduPublishError::Ring(e)) => {
                        tracing::info!(error = %e, "inbound ring closed, PDU listener stopping");
                        stats.dropped += 1;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(%peer, length, error = %e, "inbound PDU not published");
                        stats.dropped += 1;
                    }
                }
            }
        }
    }

    tracing::info!(?stats, "PDU listener stopped");
    Ok(stats)
}

/// The publish may block on backpressure, so it runs off the async workers.
async fn publish(publisher: &InboundPduPublisher, pdu: Vec<u8>, peer: SocketAddr) -> Result<(), PduPublishError> {
    let publisher = publisher.clone();
    let provenance = PduProvenance {
        ert: Some(Utc::now()),
        ..PduProvenance::default()
    };
    match tokio::task::spawn_blocking(move || publisher.publish(&pdu, provenance)).await {
        Ok(published) => {
            let sequence = published?;
            tracing::trace!(%peer, sequence, "inbound PDU published");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "PDU publish task failed");
            Err(PduPublishError::Dropped)
        }
    }
}
