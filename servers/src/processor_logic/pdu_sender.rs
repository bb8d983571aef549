use anyhow::{Context, Result};
use lib_cfdp::OutboundPduSink;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

/// Sends each outbound PDU as one UDP datagram to `peer`. The engine calls the
/// sink from the cycler thread, so this uses a plain blocking socket.
pub fn udp_sink(peer: SocketAddr) -> Result<OutboundPduSink> {
    let bind = match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    };
    let socket = UdpSocket::bind(bind).with_context(|| format!("binding PDU sender for {peer}"))?;
    tracing::info!(local = ?socket.local_addr().ok(), %peer, "PDU sender ready");
    Ok(Arc::new(move |pdu: &[u8]| {
        if let Err(e) = socket.send_to(pdu, peer) {
            tracing::warn!(error = %e, %peer, len = pdu.len(), "UDP send failed, PDU dropped");
        }
    }))
}
