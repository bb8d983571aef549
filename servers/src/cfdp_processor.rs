use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;

use lib_cfdp::{
    CfdpProcessor, EngineCallbacks, EngineError, EntityId, FinishedTransactionsHistory, IngestActionRequest,
    IngestSource, ProtocolEngine, ShutdownInterrupt,
};

mod processor_logic;
use processor_logic::{config, logger, logging_engine::LoggingEngine, pdu_listener, pdu_sender};

/// Daily log files kept on startup.
const KEPT_LOG_FILES: usize = 7;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let config = config::load_config();
    let _log_guard = logger::setup_logging(&config.log_dir(), &config.log_level(), KEPT_LOG_FILES)?;

    let processor_config = config.processor_config()?;
    let history = Arc::new(FinishedTransactionsHistory::new(processor_config.history_retention()));

    let mut processor = CfdpProcessor::new(processor_config, history.clone());
    if let Some(addr) = config.pdu_send_addr {
        processor = processor.with_outbound_pdu_sink(pdu_sender::udp_sink(addr)?);
    }
    processor.start(
        &|local: EntityId, callbacks: EngineCallbacks| -> Result<Box<dyn ProtocolEngine>, EngineError> {
            Ok(Box::new(LoggingEngine::new(local, callbacks)))
        },
    )?;

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let listener_handle = match config.pdu_listen_addr {
        Some(addr) => {
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding PDU listener to {addr}"))?;
            Some(tokio::spawn(pdu_listener::run(
                socket,
                processor.inbound_pdu_publisher()?,
                shutdown_tx.subscribe(),
            )))
        }
        None => None,
    };

    if let Some(file_name) = config.ingest_file.clone() {
        let client = processor.action_client()?;
        tokio::spawn(async move {
            let request = IngestActionRequest {
                source: IngestSource::File,
                file_name,
            };
            match client.ingest(request).await {
                Ok(result) if result.is_success() => tracing::info!(message = ?result.message, "ingest finished"),
                Ok(result) => tracing::warn!(message = ?result.message, "ingest not carried out"),
                Err(e) => tracing::error!(error = %e, "ingest request failed"),
            }
        });
    }

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        tracing::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot listen for SIGTERM");
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Stop accepting PDUs before the rings go away.
    let _ = shutdown_tx.send(());
    if let Some(handle) = listener_handle {
        match handle.await {
            Ok(Ok(stats)) => tracing::info!(?stats, "PDU listener finished"),
            Ok(Err(e)) => tracing::error!(error = %e, "PDU listener failed"),
            Err(e) => tracing::error!(error = %e, "PDU listener task panicked"),
        }
    }

    // A second Ctrl-C cuts the processor shutdown short.
    let interrupt = ShutdownInterrupt::new();
    let second_signal = {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                tracing::warn!("Second Ctrl-C received, forcing shutdown.");
                interrupt.raise();
            }
        })
    };

    let report = tokio::task::spawn_blocking(move || processor.shutdown(&interrupt)).await?;
    second_signal.abort();

    if report.is_clean() {
        tracing::info!(finished_transactions = history.len(), "Shutdown complete.");
    } else {
        tracing::warn!(interrupted = report.interrupted, failures = ?report.failures, "Shutdown completed with problems.");
    }
    Ok(())
}
