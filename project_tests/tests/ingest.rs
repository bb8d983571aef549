use std::fs;
use std::time::Duration;

use lib_cfdp::{IngestActionRequest, IngestSource, ShutdownInterrupt};
use project_tests::{pdu, start_processor, test_config, wait_for, Observer};

fn ingest(file_name: std::path::PathBuf) -> IngestActionRequest {
    IngestActionRequest {
        source: IngestSource::File,
        file_name,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_file_of_pdus_reaches_engine() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut config = test_config(dir.path());
    // Smaller than a PDU so the framer has to stitch reads together.
    config.pdu_file_read_buffer_size = 5;
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client().unwrap();

    // More PDUs than the inbound ring holds.
    let pdus: Vec<Vec<u8>> = (0..30u8).map(|n| pdu(&vec![n; n as usize + 1])).collect();
    let path = dir.path().join("downlink.pdus");
    fs::write(&path, pdus.concat()).unwrap();

    let result = client.ingest(ingest(path.clone())).await.unwrap();
    assert!(result.is_success(), "{result:?}");
    assert_eq!(
        result.message.as_deref(),
        Some(format!("Successfully ingested all 30 PDU(s) from file {}", path.display()).as_str())
    );

    assert!(wait_for(Duration::from_secs(5), || observer.pdus().len() == 30));
    assert_eq!(observer.pdus(), pdus);

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_last_pdu_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut processor = start_processor(test_config(dir.path()), &observer);
    let client = processor.action_client().unwrap();

    let mut bytes = pdu(b"whole");
    let cut = pdu(b"cut short");
    bytes.extend_from_slice(&cut[..cut.len() - 3]);
    let path = dir.path().join("truncated.pdus");
    fs::write(&path, bytes).unwrap();

    let result = client.ingest(ingest(path)).await.unwrap();
    assert!(result.is_success());
    assert!(result.message.unwrap().ends_with("with last one only partially"));

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_file_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut processor = start_processor(test_config(dir.path()), &observer);
    let client = processor.action_client().unwrap();

    let result = client.ingest(ingest(dir.path().join("absent.pdus"))).await.unwrap();
    assert!(result.bad_request);
    assert!(observer.pdus().is_empty());

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}
