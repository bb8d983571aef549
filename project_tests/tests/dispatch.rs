use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use lib_cfdp::dispatch::CLEARED_MESSAGE;
use lib_cfdp::{
    ActionType, BackpressurePolicy, EngineRequest, EntityId, GenericActionRequest, PduProvenance, PutActionRequest,
    RequestScope, SequenceRange, ShutdownInterrupt, TransactionActionRequest, TransactionOperation,
    TransactionSelector,
};
use project_tests::{pdu, start_processor, test_config, wait_for, Observer, UNKNOWN_SEQUENCE};

fn cancel(sequence: u64) -> TransactionActionRequest {
    TransactionActionRequest {
        action: ActionType::Cancel,
        selection: TransactionSelector::ByTransactionIds {
            transaction_entity_id: EntityId(1),
            transaction_sequence_numbers: vec![SequenceRange::single(sequence)],
        },
    }
}

fn put(file: &str, service_class: Option<u8>, messages: Vec<String>) -> PutActionRequest {
    PutActionRequest {
        destination_entity: EntityId(7),
        source_file_name: file.to_string(),
        destination_file_name: None,
        service_class,
        uploaded_file: None,
        session_key: Some(99),
        messages_to_user: messages,
    }
}

fn put_requests(observer: &Observer) -> Vec<lib_cfdp::PutRequest> {
    observer
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            EngineRequest::Put(put) => Some(put),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_actions_reach_engine_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut processor = start_processor(test_config(dir.path()), &observer);
    let client = processor.action_client().unwrap();

    for sequence in 1..=20 {
        let result = client.transaction_action(cancel(sequence)).await.unwrap();
        assert!(result.is_success(), "{result:?}");
    }

    let scopes: Vec<u64> = observer
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            EngineRequest::Transaction {
                operation: TransactionOperation::Cancel,
                scope: RequestScope::Transaction(id),
            } => Some(id.sequence),
            _ => None,
        })
        .collect();
    assert_eq!(scopes, (1..=20).collect::<Vec<_>>());

    let report = tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
    assert!(report.is_clean(), "{report:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recycled_slot_does_not_leak_previous_request() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let config = test_config(dir.path());
    fs::create_dir_all(&config.uplink_files_top_level_directory).unwrap();
    fs::write(config.uplink_files_top_level_directory.join("a.bin"), [1u8; 32]).unwrap();
    let ring_size = config.action_ring_buffer_size as u64;
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client().unwrap();

    // Class 2 with a message, then enough actions to come back to the same slot.
    let first = client.put(put("a.bin", Some(2), vec!["CAFE".to_string()])).await.unwrap();
    assert!(first.is_success(), "{first:?}");
    for sequence in 1..ring_size {
        client.transaction_action(cancel(sequence)).await.unwrap();
    }
    let mut bare = put("a.bin", None, Vec::new());
    bare.session_key = None;
    let second = client.put(bare).await.unwrap();
    assert!(second.is_success(), "{second:?}");

    let puts = put_requests(&observer);
    assert_eq!(puts.len(), 2);
    assert!(puts[0].ack_required);
    assert_eq!(puts[0].messages_to_user, vec![vec![0xCA, 0xFE]]);
    assert_eq!(puts[0].session_key, Some(99));
    assert!(!puts[1].ack_required);
    assert!(puts[1].messages_to_user.is_empty());
    assert_eq!(puts[1].session_key, None);

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_in_recycled_put_slot_carries_only_its_selection() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let config = test_config(dir.path());
    fs::create_dir_all(&config.uplink_files_top_level_directory).unwrap();
    fs::write(config.uplink_files_top_level_directory.join("a.bin"), [1u8; 32]).unwrap();
    let ring_size = config.action_ring_buffer_size as u64;
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client().unwrap();

    // Every PUT-only field populated, then fill the ring so the CANCEL reuses the PUT's slot.
    let mut full = put("a.bin", Some(2), vec!["CAFE".to_string()]);
    full.destination_file_name = Some("remote.bin".to_string());
    assert!(client.put(full).await.unwrap().is_success());
    for _ in 1..ring_size {
        let reset = GenericActionRequest {
            action: ActionType::ResetStat,
        };
        assert!(client.generic_action(reset).await.unwrap().is_success());
    }
    let cancelled = client.transaction_action(cancel(5)).await.unwrap();
    assert!(cancelled.is_success(), "{cancelled:?}");

    let requests = observer.requests();
    assert_eq!(requests.len(), 2, "{requests:?}");
    assert!(matches!(requests[0], EngineRequest::Put(_)));
    assert_eq!(
        requests[1],
        EngineRequest::Transaction {
            operation: TransactionOperation::Cancel,
            scope: RequestScope::Transaction(lib_cfdp::TransactionId {
                entity: EntityId(1),
                sequence: 5,
            }),
        }
    );
    assert_eq!(observer.resets(), ring_size - 1);

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_request_gets_exactly_one_answer() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut processor = start_processor(test_config(dir.path()), &observer);
    let client = processor.action_client().unwrap();

    let rejected = client.transaction_action(cancel(UNKNOWN_SEQUENCE)).await.unwrap();
    assert!(rejected.bad_request);
    assert!(rejected.message.unwrap().contains("not found"));

    observer.panic_on_next_request();
    let panicked = client.transaction_action(cancel(1)).await.unwrap();
    assert!(panicked.internal_error);

    // The cycler survived the panic.
    let after = client.transaction_action(cancel(2)).await.unwrap();
    assert!(after.is_success());

    let missing = client.put(put("nowhere.bin", None, Vec::new())).await.unwrap();
    assert!(missing.bad_request);
    assert!(missing.message.unwrap().starts_with("Source file nowhere.bin does not exist"));

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_put_rejects_undefined_message_to_user() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut config = test_config(dir.path());
    config.messages_to_user_direct_input_enabled = false;
    config.messages_to_user_map = BTreeMap::from([("GREET".to_string(), "48656c6c6f".to_string())]);
    fs::create_dir_all(&config.uplink_files_top_level_directory).unwrap();
    fs::write(config.uplink_files_top_level_directory.join("a.bin"), b"data").unwrap();
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client().unwrap();

    let undefined = client.put(put("a.bin", None, vec!["CAFE".to_string()])).await.unwrap();
    assert!(undefined.bad_request);
    assert_eq!(undefined.message.as_deref(), Some("Message to User CAFE is not defined"));

    let mapped = client.put(put("a.bin", None, vec!["GREET".to_string()])).await.unwrap();
    assert!(mapped.is_success());
    assert_eq!(put_requests(&observer)[0].messages_to_user, vec![b"Hello".to_vec()]);

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_generic_actions() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut config = test_config(dir.path());
    config.messages_to_user_map = BTreeMap::from([("GREET".to_string(), "cafe".to_string())]);
    let saved_state = config.saved_state_directory.clone();
    let mut processor = start_processor(config, &observer);
    let client = processor.action_client().unwrap();
    let generic = |action| GenericActionRequest { action };

    let map = client.generic_action(generic(ActionType::MtuMap)).await.unwrap();
    assert_eq!(map.data, Some(serde_json::json!({ "GREET": "CAFE" })));

    let reset = client.generic_action(generic(ActionType::ResetStat)).await.unwrap();
    assert!(reset.is_success());
    assert_eq!(observer.resets(), 1);

    let saved = client.generic_action(generic(ActionType::SaveState)).await.unwrap();
    assert!(saved.is_success());
    assert!(saved_state.join("state.json").exists());

    let cleared = client.generic_action(generic(ActionType::Clear)).await.unwrap();
    assert_eq!(cleared.message.as_deref(), Some(CLEARED_MESSAGE));
    assert_eq!(observer.resets(), 2);
    assert!(observer.requests().contains(&EngineRequest::Transaction {
        operation: TransactionOperation::Abandon,
        scope: RequestScope::All,
    }));

    let wrong = client.generic_action(generic(ActionType::Cancel)).await.unwrap();
    assert!(wrong.bad_request);

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_selection_modes_map_to_scopes() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut processor = start_processor(test_config(dir.path()), &observer);
    let client = processor.action_client().unwrap();

    let selections = [
        TransactionSelector::All,
        TransactionSelector::ByServiceClass { service_class: 2 },
        TransactionSelector::ByRemoteEntity {
            remote_entity_id: EntityId(5),
        },
    ];
    for selection in selections {
        let result = client
            .transaction_action(TransactionActionRequest {
                action: ActionType::Suspend,
                selection,
            })
            .await
            .unwrap();
        assert!(result.is_success());
    }
    let bad_class = client
        .transaction_action(TransactionActionRequest {
            action: ActionType::Suspend,
            selection: TransactionSelector::ByServiceClass { service_class: 3 },
        })
        .await
        .unwrap();
    assert!(bad_class.bad_request);

    let scopes: Vec<RequestScope> = observer
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            EngineRequest::Transaction { scope, .. } => Some(scope),
            _ => None,
        })
        .collect();
    assert_eq!(
        scopes,
        vec![RequestScope::All, RequestScope::ServiceClass2, RequestScope::Entity(EntityId(5))]
    );

    tokio::task::block_in_place(|| processor.shutdown(&ShutdownInterrupt::new()));
}

#[test]
fn test_inbound_pdus_survive_backpressure_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut config = test_config(dir.path());
    config.inbound_pdu_backpressure = BackpressurePolicy::Block;
    let mut processor = start_processor(config, &observer);
    let publisher = processor.inbound_pdu_publisher().unwrap();

    let producers: Vec<_> = (0..4u8)
        .map(|producer| {
            let publisher = publisher.clone();
            std::thread::spawn(move || {
                for n in 0..50u8 {
                    publisher.publish(&pdu(&[producer, n]), PduProvenance::default()).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || observer.pdus().len() == 200));
    let pdus = observer.pdus();
    for producer in 0..4u8 {
        let order: Vec<u8> = pdus.iter().filter(|p| p[7] == producer).map(|p| p[8]).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }

    let report = processor.shutdown(&ShutdownInterrupt::new());
    assert!(report.is_clean(), "{report:?}");
}

#[test]
fn test_drop_policy_reports_full_ring() {
    let dir = tempfile::tempdir().unwrap();
    let observer = Observer::new();
    let mut config = test_config(dir.path());
    config.inbound_pdu_backpressure = BackpressurePolicy::Drop;
    let mut processor = start_processor(config, &observer);
    let publisher = processor.inbound_pdu_publisher().unwrap();

    // Hold the cycler inside the engine so the ring fills up.
    observer.wedge();
    let cycles = observer.cycles();
    assert!(wait_for(Duration::from_secs(5), || observer.cycles() > cycles));

    let mut dropped = 0;
    for n in 0..20u8 {
        if publisher.publish(&pdu(&[n]), PduProvenance::default()).is_err() {
            dropped += 1;
        }
    }
    assert!(dropped >= 20 - 8 - 1, "only {dropped} dropped");

    observer.unwedge();
    assert!(wait_for(Duration::from_secs(5), || observer.pdus().len() == 20 - dropped));
    processor.shutdown(&ShutdownInterrupt::new());
}
