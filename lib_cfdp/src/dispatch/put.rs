//! # PUT Admission
//!
//! Everything a PUT has to pass before the engine sees it: the per-entity
//! transaction and byte budgets, the uplink directory, file and name length
//! limits, and messages-to-user resolution. A rejected PUT becomes a
//! [`RequestResult`] and the engine is never called.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::{ConfigError, ProcessorConfig};
use crate::engine::{ProtocolEngine, PutRequest};
use crate::events::ActionEvent;
use crate::response::RequestResult;

/// Mnemonic → message bytes, as configured in `messagesToUserMap`.
#[derive(Debug, Clone, Default)]
pub struct MessagesToUserMap {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MessagesToUserMap {
    pub fn from_config(config: &ProcessorConfig) -> Result<Self, ConfigError> {
        let mut entries = BTreeMap::new();
        for (mnemonic, encoded) in &config.messages_to_user_map {
            let bytes = hex::decode(encoded).map_err(|e| ConfigError::InvalidMessageToUser {
                mnemonic: mnemonic.clone(),
                reason: e.to_string(),
            })?;
            entries.insert(mnemonic.clone(), bytes);
        }
        Ok(Self { entries })
    }

    pub fn bytes_for(&self, mnemonic: &str) -> Option<&[u8]> {
        self.entries.get(mnemonic).map(Vec::as_slice)
    }

    /// The map as a JSON object of mnemonic to upper-case hex.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .entries
            .iter()
            .map(|(mnemonic, bytes)| (mnemonic.clone(), serde_json::Value::String(hex::encode_upper(bytes))))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// Resolves `name` inside `root`, refusing anything that could step outside it.
fn contained_path(root: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    if name.is_empty() || relative.components().any(|c| !matches!(c, Component::Normal(_) | Component::CurDir)) {
        return None;
    }
    Some(root.join(relative))
}

fn resolve_messages(
    messages: &[String],
    map: &MessagesToUserMap,
    config: &ProcessorConfig,
) -> Result<Vec<Vec<u8>>, RequestResult> {
    if messages.is_empty() {
        if config.messages_to_user_always_required {
            return Err(RequestResult::bad_request("A Message to User is required"));
        }
        return Ok(Vec::new());
    }

    messages
        .iter()
        .map(|message| {
            if let Some(bytes) = map.bytes_for(message) {
                return Ok(bytes.to_vec());
            }
            if !config.messages_to_user_direct_input_enabled {
                return Err(RequestResult::bad_request(format!("Message to User {message} is not defined")));
            }
            hex::decode(message).map_err(|_| {
                RequestResult::bad_request(format!("Message to User '{message}' is not a valid hexadecimal string"))
            })
        })
        .collect()
}

/// Runs every PUT check against `event` and, when they all pass, returns the
/// request for the engine.
pub fn admit_put(
    event: &ActionEvent,
    config: &ProcessorConfig,
    map: &MessagesToUserMap,
    engine: &dyn ProtocolEngine,
) -> Result<PutRequest, RequestResult> {
    let (Some(destination), Some(source_name)) = (event.destination_entity, event.source_file_name.as_deref()) else {
        return Err(RequestResult::bad_request("PUT requires a destination entity and a source file name"));
    };

    let open = engine.open_uplink_transactions(destination);
    let max_open = config.maximum_open_uplink_transactions_per_remote_entity;
    if open >= max_open {
        return Err(RequestResult::internal_error(format!(
            "No more uplink transactions allowed for remote entity {destination} (max of {max_open} open transactions reached)"
        )));
    }

    let uplink_dir = &config.uplink_files_top_level_directory;
    let not_found = || {
        RequestResult::bad_request(format!(
            "Source file {source_name} does not exist under {}",
            uplink_dir.display()
        ))
    };
    let source_path = contained_path(uplink_dir, source_name).ok_or_else(not_found)?;

    if let Some(uploaded) = &event.uploaded_file {
        let saved = source_path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&source_path, uploaded));
        if let Err(e) = saved {
            tracing::error!(path = %source_path.display(), error = %e, "failed to save uploaded file");
            return Err(RequestResult::internal_error("Failed to save the uploaded file to the uplink directory"));
        }
        tracing::info!(path = %source_path.display(), bytes = uploaded.len(), "saved user-uploaded file");
    }

    let metadata = match fs::metadata(&source_path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => {
            tracing::error!(path = %source_path.display(), error = %e, "failed to inspect source file");
            return Err(RequestResult::internal_error("Unexpected I/O error while working with the source file"));
        }
    };
    let file_size = metadata.len();

    let max_size = config.maximum_uplink_file_size_bytes;
    if max_size > 0 && file_size > max_size {
        return Err(RequestResult::bad_request(format!(
            "File size {file_size} is over the configured limit of {max_size} bytes"
        )));
    }

    let max_total = config.maximum_uplink_file_sizes_total_bytes_per_remote_entity;
    let total = engine.uplink_bytes_in_flight(destination).saturating_add(file_size);
    if max_total > 0 && total > max_total {
        return Err(RequestResult::internal_error(format!(
            "Uplink of {source_name} violates the maximum allowed total file sizes limit per remote entity (max: {max_total}, total: {total})"
        )));
    }

    let ack_required = match event.service_class {
        Some(2) => true,
        Some(1) => false,
        _ => config.default_service_class == 2,
    };

    if source_name.chars().count() > config.maximum_source_filename_length {
        return Err(RequestResult::bad_request(format!(
            "Source filename {source_name} is over the maximum allowed length limit ({} characters)",
            config.maximum_source_filename_length
        )));
    }

    let destination_file_name = event.destination_file_name.as_deref().unwrap_or(source_name);
    if destination_file_name.chars().count() > config.maximum_destination_filename_length {
        return Err(RequestResult::bad_request(format!(
            "Destination filename {destination_file_name} is over the maximum allowed length limit ({} characters)",
            config.maximum_destination_filename_length
        )));
    }

    let messages_to_user = resolve_messages(&event.messages_to_user, map, config)?;

    Ok(PutRequest {
        destination,
        source_file: source_path,
        destination_file_name: destination_file_name.to_string(),
        ack_required,
        session_key: event.session_key,
        messages_to_user,
        file_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CycleOutcome, EngineError, EngineRequest};
    use crate::events::PduProvenance;
    use crate::types::EntityId;
    use bytes::Bytes;

    #[derive(Default)]
    struct Stats {
        open: usize,
        in_flight: u64,
    }

    impl ProtocolEngine for Stats {
        fn give_request(&mut self, _request: EngineRequest) -> Result<RequestResult, EngineError> {
            Ok(RequestResult::ok())
        }

        fn give_pdu(&mut self, _pdu: &[u8], _provenance: &PduProvenance) -> Result<(), EngineError> {
            Ok(())
        }

        fn cycle(&mut self) -> CycleOutcome {
            CycleOutcome::default()
        }

        fn open_uplink_transactions(&self, _remote: EntityId) -> usize {
            self.open
        }

        fn uplink_bytes_in_flight(&self, _remote: EntityId) -> u64 {
            self.in_flight
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: ProcessorConfig,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("payload.bin"), [0u8; 100]).unwrap();
        let mut config = ProcessorConfig {
            uplink_files_top_level_directory: dir.path().to_path_buf(),
            ..ProcessorConfig::default()
        };
        config.messages_to_user_map.insert("GREET".to_string(), "48690A".to_string());
        Fixture { _dir: dir, config }
    }

    fn put_event(source: &str) -> ActionEvent {
        ActionEvent {
            destination_entity: Some(EntityId(5)),
            source_file_name: Some(source.to_string()),
            ..ActionEvent::default()
        }
    }

    fn admit(event: &ActionEvent, config: &ProcessorConfig, stats: &Stats) -> Result<PutRequest, RequestResult> {
        let map = MessagesToUserMap::from_config(config).unwrap();
        admit_put(event, config, &map, stats)
    }

    #[test]
    fn test_valid_put_is_admitted() {
        let f = fixture();
        let request = admit(&put_event("payload.bin"), &f.config, &Stats::default()).unwrap();
        assert_eq!(request.destination_file_name, "payload.bin");
        assert_eq!(request.file_size, 100);
        assert!(!request.ack_required);
    }

    #[test]
    fn test_open_transaction_limit() {
        let mut f = fixture();
        f.config.maximum_open_uplink_transactions_per_remote_entity = 2;
        let stats = Stats { open: 2, in_flight: 0 };
        let result = admit(&put_event("payload.bin"), &f.config, &stats).unwrap_err();
        assert!(result.internal_error);
        assert!(result.message.unwrap().starts_with("No more uplink transactions allowed"));
    }

    #[test]
    fn test_source_must_stay_inside_uplink_directory() {
        let f = fixture();
        for name in ["../etc/passwd", "/etc/passwd", "missing.bin", ""] {
            let result = admit(&put_event(name), &f.config, &Stats::default()).unwrap_err();
            assert!(result.bad_request, "{name}");
        }
    }

    #[test]
    fn test_uploaded_file_is_saved_first() {
        let f = fixture();
        let mut event = put_event("sub/new.bin");
        event.uploaded_file = Some(Bytes::from_static(b"uploaded"));
        let request = admit(&event, &f.config, &Stats::default()).unwrap();
        assert_eq!(fs::read(&request.source_file).unwrap(), b"uploaded");
    }

    #[test]
    fn test_size_limits() {
        let mut f = fixture();
        f.config.maximum_uplink_file_size_bytes = 99;
        assert!(admit(&put_event("payload.bin"), &f.config, &Stats::default()).unwrap_err().bad_request);

        f.config.maximum_uplink_file_size_bytes = 0;
        f.config.maximum_uplink_file_sizes_total_bytes_per_remote_entity = 150;
        let stats = Stats { open: 0, in_flight: 60 };
        assert!(admit(&put_event("payload.bin"), &f.config, &stats).unwrap_err().internal_error);
    }

    #[test]
    fn test_service_class_decides_ack() {
        let mut f = fixture();
        let mut event = put_event("payload.bin");
        event.service_class = Some(2);
        assert!(admit(&event, &f.config, &Stats::default()).unwrap().ack_required);

        event.service_class = None;
        f.config.default_service_class = 2;
        assert!(admit(&event, &f.config, &Stats::default()).unwrap().ack_required);

        event.service_class = Some(1);
        assert!(!admit(&event, &f.config, &Stats::default()).unwrap().ack_required);
    }

    #[test]
    fn test_filename_lengths() {
        let mut f = fixture();
        let mut event = put_event("payload.bin");
        event.destination_file_name = Some("x".repeat(20));
        f.config.maximum_destination_filename_length = 10;
        let message = admit(&event, &f.config, &Stats::default()).unwrap_err().message.unwrap();
        assert!(message.starts_with("Destination filename"));

        f.config.maximum_source_filename_length = 5;
        let message = admit(&event, &f.config, &Stats::default()).unwrap_err().message.unwrap();
        assert!(message.starts_with("Source filename"));
    }

    #[test]
    fn test_messages_to_user_resolution() {
        let mut f = fixture();
        let mut event = put_event("payload.bin");
        event.messages_to_user = vec!["GREET".to_string(), "CAFE".to_string()];
        let request = admit(&event, &f.config, &Stats::default()).unwrap();
        assert_eq!(request.messages_to_user, vec![vec![0x48, 0x69, 0x0A], vec![0xCA, 0xFE]]);

        event.messages_to_user = vec!["NOT-HEX".to_string()];
        assert!(admit(&event, &f.config, &Stats::default()).unwrap_err().bad_request);

        f.config.messages_to_user_direct_input_enabled = false;
        event.messages_to_user = vec!["CAFE".to_string()];
        let message = admit(&event, &f.config, &Stats::default()).unwrap_err().message.unwrap();
        assert_eq!(message, "Message to User CAFE is not defined");

        event.messages_to_user.clear();
        f.config.messages_to_user_always_required = true;
        let message = admit(&event, &f.config, &Stats::default()).unwrap_err().message.unwrap();
        assert_eq!(message, "A Message to User is required");
    }

    #[test]
    fn test_mtu_map_json() {
        let f = fixture();
        let map = MessagesToUserMap::from_config(&f.config).unwrap();
        assert_eq!(map.to_json(), serde_json::json!({ "GREET": "48690A" }));
    }
}
