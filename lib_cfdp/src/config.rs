//! # Processor Configuration
//!
//! Every tunable of the dispatch core in one serde struct. Field names are
//! camelCase on the wire; any field missing from a JSON document takes its
//! default. Periods of `0` disable the corresponding periodic task.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EntityId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a non-zero power of two, got {value}")]
    InvalidRingSize { field: &'static str, value: usize },

    #[error("defaultServiceClass must be 1 or 2, got {0}")]
    InvalidServiceClass(u8),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("messages-to-user mnemonic {mnemonic} does not map to valid hex: {reason}")]
    InvalidMessageToUser { mnemonic: String, reason: String },

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// What the inbound PDU publisher does when its ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressurePolicy {
    /// Wait for the cycler to free a slot.
    #[default]
    Block,
    /// Give up immediately and report the PDU as dropped.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorConfig {
    pub local_entity_id: EntityId,

    // Rings
    pub action_ring_buffer_size: usize,
    pub inbound_pdu_ring_buffer_size: usize,
    pub ingest_action_ring_buffer_size: usize,
    pub inbound_pdu_backpressure: BackpressurePolicy,

    // Shutdown
    pub pipeline_shutdown_timeout_millis: u64,
    pub worker_tasks_executor_shutdown_timeout_millis: u64,
    pub engine_cycler_task_executor_shutdown_timeout_millis: u64,

    // Cycler
    pub engine_cycle_minimum_interval_when_idle_millis: u64,

    // Producers
    pub action_result_timeout_millis: u64,
    pub ingest_result_timeout_millis: u64,

    // PDU file ingestion
    pub pdu_file_read_buffer_size: usize,
    pub inbound_pdu_file_ingestion_minimum_read_interval_millis: u64,

    // Periodic tasks
    pub finished_transactions_history_purge_period_millis: u64,
    pub finished_transactions_history_retention_millis: u64,
    pub auto_state_save_period_millis: u64,
    pub saved_state_directory: PathBuf,

    // PUT
    pub default_service_class: u8,
    pub uplink_files_top_level_directory: PathBuf,
    pub maximum_open_uplink_transactions_per_remote_entity: usize,
    pub maximum_source_filename_length: usize,
    pub maximum_destination_filename_length: usize,
    /// 0 means no limit.
    pub maximum_uplink_file_size_bytes: u64,
    /// 0 means no limit.
    pub maximum_uplink_file_sizes_total_bytes_per_remote_entity: u64,
    pub messages_to_user_direct_input_enabled: bool,
    pub messages_to_user_always_required: bool,
    /// Mnemonic to hex-encoded message bytes.
    pub messages_to_user_map: BTreeMap<String, String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            local_entity_id: EntityId(1),

            action_ring_buffer_size: 1024,
            inbound_pdu_ring_buffer_size: 1024,
            ingest_action_ring_buffer_size: 16,
            inbound_pdu_backpressure: BackpressurePolicy::Block,

            pipeline_shutdown_timeout_millis: 5_000,
            worker_tasks_executor_shutdown_timeout_millis: 5_000,
            engine_cycler_task_executor_shutdown_timeout_millis: 5_000,

            engine_cycle_minimum_interval_when_idle_millis: 10,

            action_result_timeout_millis: 30_000,
            ingest_result_timeout_millis: 600_000,

            pdu_file_read_buffer_size: 4_096,
            inbound_pdu_file_ingestion_minimum_read_interval_millis: 0,

            finished_transactions_history_purge_period_millis: 60_000,
            finished_transactions_history_retention_millis: 86_400_000,
            auto_state_save_period_millis: 0,
            saved_state_directory: PathBuf::from("./saved_state"),

            default_service_class: 1,
            uplink_files_top_level_directory: PathBuf::from("./uplink"),
            maximum_open_uplink_transactions_per_remote_entity: 100,
            maximum_source_filename_length: 1_024,
            maximum_destination_filename_length: 1_024,
            maximum_uplink_file_size_bytes: 0,
            maximum_uplink_file_sizes_total_bytes_per_remote_entity: 0,
            messages_to_user_direct_input_enabled: true,
            messages_to_user_always_required: false,
            messages_to_user_map: BTreeMap::new(),
        }
    }
}

impl ProcessorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("actionRingBufferSize", self.action_ring_buffer_size),
            ("inboundPduRingBufferSize", self.inbound_pdu_ring_buffer_size),
            ("ingestActionRingBufferSize", self.ingest_action_ring_buffer_size),
        ] {
            if value == 0 || !value.is_power_of_two() {
                return Err(ConfigError::InvalidRingSize { field, value });
            }
        }
        if !matches!(self.default_service_class, 1 | 2) {
            return Err(ConfigError::InvalidServiceClass(self.default_service_class));
        }
        if self.pdu_file_read_buffer_size == 0 {
            return Err(ConfigError::Zero("pduFileReadBufferSize"));
        }
        if self.action_result_timeout_millis == 0 {
            return Err(ConfigError::Zero("actionResultTimeoutMillis"));
        }
        if self.ingest_result_timeout_millis == 0 {
            return Err(ConfigError::Zero("ingestResultTimeoutMillis"));
        }
        // The cycler sleeps this long between idle cycles; zero would spin.
        if self.engine_cycle_minimum_interval_when_idle_millis == 0 {
            return Err(ConfigError::Zero("engineCycleMinimumIntervalWhenIdleMillis"));
        }
        for (mnemonic, encoded) in &self.messages_to_user_map {
            hex::decode(encoded).map_err(|e| ConfigError::InvalidMessageToUser {
                mnemonic: mnemonic.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn action_result_timeout(&self) -> Duration {
        Duration::from_millis(self.action_result_timeout_millis)
    }

    pub fn ingest_result_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest_result_timeout_millis)
    }

    pub fn pipeline_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_shutdown_timeout_millis)
    }

    pub fn worker_tasks_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_tasks_executor_shutdown_timeout_millis)
    }

    pub fn cycler_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_cycler_task_executor_shutdown_timeout_millis)
    }

    pub fn idle_cycle_interval(&self) -> Duration {
        Duration::from_millis(self.engine_cycle_minimum_interval_when_idle_millis)
    }

    pub fn ingest_read_interval(&self) -> Duration {
        Duration::from_millis(self.inbound_pdu_file_ingestion_minimum_read_interval_millis)
    }

    pub fn history_retention(&self) -> Duration {
        Duration::from_millis(self.finished_transactions_history_retention_millis)
    }

    /// Whether any periodic task needs the periodic-task thread.
    pub fn has_periodic_tasks(&self) -> bool {
        self.finished_transactions_history_purge_period_millis > 0 || self.auto_state_save_period_millis > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ProcessorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ProcessorConfig::from_json_str(
            r#"{ "actionRingBufferSize": 64, "inboundPduBackpressure": "drop", "localEntityId": 42 }"#,
        )
        .unwrap();
        assert_eq!(config.action_ring_buffer_size, 64);
        assert_eq!(config.inbound_pdu_backpressure, BackpressurePolicy::Drop);
        assert_eq!(config.local_entity_id, EntityId(42));
        assert_eq!(config.action_result_timeout_millis, 30_000);
    }

    #[test]
    fn test_ring_size_must_be_power_of_two() {
        let config = ProcessorConfig {
            inbound_pdu_ring_buffer_size: 100,
            ..ProcessorConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRingSize { field: "inboundPduRingBufferSize", value: 100 })
        ));
    }

    #[test]
    fn test_service_class_and_mtu_map_checked() {
        let config = ProcessorConfig {
            default_service_class: 3,
            ..ProcessorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidServiceClass(3))));

        let mut config = ProcessorConfig::default();
        config.messages_to_user_map.insert("BAD".to_string(), "zz".to_string());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMessageToUser { .. })));
    }

    #[test]
    fn test_zero_idle_cycle_interval_rejected() {
        let config = ProcessorConfig::from_json_str(r#"{ "engineCycleMinimumIntervalWhenIdleMillis": 0 }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Zero("engineCycleMinimumIntervalWhenIdleMillis"))));

        let config = ProcessorConfig {
            engine_cycle_minimum_interval_when_idle_millis: 1,
            ..ProcessorConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processor.json");
        fs::write(&path, r#"{ "autoStateSavePeriodMillis": 250 }"#).unwrap();
        let config = ProcessorConfig::from_file(&path).unwrap();
        assert_eq!(config.auto_state_save_period_millis, 250);
        assert!(config.has_periodic_tasks());

        let missing = ProcessorConfig::from_file(&dir.path().join("absent.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
