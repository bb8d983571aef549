use anyhow::{Context, Result};
use clap::Parser;
use lib_cfdp::{EntityId, ProcessorConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "CFDP processor dispatch service", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "CFDP_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "CFDP_PROCESSOR_CONFIG_PATH", help = "Path to the JSON processor configuration (ring sizes, limits, timeouts).")]
    pub processor_config_path: Option<PathBuf>,

    #[clap(long, env = "CFDP_PDU_LISTEN_ADDR", help = "UDP address to receive inbound PDUs on.")]
    pub pdu_listen_addr: Option<SocketAddr>,

    #[clap(long, env = "CFDP_PDU_SEND_ADDR", help = "UDP address the engine sends outbound PDUs to.")]
    pub pdu_send_addr: Option<SocketAddr>,

    #[clap(long, env = "CFDP_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "CFDP_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "CFDP_LOCAL_ENTITY_ID", help = "Local CFDP entity id.")]
    pub local_entity_id: Option<u64>,

    #[clap(long, env = "CFDP_UPLINK_DIR", help = "Top-level directory of files available for uplink.")]
    pub uplink_files_top_level_directory: Option<PathBuf>,

    #[clap(long, env = "CFDP_SAVED_STATE_DIR", help = "Directory the engine saves its state into.")]
    pub saved_state_directory: Option<PathBuf>,

    #[clap(long, env = "CFDP_AUTO_STATE_SAVE_PERIOD_MS", help = "Automatic state save period in milliseconds (0 disables).")]
    pub auto_state_save_period_millis: Option<u64>,

    #[clap(long, env = "CFDP_INGEST_FILE", help = "File of concatenated PDUs to ingest once the processor is running.")]
    pub ingest_file: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            processor_config_path: other.processor_config_path.or(self.processor_config_path),
            pdu_listen_addr: other.pdu_listen_addr.or(self.pdu_listen_addr),
            pdu_send_addr: other.pdu_send_addr.or(self.pdu_send_addr),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            local_entity_id: other.local_entity_id.or(self.local_entity_id),
            uplink_files_top_level_directory: other
                .uplink_files_top_level_directory
                .or(self.uplink_files_top_level_directory),
            saved_state_directory: other.saved_state_directory.or(self.saved_state_directory),
            auto_state_save_period_millis: other
                .auto_state_save_period_millis
                .or(self.auto_state_save_period_millis),
            ingest_file: other.ingest_file.or(self.ingest_file),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    /// Processor settings: defaults, then the processor JSON file, then the
    /// overrides carried by this config.
    pub fn processor_config(&self) -> Result<ProcessorConfig> {
        let mut processor = match &self.processor_config_path {
            Some(path) => ProcessorConfig::from_file(path)
                .with_context(|| format!("loading processor configuration from {}", path.display()))?,
            None => ProcessorConfig::default(),
        };
        if let Some(id) = self.local_entity_id {
            processor.local_entity_id = EntityId(id);
        }
        if let Some(dir) = &self.uplink_files_top_level_directory {
            processor.uplink_files_top_level_directory = dir.clone();
        }
        if let Some(dir) = &self.saved_state_directory {
            processor.saved_state_directory = dir.clone();
        }
        if let Some(period) = self.auto_state_save_period_millis {
            processor.auto_state_save_period_millis = period;
        }
        processor.validate()?;
        Ok(processor)
    }
}

fn read_config_file(path: &PathBuf) -> Option<Config> {
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Defaults < JSON file (`cfdp_processor.conf` or `--config-path`) < env and CLI.
pub fn load_config() -> Config {
    // 1. Load defaults
    let default_config = Config {
        pdu_listen_addr: Some(SocketAddr::from(([0, 0, 0, 0], 4560))),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        ..Default::default()
    };

    // 2. Env and CLI, parsed once; also tells us where the config file is.
    let cli_args = Config::parse();

    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("cfdp_processor.conf"));

    let mut current_config = default_config;

    // 3. Config file, if present. Logging is not up yet, so problems go to stderr.
    if config_file_path.exists() {
        if let Some(file_config) = read_config_file(&config_file_path) {
            current_config = current_config.merge(file_config);
        }
    }

    // 4. Env and CLI win over everything.
    current_config.merge(cli_args)
}
