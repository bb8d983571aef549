pub mod config;
pub mod logger;
pub mod logging_engine;
pub mod pdu_listener;
pub mod pdu_sender;
