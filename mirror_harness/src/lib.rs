pub mod api;
pub mod config;
pub mod cycle;
pub mod evaluator;
pub mod feedback;
pub mod http_client;
pub mod llm_client;
pub mod pacing;
pub mod persona;
pub mod provisioning;
pub mod session_log;
pub mod summary;
