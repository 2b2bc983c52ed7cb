pub mod ask;
pub mod config_cmd;
pub mod ingest;
pub mod serve;
pub mod serve_tools;
pub mod services;
pub mod token;
pub mod tools;
