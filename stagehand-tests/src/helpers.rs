pub mod config_builder;
pub mod http_stub;
