pub mod cipher;
pub mod discovery;
pub mod http_client;
pub mod rate_limit_store;
