// ABOUTME: PostgreSQL plumbing shared by the reader and writer
// ABOUTME: Connection construction, TLS policy and reconnecting handles

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy, PgHandle};
