//! Production backing stores.

pub mod postgres;

pub use postgres::{connect, PgAdvisoryBackend, PgTransactionBackend};
