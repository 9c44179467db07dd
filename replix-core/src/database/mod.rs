//! Durable job records.

pub mod memory;
pub mod ports;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryJobRepository;
pub use ports::JobRepository;
#[cfg(feature = "database")]
pub use postgres::PostgresJobRepository;
