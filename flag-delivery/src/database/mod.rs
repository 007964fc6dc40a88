mod memory;
mod postgres;

pub use memory::InMemoryOverrideStore;
pub use postgres::PostgresOverrideStore;
