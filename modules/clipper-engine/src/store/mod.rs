//! Article store implementations.
//!
//! `PgStore` is the production Postgres store; `MemoryStore` backs the test
//! suites and local dry runs. Both honor the same atomicity contract:
//! `find_by_url`-then-`insert` is effectively atomic per URL, so concurrent
//! discovery of the same link from two sources yields exactly one row.

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;
