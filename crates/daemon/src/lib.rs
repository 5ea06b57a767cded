//! Port allocation for game server sessions: the allocator contract, its
//! SQLite and in-memory implementations, and the HTTP surface over them.

pub mod allocator;
pub mod api;
pub mod db;
pub mod memory;

pub use allocator::PortAllocator;
pub use api::{router, AppState};
pub use db::SqliteAllocator;
pub use memory::MemoryAllocator;
