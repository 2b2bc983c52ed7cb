//! Conversation memory and document retrieval for Parley.
//!
//! - [`MessageWindowMemory`] bounds each conversation and serializes turns
//! - repositories make conversations durable (SQLite default, PostgreSQL
//!   behind the `postgres` feature, in-memory for tests)
//! - retrieval indexes rank documents by cosine similarity

pub mod in_memory;
pub mod retrieval;
pub mod vector;
pub mod window;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod codec;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryRepository;
pub use retrieval::InMemoryIndex;
pub use vector::{cosine_similarity, rank_documents};
pub use window::{DEFAULT_WINDOW_SIZE, MessageWindowMemory};

#[cfg(feature = "sqlite")]
pub use retrieval::SqliteVectorIndex;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresRepository;
