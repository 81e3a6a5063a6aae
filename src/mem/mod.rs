// In-memory `Storage`/`Transport` reference implementations, used by the
// demo binary and the test suite. Not intended for production use.

pub mod storage;
pub mod transport;

pub use storage::MemStorage;
pub use transport::{MemNetwork, MemTransport};
