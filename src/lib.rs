// coord-engine: a distributed coordination service — hierarchical
// name-space, session-scoped locking, and client-side cache invalidation —
// built on an abstract transactional key-value store and a point-to-point
// message transport.

pub mod config;
pub mod engine;
pub mod entry_cache;
pub mod error;
pub mod exchange;
pub mod ids;
pub mod lock;
pub mod mem;
pub mod model;
pub mod path;
pub mod session_mgr;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod wait;

pub use config::EngineConfig;
pub use engine::Participant;
pub use error::{Error, Result};
pub use ids::SessionId;
pub use path::Path;
