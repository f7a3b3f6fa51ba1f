//! # courier-core
//!
//! Connection routing, rooms and the messaging services of the Courier chat
//! backend.
//!
//! - **Registry** - which connection is current for each user
//! - **Router** - rooms and fan-out behind the [`PubSub`] trait
//! - **Typing** - typing indicators with idle expiry
//! - **Presence** - online/offline status with a TTL
//! - **Queue** - offline delivery of messages and notifications
//! - **Persistence** - conversations, messages and read receipts in SQLite
//! - **Session** - the orchestrator tying the above to client events
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────────────────┐
//!   ClientEvent ───────▶│  SessionManager  │──────▶ ServerEvent (sinks)
//!                       └──────────────────┘
//!            ┌──────────┬──────┴─────┬────────────┬──────────────┐
//!            ▼          ▼            ▼            ▼              ▼
//!      ┌──────────┐ ┌────────┐ ┌──────────┐ ┌──────────┐ ┌─────────────┐
//!      │ Registry │ │ Router │ │  Typing  │ │ Presence │ │ Persistence │
//!      └──────────┘ └────────┘ └──────────┘ └──────────┘ └─────────────┘
//!                                               │  Queue        │
//!                                               ▼               ▼
//!                                        ┌──────────────┐  ┌──────────┐
//!                                        │ DurableStore │  │  SQLite  │
//!                                        └──────────────┘  └──────────┘
//! ```

pub mod auth;
pub mod db;
pub mod error;
pub mod persistence;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod room;
pub mod router;
pub mod session;
pub mod store;
pub mod typing;

pub use auth::{AuthError, Authenticator, JwtAuthenticator};
pub use db::Database;
pub use error::{Error, Result};
pub use persistence::{MessagePersistenceService, MessageTarget, NewMessage};
pub use presence::PresenceStore;
pub use queue::{Batch, OfflineDeliveryQueue, Receipt};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use router::{MemberSink, Outbound, PubSub, RoomRouter, RouterConfig, RouterError, RouterStats};
pub use session::{Session, SessionConfig, SessionManager};
pub use store::{DurableStore, MemoryStore, SqliteStore, StoreError};
pub use typing::TypingCoordinator;
