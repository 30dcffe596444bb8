//! Client side of the chat pipeline.
//!
//! [`ClientMessageStore`] keeps the committed message list per conversation
//! plus at most one streaming assistant message, consumes the server's event
//! stream through a [`ChatBackend`] and mirrors committed state into a
//! [`LocalCache`] for offline display.
pub mod backend;
pub mod cache;
pub mod error;
pub mod message;
pub mod store;

pub use backend::{BoxFuture, ByteStream, ChatBackend, HttpChatBackend, RemoteMessage};
pub use cache::LocalCache;
pub use error::{ClientError, ClientResult};
pub use message::{ChatMessage, Citation, DeliveryStatus};
pub use store::{ClientMessageStore, LoadSource, SurfacedError};
