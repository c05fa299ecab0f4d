pub mod audio;
pub mod error;
pub mod logging;
pub mod session;
pub mod transport;
pub mod types;

pub use error::LiveError;
pub use logging::LogStore;
pub use session::{LiveSession, SessionState};
pub use transport::{LIVE_ENDPOINT, WebSocketTransportFactory};
pub use types::config::LiveConfig;
pub use types::events::{CloseReason, Event, EventBus, EventHandler, Subscription};
