pub mod context;
pub mod server;
pub mod sessions;
pub mod settings;
pub mod transport;
pub mod webhook;

pub use context::{AppContext, ContextError};
pub use server::{build_router, serve, start, start_on, ServerHandle};
pub use sessions::{SessionError, SessionManager, SessionRecord};
pub use settings::{CliOverrides, Settings, SettingsError};
pub use transport::{OutboundEvent, StreamTransport, TransportConfig};
