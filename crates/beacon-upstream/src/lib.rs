pub mod aggregate;
pub mod resilient;
pub mod transport;

pub mod mock;

pub use mock::{MockReply, ScriptedTransport};
pub use resilient::{ResilientClient, RetryConfig};
pub use transport::{HttpConfig, HttpTransport, PoolConfig, UpstreamRequest, UpstreamTransport};
