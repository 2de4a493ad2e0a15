//! Dispatch layer: at-least-once requests to the external harvester and
//! downloader, and the shape of the reports they send back.

mod errors;
mod messages;
mod notifier;
mod transport;

pub use errors::{DispatchError, DispatchResult};
pub use messages::{
    ColdStartReport, DispatchMessage, Envelope, FetchMode, HarvestReport, ProxySettings, Queue,
    WorkerReport,
};
pub use notifier::{Notifier, RetryPolicy};
#[cfg(test)]
pub use transport::MockTransport;
pub use transport::{ChannelTransport, RedisTransport, ReportListener, Transport, WorkerQueues};
