#![forbid(unsafe_code)]

pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
mod paths;
pub mod proto;
pub mod rendezvous;
pub mod telemetry;
pub mod transport;
mod worker;

pub use broker::{Broker, BrokerListener, Channel, ChannelListener, IncomingQuery, OutgoingQuery};
pub use config::Config;
pub use dispatcher::{Dispatcher, QueueDispatcher};
pub use error::{QuotaKind, ServiceError, ServiceErrorKind};
pub use proto::{Element, Msg, MsgType};
