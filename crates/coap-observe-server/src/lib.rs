//! # coap-observe-server
//!
//! CoAP server for an observable clock resource.
//!
//! Clients register with a GET carrying `Observe: 0` and receive a
//! notification every interval until a send to them fails. Plain GETs get a
//! single response. `/tick` and `/time` switch what the resource reports.
//! Retransmitted requests are answered from a cache of recent exchanges
//! instead of being handled twice.

pub mod dispatcher;
pub mod exchange;
pub mod observer;
pub mod server;
pub mod subscription;
pub mod transport;

pub use coap_observe_core::{ModeCell, ResourceMode};
pub use dispatcher::{DispatchOutcome, Dispatcher, ObserveRequest, ResponseError};
pub use exchange::{Exchange, ExchangeCache};
pub use observer::NotificationLoop;
pub use server::{CoapServer, ServerConfig, ServerError};
pub use subscription::{RegistryError, SubscriptionKey, SubscriptionRegistry};
pub use transport::{ClientConnection, TransportError, UdpConnection};
