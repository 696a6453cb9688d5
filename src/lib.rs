//! `ringloop`: a multi-threaded, `io_uring`-driven TCP reactor for
//! embedding in server and client applications.
//!
//! The crate is organized the way the spec's component list reads, bottom
//! up: a monotonic [`time`] wheel and a lock-free [`logger`] sit at the
//! base; [`buffer`] and [`address`] are small value types; [`socket`],
//! [`event`], [`connection`], [`poller`] and [`event_manager`] form the
//! core single-threaded reactor loop; [`acceptor`], [`connector`] and
//! [`balancer`] build the multi-manager server/client machinery that
//! [`reactor`] exposes as `Server`/`Client`.

pub mod config;
pub mod logger;
pub mod time;

pub mod buffer;

#[cfg(feature = "net")]
pub mod address;
#[cfg(feature = "net")]
pub mod socket;

#[cfg(feature = "os-poll")]
pub mod event;
#[cfg(feature = "os-poll")]
pub mod poller;

#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod connection;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod event_manager;

#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod acceptor;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod balancer;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod connector;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub mod reactor;

#[cfg(feature = "net")]
pub use address::{Address, Family};
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use balancer::{Balancer, Strategy};
pub use buffer::IoBuffer;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use connection::Connection;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use connector::Connector;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use event_manager::EventManager;
#[cfg(all(feature = "os-poll", feature = "net"))]
pub use reactor::{Client, Server};

pub use logger::Level;
