//! A sharded, edge-triggered TCP messaging engine for POSIX hosts.
//!
//! Clients open persistent TCP connections and exchange length-prefixed,
//! API-tagged binary messages; the server dispatches each decoded message to
//! a user-supplied [`Handler`](handler::Handler) and lets the handler reply
//! on the same connection. Built for high connection counts and high
//! message rates: each shard runs its own epoll/kqueue event loop and, when
//! the platform supports `SO_REUSEPORT`, its own accept queue.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quaynet::{Config, Conn, Handler, Server};
//! use quaynet::conn::CloseCause;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_open(&self, _conn: &Conn) {}
//!
//!     fn on_message(&self, conn: &Conn, api: u16, payload: &[u8]) -> bool {
//!         let _ = conn.write(api, payload);
//!         false
//!     }
//!
//!     fn on_close(&self, _conn: &Conn, _reason: &CloseCause) {}
//! }
//!
//! let mut cfg = Config::default();
//! cfg.address = "127.0.0.1:0".into();
//! let server = Server::start(cfg, Arc::new(Echo)).unwrap();
//! drop(server); // stops every shard on drop
//! ```

pub mod client;
pub mod config;
pub mod conn;
pub mod error;
pub mod frame;
pub mod handler;
pub mod poller;
pub mod ring;
pub mod server;
pub mod timer;

mod sys;

pub use client::{Client, ClientHandler};
pub use config::{Compression, Config, ListenNetwork};
pub use conn::Conn;
pub use error::{Error, Result};
pub use handler::{Cipher, Handler};
pub use server::Server;
