//! Echo server demo: replies to every message on `api=1` with the same
//! payload, and greets new connections with a welcome frame.

use std::sync::Arc;
use std::time::Duration;

use quaynet::conn::CloseCause;
use quaynet::{Config, Conn, Handler, Server};

const API_ECHO: u16 = 1;

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_open(&self, conn: &Conn) {
        tracing::info!(conn_id = conn.id(), peer = %conn.peer_addr(), "conn open");
        let _ = conn.write(API_ECHO, b"welcome");
    }

    fn on_message(&self, conn: &Conn, api: u16, payload: &[u8]) -> bool {
        if api == API_ECHO {
            let _ = conn.write(API_ECHO, payload);
        }
        false
    }

    fn on_close(&self, conn: &Conn, reason: &CloseCause) {
        tracing::info!(conn_id = conn.id(), ?reason, "conn close");
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut cfg = Config::default();
    cfg.address = ":18888".into();
    cfg.num_pollers = 2;
    cfg.reuse_port = true;
    cfg.tx_batch_window = Duration::from_millis(10);
    cfg.timer_wheel_tick = Duration::from_millis(1);

    let _server = Server::start(cfg, Arc::new(EchoHandler)).expect("server start");

    std::thread::park();
}
