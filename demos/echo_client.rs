//! Echo client demo: connects, sends one message, logs the reply, then
//! closes after a short pause.

use std::sync::Arc;
use std::time::Duration;

use quaynet::{Client, ClientHandler, Error};

const API_ECHO: u16 = 1;

struct EchoClientHandler;

impl ClientHandler for EchoClientHandler {
    fn on_open(&self, client: &Arc<Client>) {
        tracing::info!("client: connected");
        let _ = client.write(API_ECHO, b"hello");
    }

    fn on_message(&self, _client: &Arc<Client>, api: u16, payload: &[u8]) {
        tracing::info!(api, msg = %String::from_utf8_lossy(payload), "client: recv");
    }

    fn on_close(&self, _client: &Arc<Client>, reason: Option<Error>) {
        tracing::info!(?reason, "client: closed");
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let client = Client::dial("127.0.0.1:18888", Arc::new(EchoClientHandler))
        .expect("dial failed");

    std::thread::sleep(Duration::from_millis(500));
    let _ = client.close();
}
