//! End-to-end tests against real TCP sockets: a `Server` running the echo
//! handler from the demos, driven by real `Client` connections.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quaynet::conn::CloseCause;
use quaynet::{Client, ClientHandler, Config, Conn, Error, Handler, Server};

const API_ECHO: u16 = 1;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct EchoHandler;

impl Handler for EchoHandler {
    fn on_open(&self, _conn: &Conn) {}

    fn on_message(&self, conn: &Conn, api: u16, payload: &[u8]) -> bool {
        let _ = conn.write(api, payload);
        false
    }

    fn on_close(&self, _conn: &Conn, _reason: &CloseCause) {}
}

struct RecordingClient {
    messages: Mutex<mpsc::Sender<(u16, Vec<u8>)>>,
    closed: Mutex<Option<mpsc::Sender<Option<Error>>>>,
}

impl ClientHandler for RecordingClient {
    fn on_open(&self, _client: &Arc<Client>) {}

    fn on_message(&self, _client: &Arc<Client>, api: u16, payload: &[u8]) {
        let _ = self.messages.lock().unwrap().send((api, payload.to_vec()));
    }

    fn on_close(&self, _client: &Arc<Client>, reason: Option<Error>) {
        if let Some(tx) = self.closed.lock().unwrap().take() {
            let _ = tx.send(reason);
        }
    }
}

fn start_server(configure: impl FnOnce(&mut Config)) -> (Server, SocketAddr) {
    let mut cfg = Config::default();
    cfg.address = "127.0.0.1:0".into();
    cfg.num_pollers = 1;
    cfg.reuse_port = false;
    configure(&mut cfg);
    let server = Server::start(cfg, Arc::new(EchoHandler)).expect("server start");
    let addr = server.local_addr().expect("ephemeral port bound");
    (server, addr)
}

fn dial(addr: SocketAddr) -> (Arc<Client>, mpsc::Receiver<(u16, Vec<u8>)>, mpsc::Receiver<Option<Error>>) {
    let (messages_tx, messages_rx) = mpsc::channel();
    let (closed_tx, closed_rx) = mpsc::channel();
    let handler = Arc::new(RecordingClient {
        messages: Mutex::new(messages_tx),
        closed: Mutex::new(Some(closed_tx)),
    });
    let client = Client::dial(&addr.to_string(), handler).expect("client dial");
    (client, messages_rx, closed_rx)
}

#[test]
fn echo_roundtrip() {
    let (_server, addr) = start_server(|_| {});
    let (client, messages, _closed) = dial(addr);

    client.write(API_ECHO, b"hello").unwrap();
    let (api, payload) = messages.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(api, API_ECHO);
    assert_eq!(payload, b"hello".to_vec());

    client.close().unwrap();
}

#[test]
fn large_payload_roundtrip() {
    let (_server, addr) = start_server(|cfg| cfg.max_payload = 4 << 20);
    let (client, messages, _closed) = dial(addr);

    let payload = vec![0xABu8; 2 << 20];
    client.write(API_ECHO, &payload).unwrap();
    let (api, got) = messages.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(api, API_ECHO);
    assert_eq!(got, payload);

    client.close().unwrap();
}

#[test]
fn batched_replies_are_reassembled_into_individual_messages() {
    // A short batch window plus a high message-count trigger forces the
    // server to coalesce the three echoed replies into one Batched frame;
    // the client's parser must still hand them to `on_message` separately.
    let (_server, addr) = start_server(|cfg| {
        cfg.tx_batch_window = Duration::from_millis(50);
        cfg.timer_wheel_tick = Duration::from_millis(1);
        cfg.tx_batch_msgs = 3;
    });
    let (client, messages, _closed) = dial(addr);

    client.write(1, b"one").unwrap();
    client.write(2, b"two").unwrap();
    client.write(3, b"three").unwrap();

    let mut got = Vec::new();
    for _ in 0..3 {
        got.push(messages.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    assert_eq!(
        got,
        vec![
            (1, b"one".to_vec()),
            (2, b"two".to_vec()),
            (3, b"three".to_vec()),
        ]
    );

    client.close().unwrap();
}

#[test]
fn order_is_preserved_across_many_messages() {
    let (_server, addr) = start_server(|_| {});
    let (client, messages, _closed) = dial(addr);

    for i in 0..200u16 {
        client.write(i, &i.to_be_bytes()).unwrap();
    }
    for i in 0..200u16 {
        let (api, payload) = messages.recv_timeout(RECV_TIMEOUT).unwrap();
        assert_eq!(api, i);
        assert_eq!(payload, i.to_be_bytes().to_vec());
    }

    client.close().unwrap();
}

#[test]
fn oversize_payload_closes_only_that_connection() {
    let (_server, addr) = start_server(|cfg| cfg.max_payload = 1024);

    let (client, _messages, closed) = dial(addr);
    client.write(API_ECHO, &vec![0u8; 4096]).unwrap();
    let reason = closed.recv_timeout(RECV_TIMEOUT).unwrap();
    assert!(reason.is_some(), "oversize frame should close the connection with an error");

    // The shard keeps serving other connections after rejecting one.
    let (client2, messages2, _closed2) = dial(addr);
    client2.write(API_ECHO, b"still alive").unwrap();
    let (_, payload) = messages2.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(payload, b"still alive".to_vec());
    client2.close().unwrap();
}

#[test]
fn backpressure_error_does_not_take_down_the_connection() {
    // A tiny tx_ring_size means a single large reply already overflows the
    // write queue; `write` must surface `Error::Backpressure` rather than
    // panicking or silently dropping the connection.
    let (_server, addr) = start_server(|cfg| {
        cfg.tx_ring_size = 64;
        cfg.max_payload = 1 << 20;
    });
    let (client, messages, _closed) = dial(addr);

    client.write(API_ECHO, &vec![1u8; 4096]).unwrap();
    // Either the reply never arrives (server-side backpressure swallowed
    // the write) or it does once drained; the connection itself must not
    // be torn down by the attempt.
    let _ = messages.recv_timeout(Duration::from_millis(500));

    client.write(API_ECHO, b"ping").unwrap();
    let (api, payload) = messages.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(api, API_ECHO);
    assert_eq!(payload, b"ping".to_vec());
    client.close().unwrap();
}

#[test]
fn close_is_idempotent() {
    let (_server, addr) = start_server(|_| {});
    let (client, _messages, _closed) = dial(addr);

    client.close().unwrap();
    // A second close on an already-shutdown socket must not panic.
    let _ = client.close();
}
