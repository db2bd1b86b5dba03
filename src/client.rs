//! A minimal blocking-thread client used by tests and demos: one thread
//! reads and parses frames, writes go through a mutex-guarded clone of the
//! same stream.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::frame::codec::{encode_single, parse};

const DEFAULT_MAX_PAYLOAD: usize = 16 << 20;

/// Callbacks for a `Client` connection, mirroring the server-side `Handler`
/// shape but without the `async` hint (there is no engine to defer to).
pub trait ClientHandler: Send + Sync {
    fn on_open(&self, client: &Arc<Client>);
    fn on_message(&self, client: &Arc<Client>, api: u16, payload: &[u8]);
    fn on_close(&self, client: &Arc<Client>, reason: Option<Error>);
}

pub struct Client {
    write_half: Mutex<TcpStream>,
    max_payload: usize,
}

impl Client {
    /// Connects to `addr`, spawns a reader thread, and fires `on_open` once
    /// the connection is established.
    pub fn dial(addr: &str, handler: Arc<dyn ClientHandler>) -> Result<Arc<Client>> {
        Self::dial_with_max_payload(addr, handler, DEFAULT_MAX_PAYLOAD)
    }

    pub fn dial_with_max_payload(
        addr: &str,
        handler: Arc<dyn ClientHandler>,
        max_payload: usize,
    ) -> Result<Arc<Client>> {
        let read_half = TcpStream::connect(addr).map_err(Error::Io)?;
        read_half.set_nodelay(true).map_err(Error::Io)?;
        let write_half = read_half.try_clone().map_err(Error::Io)?;

        let client = Arc::new(Client {
            write_half: Mutex::new(write_half),
            max_payload,
        });

        let thread_client = client.clone();
        std::thread::Builder::new()
            .name("quaynet-client".into())
            .spawn(move || {
                handler.on_open(&thread_client);
                Client::read_loop(read_half, handler, thread_client);
            })
            .map_err(Error::Io)?;

        Ok(client)
    }

    fn read_loop(mut stream: TcpStream, handler: Arc<dyn ClientHandler>, client: Arc<Client>) {
        let mut rb: Vec<u8> = Vec::new();
        let mut scratch = [0u8; 64 * 1024];
        loop {
            match stream.read(&mut scratch) {
                Ok(0) => {
                    handler.on_close(&client, None);
                    return;
                }
                Ok(n) => {
                    rb.extend_from_slice(&scratch[..n]);
                    let consumed = match parse(&rb, client.max_payload, |api, payload| {
                        handler.on_message(&client, api, payload);
                        Ok(())
                    }) {
                        Ok(c) => c,
                        Err(e) => {
                            handler.on_close(&client, Some(e));
                            return;
                        }
                    };
                    rb.drain(..consumed);
                }
                Err(e) => {
                    handler.on_close(&client, Some(Error::Io(e)));
                    return;
                }
            }
        }
    }

    /// Encodes and writes a single, uncompressed frame.
    pub fn write(&self, api: u16, payload: &[u8]) -> Result<()> {
        let frame = encode_single(api, payload, false)?;
        let mut stream = self.write_half.lock().unwrap();
        stream.write_all(&frame).map_err(Error::Io)
    }

    pub fn close(&self) -> Result<()> {
        let stream = self.write_half.lock().unwrap();
        stream.shutdown(std::net::Shutdown::Both).map_err(Error::Io)
    }
}
