//! The per-connection state machine: accept wiring, RX accumulation,
//! parse-and-dispatch, and a write queue with partial-write handling and
//! dynamic write-interest toggling.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use concurrent_queue::ConcurrentQueue;

use crate::error::{Error, Result};
use crate::frame::codec::{encode_single, parse};
use crate::poller::{Fd, Poller};
use crate::sys::fd::FileDesc;
use crate::sys::syscall;
use crate::timer::TxAggregator;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out a fresh, monotonically increasing connection id. Distinct from
/// the fd, which the kernel recycles as connections close.
pub(crate) fn next_conn_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Why a connection ended, passed to `Handler::on_close`.
#[derive(Debug)]
pub enum CloseCause {
    /// The peer shut down its write half (EOF) or the poller reported HUP.
    PeerClosed,
    /// A protocol or I/O error, connection-fatal by definition.
    Error(Error),
    /// `Conn::close()` was called by the handler.
    UserClosed,
}

struct TxState {
    queue: VecDeque<Vec<u8>>,
    offset: usize,
    buffered_bytes: usize,
}

impl TxState {
    fn new() -> TxState {
        TxState {
            queue: VecDeque::new(),
            offset: 0,
            buffered_bytes: 0,
        }
    }
}

/// State shared between the owning shard thread and any foreign thread that
/// calls `Conn::write` from a worker. Cheap to clone (`Arc`-backed).
pub(crate) struct ConnShared {
    pub(crate) id: u64,
    pub(crate) fd: Fd,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) poller: Arc<dyn Poller>,
    pub(crate) owner_thread: ThreadId,
    pub(crate) compression_default: bool,
    pub(crate) tx_ring_size: usize,
    pub(crate) closed: AtomicBool,
    pub(crate) want_close: AtomicBool,
    pub(crate) needs_flush: AtomicBool,
    pub(crate) pending_flush: Arc<ConcurrentQueue<Fd>>,
    pub(crate) aggregator: Option<Mutex<TxAggregator>>,
    /// Shared with `Connection`, which uses it to decrypt inbound payloads;
    /// `Conn::write` uses it to encrypt outbound ones. A `Mutex` rather than
    /// engine-exclusive state because a foreign thread may call `write`.
    cipher: Option<Mutex<Box<dyn crate::handler::Cipher>>>,
    tx: Mutex<TxState>,
}

/// A handle to an accepted connection, passed to every `Handler` callback.
/// Cheap to clone; `Send + Sync` so a worker thread can reply asynchronously.
#[derive(Clone)]
pub struct Conn(pub(crate) Arc<ConnShared>);

impl Conn {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.peer_addr
    }

    /// Encodes `payload` under `api` and enqueues it for sending. When the
    /// connection's aggregator is enabled (`tx_batch_window != 0`), the pair
    /// is buffered instead and only framed once the aggregator's byte,
    /// message, or time trigger fires.
    pub fn write(&self, api: u16, payload: &[u8]) -> Result<()> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            )));
        }

        let mut owned_buf;
        let payload: &[u8] = if let Some(cipher_mutex) = &self.0.cipher {
            owned_buf = payload.to_vec();
            cipher_mutex.lock().unwrap().encrypt_in_place(&mut owned_buf);
            &owned_buf
        } else {
            payload
        };

        if let Some(agg_mutex) = &self.0.aggregator {
            let ready = {
                let mut agg = agg_mutex.lock().unwrap();
                agg.add(api, payload)
            };
            if let Some(items) = ready {
                let frame = crate::timer::encode_ready_batch(&items)?;
                return self.enqueue_frame(frame);
            }
            return Ok(());
        }

        let frame = encode_single(api, payload, self.0.compression_default)?;
        self.enqueue_frame(frame)
    }

    /// Marks the connection for teardown. The owning shard observes this on
    /// its next dispatch pass or wake and fires `on_close` exactly once;
    /// any buffered-but-unsent writes are discarded.
    pub fn close(&self) {
        self.0.want_close.store(true, Ordering::SeqCst);
        if std::thread::current().id() != self.0.owner_thread {
            let _ = self.0.pending_flush.push(self.0.fd);
            let _ = self.0.poller.wake();
        }
    }

    pub(crate) fn enqueue_frame(&self, frame: Vec<u8>) -> Result<()> {
        let shared = &self.0;
        let was_empty;
        {
            let mut tx = shared.tx.lock().unwrap();
            if tx.buffered_bytes + frame.len() > shared.tx_ring_size {
                return Err(Error::Backpressure);
            }
            was_empty = tx.queue.is_empty();
            tx.buffered_bytes += frame.len();
            tx.queue.push_back(frame);
        }

        if was_empty {
            shared.needs_flush.store(true, Ordering::SeqCst);
            if std::thread::current().id() != shared.owner_thread {
                let _ = shared.pending_flush.push(shared.fd);
                shared.poller.wake()?;
            }
        }
        Ok(())
    }
}

fn read_fd(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()))?;
    Ok(n as usize)
}

fn write_fd(fd: Fd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, buf.as_ptr() as *const libc::c_void, buf.len()))?;
    Ok(n as usize)
}

/// The engine-exclusive half of a connection: only the owning shard thread
/// ever touches this. Lives in the shard's connection map, keyed by fd.
pub struct Connection {
    pub(crate) shared: Arc<ConnShared>,
    #[allow(dead_code)]
    fd_owner: FileDesc,
    rx: Vec<u8>,
    max_rx: usize,
    max_payload: usize,
    write_interest: bool,
}

/// Outcome of draining the write queue, telling the caller whether write
/// interest should stay registered.
pub(crate) enum FlushOutcome {
    Drained,
    StillPending,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        fd_owner: FileDesc,
        peer_addr: SocketAddr,
        poller: Arc<dyn Poller>,
        compression_default: bool,
        tx_ring_size: usize,
        max_rx: usize,
        max_payload: usize,
        pending_flush: Arc<ConcurrentQueue<Fd>>,
        aggregator: Option<TxAggregator>,
        cipher: Option<Box<dyn crate::handler::Cipher>>,
    ) -> Connection {
        let fd = fd_owner.as_raw_fd();
        let shared = Arc::new(ConnShared {
            id,
            fd,
            peer_addr,
            poller,
            owner_thread: std::thread::current().id(),
            compression_default,
            tx_ring_size,
            closed: AtomicBool::new(false),
            want_close: AtomicBool::new(false),
            needs_flush: AtomicBool::new(false),
            pending_flush,
            aggregator: aggregator.map(Mutex::new),
            cipher: cipher.map(Mutex::new),
            tx: Mutex::new(TxState::new()),
        });

        Connection {
            shared,
            fd_owner,
            rx: Vec::new(),
            max_rx,
            max_payload,
            write_interest: false,
        }
    }

    pub fn handle(&self) -> Conn {
        Conn(self.shared.clone())
    }

    pub(crate) fn fd(&self) -> Fd {
        self.shared.fd
    }

    pub(crate) fn wants_close(&self) -> bool {
        self.shared.want_close.load(Ordering::SeqCst)
    }

    pub(crate) fn needs_flush(&self) -> bool {
        self.shared.needs_flush.swap(false, Ordering::SeqCst)
    }

    /// Drains the socket to `EAGAIN`, feeding bytes through the frame codec
    /// and invoking `handler.on_message` for each decoded message. Returns
    /// `Ok(true)` if the peer closed (EOF) and the connection should be torn
    /// down, `Ok(false)` to keep going, or `Err` on a fatal I/O/codec error.
    pub(crate) fn on_readable(&mut self, handler: &dyn crate::handler::Handler) -> Result<bool> {
        let mut scratch = [0u8; 64 * 1024];
        loop {
            match read_fd(self.fd(), &mut scratch) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    if self.rx.len() + n > self.max_rx {
                        return Err(Error::PayloadTooLarge {
                            len: self.rx.len() + n,
                            max: self.max_rx,
                        });
                    }
                    self.rx.extend_from_slice(&scratch[..n]);
                    self.dispatch(handler)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn dispatch(&mut self, handler: &dyn crate::handler::Handler) -> Result<()> {
        let conn = self.handle();
        let cipher = &self.shared.cipher;
        let max_payload = self.max_payload;
        let consumed = parse(&self.rx, max_payload, |api, payload| {
            let mut owned;
            let msg: &[u8] = if let Some(c) = cipher {
                owned = payload.to_vec();
                c.lock().unwrap().decrypt_in_place(&mut owned);
                &owned
            } else {
                payload
            };
            let _async_hint = handler.on_message(&conn, api, msg);
            Ok(())
        })?;
        self.rx.drain(..consumed);
        Ok(())
    }

    /// Drains the write queue with non-blocking `write(2)` calls, advancing
    /// the head buffer's partial-write offset. Returns whether the queue
    /// still has unsent bytes afterward.
    pub(crate) fn flush_tx(&mut self) -> Result<FlushOutcome> {
        let fd = self.fd();
        let mut tx = self.shared.tx.lock().unwrap();
        loop {
            let Some(front) = tx.queue.front() else {
                return Ok(FlushOutcome::Drained);
            };
            let remaining = &front[tx.offset..];
            match write_fd(fd, remaining) {
                Ok(n) => {
                    tx.buffered_bytes -= n;
                    tx.offset += n;
                    if tx.offset >= front.len() {
                        tx.queue.pop_front();
                        tx.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushOutcome::StillPending);
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    pub(crate) fn set_write_interest(&mut self, on: bool) -> Result<()> {
        if self.write_interest == on {
            return Ok(());
        }
        self.shared.poller.reregister(self.fd(), true, on)?;
        self.write_interest = on;
        Ok(())
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}
