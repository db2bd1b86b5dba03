//! The sharded acceptor: one listener + poller + connection map per shard,
//! each driven by a dedicated thread.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread::JoinHandle;

use concurrent_queue::ConcurrentQueue;

use crate::config::Config;
use crate::conn::{CloseCause, Connection, FlushOutcome};
use crate::error::{Error, Result};
use crate::handler::Handler;
use crate::poller::{self, CloseReason, Fd, PollHandler, Poller};
use crate::sys;
use crate::timer::{TimerWheel, TxAggregator};

/// A running server: `num_pollers` shards, each with its own thread, poller,
/// and (when supported) listener. Dropping or calling `stop` tears every
/// shard down and joins its thread.
pub struct Server {
    timer_wheel: Option<Arc<TimerWheel>>,
    shard_pollers: Vec<Arc<dyn Poller>>,
    join_handles: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    stopped: bool,
}

fn resolve_address(cfg: &Config) -> Result<SocketAddr> {
    let addr = &cfg.address;
    let candidate = if let Some(port) = addr.strip_prefix(':') {
        match cfg.listen_network {
            crate::config::ListenNetwork::Tcp6 => format!("[::]:{port}"),
            _ => format!("0.0.0.0:{port}"),
        }
    } else {
        addr.clone()
    };
    candidate
        .parse::<SocketAddr>()
        .map_err(|_| Error::invalid_argument(format!("invalid address: {addr}")))
}

impl Server {
    /// Validates `cfg`, opens `cfg.num_pollers` shards (listeners when
    /// `reuse_port` is set, else a single listener owned by shard 0), and
    /// starts one event-loop thread per shard.
    pub fn start(cfg: Config, handler: Arc<dyn Handler>) -> Result<Server> {
        cfg.validate()?;
        let addr = resolve_address(&cfg)?;

        let timer_wheel = TimerWheel::start(cfg.timer_wheel_tick).map(Arc::new);

        let mut shard_pollers = Vec::with_capacity(cfg.num_pollers);
        let mut join_handles = Vec::with_capacity(cfg.num_pollers);
        let mut local_addr = None;

        for idx in 0..cfg.num_pollers {
            let started = Self::start_shard(idx, &cfg, &addr, &handler, &timer_wheel, &mut local_addr);
            match started {
                Ok((poller, join)) => {
                    shard_pollers.push(poller);
                    join_handles.push(join);
                }
                Err(e) => {
                    // Earlier shards in this loop already have a live thread
                    // and (possibly) a bound listener; tear those down
                    // before surfacing the error instead of leaking them.
                    let mut partial = Server {
                        timer_wheel,
                        shard_pollers,
                        join_handles,
                        local_addr,
                        stopped: false,
                    };
                    partial.stop();
                    return Err(e);
                }
            }
        }

        Ok(Server {
            timer_wheel,
            shard_pollers,
            join_handles,
            local_addr,
            stopped: false,
        })
    }

    fn start_shard(
        idx: usize,
        cfg: &Config,
        addr: &SocketAddr,
        handler: &Arc<dyn Handler>,
        timer_wheel: &Option<Arc<TimerWheel>>,
        local_addr: &mut Option<SocketAddr>,
    ) -> Result<(Arc<dyn Poller>, JoinHandle<()>)> {
        let poller: Arc<dyn Poller> = Arc::from(poller::new()?);

        let listener = if cfg.reuse_port || idx == 0 {
            let fd = sys::socket::listen_tcp(addr, cfg.reuse_port, 1024)?;
            poller.register(fd.as_raw_fd(), true, false)?;
            if idx == 0 {
                *local_addr = Some(sys::socket::local_addr(fd.as_raw_fd())?);
            }
            Some(fd)
        } else {
            None
        };

        let mut worker = ShardWorker {
            idx,
            poller: poller.clone(),
            listener_fd: listener.as_ref().map(|f| f.as_raw_fd()),
            _listener: listener,
            conns: HashMap::new(),
            handler: handler.clone(),
            cfg: cfg.clone(),
            pending_flush: Arc::new(ConcurrentQueue::unbounded()),
            timer_wheel: timer_wheel.clone(),
        };

        let thread_poller = poller.clone();
        let join = std::thread::Builder::new()
            .name(format!("quaynet-shard-{idx}"))
            .spawn(move || {
                let span = tracing::info_span!("shard", idx);
                let _enter = span.enter();
                if let Err(e) = thread_poller.run(&mut worker) {
                    tracing::error!(error = %e, "shard event loop terminated");
                }
            })
            .map_err(Error::Io)?;

        Ok((poller, join))
    }

    /// The address shard 0's listener is bound to, including the
    /// OS-assigned port when `Config::address` requested port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Closes every shard's poller (which returns its `run` call), stops
    /// the timer wheel, and joins all shard threads. Best-effort: thread
    /// join failures are logged, not propagated.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for p in &self.shard_pollers {
            p.close();
            let _ = p.wake();
        }
        for join in self.join_handles.drain(..) {
            if join.join().is_err() {
                tracing::error!("shard thread panicked");
            }
        }
        // Shard threads have dropped their `Arc<TimerWheel>` clones by now,
        // so this is the last reference and the wheel's thread can be
        // joined without leaking it.
        if let Some(tw) = self.timer_wheel.take() {
            if let Some(mut tw) = Arc::into_inner(tw) {
                tw.stop();
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ShardWorker {
    idx: usize,
    poller: Arc<dyn Poller>,
    listener_fd: Option<Fd>,
    _listener: Option<sys::fd::FileDesc>,
    conns: HashMap<Fd, Connection>,
    handler: Arc<dyn Handler>,
    cfg: Config,
    pending_flush: Arc<ConcurrentQueue<Fd>>,
    timer_wheel: Option<Arc<TimerWheel>>,
}

impl ShardWorker {
    fn accept_loop(&mut self) {
        let Some(listener_fd) = self.listener_fd else {
            return;
        };
        loop {
            match sys::socket::accept_nonblocking(listener_fd) {
                Ok(Some(fd)) => self.accept_one(fd),
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn accept_one(&mut self, fd: sys::fd::FileDesc) {
        let raw = fd.as_raw_fd();
        if let Err(e) = sys::socket::set_nodelay(raw, true) {
            tracing::warn!(error = %e, "set_nodelay failed");
        }
        let peer_addr = match sys::socket::peer_addr(raw) {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "getpeername failed");
                return;
            }
        };
        if let Err(e) = self.poller.register(raw, true, false) {
            tracing::warn!(error = %e, "register failed");
            return;
        }

        let id = crate::conn::next_conn_id();
        let cipher = self.cfg.new_cipher.as_ref().map(|f| f());
        let aggregator = if !self.cfg.tx_batch_window.is_zero() {
            Some(TxAggregator::new(
                self.cfg.tx_batch_window,
                self.cfg.tx_batch_bytes,
                self.cfg.tx_batch_msgs,
            ))
        } else {
            None
        };

        // The RX accumulator must fit at least one maximal frame (payload +
        // the longest header), but `rx_ring_size` can widen that floor to
        // stage more pipelined frames before backpressure kicks in.
        let max_rx = self.cfg.rx_ring_size.max(self.cfg.max_payload + 8);
        let connection = Connection::new(
            id,
            fd,
            peer_addr,
            self.poller.clone(),
            matches!(self.cfg.compression_default, crate::config::Compression::Zstd),
            self.cfg.tx_ring_size,
            max_rx,
            self.cfg.max_payload,
            self.pending_flush.clone(),
            aggregator,
            cipher,
        );

        if let Some(tw) = &self.timer_wheel {
            tw.register(&connection.shared);
        }

        tracing::debug!(conn_id = id, peer = %peer_addr, "connection accepted");

        self.conns.insert(raw, connection);
        let handle = self.conns.get(&raw).unwrap().handle();
        self.handler.on_open(&handle);
        self.drain_and_reregister(raw);
    }

    fn drain_and_reregister(&mut self, fd: Fd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if conn.wants_close() {
            self.close_connection(fd, CloseCause::UserClosed);
            return;
        }
        match conn.flush_tx() {
            Ok(FlushOutcome::Drained) => {
                let _ = conn.set_write_interest(false);
            }
            Ok(FlushOutcome::StillPending) => {
                let _ = conn.set_write_interest(true);
            }
            Err(e) => {
                self.close_connection(fd, CloseCause::Error(e));
            }
        }
    }

    fn close_connection(&mut self, fd: Fd, cause: CloseCause) {
        if let Some(conn) = self.conns.remove(&fd) {
            conn.mark_closed();
            let _ = self.poller.unregister(fd);
            tracing::info!(conn_id = conn.handle().id(), ?cause, "connection closed");
            let handle = conn.handle();
            self.handler.on_close(&handle, &cause);
        }
    }
}

impl std::fmt::Debug for CloseCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseCause::PeerClosed => write!(f, "PeerClosed"),
            CloseCause::Error(e) => write!(f, "Error({e})"),
            CloseCause::UserClosed => write!(f, "UserClosed"),
        }
    }
}

impl PollHandler for ShardWorker {
    fn on_readable(&mut self, fd: Fd) {
        if Some(fd) == self.listener_fd {
            self.accept_loop();
            return;
        }
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        match conn.on_readable(self.handler.as_ref()) {
            Ok(true) => self.close_connection(fd, CloseCause::PeerClosed),
            Ok(false) => self.drain_and_reregister(fd),
            Err(e) => {
                tracing::warn!(fd, error = %e, "connection read error");
                self.close_connection(fd, CloseCause::Error(e));
            }
        }
    }

    fn on_writable(&mut self, fd: Fd) {
        self.drain_and_reregister(fd);
    }

    fn on_close(&mut self, fd: Fd, reason: CloseReason) {
        if Some(fd) == self.listener_fd {
            return;
        }
        let cause = match reason {
            CloseReason::Eof => CloseCause::PeerClosed,
            CloseReason::Error => {
                let err = sys::socket::take_error(fd)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "socket error"));
                CloseCause::Error(Error::Io(err))
            }
        };
        self.close_connection(fd, cause);
    }

    fn on_wake(&mut self) {
        while let Ok(fd) = self.pending_flush.pop() {
            self.drain_and_reregister(fd);
        }
    }
}
