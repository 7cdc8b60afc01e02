//! TCP listener and process-wide shared state.

use std::io::{BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::coordinator::{CheckpointCoordinator, CommitMutex};
use crate::engine::Store;
use crate::error::Result;
use crate::session::{Session, SessionEnd, DEFAULT_MAX_INPUT};

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Tunables shared by every session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum buffered input without a delimiter.
    pub max_input_bytes: usize,
    /// Minimum time between progress lines during `.run`.
    pub progress_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_input_bytes: DEFAULT_MAX_INPUT,
            progress_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    wake: Mutex<Option<SocketAddr>>,
}

/// Process-wide stop flag raised by `.stop`.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<ShutdownInner>,
}

impl Shutdown {
    /// Creates an untriggered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `.stop` has been received.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Raises the flag and wakes the listener if it is blocked in `accept`.
    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let wake = *self.inner.wake.lock();
        if let Some(addr) = wake {
            if let Err(err) = TcpStream::connect_timeout(&addr, WAKE_TIMEOUT) {
                debug!(error = %err, "server.shutdown.wake_failed");
            }
        }
    }

    fn set_wake_addr(&self, mut addr: SocketAddr) {
        if addr.ip().is_unspecified() {
            let loopback = match addr {
                SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            addr.set_ip(loopback);
        }
        *self.inner.wake.lock() = Some(addr);
    }
}

/// State shared by every session of one server.
pub struct ServerContext {
    /// The durable store all sessions connect to.
    pub store: Arc<dyn Store>,
    /// Checkpoint barrier.
    pub coordinator: Arc<CheckpointCoordinator>,
    /// Mutex taken by statements added with `.mutex_commit`.
    pub commit_mutex: CommitMutex,
    /// Time source for run bounds and progress.
    pub clock: Arc<dyn Clock>,
    /// Stop flag.
    pub shutdown: Shutdown,
    /// Session tunables.
    pub options: SessionOptions,
}

impl ServerContext {
    /// Builds a context around `store` with a global checkpoint threshold in WAL frames.
    pub fn new(store: Arc<dyn Store>, wal_threshold: u64) -> Self {
        Self {
            store,
            coordinator: Arc::new(CheckpointCoordinator::new(wal_threshold)),
            commit_mutex: CommitMutex::new(),
            clock: Arc::new(SystemClock::new()),
            shutdown: Shutdown::new(),
            options: SessionOptions::default(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the session tunables.
    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Closes the store and raises the stop flag.
    pub fn stop(&self) {
        self.store.close();
        self.shutdown.trigger();
    }
}

/// Accepts connections and runs one session thread per connection.
pub struct Server {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    next_session: AtomicU64,
}

impl Server {
    /// Binds the listening socket.
    pub fn bind(addr: impl ToSocketAddrs, ctx: Arc<ServerContext>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        ctx.shutdown.set_wake_addr(listener.local_addr()?);
        Ok(Self {
            listener,
            ctx,
            next_session: AtomicU64::new(1),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Shared context handed to sessions.
    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Accepts connections until `.stop` is received.
    ///
    /// An accept error ends the loop and is returned.
    pub fn serve(&self) -> Result<()> {
        info!(addr = %self.local_addr()?, "server.listening");
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "server.accept.failed");
                    return Err(err.into());
                }
            };
            if self.ctx.shutdown.is_triggered() {
                info!("server.stopped");
                return Ok(());
            }
            let id = self.next_session.fetch_add(1, Ordering::Relaxed);
            let ctx = Arc::clone(&self.ctx);
            debug!(session = id, peer = %peer, "server.accept");
            thread::Builder::new()
                .name(format!("session-{id}"))
                .spawn(move || handle_connection(ctx, id, stream))?;
        }
    }
}

fn handle_connection(ctx: Arc<ServerContext>, id: u64, stream: TcpStream) {
    match serve_connection(ctx, id, stream) {
        Ok(end) => debug!(session = id, end = ?end, "session.end"),
        Err(err) => warn!(session = id, error = %err, "session.failed"),
    }
}

fn serve_connection(
    ctx: Arc<ServerContext>,
    id: u64,
    stream: TcpStream,
) -> Result<SessionEnd> {
    let reader = stream.try_clone()?;
    let mut writer = BufWriter::new(stream);
    let mut session = match Session::open(ctx, id) {
        Ok(session) => session,
        Err(err) => {
            writeln!(writer, "error - {err}")?;
            writer.flush()?;
            return Err(err);
        }
    };
    session.serve(reader, writer)
}
