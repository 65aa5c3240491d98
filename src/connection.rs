use crate::config::{RudpConfig, SequenceFilter};
use crate::error::RudpError;
use crate::multiplexer::Multiplexer;
use crate::resolver::{Resolver, TokioResolver};
use crate::sequence_number::SequenceNumber;
use crate::transmit_queue::TransmitQueue;
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::{oneshot, RwLock};
use tokio::time;
use tracing::{debug, trace, warn};

/// Lifecycle of a connection. `Closed` is both the initial state and the
///  state of a connection that has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Listening,
    Connecting,
    Handshaking,
    Established,
}

/// A logical connection to one remote endpoint, sharing a bound UDP endpoint
///  (a [`Multiplexer`]) with other connections.
///
/// A connection is established either actively ([`Connection::connect`]: send
///  a handshake, receive the peer's handshake carrying an ack, reply with a
///  keepalive) or passively ([`Connection::accept`]: answer the first
///  handshake that arrives on the multiplexer). Once established, [`Connection::send`]
///  and [`Connection::receive`] exchange whole messages: one send on one side
///  matches one receive on the other.
///
/// Sends complete when the peer's cumulative ack covers the message's sequence
///  number, not when the datagram leaves the socket; until then the transmit
///  queue retransmits it.
pub struct Connection {
    driver: Arc<ConnectionDriver>,
}

impl Default for Connection {
    fn default() -> Self {
        Connection::new()
    }
}

impl Connection {
    /// A connection without a bound local endpoint. All network operations on
    ///  it fail with [`RudpError::NotBound`].
    pub fn new() -> Connection {
        Connection {
            driver: Arc::new(ConnectionDriver::new(None, Arc::new(RudpConfig::default()))),
        }
    }

    /// Bind a fresh local endpoint for this connection alone.
    pub async fn bind(local: impl tokio::net::ToSocketAddrs, config: Arc<RudpConfig>) -> anyhow::Result<Connection> {
        let multiplexer = Multiplexer::bind(local, config).await?;
        Ok(Self::with_multiplexer(multiplexer))
    }

    /// A connection sharing an already-bound endpoint. This is how several
    ///  logical connections (distinguished by remote address) go through one
    ///  local UDP port.
    pub fn with_multiplexer(multiplexer: Arc<Multiplexer>) -> Connection {
        let config = multiplexer.config().clone();
        Connection {
            driver: Arc::new(ConnectionDriver::new(Some(multiplexer), config)),
        }
    }

    /// Replace the resolver used by [`Connection::connect_host`].
    pub fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.driver.resolver.write().unwrap() = resolver;
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RudpError> {
        self.driver
            .multiplexer
            .as_ref()
            .map(|m| m.local_addr())
            .ok_or(RudpError::NotBound)
    }

    pub async fn state(&self) -> ConnectionState {
        self.driver.inner.read().await.state
    }

    /// The last inbound sequence number this connection accepted, if any.
    pub fn last_remote_sequence(&self) -> Option<SequenceNumber> {
        *self.driver.last_remote_sequence.read().unwrap()
    }

    /// Actively connect to a remote endpoint. An unspecified remote address is
    ///  rewritten to the loopback address of the same family.
    ///
    /// Completes when the handshake exchange is acknowledged by the peer, or
    ///  fails with [`RudpError::TimedOut`] after the configured connect
    ///  timeout.
    pub async fn connect(&self, remote: SocketAddr) -> Result<(), RudpError> {
        let mux = self.driver.require_multiplexer()?;
        let remote = substitute_loopback(remote);

        let completion = self.driver.start_connect(&mux, remote).await?;

        match time::timeout(self.driver.config.connect_timeout, completion).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RudpError::Cancelled),
            Err(_) => {
                if self.driver.abort_connect(&mux, remote).await {
                    debug!("connect attempt to {} timed out", remote);
                    Err(RudpError::TimedOut)
                }
                else {
                    // established in the window between timeout and teardown
                    Ok(())
                }
            }
        }
    }

    /// Resolve `host` / `service` and try each resulting endpoint in order.
    ///  Fails with the last endpoint's error when all are exhausted, or with
    ///  [`RudpError::HostNotFound`] if resolution yields nothing.
    pub async fn connect_host(&self, host: &str, service: &str) -> Result<(), RudpError> {
        self.driver.require_multiplexer()?;

        let resolver = self.driver.resolver.read().unwrap().clone();
        let endpoints = resolver.resolve(host, service).await?;
        if endpoints.is_empty() {
            return Err(RudpError::HostNotFound);
        }

        let mut last_error = RudpError::HostNotFound;
        for remote in endpoints {
            match self.connect(remote).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("connect attempt to {} failed ({}), trying next endpoint", remote, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Passively wait for a peer to connect: the connection takes the
    ///  multiplexer's listener slot and completes the handshake initiated by
    ///  the first remote that sends one.
    pub async fn accept(&self) -> Result<(), RudpError> {
        let mux = self.driver.require_multiplexer()?;

        let completion = {
            let mut inner = self.driver.inner.write().await;
            match inner.state {
                ConnectionState::Closed => {}
                ConnectionState::Established => return Err(RudpError::AlreadyConnected),
                _ => return Err(RudpError::AlreadyStarted),
            }
            mux.set_listener(&self.driver)?;
            inner.state = ConnectionState::Listening;
            let (tx, rx) = oneshot::channel();
            inner.connect_waiter = Some(tx);
            debug!("listening on {}", mux.local_addr());
            mux.start_receive();
            rx
        };

        match completion.await {
            Ok(result) => result,
            Err(_) => Err(RudpError::Cancelled),
        }
    }

    /// Send one message. Completes with the payload size once the peer's
    ///  cumulative ack covers this message's sequence number.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, RudpError> {
        let mux = self.driver.require_multiplexer()?;
        let payload = Bytes::copy_from_slice(payload);

        let completion = {
            let mut inner = self.driver.inner.write().await;
            let remote = inner.remote.ok_or(RudpError::NotConnected)?;
            let sequence = inner.alloc_sequence();
            let size = payload.len();
            trace!("queueing DATA {} ({} bytes) for {}", sequence, size, remote);

            let (tx, rx) = oneshot::channel();
            let driver = Arc::downgrade(&self.driver);
            let step_mux = mux.clone();
            // replayable: every retransmit re-reads the current piggyback ack
            let send_step = move || {
                let mux = step_mux.clone();
                let payload = payload.clone();
                let driver = driver.clone();
                async move {
                    let Some(driver) = driver.upgrade() else { return };
                    let ack = *driver.last_remote_sequence.read().unwrap();
                    mux.send_data(remote, sequence, ack, &payload).await;
                }
            };
            self.driver
                .transmit_queue
                .push(sequence, size, self.driver.config.retransmit_interval, send_step, tx)
                .await;
            rx
        };

        match completion.await {
            Ok(result) => result,
            Err(_) => Err(RudpError::Cancelled),
        }
    }

    /// Receive one message into `buf`. Completes with the full payload size;
    ///  at most `buf.len()` bytes are copied, so the buffer must be sized for
    ///  a whole message.
    ///
    /// Concurrent receives complete in the order they were submitted.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, RudpError> {
        let mux = self.driver.require_multiplexer()?;

        let (immediate, completion) = {
            let mut inner = self.driver.inner.write().await;
            if let Some(pending) = inner.data_pending.pop_front() {
                (Some(pending), None)
            }
            else {
                let (tx, rx) = oneshot::channel();
                inner.read_waiters.push_back(tx);
                mux.start_receive();
                (None, Some(rx))
            }
        };

        let (result, payload) = match immediate {
            Some(x) => x,
            None => completion
                .expect("either pending data or a read waiter")
                .await
                .map_err(|_| RudpError::Cancelled)?,
        };
        result?;

        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(payload.len())
    }

    /// Tear the connection down: deregister from the multiplexer and fail all
    ///  pending operations with [`RudpError::Cancelled`].
    pub async fn close(&self) {
        self.driver.shutdown(RudpError::Cancelled).await;
    }

    pub(crate) fn driver(&self) -> &Arc<ConnectionDriver> {
        &self.driver
    }
}

/// The per-connection state machine. The multiplexer holds a non-owning
///  reference to it and feeds it inbound events (`process_handshake`,
///  `process_acknowledgement`, `process_data`).
pub(crate) struct ConnectionDriver {
    config: Arc<RudpConfig>,
    multiplexer: Option<Arc<Multiplexer>>,
    resolver: StdRwLock<Arc<dyn Resolver>>,
    inner: RwLock<ConnectionInner>,
    /// kept outside `inner` so replayable send closures can read the fresh
    ///  piggyback ack without the state lock
    last_remote_sequence: StdRwLock<Option<SequenceNumber>>,
    transmit_queue: TransmitQueue,
}

struct ConnectionInner {
    state: ConnectionState,
    remote: Option<SocketAddr>,
    next_sequence: SequenceNumber,
    read_waiters: VecDeque<ReadWaiter>,
    data_pending: VecDeque<PendingData>,
    connect_waiter: Option<oneshot::Sender<Result<(), RudpError>>>,
    pending_accept: Option<PendingAccept>,
}

type ReadWaiter = oneshot::Sender<(Result<(), RudpError>, Bytes)>;
type PendingData = (Result<(), RudpError>, Bytes);

/// Passive handshake in flight: the listener has answered `remote`'s
///  handshake and becomes established once that answer is acknowledged.
struct PendingAccept {
    initial: SequenceNumber,
    remote: SocketAddr,
}

impl ConnectionInner {
    fn alloc_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        sequence
    }

    /// Keepalives are out-of-band: they carry the current sequence counter
    ///  without consuming it, so they never create a gap in the sequenced
    ///  stream their receiver tracks.
    fn peek_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }
}

impl ConnectionDriver {
    fn new(multiplexer: Option<Arc<Multiplexer>>, config: Arc<RudpConfig>) -> ConnectionDriver {
        ConnectionDriver {
            config,
            multiplexer,
            resolver: StdRwLock::new(Arc::new(TokioResolver)),
            inner: RwLock::new(ConnectionInner {
                state: ConnectionState::Closed,
                remote: None,
                next_sequence: SequenceNumber::random(),
                read_waiters: VecDeque::new(),
                data_pending: VecDeque::new(),
                connect_waiter: None,
                pending_accept: None,
            }),
            last_remote_sequence: StdRwLock::new(None),
            transmit_queue: TransmitQueue::new(),
        }
    }

    fn require_multiplexer(&self) -> Result<Arc<Multiplexer>, RudpError> {
        self.multiplexer.clone().ok_or(RudpError::NotBound)
    }

    async fn start_connect(
        self: &Arc<Self>,
        mux: &Arc<Multiplexer>,
        remote: SocketAddr,
    ) -> Result<oneshot::Receiver<Result<(), RudpError>>, RudpError> {
        let mut inner = self.inner.write().await;
        match inner.state {
            ConnectionState::Closed => {}
            ConnectionState::Established => return Err(RudpError::AlreadyConnected),
            _ => return Err(RudpError::AlreadyStarted),
        }

        mux.add(remote, self)?;
        inner.state = ConnectionState::Connecting;
        inner.remote = Some(remote);
        let (tx, rx) = oneshot::channel();
        inner.connect_waiter = Some(tx);

        debug!("connecting to {}", remote);
        mux.start_receive();
        let sequence = inner.alloc_sequence();
        self.push_handshake(mux, remote, sequence, None).await;
        Ok(rx)
    }

    /// Tear down a timed-out connect attempt. Returns false if the connection
    ///  turned established concurrently (nothing is torn down then).
    async fn abort_connect(&self, mux: &Arc<Multiplexer>, remote: SocketAddr) -> bool {
        let mut inner = self.inner.write().await;
        if !matches!(inner.state, ConnectionState::Connecting | ConnectionState::Handshaking) {
            return false;
        }

        inner.state = ConnectionState::Closed;
        inner.remote = None;
        inner.connect_waiter = None;
        self.transmit_queue.cancel_all(RudpError::TimedOut);
        mux.remove(Some(remote), self);
        true
    }

    /// Push a handshake onto the transmit queue. Its outcome is observed
    ///  through the state machine, not through the entry's completion.
    async fn push_handshake(
        &self,
        mux: &Arc<Multiplexer>,
        remote: SocketAddr,
        sequence: SequenceNumber,
        ack: Option<SequenceNumber>,
    ) {
        let step_mux = mux.clone();
        let send_step = move || {
            let mux = step_mux.clone();
            async move {
                mux.send_handshake(remote, sequence, ack).await;
            }
        };
        let (completion, _) = oneshot::channel();
        self.transmit_queue
            .push(sequence, 0, self.config.retransmit_interval, send_step, completion)
            .await;
    }

    /// A peer's handshake arrived (carrying its initial sequence number).
    pub(crate) async fn process_handshake(&self, initial: SequenceNumber, remote: SocketAddr) {
        let mut inner = self.inner.write().await;
        match inner.state {
            ConnectionState::Listening => {
                debug!("handshake from {} with initial sequence {}", remote, initial);
                let Some(mux) = &self.multiplexer else { return };
                let sequence = inner.alloc_sequence();
                inner.pending_accept = Some(PendingAccept { initial, remote });
                self.push_handshake(mux, remote, sequence, Some(initial)).await;
            }
            ConnectionState::Connecting => {
                debug!("handshake reply from {} with initial sequence {}", remote, initial);
                let Some(mux) = &self.multiplexer else { return };
                inner.state = ConnectionState::Handshaking;
                *self.last_remote_sequence.write().unwrap() = Some(initial);
                let sequence = inner.peek_sequence();
                mux.send_keepalive(remote, sequence, Some(initial)).await;
            }
            other => {
                warn!("unexpected handshake from {} in state {:?}, dropping", remote, other);
            }
        }
    }

    /// A cumulative ack arrived (piggybacked on a handshake, keepalive or data
    ///  packet).
    pub(crate) async fn process_acknowledgement(&self, ack: SequenceNumber) {
        let mut inner = self.inner.write().await;
        match inner.state {
            ConnectionState::Established => {}
            ConnectionState::Handshaking => {
                debug!("ack {} completes the handshake", ack);
                inner.state = ConnectionState::Established;
                if let Some(waiter) = inner.connect_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
            ConnectionState::Listening => {
                // handled below: the ack may cover our answering handshake
            }
            other => {
                warn!("unexpected ack {} in state {:?}, dropping", ack, other);
                return;
            }
        }

        let removed = self.transmit_queue.apply_ack(ack);

        if inner.state == ConnectionState::Listening && removed > 0 {
            if let Some(accept) = inner.pending_accept.take() {
                debug!("connection from {} established", accept.remote);
                inner.state = ConnectionState::Established;
                inner.remote = Some(accept.remote);
                *self.last_remote_sequence.write().unwrap() = Some(accept.initial);
                if let Some(waiter) = inner.connect_waiter.take() {
                    let _ = waiter.send(Ok(()));
                }
            }
        }
    }

    /// A data packet arrived. The payload either satisfies the oldest read
    ///  waiter (answering with a keepalive so the ack gets back even with no
    ///  data flowing the other way) or is parked until the next receive.
    pub(crate) async fn process_data(&self, error: Option<RudpError>, sequence: SequenceNumber, payload: Bytes) {
        let mut inner = self.inner.write().await;

        if !self.is_expected_packet(sequence) {
            trace!("dropping out-of-sequence DATA {}", sequence);
            return;
        }
        *self.last_remote_sequence.write().unwrap() = Some(sequence);

        let result = match error {
            Some(e) => Err(e),
            None => Ok(()),
        };

        if let Some(waiter) = inner.read_waiters.pop_front() {
            if let (Some(mux), Some(remote)) = (&self.multiplexer, inner.remote) {
                let ka_sequence = inner.peek_sequence();
                mux.send_keepalive(remote, ka_sequence, Some(sequence)).await;
            }
            trace!("delivering DATA {} ({} bytes) to waiting receive", sequence, payload.len());
            let _ = waiter.send((result, payload));
        }
        else {
            trace!("parking DATA {} ({} bytes), no receive pending", sequence, payload.len());
            inner.data_pending.push_back((result, payload));
        }
    }

    /// Accept filter for inbound data sequences. The default is the strict
    ///  successor of the last accepted sequence; [`SequenceFilter::AnyNewer`]
    ///  is the widening hook (a reorder buffer would attach there).
    fn is_expected_packet(&self, sequence: SequenceNumber) -> bool {
        match *self.last_remote_sequence.read().unwrap() {
            None => true,
            Some(last) => match self.config.sequence_filter {
                SequenceFilter::StrictNext => last.next() == sequence,
                SequenceFilter::AnyNewer => !sequence.is_covered_by(last),
            },
        }
    }

    async fn shutdown(&self, error: RudpError) {
        let mut inner = self.inner.write().await;
        if inner.state == ConnectionState::Closed {
            return;
        }
        debug!("closing connection (remote {:?})", inner.remote);

        let remote = inner.remote.take();
        inner.state = ConnectionState::Closed;
        inner.pending_accept = None;
        if let Some(waiter) = inner.connect_waiter.take() {
            let _ = waiter.send(Err(error.clone()));
        }
        while let Some(waiter) = inner.read_waiters.pop_front() {
            let _ = waiter.send((Err(error.clone()), Bytes::new()));
        }
        inner.data_pending.clear();
        self.transmit_queue.cancel_all(error);

        if let Some(mux) = &self.multiplexer {
            mux.remove(remote, self);
        }
    }
}

/// An unspecified address in a connect target means "this host": rewrite it
///  to the loopback address of the same family.
fn substitute_loopback(remote: SocketAddr) -> SocketAddr {
    if !remote.ip().is_unspecified() {
        return remote;
    }
    match remote {
        SocketAddr::V4(addr) => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), addr.port()),
        SocketAddr::V6(addr) => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), addr.port()),
    }
}
