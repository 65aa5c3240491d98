use crate::config::RudpConfig;
use crate::connection::ConnectionDriver;
use crate::error::RudpError;
use crate::packet_header::{PacketHeader, PacketKind};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::sequence_number::SequenceNumber;
use bytes::{BufMut, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, error, info, trace, warn};

/// The multiplexer owns one bound UDP endpoint and shares it among many
///  logical connections: it assembles and transmits outbound packets, runs the
///  single receive loop, and dispatches each inbound datagram to the
///  connection registered for its source address.
///
/// Back-references to connections are non-owning; an entry whose connection
///  has been dropped is cleaned up lazily on the next lookup.
pub struct Multiplexer {
    config: Arc<RudpConfig>,
    receive_socket: Arc<UdpSocket>,
    send_pipeline: SendPipeline,
    connections: Mutex<ConnectionTable>,
    recv_loop_started: AtomicBool,
}

struct ConnectionTable {
    by_remote: FxHashMap<SocketAddr, Weak<ConnectionDriver>>,
    /// wildcard slot consumed by the first handshake from an unknown remote
    listener: Option<Weak<ConnectionDriver>>,
}

impl Multiplexer {
    /// Bind a fresh UDP endpoint.
    pub async fn bind(addr: impl ToSocketAddrs, config: Arc<RudpConfig>) -> anyhow::Result<Arc<Multiplexer>> {
        config.validate()?;

        let receive_socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr());

        Ok(Arc::new(Multiplexer {
            config,
            send_pipeline: SendPipeline::new(Arc::new(receive_socket.clone())),
            receive_socket,
            connections: Mutex::new(ConnectionTable {
                by_remote: FxHashMap::default(),
                listener: None,
            }),
            recv_loop_started: AtomicBool::new(false),
        }))
    }

    /// Like [`Multiplexer::bind`], but transmitting through the given
    ///  [`SendSocket`] instead of the receive socket itself. This is the hook
    ///  for fault injection (e.g. a decorator that drops packets).
    pub fn with_send_socket(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        config: Arc<RudpConfig>,
    ) -> anyhow::Result<Arc<Multiplexer>> {
        config.validate()?;

        Ok(Arc::new(Multiplexer {
            config,
            send_pipeline: SendPipeline::new(send_socket),
            receive_socket,
            connections: Mutex::new(ConnectionTable {
                by_remote: FxHashMap::default(),
                listener: None,
            }),
            recv_loop_started: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket.local_addr()
    }

    pub(crate) fn config(&self) -> &Arc<RudpConfig> {
        &self.config
    }

    /// Register a connection under its remote endpoint. At most one connection
    ///  per remote endpoint can exist on a multiplexer.
    pub(crate) fn add(&self, remote: SocketAddr, driver: &Arc<ConnectionDriver>) -> Result<(), RudpError> {
        let mut table = self.connections.lock().unwrap();
        if let Some(existing) = table.by_remote.get(&remote) {
            if existing.upgrade().is_some() {
                return Err(RudpError::AddressInUse);
            }
        }
        table.by_remote.insert(remote, Arc::downgrade(driver));
        Ok(())
    }

    /// Register a connection in the wildcard listener slot.
    pub(crate) fn set_listener(&self, driver: &Arc<ConnectionDriver>) -> Result<(), RudpError> {
        let mut table = self.connections.lock().unwrap();
        if let Some(existing) = &table.listener {
            if existing.upgrade().is_some() {
                return Err(RudpError::AddressInUse);
            }
        }
        table.listener = Some(Arc::downgrade(driver));
        Ok(())
    }

    /// Unregister a connection (keyed entry and listener slot alike).
    pub(crate) fn remove(&self, remote: Option<SocketAddr>, driver: &ConnectionDriver) {
        let mut table = self.connections.lock().unwrap();
        if let Some(remote) = remote {
            if let Some(existing) = table.by_remote.get(&remote) {
                if std::ptr::eq(existing.as_ptr(), driver) {
                    table.by_remote.remove(&remote);
                }
            }
        }
        if let Some(listener) = &table.listener {
            if std::ptr::eq(listener.as_ptr(), driver) {
                table.listener = None;
            }
        }
    }

    pub(crate) async fn send_handshake(&self, to: SocketAddr, sequence: SequenceNumber, ack: Option<SequenceNumber>) {
        trace!("sending HANDSHAKE {}:{:?} to {}", sequence, ack.map(|a| a.to_raw()), to);
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN_MAX);
        PacketHeader::new(PacketKind::Handshake, sequence, ack).ser(&mut buf);
        self.send_pipeline.do_send_packet(to, &buf).await;
    }

    pub(crate) async fn send_keepalive(&self, to: SocketAddr, sequence: SequenceNumber, ack: Option<SequenceNumber>) {
        trace!("sending KEEPALIVE {}:{:?} to {}", sequence, ack.map(|a| a.to_raw()), to);
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN_MAX);
        PacketHeader::new(PacketKind::Keepalive, sequence, ack).ser(&mut buf);
        self.send_pipeline.do_send_packet(to, &buf).await;
    }

    pub(crate) async fn send_data(&self, to: SocketAddr, sequence: SequenceNumber, ack: Option<SequenceNumber>, payload: &[u8]) {
        trace!("sending DATA {}:{:?} ({} bytes) to {}", sequence, ack.map(|a| a.to_raw()), payload.len(), to);
        let mut buf = BytesMut::with_capacity(PacketHeader::SERIALIZED_LEN_MAX + payload.len());
        PacketHeader::new(PacketKind::Data, sequence, ack).ser(&mut buf);
        buf.put_slice(payload);
        self.send_pipeline.do_send_packet(to, &buf).await;
    }

    /// Ensure the receive loop is running. Callable any number of times; only
    ///  one loop is ever spawned, and only it consumes from the socket.
    pub(crate) fn start_receive(self: &Arc<Self>) {
        if self.recv_loop_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mux = self.clone();
        tokio::spawn(async move {
            mux.recv_loop().await;
        });
    }

    async fn recv_loop(&self) {
        debug!("starting receive loop on {}", self.local_addr());
        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            let (num_read, from) = match self.receive_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            self.dispatch(from, &buf[..num_read]).await;
        }
    }

    /// Parse one inbound datagram and route it to the connection registered
    ///  for its source address.
    ///
    /// A piggybacked ack is processed before a co-arriving DATA payload; on a
    ///  HANDSHAKE it is processed after the handshake itself, so that an
    ///  actively connecting peer has moved on from `Connecting` by the time
    ///  the ack completes its side of the exchange.
    pub(crate) async fn dispatch(&self, from: SocketAddr, datagram: &[u8]) {
        let parse_buf = &mut &datagram[..];
        let header = match PacketHeader::deser(parse_buf) {
            Ok(header) => header,
            Err(_) => {
                warn!("received packet with unparsable header from {:?}, dropping", from);
                return;
            }
        };
        trace!("received {:?} from {}", header, from);

        let Some(connection) = self.lookup(from, header.packet_kind) else {
            trace!("no connection for {}, dropping {:?}", from, header);
            return;
        };

        match header.packet_kind {
            PacketKind::Handshake => {
                connection.process_handshake(header.sequence, from).await;
                if let Some(ack) = header.ack {
                    connection.process_acknowledgement(ack).await;
                }
            }
            PacketKind::Keepalive => {
                if let Some(ack) = header.ack {
                    connection.process_acknowledgement(ack).await;
                }
            }
            PacketKind::Data => {
                if let Some(ack) = header.ack {
                    connection.process_acknowledgement(ack).await;
                }
                let payload = Bytes::copy_from_slice(parse_buf);
                connection.process_data(None, header.sequence, payload).await;
            }
        }
    }

    /// Find the connection for a source address. A handshake from an unknown
    ///  remote consumes the listener slot, re-registering that connection
    ///  under the source address so follow-up packets find it.
    fn lookup(&self, from: SocketAddr, packet_kind: PacketKind) -> Option<Arc<ConnectionDriver>> {
        let mut table = self.connections.lock().unwrap();

        if let Some(weak) = table.by_remote.get(&from) {
            if let Some(connection) = weak.upgrade() {
                return Some(connection);
            }
            table.by_remote.remove(&from);
        }

        if packet_kind == PacketKind::Handshake {
            if let Some(weak) = table.listener.clone() {
                table.listener = None;
                if let Some(connection) = weak.upgrade() {
                    debug!("listener takes over connection attempt from {}", from);
                    table.by_remote.insert(from, weak);
                    return Some(connection);
                }
            }
        }

        None
    }
}
