//! UDP listener that feeds datagrams through the decoder into the sink.
//!
//! Each worker thread owns one socket. Where the kernel supports
//! `SO_REUSEPORT` every worker binds its own socket to the shared port and
//! the kernel spreads datagrams between them; elsewhere the workers share
//! clones of a single socket.

use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::TimeDelta;
use log::{debug, error, info, warn};
use socket2::SockRef;
use thiserror::Error;

use crate::decoder::PacketDecoder;
use crate::settings::ServerSettings;
use crate::sinks::FlowSink;
use crate::socket_stats::*;

/// Largest possible UDP payload.
pub const RECEIVE_BUFFER_SIZE: usize = 65535;
/// How often a blocked worker wakes up to look at the stop flag.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("unable to bind worker {worker} to port {port}: {source}")]
    Bind {
        port: u16,
        worker: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("server was already started")]
    AlreadyStarted,
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to start worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Bound,
    Running,
    Stopping,
    Stopped,
}

/// How worker sockets are obtained for a listen address.
pub trait BindStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns one socket per worker, all bound to the same port. Port zero
    /// picks a free port once and reuses it for the remaining workers.
    fn bind(&self, address: SocketAddrV4, workers: usize, buffer_size: usize) -> Result<Vec<UdpSocket>, ServerError>;
}

/// One `SO_REUSEPORT` socket per worker.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub struct ReusePortStrategy;

#[cfg(any(target_os = "linux", target_os = "android"))]
impl BindStrategy for ReusePortStrategy {
    fn name(&self) -> &'static str {
        "reuse-port"
    }

    fn bind(&self, address: SocketAddrV4, workers: usize, buffer_size: usize) -> Result<Vec<UdpSocket>, ServerError> {
        bind_each(address, workers, |address| reuse_port_socket(address, buffer_size))
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
/// Opens one socket per worker with `open`. On failure the sockets opened so
/// far are dropped, releasing the port, before the error is returned.
fn bind_each<F>(address: SocketAddrV4, workers: usize, mut open: F) -> Result<Vec<UdpSocket>, ServerError>
where
    F: FnMut(SocketAddrV4) -> std::io::Result<UdpSocket>,
{
    let mut address = address;
    let mut sockets = Vec::with_capacity(workers);
    for worker in 0..workers {
        let socket = open(address).map_err(|e| ServerError::Bind {
            port: address.port(),
            worker,
            source: e,
        })?;
        if address.port() == 0 {
            address.set_port(socket.local_addr()?.port());
        }
        sockets.push(socket);
    }
    Ok(sockets)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn reuse_port_socket(address: SocketAddrV4, buffer_size: usize) -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    set_receive_buffer(SockRef::from(&socket), buffer_size);
    socket.bind(&SocketAddr::V4(address).into())?;
    Ok(socket.into())
}

/// A single socket cloned for every worker. Workers contend on one kernel
/// queue, so throughput is lower than with `SO_REUSEPORT`.
pub struct SharedSocketStrategy;

impl BindStrategy for SharedSocketStrategy {
    fn name(&self) -> &'static str {
        "shared-socket"
    }

    fn bind(&self, address: SocketAddrV4, workers: usize, buffer_size: usize) -> Result<Vec<UdpSocket>, ServerError> {
        warn!("Running in reduced-throughput mode: {workers} workers share one socket");
        let socket = UdpSocket::bind(address).map_err(|e| ServerError::Bind {
            port: address.port(),
            worker: 0,
            source: e,
        })?;
        set_receive_buffer(SockRef::from(&socket), buffer_size);

        let mut sockets = Vec::with_capacity(workers);
        for _ in 1..workers {
            sockets.push(socket.try_clone()?);
        }
        sockets.insert(0, socket);
        Ok(sockets)
    }
}

/// Picks the fastest strategy the platform supports.
pub fn bind_strategy_for_platform() -> Box<dyn BindStrategy> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        Box::new(ReusePortStrategy)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        info!("SO_REUSEPORT is not available, falling back to a shared socket");
        Box::new(SharedSocketStrategy)
    }
}

fn set_receive_buffer(socket: SockRef<'_>, requested: usize) {
    if requested == 0 {
        return;
    }
    if let Err(e) = socket.set_recv_buffer_size(requested) {
        warn!("Unable to set receive buffer to {requested} bytes: {e}");
        return;
    }
    //the kernel may clamp the request to net.core.rmem_max
    if let Ok(actual) = socket.recv_buffer_size() {
        if actual < requested {
            warn!("Receive buffer is {actual} bytes, below the requested {requested}");
        }
    }
}

/// Decodes one datagram and hands every flow to the sink.
pub fn handle_packet(decoder: &dyn PacketDecoder, sink: &dyn FlowSink, payload: &[u8], peer: SocketAddr) {
    for flow in decoder.decode(payload, peer) {
        sink.write(&flow);
    }
}

fn receive_loop(worker: usize, socket: UdpSocket, decoder: &dyn PacketDecoder, sink: &dyn FlowSink, stop: &AtomicBool) {
    let mut receive_buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
    debug!("Worker {worker} listening");
    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut receive_buffer) {
            Ok((byte_count, peer)) => handle_packet(decoder, sink, &receive_buffer[..byte_count], peer),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                error!("Worker {worker} failed to receive: {e}");
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
    debug!("Worker {worker} stopped");
}

struct Worker {
    join_handle: JoinHandle<()>,
    done: Receiver<()>,
}

pub struct IpfixServer {
    settings: ServerSettings,
    decoder: Arc<dyn PacketDecoder>,
    sink: Arc<dyn FlowSink>,
    strategy: Box<dyn BindStrategy>,
    socket_stats: Arc<dyn SocketStatsReader>,
    state: ServerState,
    stop: Arc<AtomicBool>,
    workers: Vec<Worker>,
    local_addr: Option<SocketAddr>,
}

impl IpfixServer {
    pub fn new(settings: ServerSettings, decoder: Arc<dyn PacketDecoder>, sink: Arc<dyn FlowSink>) -> Self {
        Self::with_strategy(settings, decoder, sink, bind_strategy_for_platform())
    }

    pub fn with_strategy(
        settings: ServerSettings,
        decoder: Arc<dyn PacketDecoder>,
        sink: Arc<dyn FlowSink>,
        strategy: Box<dyn BindStrategy>,
    ) -> Self {
        let validity = TimeDelta::from_std(settings.socket_stats_validity)
            .unwrap_or(TimeDelta::seconds(DEFAULT_VALIDITY_SECS));
        let socket_stats = Arc::new(SocketStatsCachingReader::new(
            ProcNetUdpReader::new(settings.port),
            validity,
        ));
        IpfixServer {
            settings,
            decoder,
            sink,
            strategy,
            socket_stats,
            state: ServerState::Created,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            local_addr: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Bound address, known once the server is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Kernel counters for the configured listen port.
    pub fn socket_stats(&self) -> Arc<dyn SocketStatsReader> {
        Arc::clone(&self.socket_stats)
    }

    /// Binds the worker sockets and starts receiving. Only valid once.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.state != ServerState::Created {
            return Err(ServerError::AlreadyStarted);
        }

        let address = SocketAddrV4::new(self.settings.address, self.settings.port);
        let worker_count = self.settings.threads.max(1);
        let sockets = self.strategy.bind(address, worker_count, self.settings.buffer_size)?;
        self.local_addr = match sockets.first() {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };

        self.state = ServerState::Bound;
        for (worker, socket) in sockets.into_iter().enumerate() {
            if let Err(e) = self.spawn_worker(worker, socket) {
                //sockets not yet handed to a worker are dropped with the iterator
                self.stop();
                return Err(e);
            }
        }
        self.state = ServerState::Running;

        info!(
            "Listening for IPFIX on {} with {} workers ({})",
            self.local_addr.map(|a| a.to_string()).unwrap_or_default(),
            worker_count,
            self.strategy.name()
        );
        Ok(())
    }

    fn spawn_worker(&mut self, worker: usize, socket: UdpSocket) -> Result<(), ServerError> {
        socket.set_read_timeout(Some(READ_TIMEOUT))?;
        let decoder = Arc::clone(&self.decoder);
        let sink = Arc::clone(&self.sink);
        let stop = Arc::clone(&self.stop);
        let (done_tx, done_rx) = mpsc::channel();
        let join_handle = thread::Builder::new()
            .name(format!("kflow-worker-{worker}"))
            .spawn(move || {
                receive_loop(worker, socket, decoder.as_ref(), sink.as_ref(), &stop);
                let _ = done_tx.send(());
            })
            .map_err(|e| ServerError::Spawn { worker, source: e })?;
        self.workers.push(Worker {
            join_handle,
            done: done_rx,
        });
        Ok(())
    }

    /// Signals the workers and waits up to the shutdown timeout for them to
    /// exit and drop their sockets. Workers still busy after that are left
    /// behind.
    pub fn stop(&mut self) {
        match self.state {
            ServerState::Created => {
                self.state = ServerState::Stopped;
                return;
            }
            ServerState::Stopping | ServerState::Stopped => return,
            ServerState::Bound | ServerState::Running => {}
        }

        self.state = ServerState::Stopping;
        self.stop.store(true, Ordering::SeqCst);
        let timeout = self.settings.shutdown_timeout;
        let deadline = Instant::now() + timeout;
        for (index, worker) in self.workers.drain(..).enumerate() {
            match worker.done.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.join_handle.join().is_err() {
                        error!("Worker {index} panicked");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    warn!("Worker {index} did not stop within {timeout:?}, detaching it");
                }
            }
        }
        self.state = ServerState::Stopped;
        info!("IPFIX server stopped");
    }
}

impl Drop for IpfixServer {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Mutex;

    use super::*;
    use crate::decoder::IpfixDecoder;
    use crate::flows::Flow;
    use crate::templates::TemplateStore;

    #[derive(Default)]
    struct CollectingSink {
        flows: Mutex<Vec<Flow>>,
    }

    impl FlowSink for CollectingSink {
        fn write(&self, flow: &Flow) {
            self.flows.lock().unwrap().push(*flow);
        }
    }

    fn test_settings(port: u16) -> ServerSettings {
        ServerSettings {
            address: Ipv4Addr::LOCALHOST,
            port,
            threads: 2,
            buffer_size: 0,
            shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    //template 256 (sourceIPv4Address, sourceTransportPort, octetDeltaCount) and one record
    fn template_and_data_packet() -> Vec<u8> {
        let mut template_set = Vec::new();
        template_set.extend_from_slice(&2u16.to_be_bytes());
        template_set.extend_from_slice(&20u16.to_be_bytes());
        template_set.extend_from_slice(&256u16.to_be_bytes());
        template_set.extend_from_slice(&3u16.to_be_bytes());
        for (id, length) in [(8u16, 4u16), (7, 2), (1, 4)] {
            template_set.extend_from_slice(&id.to_be_bytes());
            template_set.extend_from_slice(&length.to_be_bytes());
        }

        let mut data_set = Vec::new();
        data_set.extend_from_slice(&256u16.to_be_bytes());
        data_set.extend_from_slice(&14u16.to_be_bytes());
        data_set.extend_from_slice(&[10, 0, 0, 1]);
        data_set.extend_from_slice(&443u16.to_be_bytes());
        data_set.extend_from_slice(&1500u32.to_be_bytes());

        let length = (16 + template_set.len() + data_set.len()) as u16;
        let mut packet = Vec::new();
        packet.extend_from_slice(&10u16.to_be_bytes());
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        packet.extend_from_slice(&1u32.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.extend_from_slice(&template_set);
        packet.extend_from_slice(&data_set);
        packet
    }

    fn wait_for_flows(sink: &CollectingSink, count: usize) -> Vec<Flow> {
        let started = Instant::now();
        loop {
            let flows = sink.flows.lock().unwrap().clone();
            if flows.len() >= count || started.elapsed() > Duration::from_secs(5) {
                return flows;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_receives_and_decodes_over_loopback() {
        let sink = Arc::new(CollectingSink::default());
        let decoder = Arc::new(IpfixDecoder::new(Arc::new(TemplateStore::new())));
        let mut server = IpfixServer::new(test_settings(0), decoder.clone(), sink.clone());
        server.start().unwrap();
        let server_addr = server.local_addr().unwrap();
        assert_ne!(server_addr.port(), 0);

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&template_and_data_packet(), server_addr).unwrap();

        let flows = wait_for_flows(&sink, 1);
        server.stop();

        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].sampler_address, 0x7F00_0001);
        assert_eq!(flows[0].source_address, 0x0A00_0001);
        assert_eq!(flows[0].source_port, 443);
        assert_eq!(flows[0].bytes, 1500);
        assert_eq!(flows[0].timestamp, 1_700_000_000_000);
        assert_eq!(decoder.metrics().packets(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let sink = Arc::new(CollectingSink::default());
        let decoder = Arc::new(IpfixDecoder::new(Arc::new(TemplateStore::new())));
        let mut server = IpfixServer::new(test_settings(0), decoder, sink);
        assert_eq!(server.state(), ServerState::Created);
        assert!(server.local_addr().is_none());

        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));

        let started = Instant::now();
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
        server.stop();
        assert!(matches!(server.start(), Err(ServerError::AlreadyStarted)));
    }

    #[test]
    fn test_stop_before_start() {
        let sink = Arc::new(CollectingSink::default());
        let decoder = Arc::new(IpfixDecoder::new(Arc::new(TemplateStore::new())));
        let mut server = IpfixServer::new(test_settings(0), decoder, sink);
        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[test]
    fn test_bind_fails_on_occupied_port() {
        let occupant = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = occupant.local_addr().unwrap().port();

        let sink = Arc::new(CollectingSink::default());
        let decoder = Arc::new(IpfixDecoder::new(Arc::new(TemplateStore::new())));
        let mut server = IpfixServer::new(test_settings(port), decoder, sink);
        match server.start() {
            Err(ServerError::Bind { port: failed, worker, .. }) => {
                assert_eq!(failed, port);
                assert_eq!(worker, 0);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    #[test]
    fn test_shared_socket_strategy_clones_one_port() {
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let sockets = SharedSocketStrategy.bind(address, 3, 0).unwrap();
        assert_eq!(sockets.len(), 3);
        let port = sockets[0].local_addr().unwrap().port();
        assert!(sockets.iter().all(|s| s.local_addr().unwrap().port() == port));
    }

    #[test]
    fn test_shared_socket_server_receives_over_loopback() {
        let sink = Arc::new(CollectingSink::default());
        let decoder = Arc::new(IpfixDecoder::new(Arc::new(TemplateStore::new())));
        let mut server = IpfixServer::with_strategy(
            test_settings(0),
            decoder,
            sink.clone(),
            Box::new(SharedSocketStrategy),
        );
        server.start().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(&template_and_data_packet(), server.local_addr().unwrap()).unwrap();
        let flows = wait_for_flows(&sink, 1);
        server.stop();

        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].bytes, 1500);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_failed_bind_releases_earlier_sockets() {
        let mut picked_port = 0;
        let result = bind_each(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 3, |address| {
            if address.port() == 0 {
                let socket = UdpSocket::bind(address)?;
                picked_port = socket.local_addr()?.port();
                Ok(socket)
            } else {
                Err(std::io::Error::from(ErrorKind::AddrInUse))
            }
        });

        match result {
            Err(ServerError::Bind { port, worker, .. }) => {
                assert_eq!(worker, 1);
                assert_eq!(port, picked_port);
            }
            other => panic!("expected bind error, got {other:?}"),
        }
        //the first worker's socket is gone, so the port can be taken again
        assert!(UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, picked_port)).is_ok());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_reuse_port_strategy_shares_picked_port() {
        let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let sockets = ReusePortStrategy.bind(address, 3, 1 << 20).unwrap();
        assert_eq!(sockets.len(), 3);
        let port = sockets[0].local_addr().unwrap().port();
        assert_ne!(port, 0);
        assert!(sockets.iter().all(|s| s.local_addr().unwrap().port() == port));
    }

    struct FixedDecoder(Vec<Flow>);

    impl PacketDecoder for FixedDecoder {
        fn decode(&self, _payload: &[u8], _sender: SocketAddr) -> Vec<Flow> {
            self.0.clone()
        }
    }

    #[test]
    fn test_handle_packet_forwards_every_flow() {
        let sink = CollectingSink::default();
        let decoder = FixedDecoder(vec![Flow { bytes: 1, ..Default::default() }, Flow { bytes: 2, ..Default::default() }]);
        let peer: SocketAddr = "192.0.2.1:2055".parse().unwrap();
        handle_packet(&decoder, &sink, b"ignored", peer);
        let flows = sink.flows.lock().unwrap();
        assert_eq!(flows.iter().map(|f| f.bytes).collect::<Vec<_>>(), vec![1, 2]);
    }
}
