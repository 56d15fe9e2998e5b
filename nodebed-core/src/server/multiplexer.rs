use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    net::{SocketAddr, TcpListener as StdTcpListener},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use futures_channel::oneshot::{self, Receiver as OReceiver, Sender as OSender};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::{
    runtime::{bind_to_core, RuntimeWrapper},
    ProtocolRouter, SessionMachine,
};
use crate::{
    config::RuntimeConfig,
    error::{Error, Result},
    wire::SessionId,
};

const READ_BUF_SIZE: usize = 4096;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type SessionRegistry = Rc<RefCell<HashMap<SessionId, (OReceiver<()>, JoinHandle<()>)>>>;

/// Stops a running [`Multiplexer`] from any thread.
///
/// The multiplexer owns the sender half of a oneshot channel and waits for
/// its cancellation; dropping the receiver here wakes the runtime.
#[derive(Clone)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

struct StopState {
    stopped: AtomicBool,
    signal: Mutex<Option<OReceiver<()>>>,
}

impl StopHandle {
    fn new(signal: OReceiver<()>) -> Self {
        Self {
            inner: Arc::new(StopState {
                stopped: AtomicBool::new(false),
                signal: Mutex::new(Some(signal)),
            }),
        }
    }

    /// Request the accept loop to exit. Returns `false` if a stop was
    /// already requested.
    pub fn stop(&self) -> bool {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        let signal = self
            .inner
            .signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(signal);
        info!("multiplexer stop requested");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

/// Bind a std listener, classifying the failures an operator can act on.
pub fn bind_listener(addr: SocketAddr) -> Result<StdTcpListener> {
    if addr.port() != 0 && addr.port() < 1024 {
        warn!("binding privileged port {}", addr.port());
    }
    StdTcpListener::bind(addr).map_err(|source| match source.kind() {
        io::ErrorKind::AddrInUse => Error::Bind { addr, source },
        io::ErrorKind::PermissionDenied => Error::Permission { addr, source },
        _ => Error::Io(source),
    })
}

/// Accepts sockets on one address and drives every session on a single
/// monoio runtime thread.
pub struct Multiplexer {
    addr: SocketAddr,
    runtime: RuntimeConfig,
    router: Arc<ProtocolRouter>,
    listener: Option<StdTcpListener>,
    stop_tx: OSender<()>,
    stop: StopHandle,
}

impl Multiplexer {
    pub fn new(addr: SocketAddr, runtime: RuntimeConfig, router: Arc<ProtocolRouter>) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        Self {
            addr,
            runtime,
            router,
            listener: None,
            stop_tx,
            stop: StopHandle::new(stop_rx),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    /// Bind the listening socket on the calling thread, so address errors
    /// surface before the runtime starts.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Ok(listener.local_addr()?);
        }
        let listener = bind_listener(self.addr)?;
        let local = listener.local_addr()?;
        info!("multiplexer bound to {local}");
        self.listener = Some(listener);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Run the accept loop on the calling thread until stopped.
    ///
    /// On return the listener is closed and every session has been
    /// signalled, awaited and closed.
    pub fn start(mut self) -> Result<()> {
        self.bind()?;
        let Some(listener) = self.listener.take() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "multiplexer listener missing after bind",
            )));
        };
        if let Some(core) = self.runtime.cpu_affinity {
            bind_to_core(core);
        }
        let mut runtime = RuntimeWrapper::try_from(&self.runtime)?;
        runtime.block_on(serve(listener, self.router, self.stop_tx))
    }
}

async fn serve(
    listener: StdTcpListener,
    router: Arc<ProtocolRouter>,
    mut stop: OSender<()>,
) -> Result<()> {
    // monoio registers the raw fd; the legacy driver needs it non-blocking.
    if monoio::utils::is_legacy() {
        listener.set_nonblocking(true)?;
    }
    let listener = TcpListener::from_std(listener)?;
    let sessions: SessionRegistry = Default::default();
    let mut cancellation = stop.cancellation();
    loop {
        monoio::select! {
            _ = &mut cancellation => {
                info!("multiplexer is notified to stop");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let machine = router.open_session(peer);
                        let id = machine.id();
                        let (tx, rx) = oneshot::channel();
                        let registry = sessions.clone();
                        let handle = monoio::spawn(async move {
                            serve_session(stream, machine, tx).await;
                            registry.borrow_mut().remove(&id);
                        });
                        sessions.borrow_mut().insert(id, (rx, handle));
                    }
                    Err(e) => {
                        error!("accept failed: {e}");
                        monoio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }
    drop(listener);

    let live: Vec<(OReceiver<()>, JoinHandle<()>)> =
        sessions.borrow_mut().drain().map(|(_, v)| v).collect();
    info!("closing {} live sessions", live.len());
    let mut handles = Vec::with_capacity(live.len());
    for (signal, handle) in live {
        drop(signal);
        handles.push(handle);
    }
    for handle in handles {
        handle.await;
    }
    info!("multiplexer stopped");
    Ok(())
}

async fn serve_session(mut stream: TcpStream, mut machine: SessionMachine, mut stop: OSender<()>) {
    let mut cancellation = stop.cancellation();
    let mut buf = Vec::with_capacity(READ_BUF_SIZE);
    loop {
        let (res, returned) = monoio::select! {
            _ = &mut cancellation => {
                debug!("session {} is notified to stop", machine.id());
                break;
            }
            r = stream.read(buf) => r,
        };
        buf = returned;
        let n = match res {
            Ok(0) => {
                debug!("session {} peer {} hung up", machine.id(), machine.peer());
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("session {} read failed: {e}", machine.id());
                break;
            }
        };
        let feed = machine.feed(&buf[..n]);
        let mut write_failed = false;
        for reply in feed.replies {
            let (res, _) = stream.write_all(reply.to_vec()).await;
            if let Err(e) = res {
                warn!("session {} write failed: {e}", machine.id());
                write_failed = true;
                break;
            }
        }
        if write_failed || feed.close {
            break;
        }
    }
    let _ = stream.shutdown().await;
    // No await between closing and deregistering: the id may be reused.
    machine.close();
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream as StdTcpStream,
        sync::atomic::AtomicUsize,
        thread,
        time::Instant,
    };

    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        cache::ConnectionCache,
        config::RuntimeType,
        error::ProtocolError,
        server::SubServer,
        stage::{Stage, Transition},
        wire::{NodeId, ProtocolId, SessionHeader},
    };

    /// Echoes 4-byte frames; `quit` closes.
    #[derive(Default)]
    struct Echo4 {
        closes: AtomicUsize,
    }

    impl SubServer for Echo4 {
        fn name(&self) -> &'static str {
            "echo4"
        }

        fn serv_init(&self, _: NodeId, _: SessionId) -> Stage {
            Stage::new(4, 0)
        }

        fn on_frame(&self, _: SessionId, _: Stage, frame: &[u8]) -> std::result::Result<Transition, ProtocolError> {
            let reply = Bytes::copy_from_slice(frame);
            if frame == b"quit" {
                return Ok(Transition::reply_and_close(reply));
            }
            Ok(Transition::reply_and_next(reply, Stage::new(4, 0)))
        }

        fn serv_close(&self, _: SessionId) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn legacy_runtime() -> RuntimeConfig {
        RuntimeConfig {
            runtime_type: RuntimeType::Legacy,
            ..Default::default()
        }
    }

    fn launch() -> (
        Arc<Echo4>,
        Arc<ProtocolRouter>,
        SocketAddr,
        StopHandle,
        thread::JoinHandle<Result<()>>,
    ) {
        let echo = Arc::new(Echo4::default());
        let router = Arc::new(
            ProtocolRouter::builder(Arc::new(ConnectionCache::new()))
                .register(ProtocolId::Agent, echo.clone())
                .build(),
        );
        let mut mux = Multiplexer::new(
            "127.0.0.1:0".parse().unwrap(),
            legacy_runtime(),
            router.clone(),
        );
        let addr = mux.bind().unwrap();
        let stop = mux.stop_handle();
        let join = thread::spawn(move || mux.start());
        (echo, router, addr, stop, join)
    }

    fn connect(addr: SocketAddr) -> StdTcpStream {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut header = BytesMut::new();
        SessionHeader::new(ProtocolId::Agent, NodeId::UNASSIGNED).encode(&mut header);
        stream.write_all(&header).unwrap();
        stream
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn echoes_frames_split_across_writes() {
        let (echo, _, addr, stop, join) = launch();
        let mut client = connect(addr);
        client.write_all(b"pi").unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(20));
        client.write_all(b"ngquit").unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).unwrap();
        assert_eq!(reply, b"pingquit");
        assert!(wait_until(|| echo.closes.load(Ordering::SeqCst) == 1));

        assert!(stop.stop());
        join.join().unwrap().unwrap();
    }

    #[test]
    fn hangup_closes_the_session_once() {
        let (echo, router, addr, stop, join) = launch();
        let client = connect(addr);
        assert!(wait_until(|| router.cache().session_count() == 1));
        drop(client);
        assert!(wait_until(|| echo.closes.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| router.cache().session_count() == 0));

        stop.stop();
        join.join().unwrap().unwrap();
        assert_eq!(echo.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_closes_live_sessions_and_is_idempotent() {
        let (echo, router, addr, stop, join) = launch();
        let clients: Vec<StdTcpStream> = (0..3).map(|_| connect(addr)).collect();
        assert!(wait_until(|| router.cache().session_count() == 3));
        // Make sure every header has been routed before stopping.
        assert!(wait_until(|| (0..3).all(|i| router
            .cache()
            .session(SessionId(i))
            .map_or(false, |s| s.protocol.is_some()))));

        let other = stop.clone();
        let begin = Instant::now();
        assert!(stop.stop());
        assert!(!other.stop());
        assert!(other.is_stopped());
        join.join().unwrap().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(5));
        assert_eq!(echo.closes.load(Ordering::SeqCst), 3);
        assert_eq!(router.cache().session_count(), 0);
        drop(clients);
    }

    #[test]
    fn stop_before_start_returns_promptly() {
        let (_, _, _, stop, join) = launch();
        stop.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn address_in_use_is_a_bind_error() {
        let holder = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();
        let router = Arc::new(ProtocolRouter::builder(Arc::new(ConnectionCache::new())).build());
        let mut mux = Multiplexer::new(addr, legacy_runtime(), router);
        assert!(matches!(mux.bind(), Err(Error::Bind { .. })));
        assert!(mux.local_addr().is_none());
    }
}
