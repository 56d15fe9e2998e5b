use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tracing::{debug, warn};

use super::{ProtocolRouter, SubServer};
use crate::{
    error::ProtocolError,
    stage::{FrameBuffer, Stage, Transition},
    wire::{SessionHeader, SessionId, SESSION_HEADER_LEN},
};

const SESSION_HEADER_STAGE: Stage = Stage::new(SESSION_HEADER_LEN, 0);

/// Outcome of feeding bytes into a session.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    /// Replies to write back, in order.
    pub replies: Vec<Bytes>,
    /// The session is finished; the caller flushes `replies` and closes.
    pub close: bool,
}

/// Staged protocol state of one connection.
///
/// The machine owns no socket: callers push received bytes through
/// [`SessionMachine::feed`] and write back whatever it returns. This keeps the
/// same code path for socket sessions and for in-process loopback queries.
pub struct SessionMachine {
    id: SessionId,
    peer: SocketAddr,
    router: Arc<ProtocolRouter>,
    active: Option<Arc<dyn SubServer>>,
    stage: Stage,
    frame: FrameBuffer,
    finished: bool,
    closed: bool,
}

impl SessionMachine {
    pub(crate) fn new(router: Arc<ProtocolRouter>, peer: SocketAddr) -> Self {
        let id = router.cache().open_session(peer);
        debug!("session {id} opened for {peer}");
        Self {
            id,
            peer,
            router,
            active: None,
            stage: SESSION_HEADER_STAGE,
            frame: FrameBuffer::new(SESSION_HEADER_STAGE.len),
            finished: false,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume `input`, running every frame it completes.
    ///
    /// Bytes may arrive in any chunking; a frame is handled only once all of
    /// its bytes are buffered. Bytes after a closing frame are discarded.
    pub fn feed(&mut self, mut input: &[u8]) -> Feed {
        let mut out = Feed::default();
        if self.finished {
            out.close = true;
            return out;
        }
        loop {
            let consumed = self.frame.fill(input);
            input = &input[consumed..];
            let Some(frame) = self.frame.take_frame() else {
                break;
            };
            match self.handle(&frame) {
                Ok(Transition::Continue { reply, next }) => {
                    out.replies.extend(reply);
                    self.stage = next;
                    self.frame.reset(next.len);
                }
                Ok(Transition::Close { reply }) => {
                    out.replies.extend(reply);
                    self.finished = true;
                    break;
                }
                Err(e) => {
                    warn!(
                        "session {} from {} closed on protocol error: {e}",
                        self.id, self.peer
                    );
                    self.finished = true;
                    break;
                }
            }
        }
        out.close = self.finished;
        out
    }

    fn handle(&mut self, frame: &[u8]) -> Result<Transition, ProtocolError> {
        if let Some(server) = &self.active {
            return server.on_frame(self.id, self.stage, frame);
        }
        self.on_session_header(frame)
    }

    fn on_session_header(&mut self, frame: &[u8]) -> Result<Transition, ProtocolError> {
        let header = SessionHeader::decode(frame)?;
        let Some((protocol, server)) = self.router.route(header.protocol_id) else {
            warn!(
                "session {} from {}: unsupported protocol id {}",
                self.id, self.peer, header.protocol_id
            );
            return Ok(Transition::close());
        };
        let cache = self.router.cache();
        cache.set_session_protocol(self.id, protocol)?;
        if header.node_id.is_assigned() {
            cache.resolve_node(self.id, header.node_id)?;
        }
        debug!(
            "session {} speaks {} for node {}",
            self.id,
            server.name(),
            header.node_id
        );
        let next = server.serv_init(header.node_id, self.id);
        self.active = Some(server);
        Ok(Transition::next(next))
    }

    /// Release the session. Safe to call any number of times.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.finished = true;
        if let Some(server) = self.active.take() {
            server.serv_close(self.id);
        }
        self.router.cache().close_session(self.id);
        debug!("session {} from {} closed", self.id, self.peer);
    }
}

impl Drop for SessionMachine {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use bytes::BytesMut;

    use super::*;
    use crate::{
        cache::ConnectionCache,
        wire::{NodeId, ProtocolId},
    };

    const STEP_LEN: u16 = 0;
    const STEP_BODY: u16 = 1;

    /// Length-prefixed echo: one byte of length, then that many bytes.
    /// An empty body closes the session.
    #[derive(Default)]
    struct Echo {
        inits: AtomicUsize,
        closes: AtomicUsize,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl SubServer for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn serv_init(&self, _: NodeId, _: SessionId) -> Stage {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Stage::new(1, STEP_LEN)
        }

        fn on_frame(
            &self,
            _: SessionId,
            stage: Stage,
            frame: &[u8],
        ) -> Result<Transition, ProtocolError> {
            match stage.step {
                STEP_LEN => Ok(Transition::next(Stage::new(frame[0] as usize, STEP_BODY))),
                STEP_BODY => {
                    self.frames.lock().unwrap().push(frame.to_vec());
                    if frame.is_empty() {
                        return Ok(Transition::close());
                    }
                    Ok(Transition::reply_and_next(
                        Bytes::copy_from_slice(frame),
                        Stage::new(1, STEP_LEN),
                    ))
                }
                step => Err(ProtocolError::UnexpectedStep(step)),
            }
        }

        fn serv_close(&self, _: SessionId) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<ProtocolRouter>, Arc<Echo>) {
        let echo = Arc::new(Echo::default());
        let router = ProtocolRouter::builder(Arc::new(ConnectionCache::new()))
            .register(ProtocolId::Agent, echo.clone())
            .build();
        (Arc::new(router), echo)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 9], 4000))
    }

    fn header(protocol_id: u16, node: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        SessionHeader {
            protocol_id,
            node_id: NodeId(node),
        }
        .encode(&mut buf);
        buf.to_vec()
    }

    fn stream() -> Vec<u8> {
        let mut bytes = header(ProtocolId::Agent as u16, 0);
        bytes.extend_from_slice(&[3, b'a', b'b', b'c', 2, b'x', b'y']);
        bytes
    }

    #[test]
    fn frames_survive_any_chunking() {
        let (router, _) = setup();
        let mut whole = router.open_session(peer());
        let expected = whole.feed(&stream());
        assert_eq!(
            expected.replies,
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"xy")]
        );
        assert!(!expected.close);

        for chunk in [1, 2, 5, 7] {
            let mut session = router.open_session(peer());
            let mut replies = Vec::new();
            for piece in stream().chunks(chunk) {
                replies.extend(session.feed(piece).replies);
            }
            assert_eq!(replies, expected.replies, "chunk size {chunk}");
        }
    }

    #[test]
    fn zero_length_stage_completes_without_input() {
        let (router, echo) = setup();
        let mut session = router.open_session(peer());
        let mut bytes = header(ProtocolId::Agent as u16, 0);
        bytes.push(0);
        let feed = session.feed(&bytes);
        assert!(feed.close);
        assert_eq!(echo.frames.lock().unwrap().as_slice(), &[Vec::<u8>::new()]);
    }

    #[test]
    fn serv_close_runs_exactly_once() {
        let (router, echo) = setup();
        let mut session = router.open_session(peer());
        session.feed(&header(ProtocolId::Agent as u16, 0));
        session.close();
        session.close();
        drop(session);
        assert_eq!(echo.inits.load(Ordering::SeqCst), 1);
        assert_eq!(echo.closes.load(Ordering::SeqCst), 1);
        assert_eq!(router.cache().session_count(), 0);
    }

    #[test]
    fn unknown_protocol_closes_quietly() {
        let (router, echo) = setup();
        for protocol_id in [0, ProtocolId::Hub as u16, 9, u16::MAX] {
            let mut session = router.open_session(peer());
            let feed = session.feed(&header(protocol_id, 0));
            assert!(feed.close);
            assert!(feed.replies.is_empty());
        }
        assert_eq!(echo.inits.load(Ordering::SeqCst), 0);
        assert_eq!(echo.closes.load(Ordering::SeqCst), 0);
        assert_eq!(router.cache().session_count(), 0);
    }

    #[test]
    fn bytes_after_close_are_ignored() {
        let (router, echo) = setup();
        let mut session = router.open_session(peer());
        let mut bytes = header(ProtocolId::Agent as u16, 0);
        bytes.extend_from_slice(&[0, 1, b'z']);
        assert!(session.feed(&bytes).close);
        let again = session.feed(&[1, b'q']);
        assert!(again.close);
        assert!(again.replies.is_empty());
        assert_eq!(echo.frames.lock().unwrap().len(), 1);
    }

    #[test]
    fn nonzero_node_id_refreshes_the_cache() {
        let (router, _) = setup();
        let mut session = router.open_session(peer());
        session.feed(&header(ProtocolId::Agent as u16, 12));
        let node = router.cache().node(NodeId(12)).unwrap();
        assert_eq!(node.addr, Some(peer()));
        let data = router.cache().session(session.id()).unwrap();
        assert_eq!(data.node_id, Some(NodeId(12)));
        assert_eq!(data.protocol, Some(ProtocolId::Agent));
    }

    #[test]
    fn protocol_errors_close_the_session() {
        struct Broken;
        impl SubServer for Broken {
            fn name(&self) -> &'static str {
                "broken"
            }
            fn serv_init(&self, _: NodeId, _: SessionId) -> Stage {
                Stage::new(2, 7)
            }
            fn on_frame(
                &self,
                _: SessionId,
                stage: Stage,
                _: &[u8],
            ) -> Result<Transition, ProtocolError> {
                Err(ProtocolError::UnexpectedStep(stage.step))
            }
        }
        let router = Arc::new(
            ProtocolRouter::builder(Arc::new(ConnectionCache::new()))
                .register(ProtocolId::Logging, Arc::new(Broken))
                .build(),
        );
        let mut session = router.open_session(peer());
        let mut bytes = header(ProtocolId::Logging as u16, 0);
        bytes.extend_from_slice(&[0, 0]);
        assert!(session.feed(&bytes).close);
        assert!(session.is_finished());
    }
}
