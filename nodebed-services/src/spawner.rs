//! Spawner sub-server: launches services on request.
//!
//! A launch request is read in three frames: the request header (its param is
//! the service name length), the name, then a length-prefixed config path
//! where length 0 means "no config". The reply is a single status, `ACK` or
//! `NACK`, and the session closes.
//!
//! `ACK` means the request named a known service with an acceptable path and
//! was dispatched. The config itself is read on the service's own thread, so
//! a broken config file is reported in the log rather than on the wire.
use std::{
    collections::HashMap,
    path::Path,
    sync::{Mutex, MutexGuard, PoisonError},
};

use nodebed_core::{
    server::SubServer,
    stage::{Stage, Transition},
    table::{
        PayloadLen, ProtocolTable, Request, RequestReader, REQUEST_STAGE, STEP_CUSTOM,
        STEP_PAYLOAD, STEP_REQUEST,
    },
    wire::{
        checked_frame_len, decode_u32, encode_status, NodeId, SessionId, ACK, LENGTH_PREFIX_LEN,
        NACK, SPAWNER_ENUM_SIZE, SPAWNER_LAUNCH_SERVICE,
    },
    AnyResult, ProtocolError,
};
use tracing::{info, warn};

use crate::builder::ServiceLauncher;

const STEP_PATH_LEN: u16 = STEP_CUSTOM;
const STEP_PATH: u16 = STEP_CUSTOM + 1;

pub struct Spawner {
    launcher: ServiceLauncher,
    requests: RequestReader<Spawner>,
    names: Mutex<HashMap<SessionId, String>>,
}

impl Spawner {
    pub fn new(launcher: ServiceLauncher) -> AnyResult<Self> {
        let table = ProtocolTable::new(SPAWNER_ENUM_SIZE).register(
            SPAWNER_LAUNCH_SERVICE,
            PayloadLen::Param,
            Spawner::on_service_name,
        )?;
        Ok(Self {
            launcher,
            requests: RequestReader::new(table),
            names: Mutex::new(HashMap::new()),
        })
    }

    fn names(&self) -> MutexGuard<'_, HashMap<SessionId, String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_service_name(
        &self,
        session: SessionId,
        req: Request,
    ) -> Result<Transition, ProtocolError> {
        let name = std::str::from_utf8(&req.payload)
            .map_err(|_| ProtocolError::InvalidUtf8("service name"))?;
        self.names().insert(session, name.to_string());
        Ok(Transition::next(Stage::new(LENGTH_PREFIX_LEN, STEP_PATH_LEN)))
    }

    fn launch(
        &self,
        session: SessionId,
        config: Option<&Path>,
    ) -> Result<Transition, ProtocolError> {
        let name = self
            .names()
            .remove(&session)
            .ok_or(ProtocolError::UnexpectedStep(STEP_PATH))?;
        let status = match self.launcher.launch(&name, config) {
            Ok(handle) => {
                info!("session {session} launched {name} as {handle}");
                ACK
            }
            Err(e) => {
                warn!("session {session} could not launch {name}: {e:?}");
                NACK
            }
        };
        Ok(Transition::reply_and_close(encode_status(status)))
    }

}

impl SubServer for Spawner {
    fn name(&self) -> &'static str {
        "spawner"
    }

    fn serv_init(&self, _node_id: NodeId, _session: SessionId) -> Stage {
        REQUEST_STAGE
    }

    fn on_frame(
        &self,
        session: SessionId,
        stage: Stage,
        frame: &[u8],
    ) -> Result<Transition, ProtocolError> {
        match stage.step {
            STEP_REQUEST | STEP_PAYLOAD => self.requests.on_frame(self, session, stage, frame),
            STEP_PATH_LEN => match checked_frame_len(decode_u32(frame)?)? {
                0 => self.launch(session, None),
                len => Ok(Transition::next(Stage::new(len, STEP_PATH))),
            },
            STEP_PATH => {
                let path = std::str::from_utf8(frame)
                    .map_err(|_| ProtocolError::InvalidUtf8("config path"))?;
                self.launch(session, Some(Path::new(path)))
            }
            step => Err(ProtocolError::UnexpectedStep(step)),
        }
    }

    fn serv_close(&self, session: SessionId) {
        self.requests.forget(session);
        self.names().remove(&session);
    }
}
