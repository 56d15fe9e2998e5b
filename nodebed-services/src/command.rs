//! Line-oriented command listener kept for older launch scripts.
//!
//! Each line is `\n`-terminated ASCII with space-separated fields:
//! `S <service> [<config_path>]` launches a service, `E` ends the session.
//! Every command is answered with `OK` or `ERR`.
use std::{
    io::{self, BufRead, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use nodebed_core::{
    orchestrator::{Interrupt, Runnable},
    server::bind_listener,
    AnyResult,
};
use tracing::{debug, info, warn};

use crate::builder::ServiceLauncher;

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const DELIMITER: char = ' ';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Spawn {
        service: String,
        config: Option<PathBuf>,
    },
    End,
}

pub fn parse_command(line: &str) -> Option<Command> {
    let mut fields = line
        .trim_end_matches(['\r', '\n'])
        .split(DELIMITER)
        .filter(|f| !f.is_empty());
    let command = match fields.next()? {
        "S" => Command::Spawn {
            service: fields.next()?.to_string(),
            config: fields.next().map(PathBuf::from),
        },
        "E" => Command::End,
        _ => return None,
    };
    match fields.next() {
        Some(_) => None,
        None => Some(command),
    }
}

/// Encode a command line; `None` if a field would not survive the framing.
pub fn encode_command(command: &Command) -> Option<String> {
    let clean = |s: &str| !s.is_empty() && !s.contains([DELIMITER, '\n', '\r']);
    match command {
        Command::End => Some("E\n".to_string()),
        Command::Spawn { service, config } => {
            if !clean(service) {
                return None;
            }
            match config {
                Some(path) => {
                    let path = path.to_str().filter(|p| clean(p))?;
                    Some(format!("S{DELIMITER}{service}{DELIMITER}{path}\n"))
                }
                None => Some(format!("S{DELIMITER}{service}\n")),
            }
        }
    }
}

/// Accepts command connections and hands each one to the dispatcher.
pub struct CommandListener {
    listener: TcpListener,
    launcher: ServiceLauncher,
    wakeup: Interrupt,
}

impl CommandListener {
    pub fn bind(addr: SocketAddr, launcher: ServiceLauncher) -> nodebed_core::Result<Self> {
        let listener = bind_listener(addr)?;
        listener.set_nonblocking(true)?;
        info!("command listener bound to {}", listener.local_addr()?);
        Ok(Self {
            listener,
            launcher,
            wakeup: Interrupt::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> AnyResult<()> {
        stream.set_nonblocking(false)?;
        let session = CommandSession::new(stream, peer, self.launcher.clone());
        self.launcher.dispatcher().dispatch(session, true)?;
        Ok(())
    }
}

impl Runnable for CommandListener {
    fn name(&self) -> &str {
        "CommandListener"
    }

    fn start(&self) -> AnyResult<()> {
        while !self.wakeup.is_interrupted() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("command connection from {peer}");
                    if let Err(e) = self.accept(stream, peer) {
                        warn!("command connection from {peer} dropped: {e:?}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wakeup.wait_timeout(ACCEPT_POLL);
                }
                Err(e) => {
                    warn!("command accept failed: {e}");
                    self.wakeup.wait_timeout(ACCEPT_POLL);
                }
            }
        }
        info!("command listener stopped");
        Ok(())
    }

    fn stop(&self) {
        self.wakeup.interrupt();
    }
}

/// One command connection, served on its own thread.
pub struct CommandSession {
    stream: TcpStream,
    peer: SocketAddr,
    launcher: ServiceLauncher,
    closed: AtomicBool,
}

impl CommandSession {
    pub fn new(stream: TcpStream, peer: SocketAddr, launcher: ServiceLauncher) -> Self {
        Self {
            stream,
            peer,
            launcher,
            closed: AtomicBool::new(false),
        }
    }

    fn spawn(&self, service: &str, config: Option<PathBuf>) -> AnyResult<()> {
        let handle = self.launcher.launch(service, config.as_deref())?;
        info!("{} launched {service} as {handle}", self.peer);
        Ok(())
    }
}

impl Runnable for CommandSession {
    fn name(&self) -> &str {
        "CommandSession"
    }

    fn start(&self) -> AnyResult<()> {
        let reader = BufReader::new(&self.stream);
        let mut writer = &self.stream;
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) if self.closed.load(Ordering::Acquire) => break,
                Err(e) => return Err(e.into()),
            };
            let ok = match parse_command(&line) {
                Some(Command::End) => {
                    writer.write_all(b"OK\n")?;
                    break;
                }
                Some(Command::Spawn { service, config }) => match self.spawn(&service, config) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("{} could not launch {service}: {e:?}", self.peer);
                        false
                    }
                },
                None => {
                    warn!("{} sent a malformed command {line:?}", self.peer);
                    false
                }
            };
            let reply: &[u8] = if ok { b"OK\n" } else { b"ERR\n" };
            writer.write_all(reply)?;
        }
        debug!("command session with {} ended", self.peer);
        self.stop();
        Ok(())
    }

    fn stop(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
