//! Session registry and supervisor: routes client requests to sessions,
//! owns session lifetime, spawns the PPP engine process, hosts in-process
//! L2TP control tunnels and re-dispatches engine-originated messages into
//! the client fan-out.

use crate::buffer::Buffer;
use crate::client::{Client, ClientId, NOTIFY_EVENTS, NOTIFY_STATUS};
use crate::msg::{self, MsgHeader};
use crate::options::{self, entities, props, OptionSet, OptionView};
use crate::session::{self, Phase, Session, SubType};
use byteorder::{BigEndian, ByteOrder};
use hashbrown::HashMap;
use l2tp::tunnel::{FLAG_ADAPT_TIMER, FLAG_CONTROL};
use l2tp::{Command as TunnelCommand, Engine, Event, HostId, TunnelHost, Verdict};
use serde_derive::Deserialize;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::{Child, Command, Stdio};
use strand::logging;

// Event kinds surfaced to subscribed clients.
pub const EVT_STARTED: u32 = 1;
pub const EVT_CONNECTED: u32 = 2;
pub const EVT_DISCONNECTED: u32 = 3;

const LINK_BUF_SIZE: usize = 64 * 1024;
const LINK_FRAME_PREFIX: usize = 2;

/// Daemon configuration, loaded from a JSON file at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_engine_path")]
    pub engine_path: String,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub serviceid: String,
    pub subtype: String,
    #[serde(default)]
    pub serverid: Option<String>,
    #[serde(default)]
    pub setup: OptionSet,
}

fn default_socket_path() -> String {
    "/var/run/linkd.sock".to_string()
}

fn default_engine_path() -> String {
    "/usr/sbin/pppengine".to_string()
}

/// A notification waiting to be fanned out to subscribed clients.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: u32,
    pub serviceid: String,
    pub link: u32,
    pub event: u32,
    pub error: u32,
}

/// The pipe pair to a spawned PPP engine process. Control frames cross it
/// with a two-byte length prefix in network order.
pub struct EngineLink {
    child: Child,
    to_engine: Buffer,
    from_engine: Buffer,
}

impl EngineLink {
    fn new(child: Child) -> io::Result<EngineLink> {
        set_nonblocking(child.stdin.as_ref().expect("Engine stdin piped").as_raw_fd())?;
        set_nonblocking(child.stdout.as_ref().expect("Engine stdout piped").as_raw_fd())?;

        Ok(EngineLink {
            child,
            to_engine: Buffer::new(LINK_BUF_SIZE),
            from_engine: Buffer::new(LINK_BUF_SIZE),
        })
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    #[inline]
    pub fn stdin_fd(&self) -> RawFd {
        self.child.stdin.as_ref().expect("Engine stdin piped").as_raw_fd()
    }

    #[inline]
    pub fn stdout_fd(&self) -> RawFd {
        self.child.stdout.as_ref().expect("Engine stdout piped").as_raw_fd()
    }

    /// Queues one length-prefixed frame for the engine and flushes
    /// opportunistically.
    pub fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > u16::max_value() as usize
            || LINK_FRAME_PREFIX + frame.len() > self.to_engine.free_capacity()
        {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "Link backlogged"));
        }

        let mut prefix = [0u8; LINK_FRAME_PREFIX];
        BigEndian::write_u16(&mut prefix, frame.len() as u16);
        self.to_engine.append(&prefix);
        self.to_engine.append(frame);

        self.flush()?;
        Ok(())
    }

    /// Flushes buffered frames into the engine's stdin.
    pub fn flush(&mut self) -> io::Result<usize> {
        let stdin = self.child.stdin.as_mut().expect("Engine stdin piped");
        self.to_engine.egress(stdin)
    }

    /// Reads whatever the engine wrote and peels off complete frames.
    pub fn read_frames(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let stdout = self.child.stdout.as_mut().expect("Engine stdout piped");
        self.from_engine.ingress(stdout)?;

        let mut frames = Vec::new();
        loop {
            let buffered = self.from_engine.read_slice();
            if buffered.len() < LINK_FRAME_PREFIX {
                break;
            }

            let frame_len = BigEndian::read_u16(buffered) as usize;
            if buffered.len() < LINK_FRAME_PREFIX + frame_len {
                break;
            }

            frames.push(buffered[LINK_FRAME_PREFIX..LINK_FRAME_PREFIX + frame_len].to_vec());
            self.from_engine.consume(LINK_FRAME_PREFIX + frame_len);
        }

        Ok(frames)
    }

    pub fn signal(&self, signal: libc::c_int) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, signal);
        }
    }

    /// Exit code if the engine has terminated. Signal deaths report as
    /// HANGUP.
    pub fn try_reap(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().map_or(session::EXIT_HANGUP, |code| code as u32)),
            Ok(None) => None,
            Err(_) => Some(session::EXIT_HANGUP),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

pub struct Manager {
    sessions: Vec<Session>,
    links: HashMap<u16, EngineLink>,
    engine_path: String,
    notifications: Vec<Notification>,
    log: logging::Logger,
}

impl Manager {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(config: &Config, log: L) -> Manager {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let mut sessions = Vec::new();
        for service in &config.services {
            let subtype = match SubType::from_name(&service.subtype) {
                Some(subtype) => subtype,
                None => {
                    logging::warn!(log, "skipping service with unknown subtype";
                                   "serviceid" => &service.serviceid,
                                   "subtype" => &service.subtype);
                    continue;
                }
            };

            let unit = sessions.len() as u16;
            sessions.push(Session::new(
                service.serviceid.clone(),
                service.serverid.clone(),
                unit,
                subtype,
                service.setup.clone(),
                &log,
            ));
        }

        logging::info!(log, "session registry built"; "sessions" => sessions.len());

        Manager {
            sessions,
            links: HashMap::new(),
            engine_path: config.engine_path.clone(),
            notifications: Vec::new(),
            log,
        }
    }

    #[inline]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Notifications raised since the last drain, in the order they were
    /// posted.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::replace(&mut self.notifications, Vec::new())
    }

    /// Units with a live engine link, plus the pipe fds the reactor polls.
    pub fn link_fds(&self) -> Vec<(u16, RawFd, RawFd)> {
        self.links
            .iter()
            .map(|(&unit, link)| (unit, link.stdin_fd(), link.stdout_fd()))
            .collect()
    }

    fn find_session(&self, hdr: &MsgHeader, serviceid: Option<&str>) -> Option<usize> {
        if hdr.flags & msg::USE_SERVICEID != 0 {
            let wanted = serviceid?;
            self.sessions
                .iter()
                .position(|session| session.serviceid == wanted)
        } else {
            self.sessions
                .iter()
                .position(|session| session.makeref() == hdr.link)
        }
    }

    /// Routes one complete client request, queueing the reply on the
    /// client. `engine` is consulted for L2TP-subtype session control.
    pub fn process_request(
        &mut self,
        clients: &mut [Client],
        client_id: ClientId,
        message: crate::client::Message,
        engine: &mut Engine,
    ) {
        let mut hdr = message.hdr;
        let mut body: Vec<u8> = Vec::new();
        let swap = clients[client_id].swaps();

        logging::trace!(self.log, "request";
                        "client_id" => client_id,
                        "type" => hdr.mtype,
                        "link" => hdr.link,
                        "len" => hdr.len);

        if hdr.mtype <= msg::LAST_REQUEST {
            match hdr.mtype {
                msg::VERSION => {
                    hdr.result = 0;
                    body = msg::write_u32_body(msg::CURRENT_VERSION, swap).to_vec();
                }
                msg::STATUS => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        hdr.result = 0;
                        body = self.serialize_status(idx, swap);
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::EXTENDED_STATUS => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        hdr.result = 0;
                        body = self.serialize_extended_status(idx);
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::CONNECT => {
                    hdr.result = self.handle_connect(clients, client_id, &hdr, &message, engine);
                }
                msg::DISCONNECT => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        let requester = if hdr.flags & msg::DISCONNECT_ARBITRATED != 0 {
                            Some(client_id)
                        } else {
                            None
                        };
                        self.disconnect(idx, requester, engine);
                        hdr.result = 0;
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::SUSPEND => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        self.signal_session(idx, libc::SIGTSTP);
                        hdr.result = 0;
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::RESUME => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        self.signal_session(idx, libc::SIGCONT);
                        hdr.result = 0;
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::GET_CONNECT_DATA => match self.find_session(&hdr, message.serviceid.as_deref()) {
                    Some(idx) => {
                        hdr.result = 0;
                        body = self.sessions[idx]
                            .connect_opts
                            .as_ref()
                            .map_or_else(|| b"{}".to_vec(), |opts| opts.to_json());
                    }
                    None => hdr.result = msg::ENODEV,
                },
                msg::ENABLE_EVENT => {
                    hdr.result = Self::enable_event(&mut clients[client_id], &hdr, &message, swap);
                }
                msg::DISABLE_EVENT => {
                    hdr.result = Self::disable_event(&mut clients[client_id], &hdr, &message, swap);
                }
                msg::GET_NB_LINKS => {
                    let selector = (hdr.link >> 16) as u16;
                    let count = self
                        .sessions
                        .iter()
                        .filter(|session| session.matches_subtype(selector))
                        .count() as u32;
                    hdr.result = 0;
                    body = msg::write_u32_body(count, swap).to_vec();
                }
                msg::GET_LINK_BY_INDEX => {
                    let selector = (hdr.link >> 16) as u16;
                    if message.body.len() < 4 {
                        hdr.result = msg::EINVAL;
                    } else {
                        let index = msg::read_u32_body(&message.body, swap);
                        match self
                            .sessions
                            .iter()
                            .filter(|session| session.matches_subtype(selector))
                            .nth(index as usize)
                        {
                            Some(session) => {
                                hdr.result = 0;
                                body = msg::write_u32_body(session.makeref(), swap).to_vec();
                            }
                            None => hdr.result = msg::ENODEV,
                        }
                    }
                }
                msg::GET_LINK_BY_SERVICEID => {
                    let wanted = String::from_utf8_lossy(&message.body);
                    let wanted = wanted.trim_end_matches('\0');
                    match self
                        .sessions
                        .iter()
                        .find(|session| session.serviceid == wanted)
                    {
                        Some(session) => {
                            hdr.result = 0;
                            body = msg::write_u32_body(session.makeref(), swap).to_vec();
                        }
                        None => hdr.result = msg::ENODEV,
                    }
                }
                msg::GET_LINK_BY_IFNAME => {
                    let wanted = String::from_utf8_lossy(&message.body);
                    let wanted = wanted.trim_end_matches('\0');
                    match self.sessions.iter().find(|session| session.ifname == wanted) {
                        Some(session) => {
                            hdr.result = 0;
                            if hdr.flags & msg::USE_SERVICEID != 0 {
                                body = session.serviceid.clone().into_bytes();
                            } else {
                                body = msg::write_u32_body(session.makeref(), swap).to_vec();
                            }
                        }
                        None => hdr.result = msg::ENODEV,
                    }
                }
                msg::SET_OPTION => {
                    hdr.result = self.handle_set_option(clients, client_id, &hdr, &message, swap);
                }
                msg::GET_OPTION => {
                    match self.handle_get_option(clients, client_id, &hdr, &message, swap) {
                        Ok(reply) => {
                            hdr.result = 0;
                            body = reply;
                        }
                        Err(errno) => hdr.result = errno,
                    }
                }
                _ => hdr.result = msg::EINVAL,
            }
        } else if clients[client_id].is_privileged() {
            // Fire-and-forget side-channel from the PPP engine
            hdr.len = msg::NO_REPLY;
            match hdr.mtype {
                msg::PPPD_EVENT => self.pppd_event(&hdr, &message),
                msg::PPPD_STATUS => self.pppd_status(&hdr, &message),
                msg::PPPD_PHASE => self.pppd_phase(&hdr, &message, engine),
                _ => {}
            }
        } else {
            hdr.result = msg::EINVAL;
        }

        if hdr.len != msg::NO_REPLY {
            hdr.len = body.len() as u32;
        }

        let echo = if hdr.flags & msg::USE_SERVICEID != 0 {
            message.serviceid.as_deref()
        } else {
            None
        };
        clients[client_id].send_reply(&hdr, echo, &body);
    }

    fn serialize_status(&self, idx: usize, swap: bool) -> Vec<u8> {
        let session = &self.sessions[idx];
        let mut body = Vec::with_capacity(36);
        let mut push = |body: &mut Vec<u8>, value: u32| {
            body.extend_from_slice(&msg::write_u32_body(value, swap));
        };

        push(&mut body, session.status);
        if session.phase == Phase::Running {
            push(&mut body, session.time_elapsed());
            push(&mut body, 0); // time remaining: no session timer cutoff
            push(&mut body, session.stats.in_bytes);
            push(&mut body, session.stats.in_packets);
            push(&mut body, session.stats.in_errors);
            push(&mut body, session.stats.out_bytes);
            push(&mut body, session.stats.out_packets);
            push(&mut body, session.stats.out_errors);
        } else {
            push(&mut body, session.last_disc_cause);
            for _ in 0..7 {
                push(&mut body, 0);
            }
        }

        body
    }

    fn serialize_extended_status(&self, idx: usize) -> Vec<u8> {
        let session = &self.sessions[idx];
        let value = serde_json::json!({
            "ServiceID": session.serviceid,
            "IfName": session.ifname,
            "SubType": session.subtype.code(),
            "Phase": session.phase.code(),
            "Status": session.status,
            "DevStatus": session.devstatus,
            "LastCause": session.last_disc_cause,
            "TimeElapsed": session.time_elapsed(),
        });

        serde_json::to_vec(&value).expect("Status always serializes")
    }

    fn handle_connect(
        &mut self,
        clients: &mut [Client],
        client_id: ClientId,
        hdr: &MsgHeader,
        message: &crate::client::Message,
        engine: &mut Engine,
    ) -> u32 {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return msg::ENODEV,
        };

        let opts = if message.body.is_empty() {
            clients[client_id]
                .opts
                .get(&self.sessions[idx].serviceid)
                .cloned()
        } else {
            match OptionSet::from_json(&message.body) {
                Ok(opts) => Some(opts),
                Err(_) => return msg::ENOMEM,
            }
        };

        let owner = if hdr.flags & msg::CONNECT_ARBITRATED != 0 {
            Some(client_id)
        } else {
            None
        };
        let autoclose = hdr.flags & msg::CONNECT_AUTOCLOSE != 0;

        self.connect(idx, opts, owner, autoclose, engine)
    }

    /// Brings a session up: freezes the option set, prepares the L2TP
    /// control tunnel when applicable and spawns the PPP engine.
    pub fn connect(
        &mut self,
        idx: usize,
        opts: Option<OptionSet>,
        owner: Option<ClientId>,
        autoclose: bool,
        engine: &mut Engine,
    ) -> u32 {
        {
            let session = &self.sessions[idx];
            if session.phase != Phase::Idle {
                if session.owner.is_some() && session.owner != owner {
                    return msg::EBUSY;
                }
                return 0;
            }
        }

        {
            let session = &mut self.sessions[idx];
            session.connect_opts = Some(opts.unwrap_or_default());
            session.owner = owner;
            session.autoclose = autoclose;
        }

        if self.sessions[idx].subtype == SubType::L2TP {
            match self.setup_tunnel(idx, engine) {
                Ok(handle) => self.sessions[idx].tunnel = Some(handle),
                Err(errno) => {
                    self.release_session(idx, engine);
                    return errno;
                }
            }
        }

        match self.spawn_engine(idx) {
            Ok(link) => {
                let unit = self.sessions[idx].unit;
                logging::info!(self.sessions[idx].log, "engine spawned";
                               "pid" => link.pid(),
                               "subtype" => ?self.sessions[idx].subtype);
                self.links.insert(unit, link);

                let session = &mut self.sessions[idx];
                session.update_phase(Phase::Initialize);
                session.status = Phase::Initialize.code();

                self.notify(idx, NOTIFY_EVENTS, EVT_STARTED, 0);
                0
            }
            Err(err) => {
                logging::warn!(self.sessions[idx].log, "engine spawn failed"; "error" => %err);
                self.release_session(idx, engine);
                msg::EINVAL
            }
        }
    }

    /// Creates and configures the in-process control tunnel for an L2TP
    /// session from its effective options.
    fn setup_tunnel(&mut self, idx: usize, engine: &mut Engine) -> Result<l2tp::Handle, u32> {
        let (unit, peer, local, window, timeout, timeout_cap, retries) = {
            let session = &self.sessions[idx];
            let view = OptionView {
                state: None,
                client: session.connect_opts.as_ref(),
                setup: Some(&session.setup),
            };

            let (remote, _) = view.get_str(entities::PPP, props::REMOTE_ADDRESS, "");
            if remote.is_empty() {
                return Err(msg::EINVAL);
            }

            let peer = resolve_peer(&remote).ok_or(msg::EINVAL)?;
            let (local_host, _) = view.get_str(entities::L2TP, props::LOCAL_ADDRESS, "0.0.0.0");
            let local: SocketAddr = format!("{}:0", local_host).parse().map_err(|_| msg::EINVAL)?;

            (
                session.unit,
                peer,
                local,
                view.get_int(entities::L2TP, props::TRANSPORT_WINDOW, 4).0 as u16,
                view.get_int(entities::L2TP, props::TRANSPORT_TIMEOUT, 1).0 as u16,
                view.get_int(entities::L2TP, props::TRANSPORT_TIMEOUT_CAP, 8).0 as u16,
                view.get_int(entities::L2TP, props::TRANSPORT_RETRIES, 5).0 as u16,
            )
        };

        let handle = engine.new_client(HostId::from(unit));
        let result: Result<(), l2tp::support::Error> = (|| {
            engine.command(handle, TunnelCommand::SetFlags(FLAG_CONTROL | FLAG_ADAPT_TIMER), self)?;
            engine.command(handle, TunnelCommand::SetWindow(window), self)?;
            engine.command(handle, TunnelCommand::SetTimeout(timeout), self)?;
            engine.command(handle, TunnelCommand::SetTimeoutCap(timeout_cap), self)?;
            engine.command(handle, TunnelCommand::SetMaxRetries(retries), self)?;
            engine.command(handle, TunnelCommand::SetOurAddr(Some(local)), self)?;
            engine.command(handle, TunnelCommand::SetPeerAddr(Some(peer)), self)?;
            engine.command(handle, TunnelCommand::GetNewTunnelId, self)?;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(handle),
            Err(err) => {
                engine.free_client(handle);
                Err(err.errno())
            }
        }
    }

    fn spawn_engine(&self, idx: usize) -> io::Result<EngineLink> {
        let session = &self.sessions[idx];
        let view = OptionView {
            state: None,
            client: session.connect_opts.as_ref(),
            setup: Some(&session.setup),
        };

        let mut command = Command::new(&self.engine_path);
        command.arg("serviceid").arg(&session.serviceid);
        if let Some(serverid) = &session.serverid {
            command.arg("serverid").arg(serverid);
        }
        if view.get_int(entities::INTERFACE, props::NO_KERNEL_LOAD, 0).0 != 0 {
            command.arg("nopppload");
        }
        let looplocal = view.get_int(entities::IPV4, props::LOOP_LOCAL, 0).0 != 0;
        command.arg(if looplocal { "looplocal" } else { "nolooplocal" });
        let addifroute = view.get_int(entities::IPV4, props::ADD_IF_ROUTE, 0).0 != 0;
        command.arg(if addifroute { "addifroute" } else { "noifroute" });

        let opts_json = session
            .connect_opts
            .as_ref()
            .map_or_else(|| b"{}".to_vec(), |opts| opts.to_json());
        command.env(
            "LINKD_OPTIONS",
            String::from_utf8_lossy(&opts_json).to_string(),
        );

        let child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        EngineLink::new(child)
    }

    /// Tears a session down: signals the engine and releases the L2TP
    /// tunnel. The record itself survives for the next connect.
    pub fn disconnect(&mut self, idx: usize, requester: Option<ClientId>, engine: &mut Engine) {
        {
            let session = &self.sessions[idx];

            // Arbitrated connections are only torn down by their owner
            if let (Some(owner), Some(requester)) = (session.owner, requester) {
                if owner != requester {
                    return;
                }
            }

            if session.phase == Phase::Idle {
                return;
            }
        }

        self.signal_session(idx, libc::SIGHUP);
        self.sessions[idx].update_phase(Phase::Disconnect);

        if let Some(handle) = self.sessions[idx].tunnel.take() {
            engine.free_client(handle);
        }
    }

    fn signal_session(&self, idx: usize, signal: libc::c_int) {
        if let Some(link) = self.links.get(&self.sessions[idx].unit) {
            link.signal(signal);
        }
    }

    fn release_session(&mut self, idx: usize, engine: &mut Engine) {
        let session = &mut self.sessions[idx];
        session.connect_opts = None;
        session.owner = None;
        session.autoclose = false;
        session.update_phase(Phase::Idle);
        session.status = Phase::Idle.code();

        if let Some(handle) = session.tunnel.take() {
            engine.free_client(handle);
        }
    }

    fn enable_event(
        client: &mut Client,
        hdr: &MsgHeader,
        message: &crate::client::Message,
        swap: bool,
    ) -> u32 {
        let mut notification = NOTIFY_EVENTS;
        if message.body.len() == 4 {
            notification = msg::read_u32_body(&message.body, swap);
            if notification < 1 || notification > 3 {
                return msg::EINVAL;
            }
        }

        client.notify_flags = notification & (NOTIFY_EVENTS | NOTIFY_STATUS);
        client.notify_link = 0;
        client.notify_serviceid = None;

        if hdr.flags & msg::USE_SERVICEID != 0 {
            client.notify_serviceid = message.serviceid.clone();
        } else {
            client.notify_link = hdr.link;
        }

        0
    }

    fn disable_event(
        client: &mut Client,
        _hdr: &MsgHeader,
        message: &crate::client::Message,
        swap: bool,
    ) -> u32 {
        let mut notification = NOTIFY_EVENTS;
        if message.body.len() == 4 {
            notification = msg::read_u32_body(&message.body, swap);
            if notification < 1 || notification > 3 {
                return msg::EINVAL;
            }
        }

        client.notify_flags &= !notification;
        if client.notify_flags == 0 {
            client.notify_link = 0;
            client.notify_serviceid = None;
        }

        0
    }

    fn handle_set_option(
        &mut self,
        clients: &mut [Client],
        client_id: ClientId,
        hdr: &MsgHeader,
        message: &crate::client::Message,
        swap: bool,
    ) -> u32 {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return msg::ENODEV,
        };

        if message.body.len() < 4 {
            return msg::EINVAL;
        }

        let otype = msg::read_u32_body(&message.body, swap);
        let serviceid = self.sessions[idx].serviceid.clone();

        let opts = clients[client_id]
            .opts
            .entry(serviceid)
            .or_insert_with(OptionSet::new);

        match options::set_option(opts, otype, &message.body[4..], swap) {
            Ok(()) => 0,
            Err(errno) => errno,
        }
    }

    fn handle_get_option(
        &mut self,
        clients: &mut [Client],
        client_id: ClientId,
        hdr: &MsgHeader,
        message: &crate::client::Message,
        swap: bool,
    ) -> Result<Vec<u8>, u32> {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return Err(msg::ENODEV),
        };

        if message.body.len() < 4 {
            return Err(msg::EINVAL);
        }

        let otype = msg::read_u32_body(&message.body, swap);
        let session = &self.sessions[idx];

        let client_opts = clients[client_id].opts.get(&session.serviceid);
        let view = OptionView {
            // A running engine's frozen options are the authoritative state
            state: if session.phase != Phase::Idle {
                session.connect_opts.as_ref()
            } else {
                None
            },
            client: client_opts,
            setup: Some(&session.setup),
        };

        let payload = options::get_option(&view, otype, swap).ok_or(msg::EOPNOTSUPP)?;

        let mut reply = msg::write_u32_body(otype, swap).to_vec();
        reply.extend_from_slice(&payload);
        Ok(reply)
    }

    fn pppd_event(&mut self, hdr: &MsgHeader, message: &crate::client::Message) {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return,
        };

        if message.body.len() < 8 {
            return;
        }

        let event = msg::read_u32_body(&message.body, false);
        let raw_error = msg::read_u32_body(&message.body[4..], false);

        let error = if event == EVT_DISCONNECTED {
            let translated = session::translate_error(self.sessions[idx].subtype, raw_error);
            self.sessions[idx].last_disc_cause = translated;
            translated
        } else {
            0
        };

        self.notify(idx, NOTIFY_EVENTS, event, error);
    }

    fn pppd_status(&mut self, hdr: &MsgHeader, message: &crate::client::Message) {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return,
        };

        if message.body.len() < 8 {
            return;
        }

        let status = msg::read_u32_body(&message.body, false);
        let devstatus = msg::read_u32_body(&message.body[4..], false);

        self.sessions[idx].update_status(status, devstatus);
        self.notify(idx, NOTIFY_STATUS, status, devstatus);
    }

    fn pppd_phase(&mut self, hdr: &MsgHeader, message: &crate::client::Message, engine: &mut Engine) {
        let idx = match self.find_session(hdr, message.serviceid.as_deref()) {
            Some(idx) => idx,
            None => return,
        };

        if message.body.len() < 4 {
            return;
        }

        let phase = match Phase::from_code(msg::read_u32_body(&message.body, false)) {
            Some(phase) => phase,
            None => return,
        };

        self.sessions[idx].update_phase(phase);
        self.sessions[idx].status = phase.code();

        match phase {
            Phase::Running => self.notify(idx, NOTIFY_EVENTS, EVT_CONNECTED, 0),
            Phase::Dead | Phase::Idle => self.release_session(idx, engine),
            _ => {}
        }
    }

    fn notify(&mut self, idx: usize, kind: u32, event: u32, error: u32) {
        let session = &self.sessions[idx];

        self.notifications.push(Notification {
            kind,
            serviceid: session.serviceid.clone(),
            link: session.makeref(),
            event,
            error,
        });
    }

    /// Frames written by the engine process: feed them into the L2TP
    /// control tunnel for transmission.
    pub fn link_output(&mut self, unit: u16, engine: &mut Engine) {
        let frames = {
            let link = match self.links.get_mut(&unit) {
                Some(link) => link,
                None => return,
            };

            match link.read_frames() {
                Ok(frames) => frames,
                // EOF or a torn pipe: the reaper picks the child up
                Err(_) => return,
            }
        };

        let handle = match self
            .sessions
            .iter()
            .find(|session| session.unit == unit)
            .and_then(|session| session.tunnel)
        {
            Some(handle) => handle,
            None => return,
        };

        for frame in frames {
            if let Err(err) = engine.output(handle, frame, None) {
                logging::debug!(self.log, "tunnel output failed";
                                "unit" => unit,
                                "error" => ?err);
            }
        }
    }

    /// Flushes any backlog toward the engine processes.
    pub fn flush_links(&mut self) {
        for link in self.links.values_mut() {
            let _ = link.flush();
        }
    }

    /// A client went away: tear down the sessions it arbitrated with
    /// auto-close, and release its ownership everywhere else.
    pub fn client_closed(&mut self, client_id: ClientId, engine: &mut Engine) {
        let owned: Vec<usize> = self
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, session)| session.owner == Some(client_id))
            .map(|(idx, _)| idx)
            .collect();

        for idx in owned {
            if self.sessions[idx].autoclose {
                self.disconnect(idx, Some(client_id), engine);
            }
            self.sessions[idx].owner = None;
        }
    }

    /// Slow housekeeping: reap exited engine processes and settle their
    /// sessions.
    pub fn slow_tick(&mut self, engine: &mut Engine) {
        let mut exited = Vec::new();

        for (&unit, link) in self.links.iter_mut() {
            if let Some(code) = link.try_reap() {
                exited.push((unit, code));
            }
        }

        for (unit, code) in exited {
            self.links.remove(&unit);

            let idx = match self.sessions.iter().position(|session| session.unit == unit) {
                Some(idx) => idx,
                None => continue,
            };

            let was_active = self.sessions[idx].phase != Phase::Idle;
            let translated = session::translate_error(self.sessions[idx].subtype, code);

            logging::info!(self.sessions[idx].log, "engine exited";
                           "exit_code" => code,
                           "translated" => translated);

            if was_active {
                self.sessions[idx].last_disc_cause = translated;
                self.release_session(idx, engine);
                self.notify(idx, NOTIFY_EVENTS, EVT_DISCONNECTED, translated);
            }
        }
    }
}

/// Resolves a peer endpoint; a bare host gets the well-known L2TP port.
fn resolve_peer(remote: &str) -> Option<SocketAddr> {
    if let Ok(addr) = remote.parse::<SocketAddr>() {
        return Some(addr);
    }

    let with_port = format!("{}:{}", remote, l2tp::wire::UDP_PORT);
    with_port.to_socket_addrs().ok()?.next()
}

impl TunnelHost for Manager {
    /// Control frames delivered by the reliability engine are relayed to
    /// the PPP engine process over the session's pipe link.
    fn on_input(
        &mut self,
        host: HostId,
        payload: &[u8],
        _from: Option<SocketAddr>,
        is_control: bool,
    ) -> Verdict {
        let unit = host as u16;

        if !is_control {
            // Data frames bypass the control plane entirely
            return Verdict::Accepted;
        }

        match self.links.get_mut(&unit) {
            Some(link) => match link.write_frame(payload) {
                Ok(()) => Verdict::Accepted,
                Err(_) => Verdict::Refused,
            },
            None => Verdict::Refused,
        }
    }

    fn on_event(&mut self, host: HostId, event: Event, _aux: u32) {
        let unit = host as u16;
        let idx = match self.sessions.iter().position(|session| session.unit == unit) {
            Some(idx) => idx,
            None => return,
        };

        match event {
            Event::ReliableFailed => {
                let translated =
                    session::translate_error(self.sessions[idx].subtype, session::EXIT_HANGUP);

                logging::info!(self.sessions[idx].log, "control channel failed";
                               "cause" => translated);

                self.sessions[idx].last_disc_cause = translated;
                self.sessions[idx].update_phase(Phase::Disconnect);
                self.signal_session(idx, libc::SIGHUP);
                self.notify(idx, NOTIFY_EVENTS, EVT_DISCONNECTED, translated);
            }
            Event::InputError => {
                logging::warn!(self.sessions[idx].log, "data sequence violation");
            }
            Event::XmitFull | Event::XmitOk => {
                logging::trace!(self.sessions[idx].log, "transmit flow hint"; "event" => ?event);
            }
        }
    }
}
