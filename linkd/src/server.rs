//! The reactor: one poll loop over the control-socket listener, client
//! streams, the engine's UDP endpoints and the PPP engine pipe links, with
//! the two protocol ticks derived from a monotonic clock. Every state
//! mutation in the daemon happens on this thread.

use crate::client::{Client, ClientId};
use crate::manager::{Config, Manager};
use hashbrown::HashMap;
use indexmap::IndexSet;
use l2tp::transport::EndpointId;
use l2tp::Engine;
use mio::net::UnixListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::{Duration, Instant};
use strand::logging;
use strand::time::Ticker;

const TOKEN_LISTENER: Token = Token(0);
const CLIENT_BASE: usize = 1;
const UDP_BASE: usize = 1_000_000;
const LINK_BASE: usize = 2_000_000;

const FAST_TICK: Duration = Duration::from_millis(200);
const SLOW_TICK: Duration = Duration::from_millis(500);

pub struct Server {
    poll: Poll,
    events: Events,
    listener: UnixListener,

    clients: Vec<Client>,
    free: Vec<ClientId>,

    manager: Manager,
    engine: Engine,

    registered_endpoints: IndexSet<EndpointId>,
    registered_links: HashMap<u16, RawFd>,

    fast: Ticker,
    slow: Ticker,

    log: logging::Logger,
}

impl Server {
    /// Binds the well-known control socket (mode 0666) and assembles the
    /// reactor around it.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        config: &Config,
        log: L,
    ) -> io::Result<Server> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let path = Path::new(&config.socket_path);
        let _ = fs::remove_file(path);

        let poll = Poll::new()?;
        let mut listener = UnixListener::bind(path)?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o666))?;

        poll.registry()
            .register(&mut listener, TOKEN_LISTENER, Interest::READABLE)?;

        let now = Instant::now();

        logging::info!(log, "control socket listening"; "path" => &config.socket_path);

        Ok(Server {
            poll,
            events: Events::with_capacity(1024),
            listener,
            clients: Vec::new(),
            free: Vec::new(),
            manager: Manager::new(config, &log),
            engine: Engine::new(&log),
            registered_endpoints: IndexSet::new(),
            registered_links: HashMap::new(),
            fast: Ticker::new(FAST_TICK, now),
            slow: Ticker::new(SLOW_TICK, now),
            log,
        })
    }

    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.poll_once()?;
        }
    }

    /// One reactor iteration: wait for readiness or the next tick, handle
    /// every ready source, run the due ticks, then fan out and flush.
    pub fn poll_once(&mut self) -> io::Result<()> {
        let now = Instant::now();
        let timeout = self.fast.remaining(now).min(self.slow.remaining(now));

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            self.dispatch(token, readable, writable);
        }

        let now = Instant::now();
        for _ in 0..self.fast.fire(now) {
            self.engine.fast_tick();
        }
        for _ in 0..self.slow.fire(now) {
            self.engine.slow_tick(&mut self.manager);
            self.manager.slow_tick(&mut self.engine);
        }

        self.fan_out();
        self.flush_clients();
        self.manager.flush_links();
        self.sync_registrations();

        Ok(())
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        match token.0 {
            0 => self.accept_clients(),
            id if id >= LINK_BASE => {
                let unit = (id - LINK_BASE) as u16;
                self.manager.link_output(unit, &mut self.engine);
            }
            id if id >= UDP_BASE => {
                let endpoint = id - UDP_BASE;
                self.engine.drain_endpoint(endpoint, &mut self.manager);
            }
            id => {
                let client_id = id - CLIENT_BASE;
                self.client_ready(client_id, readable, writable);
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let id = match self.free.pop() {
                        Some(id) => id,
                        None => {
                            self.clients.push(Client::new(&self.log));
                            self.clients.len() - 1
                        }
                    };

                    self.clients[id].open(id, stream);

                    if let Err(err) =
                        self.clients[id].register(&self.poll, Token(CLIENT_BASE + id))
                    {
                        logging::warn!(self.log, "client registration failed"; "error" => %err);
                        self.clients[id].close();
                        self.free.push(id);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "error" => %err);
                    break;
                }
            }
        }
    }

    fn client_ready(&mut self, client_id: ClientId, readable: bool, writable: bool) {
        if client_id >= self.clients.len() || !self.clients[client_id].is_open() {
            return;
        }

        if readable {
            if self.clients[client_id].receive().is_err() {
                self.close_client(client_id);
                return;
            }

            loop {
                match self.clients[client_id].next_message() {
                    Ok(Some(message)) => {
                        self.manager.process_request(
                            &mut self.clients,
                            client_id,
                            message,
                            &mut self.engine,
                        );
                    }
                    Ok(None) => break,
                    Err(_) => {
                        self.close_client(client_id);
                        return;
                    }
                }
            }
        }

        if writable && self.clients[client_id].flush().is_err() {
            self.close_client(client_id);
        }
    }

    fn close_client(&mut self, client_id: ClientId) {
        let _ = self.clients[client_id].deregister(&self.poll);
        self.clients[client_id].close();
        self.free.push(client_id);

        // Auto-close connections arbitrated by the departing client
        self.manager.client_closed(client_id, &mut self.engine);
    }

    /// Delivers pending notifications to every subscribed client, in the
    /// order they were raised.
    fn fan_out(&mut self) {
        let pending = self.manager.drain_notifications();

        for notification in pending {
            for client in self.clients.iter_mut() {
                if !client.wants_notification(
                    notification.kind,
                    &notification.serviceid,
                    notification.link,
                ) {
                    continue;
                }

                let tail = if client.notify_serviceid.is_some() {
                    Some(notification.serviceid.as_str())
                } else {
                    None
                };

                client.send_event(
                    notification.event,
                    notification.error,
                    notification.link,
                    tail,
                );
            }
        }
    }

    fn flush_clients(&mut self) {
        let mut failed = Vec::new();

        for (id, client) in self.clients.iter_mut().enumerate() {
            if client.is_open() && client.has_egress() && client.flush().is_err() {
                failed.push(id);
            }
        }

        for id in failed {
            self.close_client(id);
        }
    }

    /// Keeps poll registrations in step with the engine's endpoint arena
    /// and the supervisor's engine links. Closed descriptors fall out of
    /// the poll set on their own.
    fn sync_registrations(&mut self) {
        let live: IndexSet<EndpointId> = self.engine.endpoints().live().collect();

        for endpoint in live.iter().cloned() {
            if self.registered_endpoints.contains(&endpoint) {
                continue;
            }

            match self
                .engine
                .endpoints_mut()
                .register(endpoint, &self.poll, Token(UDP_BASE + endpoint))
            {
                Ok(()) => {
                    self.registered_endpoints.insert(endpoint);
                }
                Err(err) => {
                    logging::warn!(self.log, "endpoint registration failed";
                                   "endpoint" => endpoint,
                                   "error" => %err);
                }
            }
        }
        self.registered_endpoints.retain(|endpoint| live.contains(endpoint));

        let links = self.manager.link_fds();
        for (unit, _, stdout_fd) in links.iter().cloned() {
            if self.registered_links.get(&unit) == Some(&stdout_fd) {
                continue;
            }

            match self.poll.registry().register(
                &mut SourceFd(&stdout_fd),
                Token(LINK_BASE + unit as usize),
                Interest::READABLE,
            ) {
                Ok(()) => {
                    self.registered_links.insert(unit, stdout_fd);
                }
                Err(err) => {
                    logging::warn!(self.log, "link registration failed";
                                   "unit" => unit,
                                   "error" => %err);
                }
            }
        }
        let live_units: IndexSet<u16> = links.iter().map(|(unit, _, _)| *unit).collect();
        self.registered_links.retain(|unit, _| live_units.contains(unit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{self, MsgHeader};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn test_server(name: &str) -> (Server, String) {
        let path = std::env::temp_dir()
            .join(format!("linkd-test-{}-{}.sock", name, std::process::id()))
            .to_string_lossy()
            .to_string();

        let config = Config {
            socket_path: path.clone(),
            engine_path: "/bin/cat".to_string(),
            services: Vec::new(),
        };

        (Server::new(&config, None).unwrap(), path)
    }

    fn drive_until<F: FnMut(&Server) -> bool>(server: &mut Server, mut done: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(server) {
            assert!(Instant::now() < deadline, "reactor never settled");
            server.poll_once().unwrap();
        }
    }

    #[test]
    fn test_version_request_over_socket() {
        let (mut server, path) = test_server("version");

        let mut stream = StdUnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();

        let hdr = MsgHeader {
            mtype: msg::VERSION,
            ..Default::default()
        };
        let mut wire = [0u8; msg::HDR_SIZE];
        hdr.write(&mut wire);
        stream.write_all(&wire).unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];
        drive_until(&mut server, |_| {
            if let Ok(count) = stream.read(&mut chunk) {
                reply.extend_from_slice(&chunk[..count]);
            }
            reply.len() >= msg::HDR_SIZE + 4
        });

        let hdr = MsgHeader::read(&reply);
        assert_eq!(hdr.mtype, msg::VERSION);
        assert_eq!(hdr.result, 0);
        assert_eq!(hdr.len, 4);
        assert_eq!(
            msg::read_u32_body(&reply[msg::HDR_SIZE..], false),
            msg::CURRENT_VERSION
        );

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_client_slot_recycled_on_disconnect() {
        let (mut server, path) = test_server("recycle");

        let stream = StdUnixStream::connect(&path).unwrap();
        drive_until(&mut server, |server| !server.clients.is_empty());
        assert!(server.clients[0].is_open());

        drop(stream);
        drive_until(&mut server, |server| !server.clients[0].is_open());
        assert_eq!(server.free, vec![0]);

        // A new connection takes the freed slot
        let _stream = StdUnixStream::connect(&path).unwrap();
        drive_until(&mut server, |server| server.clients[0].is_open());
        assert!(server.free.is_empty());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_unroutable_small_request_gets_einval() {
        let (mut server, path) = test_server("einval");

        let mut stream = StdUnixStream::connect(&path).unwrap();
        stream.set_nonblocking(true).unwrap();

        // Type 4 is a hole in the request numbering
        let hdr = MsgHeader {
            mtype: 4,
            ..Default::default()
        };
        let mut wire = [0u8; msg::HDR_SIZE];
        hdr.write(&mut wire);
        stream.write_all(&wire).unwrap();

        let mut reply = Vec::new();
        let mut chunk = [0u8; 256];
        drive_until(&mut server, |_| {
            if let Ok(count) = stream.read(&mut chunk) {
                reply.extend_from_slice(&chunk[..count]);
            }
            reply.len() >= msg::HDR_SIZE
        });

        assert_eq!(MsgHeader::read(&reply).result, msg::EINVAL);

        let _ = fs::remove_file(&path);
    }
}
