//! Listening sockets: URL parsing, binding, accepting.
//!
//! A listener is bound when `listen` is called (before the reactor
//! starts, so forked workers inherit the fd) and attached to each
//! eligible process's reactor as an internal accept protocol. Accepted
//! fds are handed to the caller's `on_open`, which attaches them to a
//! real protocol or closes them.

use crate::config::{DEFAULT_LISTEN_URL, LISTEN_BACKLOG};
use crate::conn::Io;
use crate::protocol::{Protocol, UserData};
use crate::reactor::{Core, Reactor};
use socket2::{Domain, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Where a listener ended up bound.
#[derive(Debug, Clone)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{addr}"),
            BoundAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A listen URL the reactor can't act on.
#[derive(Debug)]
pub enum UrlError {
    UnsupportedScheme(String),
    InvalidHost(String),
    InvalidPort(String),
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlError::UnsupportedScheme(s) => write!(f, "unsupported scheme '{s}'"),
            UrlError::InvalidHost(h) => write!(f, "invalid host '{h}'"),
            UrlError::InvalidPort(p) => write!(f, "invalid port '{p}'"),
        }
    }
}

impl std::error::Error for UrlError {}

/// Parse `scheme://host:port` with schemes `tcp`, `tls` and `unix`.
/// The scheme defaults to tcp, the host to `0.0.0.0`, the port to 3000;
/// a path or query after the authority is ignored. Returns the target
/// plus whether the URL asked for TLS.
pub(crate) fn parse_url(url: &str) -> Result<(BoundAddr, bool), UrlError> {
    let url = if url.is_empty() { DEFAULT_LISTEN_URL } else { url };
    let (scheme, rest) = match url.find("://") {
        Some(pos) => (&url[..pos], &url[pos + 3..]),
        None => ("tcp", url),
    };
    let tls = match scheme {
        "tcp" => false,
        "tls" => true,
        "unix" => {
            let path = rest.split('?').next().unwrap_or(rest);
            return Ok((BoundAddr::Unix(PathBuf::from(path)), false));
        }
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    };

    let authority = rest
        .split(|c| c == '/' || c == '?')
        .next()
        .unwrap_or(rest);

    let (host, port) = if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6: [::1]:3000
        match stripped.split_once(']') {
            Some((host, rest)) => (host, rest.strip_prefix(':')),
            None => return Err(UrlError::InvalidHost(authority.to_string())),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    let ip: IpAddr = if host.is_empty() {
        IpAddr::from([0u8, 0, 0, 0])
    } else {
        host.parse()
            .map_err(|_| UrlError::InvalidHost(host.to_string()))?
    };
    let port: u16 = match port {
        Some("") | None => 3000,
        Some(p) => p
            .parse()
            .map_err(|_| UrlError::InvalidPort(p.to_string()))?,
    };
    Ok((BoundAddr::Tcp(SocketAddr::new(ip, port)), tls))
}

/// Arguments for [`Reactor::listen`].
pub struct ListenArgs {
    /// Bind target in URL form. Empty means `tcp://0.0.0.0:3000`.
    pub url: String,
    /// Called for every accepted fd; attach it or close it.
    pub on_open: Arc<dyn Fn(RawFd, &Reactor) + Send + Sync>,
    /// Runs once per process when the listener closes.
    pub on_finish: Option<Box<dyn FnOnce() + Send>>,
    /// Accept only in the master process.
    pub master_only: bool,
}

impl ListenArgs {
    pub fn new(
        url: impl Into<String>,
        on_open: impl Fn(RawFd, &Reactor) + Send + Sync + 'static,
    ) -> ListenArgs {
        ListenArgs {
            url: url.into(),
            on_open: Arc::new(on_open),
            on_finish: None,
            master_only: false,
        }
    }

    pub fn on_finish(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    pub fn master_only(mut self, yes: bool) -> Self {
        self.master_only = yes;
        self
    }
}

pub(crate) struct ListenerCfg {
    pub(crate) addr: BoundAddr,
    pub(crate) fd: RawFd,
    pub(crate) on_open: Arc<dyn Fn(RawFd, &Reactor) + Send + Sync>,
    pub(crate) on_finish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    pub(crate) master_only: bool,
}

/// Bind now, accept when the reactor runs.
pub(crate) fn listen(core: &Arc<Core>, args: ListenArgs) -> io::Result<BoundAddr> {
    let (target, tls) = parse_url(&args.url).map_err(|err| {
        error!(url = %args.url, error = %err, "invalid listen URL");
        io::Error::new(io::ErrorKind::InvalidInput, err)
    })?;
    if tls {
        warn!(url = %args.url, "tls scheme accepted but no transport hook is attached; serving cleartext");
    }
    let (socket, bound) = bind(&target)?;
    let fd = socket.into_raw_fd();
    info!(addr = %bound, "listening");
    core.listeners.lock().unwrap().push(Arc::new(ListenerCfg {
        addr: bound.clone(),
        fd,
        on_open: args.on_open,
        on_finish: Mutex::new(args.on_finish),
        master_only: args.master_only,
    }));
    Ok(bound)
}

fn bind(target: &BoundAddr) -> io::Result<(Socket, BoundAddr)> {
    match target {
        BoundAddr::Tcp(addr) => {
            let domain = match addr {
                SocketAddr::V4(_) => Domain::IPV4,
                SocketAddr::V6(_) => Domain::IPV6,
            };
            let socket = Socket::new(domain, Type::STREAM, Some(socket2::Protocol::TCP))?;
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket.bind(&(*addr).into())?;
            socket.listen(LISTEN_BACKLOG)?;
            let local = socket
                .local_addr()?
                .as_socket()
                .unwrap_or(*addr);
            Ok((socket, BoundAddr::Tcp(local)))
        }
        BoundAddr::Unix(path) => {
            // A previous run may have left its socket file behind.
            let _ = std::fs::remove_file(path);
            let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
            socket.set_nonblocking(true)?;
            socket.bind(&SockAddr::unix(path)?)?;
            socket.listen(LISTEN_BACKLOG)?;
            Ok((socket, BoundAddr::Unix(path.clone())))
        }
    }
}

/// Attach the listeners this process should serve: master-only ones in
/// the master, the rest wherever user callbacks run.
pub(crate) fn attach_eligible(core: &Arc<Core>) {
    let reactor = Reactor::from_core(Arc::clone(core));
    let cfgs: Vec<Arc<ListenerCfg>> = core.listeners.lock().unwrap().clone();
    for cfg in cfgs {
        let eligible = if cfg.master_only {
            core.is_master()
        } else {
            core.is_worker()
        };
        if !eligible {
            continue;
        }
        let protocol = Arc::new(AcceptProtocol {
            cfg: Arc::clone(&cfg),
        });
        match reactor.attach_fd(cfg.fd, protocol, None, None) {
            Ok(_) => debug!(addr = %cfg.addr, "listener attached"),
            Err(err) => error!(addr = %cfg.addr, error = %err, "couldn't attach listener"),
        }
    }
}

/// The internal protocol bound to every listening socket: readable
/// means "accept until dry".
struct AcceptProtocol {
    cfg: Arc<ListenerCfg>,
}

impl Protocol for AcceptProtocol {
    fn on_data(&self, io: &Io) {
        let reactor = io.reactor();
        loop {
            let client =
                unsafe { libc::accept(self.cfg.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if client < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        error!(addr = %self.cfg.addr, error = %err, "accept failed");
                        break;
                    }
                }
            }
            debug!(fd = client, addr = %self.cfg.addr, "accepted connection");
            (self.cfg.on_open)(client, &reactor);
        }
    }

    fn on_close(&self, _udata: UserData) {
        if let Some(f) = self.cfg.on_finish.lock().unwrap().take() {
            f();
        }
        if let BoundAddr::Unix(path) = &self.cfg.addr {
            let _ = std::fs::remove_file(path);
        }
        debug!(addr = %self.cfg.addr, "listener closed");
    }

    // Listeners never idle out.
    fn on_timeout(&self, io: &Io) {
        io.touch();
    }
}
