//! TCP stream fronts over the stream engine.

use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::addr::SockName;
use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::request::{Continuation, Request, RequestKind};
use crate::stream::{ConnectReq, StreamState, StreamStatus, StreamVariant};
use crate::sys::net;

/// Address family requested at TCP handle creation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TcpFamily {
    Inet,
    Inet6,
}

impl Context {
    /// A TCP handle. With `family` the socket is created eagerly for that
    /// family; otherwise creation is deferred until bind or connect reveals
    /// the peer family.
    pub fn new_tcp(&mut self, family: Option<TcpFamily>) -> Result<Handle> {
        let h = self.alloc_handle(HandleData::Stream(StreamState::new(StreamVariant::Tcp)));
        if let Some(family) = family {
            let domain = match family {
                TcpFamily::Inet => libc::AF_INET,
                TcpFamily::Inet6 => libc::AF_INET6,
            };
            let fd = match net::new_socket(domain, libc::SOCK_STREAM) {
                Ok(fd) => fd,
                Err(err) => {
                    self.start_close(h);
                    return Err(Error::sys(err));
                }
            };
            self.stream_state_mut(h)?.fd = Some(fd);
        }
        Ok(h)
    }

    /// Adopt an existing connected or bound socket.
    pub fn tcp_open(&mut self, h: Handle, fd: RawFd) -> Result<()> {
        let state = self.tcp_state_mut(h)?;
        if state.fd.is_some() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        crate::sys::fdio::set_nonblocking(fd, true)?;
        state.adopt_fd(fd, true, true);
        Ok(())
    }

    pub fn tcp_bind(&mut self, h: Handle, ip: &str, port: u16, ipv6only: bool) -> Result<()> {
        let addr = net::parse_addr(ip, port).map_err(|_| Error::arg(2, "ip address"))?;
        let fd = self.tcp_maybe_socket(h, &addr)?;
        net::set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as libc::c_int)?;
        if let SocketAddr::V6(_) = addr {
            net::set_opt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                ipv6only as libc::c_int,
            )?;
        }
        net::bind(fd, &addr)?;
        Ok(())
    }

    /// Start a connection; the continuation fires with the outcome once the
    /// socket settles.
    pub fn tcp_connect(
        &mut self,
        h: Handle,
        ip: &str,
        port: u16,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        let addr = net::parse_addr(ip, port).map_err(|_| Error::arg(2, "ip address"))?;
        let fd = self.tcp_maybe_socket(h, &addr)?;
        if self.tcp_state(h)?.connect_req.is_some() {
            return Err(Error::Sys(Errno::EALREADY));
        }
        match net::connect(fd, &addr) {
            Ok(()) => {}
            Err(ref err) if err.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(err) => return Err(Error::sys(err)),
        }
        let req = self.alloc_request(
            Some(h),
            RequestKind::Connect(ConnectReq {
                error: None,
                cont,
            }),
        );
        self.tcp_state_mut(h)?.connect_req = Some(req);
        // Connect completion is reported as writability.
        self.stream_update(h);
        Ok(req)
    }

    pub fn tcp_getsockname(&self, h: Handle) -> Result<SockName> {
        let fd = self.tcp_fd(h)?;
        Ok(net::getsockname(fd).map(SockName::from)?)
    }

    pub fn tcp_getpeername(&self, h: Handle) -> Result<SockName> {
        let fd = self.tcp_fd(h)?;
        Ok(net::getpeername(fd).map(SockName::from)?)
    }

    pub fn tcp_nodelay(&mut self, h: Handle, enable: bool) -> Result<()> {
        let fd = self.tcp_fd(h)?;
        net::set_opt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable as libc::c_int)?;
        Ok(())
    }

    /// Enable or disable keep-alive probes; `delay` is the idle time in
    /// seconds before the first probe.
    pub fn tcp_keepalive(&mut self, h: Handle, enable: bool, delay: Option<u32>) -> Result<()> {
        let fd = self.tcp_fd(h)?;
        net::set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable as libc::c_int)?;
        if enable {
            if let Some(delay) = delay {
                net::set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, delay as libc::c_int)?;
            }
        }
        Ok(())
    }

    /// Kept for call-compatibility: the balancing hint only matters on
    /// completion-port backends, the readiness backend always behaves as if
    /// it were enabled.
    pub fn tcp_simultaneous_accepts(&mut self, h: Handle, _enable: bool) -> Result<()> {
        let _ = self.tcp_fd(h)?;
        Ok(())
    }

    /// Close the handle after arranging a RST instead of the orderly FIN
    /// exchange.
    pub fn tcp_close_reset(
        &mut self,
        h: Handle,
        cb: Option<Box<dyn FnOnce(&mut Context)>>,
    ) -> Result<()> {
        let fd = self.tcp_fd(h)?;
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        net::set_opt(fd, libc::SOL_SOCKET, libc::SO_LINGER, linger)?;
        self.close(h, cb)
    }

    // ===== internals =====

    /// Create the socket on first use, matching the family of `addr`.
    fn tcp_maybe_socket(&mut self, h: Handle, addr: &SocketAddr) -> Result<RawFd> {
        let state = self.tcp_state_mut(h)?;
        if let Some(fd) = state.fd {
            return Ok(fd);
        }
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = net::new_socket(domain, libc::SOCK_STREAM)?;
        state.fd = Some(fd);
        Ok(fd)
    }

    fn tcp_state(&self, h: Handle) -> Result<&StreamState> {
        let state = self.stream_state(h)?;
        match state.variant {
            StreamVariant::Tcp => Ok(state),
            _ => Err(Error::arg(1, "tcp handle")),
        }
    }

    fn tcp_state_mut(&mut self, h: Handle) -> Result<&mut StreamState> {
        let state = self.stream_state_mut(h)?;
        match state.variant {
            StreamVariant::Tcp => Ok(state),
            _ => Err(Error::arg(1, "tcp handle")),
        }
    }

    fn tcp_fd(&self, h: Handle) -> Result<RawFd> {
        self.tcp_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))
    }
}
