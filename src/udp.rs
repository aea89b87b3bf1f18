//! The datagram engine.
//!
//! Sends queue per socket and drain with `sendmsg` until the kernel pushes
//! back; datagrams are atomic, so a request either reports the whole
//! message sent or an error — never partial progress. Receives deliver one
//! callback per message, with flags marking kernel-truncated payloads and
//! messages that arrived through a batched `recvmmsg`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use crate::addr::SockName;
use crate::context::Context;
use crate::error::{Errno, Error, Result};
use crate::handle::{Handle, HandleData};
use crate::interest::Interest;
use crate::request::{Continuation, Request, RequestKind};
use crate::stream::StreamStatus;
use crate::sys::{fdio, net};
use crate::tcp::TcpFamily;

const RECV_BUF_SIZE: usize = 64 * 1024;
const MAX_RECVS_PER_EVENT: usize = 32;

/// Flags attached to one received datagram.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecvFlags {
    /// The message was larger than the buffer and the kernel truncated it.
    pub partial: bool,
    /// The message came out of a batched receive syscall.
    pub mmsg_chunk: bool,
}

/// One receive delivery: `(data, sender, flags)`, `Ok(None)` for a spurious
/// wakeup with nothing to read, or the error that stopped receiving.
pub type UdpRecv = std::result::Result<Option<(Vec<u8>, Option<SockName>, RecvFlags)>, Errno>;

pub(crate) type RecvCallback = Rc<RefCell<dyn FnMut(&mut Context, UdpRecv)>>;

pub(crate) struct SendReq {
    pub(crate) bufs: Vec<Vec<u8>>,
    pub(crate) addr: Option<SocketAddr>,
    pub(crate) error: Option<Errno>,
    pub(crate) cont: Continuation<StreamStatus>,
}

impl SendReq {
    fn len(&self) -> usize {
        self.bufs.iter().map(Vec::len).sum()
    }
}

pub(crate) struct UdpState {
    pub(crate) fd: Option<RawFd>,
    pub(crate) connected: bool,
    pub(crate) recving: bool,
    pub(crate) recv_cb: Option<RecvCallback>,
    pub(crate) send_queue: VecDeque<Request>,
    pub(crate) completed: VecDeque<Request>,
    pub(crate) send_queue_size: usize,
    pub(crate) interest: Option<Interest>,
    pub(crate) in_pending: bool,
    /// Batch size when `recvmmsg` batching was requested at creation.
    pub(crate) mmsg_batch: Option<usize>,
}

impl Context {
    /// A UDP handle. `family` creates the socket eagerly; `mmsg_batch`
    /// turns on batched receives with the given number of messages per
    /// syscall.
    pub fn new_udp(&mut self, family: Option<TcpFamily>, mmsg_batch: Option<usize>) -> Result<Handle> {
        let h = self.alloc_handle(HandleData::Udp(UdpState {
            fd: None,
            connected: false,
            recving: false,
            recv_cb: None,
            send_queue: VecDeque::new(),
            completed: VecDeque::new(),
            send_queue_size: 0,
            interest: None,
            in_pending: false,
            mmsg_batch: mmsg_batch.filter(|&n| n > 1),
        }));
        if let Some(family) = family {
            let domain = match family {
                TcpFamily::Inet => libc::AF_INET,
                TcpFamily::Inet6 => libc::AF_INET6,
            };
            let fd = match net::new_socket(domain, libc::SOCK_DGRAM) {
                Ok(fd) => fd,
                Err(err) => {
                    self.start_close(h);
                    return Err(Error::sys(err));
                }
            };
            self.udp_state_mut(h)?.fd = Some(fd);
        }
        Ok(h)
    }

    /// Adopt an existing datagram socket.
    pub fn udp_open(&mut self, h: Handle, fd: RawFd) -> Result<()> {
        let state = self.udp_state_mut(h)?;
        if state.fd.is_some() {
            return Err(Error::Sys(Errno::EBUSY));
        }
        fdio::set_nonblocking(fd, true)?;
        state.fd = Some(fd);
        Ok(())
    }

    pub fn udp_bind(
        &mut self,
        h: Handle,
        ip: &str,
        port: u16,
        reuseaddr: bool,
        ipv6only: bool,
    ) -> Result<()> {
        let addr = net::parse_addr(ip, port).map_err(|_| Error::arg(2, "ip address"))?;
        let fd = self.udp_maybe_socket(h, &addr)?;
        if reuseaddr {
            net::set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as libc::c_int)?;
        }
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

    /// Fix the remote peer; sends omit the address and receives filter on it.
    pub fn udp_connect(&mut self, h: Handle, ip: &str, port: u16) -> Result<()> {
        let addr = net::parse_addr(ip, port).map_err(|_| Error::arg(2, "ip address"))?;
        let fd = self.udp_maybe_socket(h, &addr)?;
        net::connect(fd, &addr)?;
        self.udp_state_mut(h)?.connected = true;
        Ok(())
    }

    pub fn udp_disconnect(&mut self, h: Handle) -> Result<()> {
        let state = self.udp_state(h)?;
        let fd = state.fd.ok_or(Error::Sys(Errno::EBADF))?;
        if !state.connected {
            return Err(Error::Sys(Errno::ENOTCONN));
        }
        // Dissolve the association by connecting to AF_UNSPEC.
        let mut addr: libc::sockaddr = unsafe { mem::zeroed() };
        addr.sa_family = libc::AF_UNSPEC as libc::sa_family_t;
        match syscall!(connect(fd, &addr, mem::size_of::<libc::sockaddr>() as libc::socklen_t)) {
            Ok(_) => {}
            // Some kernels report EAFNOSUPPORT for a successful dissolve.
            Err(ref err) if err.raw_os_error() == Some(libc::EAFNOSUPPORT) => {}
            Err(err) => return Err(Error::sys(err)),
        }
        self.udp_state_mut(h)?.connected = false;
        Ok(())
    }

    /// Queue one datagram. `addr` must be `None` exactly when the socket is
    /// connected. The continuation reports the whole message sent or the
    /// error; completions fire in submission order.
    pub fn udp_send(
        &mut self,
        h: Handle,
        data: impl Into<crate::stream::WriteData>,
        addr: Option<(&str, u16)>,
        cont: Continuation<StreamStatus>,
    ) -> Result<Request> {
        let state = self.udp_state(h)?;
        if state.connected && addr.is_some() {
            return Err(Error::Sys(Errno::EISCONN));
        }
        if !state.connected && addr.is_none() {
            return Err(Error::Sys(Errno::from_raw(libc::EDESTADDRREQ)));
        }
        let dest = match addr {
            Some((ip, port)) => {
                Some(net::parse_addr(ip, port).map_err(|_| Error::arg(3, "ip address"))?)
            }
            None => None,
        };
        match dest {
            Some(ref addr) => {
                self.udp_maybe_socket(h, addr)?;
            }
            None => {
                self.udp_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))?;
            }
        }
        let bufs = match data.into() {
            crate::stream::WriteData::Single(buf) => vec![buf],
            crate::stream::WriteData::Multi(bufs) => bufs,
        };
        let size: usize = bufs.iter().map(Vec::len).sum();
        let req = self.alloc_request(
            Some(h),
            RequestKind::UdpSend(SendReq {
                bufs,
                addr: dest,
                error: None,
                cont,
            }),
        );
        let state = self.udp_state_mut(h)?;
        let first = state.send_queue.is_empty();
        state.send_queue.push_back(req);
        state.send_queue_size += size;
        if first {
            self.udp_flush(h);
            self.udp_schedule_drain(h);
        }
        self.udp_update(h);
        Ok(req)
    }

    /// Send without queueing: the datagram goes out now or the call reports
    /// the kernel's refusal.
    pub fn udp_try_send(
        &mut self,
        h: Handle,
        data: impl Into<crate::stream::WriteData>,
        addr: Option<(&str, u16)>,
    ) -> Result<usize> {
        let dest = match addr {
            Some((ip, port)) => {
                Some(net::parse_addr(ip, port).map_err(|_| Error::arg(3, "ip address"))?)
            }
            None => None,
        };
        let fd = match dest {
            Some(ref addr) => self.udp_maybe_socket(h, addr)?,
            None => self.udp_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))?,
        };
        if !self.udp_state(h)?.send_queue.is_empty() {
            return Err(Error::Sys(Errno::EAGAIN));
        }
        let bufs = match data.into() {
            crate::stream::WriteData::Single(buf) => vec![buf],
            crate::stream::WriteData::Multi(bufs) => bufs,
        };
        send_one(fd, &bufs, dest.as_ref()).map_err(Error::sys)
    }

    pub fn udp_recv_start(
        &mut self,
        h: Handle,
        cb: impl FnMut(&mut Context, UdpRecv) + 'static,
    ) -> Result<()> {
        let state = self.udp_state_mut(h)?;
        if state.fd.is_none() {
            return Err(Error::Sys(Errno::EBADF));
        }
        if state.recving {
            return Err(Error::Sys(Errno::EALREADY));
        }
        state.recv_cb = Some(Rc::new(RefCell::new(cb)));
        state.recving = true;
        self.udp_update(h);
        Ok(())
    }

    /// Idempotent.
    pub fn udp_recv_stop(&mut self, h: Handle) -> Result<()> {
        let state = self.udp_state_mut(h)?;
        state.recving = false;
        self.udp_update(h);
        Ok(())
    }

    pub fn udp_getsockname(&self, h: Handle) -> Result<SockName> {
        let fd = self.udp_fd(h)?;
        Ok(net::getsockname(fd).map(SockName::from)?)
    }

    pub fn udp_getpeername(&self, h: Handle) -> Result<SockName> {
        let fd = self.udp_fd(h)?;
        Ok(net::getpeername(fd).map(SockName::from)?)
    }

    /// Join (`true`) or leave a multicast group.
    pub fn udp_set_membership(
        &mut self,
        h: Handle,
        multicast: &str,
        interface: Option<&str>,
        join: bool,
    ) -> Result<()> {
        let fd = self.udp_fd(h)?;
        let group = net::parse_addr(multicast, 0).map_err(|_| Error::arg(2, "multicast address"))?;
        match group {
            SocketAddr::V4(group) => {
                let iface = match interface {
                    Some(ip) => ip
                        .parse::<std::net::Ipv4Addr>()
                        .map_err(|_| Error::arg(3, "interface address"))?,
                    None => std::net::Ipv4Addr::UNSPECIFIED,
                };
                let mreq = libc::ip_mreq {
                    imr_multiaddr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(group.ip().octets()),
                    },
                    imr_interface: libc::in_addr {
                        s_addr: u32::from_ne_bytes(iface.octets()),
                    },
                };
                let opt = if join {
                    libc::IP_ADD_MEMBERSHIP
                } else {
                    libc::IP_DROP_MEMBERSHIP
                };
                net::set_opt(fd, libc::IPPROTO_IP, opt, mreq)?;
            }
            SocketAddr::V6(group) => {
                let ifindex = match interface {
                    Some(name) => {
                        let cname = std::ffi::CString::new(name)
                            .map_err(|_| Error::arg(3, "interface name"))?;
                        unsafe { libc::if_nametoindex(cname.as_ptr()) }
                    }
                    None => 0,
                };
                let mreq = libc::ipv6_mreq {
                    ipv6mr_multiaddr: libc::in6_addr {
                        s6_addr: group.ip().octets(),
                    },
                    ipv6mr_interface: ifindex,
                };
                let opt = if join {
                    libc::IPV6_ADD_MEMBERSHIP
                } else {
                    libc::IPV6_DROP_MEMBERSHIP
                };
                net::set_opt(fd, libc::IPPROTO_IPV6, opt, mreq)?;
            }
        }
        Ok(())
    }

    /// Source-specific multicast membership (IPv4).
    pub fn udp_set_source_membership(
        &mut self,
        h: Handle,
        multicast: &str,
        interface: Option<&str>,
        source: &str,
        join: bool,
    ) -> Result<()> {
        let fd = self.udp_fd(h)?;
        let group = multicast
            .parse::<std::net::Ipv4Addr>()
            .map_err(|_| Error::arg(2, "ipv4 multicast address"))?;
        let src = source
            .parse::<std::net::Ipv4Addr>()
            .map_err(|_| Error::arg(4, "ipv4 source address"))?;
        let iface = match interface {
            Some(ip) => ip
                .parse::<std::net::Ipv4Addr>()
                .map_err(|_| Error::arg(3, "interface address"))?,
            None => std::net::Ipv4Addr::UNSPECIFIED,
        };
        let mreq = libc::ip_mreq_source {
            imr_multiaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(group.octets()),
            },
            imr_interface: libc::in_addr {
                s_addr: u32::from_ne_bytes(iface.octets()),
            },
            imr_sourceaddr: libc::in_addr {
                s_addr: u32::from_ne_bytes(src.octets()),
            },
        };
        let opt = if join {
            libc::IP_ADD_SOURCE_MEMBERSHIP
        } else {
            libc::IP_DROP_SOURCE_MEMBERSHIP
        };
        net::set_opt(fd, libc::IPPROTO_IP, opt, mreq)?;
        Ok(())
    }

    pub fn udp_set_broadcast(&mut self, h: Handle, on: bool) -> Result<()> {
        let fd = self.udp_fd(h)?;
        net::set_opt(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, on as libc::c_int)?;
        Ok(())
    }

    pub fn udp_set_ttl(&mut self, h: Handle, ttl: u8) -> Result<()> {
        let fd = self.udp_fd(h)?;
        net::set_opt(fd, libc::IPPROTO_IP, libc::IP_TTL, ttl as libc::c_int)?;
        Ok(())
    }

    pub fn udp_set_multicast_loop(&mut self, h: Handle, on: bool) -> Result<()> {
        let fd = self.udp_fd(h)?;
        net::set_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_LOOP, on as libc::c_int)?;
        Ok(())
    }

    pub fn udp_set_multicast_ttl(&mut self, h: Handle, ttl: u8) -> Result<()> {
        let fd = self.udp_fd(h)?;
        net::set_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_TTL, ttl as libc::c_int)?;
        Ok(())
    }

    pub fn udp_set_multicast_interface(&mut self, h: Handle, interface: &str) -> Result<()> {
        let fd = self.udp_fd(h)?;
        let iface = interface
            .parse::<std::net::Ipv4Addr>()
            .map_err(|_| Error::arg(2, "interface address"))?;
        let addr = libc::in_addr {
            s_addr: u32::from_ne_bytes(iface.octets()),
        };
        net::set_opt(fd, libc::IPPROTO_IP, libc::IP_MULTICAST_IF, addr)?;
        Ok(())
    }

    /// Bytes queued but not yet handed to the kernel.
    pub fn udp_get_send_queue_size(&self, h: Handle) -> Result<usize> {
        Ok(self.udp_state(h)?.send_queue_size)
    }

    pub fn udp_get_send_queue_count(&self, h: Handle) -> Result<usize> {
        Ok(self.udp_state(h)?.send_queue.len())
    }

    // ===== engine internals =====

    fn udp_flush(&mut self, h: Handle) {
        loop {
            let (fd, req) = match self.udp_state(h) {
                Ok(state) => match (state.fd, state.send_queue.front()) {
                    (Some(fd), Some(&req)) => (fd, req),
                    _ => return,
                },
                Err(_) => return,
            };
            let outcome = {
                let record = match self.requests.get_mut(req.index as usize) {
                    Some(record) => record,
                    None => return,
                };
                let send = match &mut record.kind {
                    RequestKind::UdpSend(send) => send,
                    _ => return,
                };
                match send_one(fd, &send.bufs, send.addr.as_ref()) {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        let errno = Errno::from_io(&err);
                        if !errno.is_would_block() {
                            send.error = Some(errno);
                        }
                        Err(errno)
                    }
                }
            };
            match outcome {
                Err(errno) if errno.is_would_block() => return,
                _ => {
                    let size = {
                        let record = self.requests.get(req.index as usize);
                        match record.map(|r| &r.kind) {
                            Some(RequestKind::UdpSend(send)) => send.len(),
                            _ => 0,
                        }
                    };
                    if let Ok(state) = self.udp_state_mut(h) {
                        state.send_queue.pop_front();
                        state.send_queue_size -= size;
                        state.completed.push_back(req);
                    }
                }
            }
        }
    }

    pub(crate) fn udp_drain_completed(&mut self, h: Handle) {
        if let Ok(state) = self.udp_state_mut(h) {
            state.in_pending = false;
        } else {
            return;
        }
        loop {
            let req = match self.udp_state_mut(h) {
                Ok(state) => match state.completed.pop_front() {
                    Some(req) => req,
                    None => break,
                },
                Err(_) => return,
            };
            if let Some(record) = self.take_request(req) {
                if let RequestKind::UdpSend(send) = record.kind {
                    let status = send.error.map_or(Ok(()), Err);
                    send.cont.fulfill(self, status);
                }
            }
        }
        self.udp_update(h);
    }

    pub(crate) fn udp_on_event(&mut self, h: Handle, readable: bool, writable: bool) {
        if writable {
            self.udp_flush(h);
            self.udp_drain_completed(h);
        }
        if readable {
            self.udp_do_recv(h);
        }
        self.udp_update(h);
    }

    fn udp_do_recv(&mut self, h: Handle) {
        let batch = match self.udp_state(h) {
            Ok(state) if state.recving => state.mmsg_batch,
            _ => return,
        };
        match batch {
            Some(batch) => self.udp_recv_mmsg(h, batch),
            None => self.udp_recv_single(h),
        }
    }

    fn udp_recv_single(&mut self, h: Handle) {
        for _ in 0..MAX_RECVS_PER_EVENT {
            let fd = match self.udp_state(h) {
                Ok(state) if state.recving => match state.fd {
                    Some(fd) => fd,
                    None => return,
                },
                _ => return,
            };
            let mut buf = vec![0u8; RECV_BUF_SIZE];
            match recv_one(fd, &mut buf) {
                Ok((n, sender, truncated)) => {
                    buf.truncate(n);
                    let flags = RecvFlags {
                        partial: truncated,
                        mmsg_chunk: false,
                    };
                    self.udp_fire_recv(h, Ok(Some((buf, sender, flags))));
                }
                Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(err) => {
                    let errno = Errno::from_io(&err);
                    if errno.is_would_block() {
                        return;
                    }
                    self.udp_fire_recv(h, Err(errno));
                    return;
                }
            }
        }
    }

    /// Batched receive: one syscall pulls up to `batch` messages, each
    /// delivered as its own callback with `mmsg_chunk` set.
    fn udp_recv_mmsg(&mut self, h: Handle, batch: usize) {
        let fd = match self.udp_state(h) {
            Ok(state) => match state.fd {
                Some(fd) => fd,
                None => return,
            },
            Err(_) => return,
        };
        let mut storage = vec![0u8; RECV_BUF_SIZE * batch];
        let mut names: Vec<libc::sockaddr_storage> = vec![unsafe { mem::zeroed() }; batch];
        let mut iovecs: Vec<libc::iovec> = storage
            .chunks_mut(RECV_BUF_SIZE)
            .map(|chunk| libc::iovec {
                iov_base: chunk.as_mut_ptr() as *mut libc::c_void,
                iov_len: chunk.len(),
            })
            .collect();
        let mut msgs: Vec<libc::mmsghdr> = (0..batch)
            .map(|i| {
                let mut hdr: libc::mmsghdr = unsafe { mem::zeroed() };
                hdr.msg_hdr.msg_iov = &mut iovecs[i];
                hdr.msg_hdr.msg_iovlen = 1;
                hdr.msg_hdr.msg_name = &mut names[i] as *mut _ as *mut libc::c_void;
                hdr.msg_hdr.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as u32;
                hdr
            })
            .collect();
        let n = match syscall!(recvmmsg(
            fd,
            msgs.as_mut_ptr(),
            batch as libc::c_uint,
            0,
            std::ptr::null_mut()
        )) {
            Ok(n) => n as usize,
            Err(err) => {
                let errno = Errno::from_io(&err);
                if !errno.is_would_block() {
                    self.udp_fire_recv(h, Err(errno));
                }
                return;
            }
        };
        for i in 0..n {
            let len = msgs[i].msg_len as usize;
            let truncated = msgs[i].msg_hdr.msg_flags & libc::MSG_TRUNC != 0;
            let data = storage[i * RECV_BUF_SIZE..i * RECV_BUF_SIZE + len].to_vec();
            let sender = net::to_socket_addr(&names[i]).ok().map(SockName::from);
            let flags = RecvFlags {
                partial: truncated,
                mmsg_chunk: true,
            };
            self.udp_fire_recv(h, Ok(Some((data, sender, flags))));
            let stopped = match self.udp_state(h) {
                Ok(state) => !state.recving,
                Err(_) => true,
            };
            if stopped {
                return;
            }
        }
    }

    fn udp_fire_recv(&mut self, h: Handle, result: UdpRecv) {
        let cb = match self.udp_state(h) {
            Ok(state) => state.recv_cb.clone(),
            Err(_) => None,
        };
        if let Some(cb) = cb {
            self.dispatch(move |ctx| (cb.borrow_mut())(ctx, result));
        }
    }

    fn udp_update(&mut self, h: Handle) {
        let (fd, desired, registered, active) = match self.udp_state(h) {
            Ok(state) => {
                let fd = match state.fd {
                    Some(fd) => fd,
                    None => return,
                };
                let mut desired: Option<Interest> = None;
                if state.recving {
                    desired = Some(Interest::READABLE);
                }
                if !state.send_queue.is_empty() {
                    desired = Some(desired.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
                }
                let active = desired.is_some() || !state.completed.is_empty();
                (fd, desired, state.interest, active)
            }
            Err(_) => return,
        };
        if desired != registered {
            let token = h.token();
            let result = match (registered, desired) {
                (None, Some(interest)) => self.selector.register(fd, token, interest),
                (Some(_), Some(interest)) => self.selector.reregister(fd, token, interest),
                (Some(_), None) => self.selector.deregister(fd),
                (None, None) => Ok(()),
            };
            match result {
                Ok(()) => {
                    if let Ok(state) = self.udp_state_mut(h) {
                        state.interest = desired;
                    }
                }
                Err(err) => log::warn!("udp interest update failed: {}", err),
            }
        }
        self.set_active(h, active);
    }

    fn udp_schedule_drain(&mut self, h: Handle) {
        if let Ok(state) = self.udp_state_mut(h) {
            if !state.in_pending && !state.completed.is_empty() {
                state.in_pending = true;
                self.pending.push_back(h);
            }
        }
    }

    pub(crate) fn udp_teardown(&mut self, h: Handle) {
        let (fd, interest, reqs) = match self.udp_state_mut(h) {
            Ok(state) => {
                state.recv_cb = None;
                state.recving = false;
                state.send_queue_size = 0;
                (
                    state.fd.take(),
                    state.interest.take(),
                    std::mem::take(&mut state.send_queue),
                )
            }
            Err(_) => return,
        };
        for req in reqs {
            if let Some(record) = self.requests.get_mut(req.index as usize) {
                if let RequestKind::UdpSend(send) = &mut record.kind {
                    send.error = Some(Errno::ECANCELED);
                }
            }
            if let Ok(state) = self.udp_state_mut(h) {
                state.completed.push_back(req);
            }
        }
        if let Some(fd) = fd {
            if interest.is_some() {
                let _ = self.selector.deregister(fd);
            }
            fdio::close(fd);
        }
    }

    // ===== state accessors =====

    fn udp_maybe_socket(&mut self, h: Handle, addr: &SocketAddr) -> Result<RawFd> {
        let state = self.udp_state_mut(h)?;
        if let Some(fd) = state.fd {
            return Ok(fd);
        }
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = net::new_socket(domain, libc::SOCK_DGRAM)?;
        state.fd = Some(fd);
        Ok(fd)
    }

    fn udp_state(&self, h: Handle) -> Result<&UdpState> {
        match &self.record(h)?.data {
            HandleData::Udp(state) => Ok(state),
            _ => Err(Error::arg(1, "udp handle")),
        }
    }

    fn udp_state_mut(&mut self, h: Handle) -> Result<&mut UdpState> {
        match &mut self.record_mut(h)?.data {
            HandleData::Udp(state) => Ok(state),
            _ => Err(Error::arg(1, "udp handle")),
        }
    }

    fn udp_fd(&self, h: Handle) -> Result<RawFd> {
        self.udp_state(h)?.fd.ok_or(Error::Sys(Errno::EBADF))
    }
}

/// One whole datagram out, or the kernel's error.
fn send_one(fd: RawFd, bufs: &[Vec<u8>], addr: Option<&SocketAddr>) -> std::io::Result<usize> {
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter()
        .map(|buf| libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        })
        .collect();
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iovecs.len();
    let raw = addr.map(net::socket_addr);
    if let Some((ref raw, len)) = raw {
        msg.msg_name = raw.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = len;
    }
    loop {
        match syscall!(sendmsg(fd, &msg, 0)) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// One datagram in: `(len, sender, truncated)`.
fn recv_one(fd: RawFd, buf: &mut [u8]) -> std::io::Result<(usize, Option<SockName>, bool)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut name: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_name = &mut name as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as u32;
    let n = syscall!(recvmsg(fd, &mut msg, 0))?;
    let truncated = msg.msg_flags & libc::MSG_TRUNC != 0;
    let sender = net::to_socket_addr(&name).ok().map(SockName::from);
    Ok((n as usize, sender, truncated))
}
