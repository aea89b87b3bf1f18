//! Raw file-descriptor plumbing shared by the stream and datagram engines.

use std::io;
use std::mem;
use std::os::fd::RawFd;

pub(crate) fn close(fd: RawFd) {
    // Nothing sensible to do on error and EINTR must not retry close.
    let _ = unsafe { libc::close(fd) };
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    syscall!(fcntl(fd, libc::F_SETFL, flags)).map(|_| ())
}

/// Anonymous pipe pair as `(read, write)`.
pub(crate) fn pipe(nonblock_read: bool, nonblock_write: bool) -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    syscall!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))?;
    if nonblock_read {
        set_nonblocking(fds[0], true)?;
    }
    if nonblock_write {
        set_nonblocking(fds[1], true)?;
    }
    Ok((fds[0], fds[1]))
}

/// `socketpair(2)` of stream sockets, used for duplex child stdio slots.
pub(crate) fn socketpair() -> io::Result<(RawFd, RawFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
        0,
        fds.as_mut_ptr()
    ))?;
    Ok((fds[0], fds[1]))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())).map(|n| n as usize)
}

/// Vectored write over the unwritten suffixes of `bufs`, starting at
/// `(idx, off)`. Retries `EINTR` internally.
pub(crate) fn writev(fd: RawFd, bufs: &[Vec<u8>], idx: usize, off: usize) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(bufs.len() - idx);
    for (i, buf) in bufs.iter().enumerate().skip(idx) {
        let skip = if i == idx { off } else { 0 };
        iov.push(libc::iovec {
            iov_base: buf[skip..].as_ptr() as *mut libc::c_void,
            iov_len: buf.len() - skip,
        });
    }
    loop {
        match syscall!(writev(fd, iov.as_ptr(), iov.len() as libc::c_int)) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Like [`writev`], but carries `send_fd` as `SCM_RIGHTS` ancillary data.
pub(crate) fn sendmsg_fd(
    fd: RawFd,
    bufs: &[Vec<u8>],
    idx: usize,
    off: usize,
    send_fd: RawFd,
) -> io::Result<usize> {
    let mut iov: Vec<libc::iovec> = Vec::with_capacity(bufs.len() - idx);
    for (i, buf) in bufs.iter().enumerate().skip(idx) {
        let skip = if i == idx { off } else { 0 };
        iov.push(libc::iovec {
            iov_base: buf[skip..].as_ptr() as *mut libc::c_void,
            iov_len: buf.len() - skip,
        });
    }

    // Sized to hold one descriptor plus the cmsg header on 64-bit targets.
    let mut cmsg_buf = [0u8; 32];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iov.as_mut_ptr();
    msg.msg_iovlen = iov.len();
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as usize;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as usize;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, send_fd);
    }

    loop {
        match syscall!(sendmsg(fd, &msg, 0)) {
            Ok(n) => return Ok(n as usize),
            Err(ref err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Read into `buf`, collecting any descriptors passed over the socket into
/// `fds`. Used by IPC-capable pipe reads.
pub(crate) fn recvmsg_fds(fd: RawFd, buf: &mut [u8], fds: &mut Vec<RawFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // Room for a handful of descriptors per message.
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let n = syscall!(recvmsg(fd, &mut msg, 0))?;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / mem::size_of::<RawFd>();
                for i in 0..count {
                    fds.push(std::ptr::read_unaligned(data.add(i)));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok(n as usize)
}

/// Descriptor held open purely so it can be closed to accept under `EMFILE`.
pub(crate) fn open_spare_fd() -> Option<RawFd> {
    let path = b"/dev/null\0";
    match syscall!(open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY | libc::O_CLOEXEC)) {
        Ok(fd) => Some(fd),
        Err(_) => None,
    }
}
