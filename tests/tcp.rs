use std::cell::RefCell;
use std::rc::Rc;

use evio::{Continuation, Family, RunMode, StreamStatus};

mod util;

use util::{init_with_context, live_handles};

#[test]
fn echo_round_trip() {
    let mut ctx = init_with_context();

    let server = ctx.new_tcp(None).unwrap();
    ctx.tcp_bind(server, "127.0.0.1", 0, false).unwrap();
    let addr = ctx.tcp_getsockname(server).unwrap();
    assert_eq!(addr.family, Family::Inet);
    assert_ne!(addr.port, 0);

    ctx.listen(server, 128, move |ctx, status| {
        status.unwrap();
        let peer = ctx.new_tcp(None).unwrap();
        ctx.accept(server, peer).unwrap();
        // A second accept without a new connection reports EAGAIN.
        let spare = ctx.new_tcp(None).unwrap();
        let again = ctx.accept(server, spare).unwrap_err();
        assert_eq!(again.errno(), Some(evio::Errno::EAGAIN));
        ctx.close(spare, None).unwrap();

        ctx.read_start(peer, move |ctx, result| match result {
            Ok(Some(chunk)) => {
                ctx.write(
                    peer,
                    chunk,
                    Continuation::call(|_, status: StreamStatus| status.unwrap()),
                )
                .unwrap();
            }
            Ok(None) => {
                ctx.shutdown(
                    peer,
                    Continuation::call(move |ctx, status: StreamStatus| {
                        status.unwrap();
                        ctx.close(peer, None).unwrap();
                    }),
                )
                .unwrap();
                ctx.close(server, None).unwrap();
            }
            Err(err) => panic!("server read error: {}", err),
        })
        .unwrap();
    })
    .unwrap();

    let sock = ctx.new_tcp(None).unwrap();
    let reply = Rc::new(RefCell::new(Vec::new()));
    {
        let reply = Rc::clone(&reply);
        ctx.tcp_connect(
            sock,
            "127.0.0.1",
            addr.port,
            Continuation::call(move |ctx, status: StreamStatus| {
                status.unwrap();
                assert!(ctx.is_readable(sock).unwrap());
                assert!(ctx.is_writable(sock).unwrap());
                ctx.read_start(sock, move |ctx, result| match result {
                    Ok(Some(chunk)) => reply.borrow_mut().extend_from_slice(&chunk),
                    Ok(None) => ctx.close(sock, None).unwrap(),
                    Err(err) => panic!("client read error: {}", err),
                })
                .unwrap();
                ctx.write(sock, "ping", Continuation::none()).unwrap();
                ctx.shutdown(sock, Continuation::none()).unwrap();
            }),
        )
        .unwrap();
    }

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(reply.borrow().as_slice(), b"ping");
    assert_eq!(live_handles(&mut ctx), 0);
    assert!(!ctx.loop_alive());
}

#[test]
fn connect_refused() {
    let mut ctx = init_with_context();

    // Grab a port that is certainly closed by binding and dropping it.
    let probe = ctx.new_tcp(None).unwrap();
    ctx.tcp_bind(probe, "127.0.0.1", 0, false).unwrap();
    let port = ctx.tcp_getsockname(probe).unwrap().port;
    ctx.close(probe, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();

    let sock = ctx.new_tcp(None).unwrap();
    let seen = Rc::new(RefCell::new(None));
    {
        let seen = Rc::clone(&seen);
        ctx.tcp_connect(
            sock,
            "127.0.0.1",
            port,
            Continuation::call(move |ctx, status: StreamStatus| {
                *seen.borrow_mut() = Some(status);
                ctx.close(sock, None).unwrap();
            }),
        )
        .unwrap();
    }
    ctx.run(RunMode::Default).unwrap();
    let status = seen.borrow_mut().take().expect("connect callback ran");
    assert_eq!(status.unwrap_err(), evio::Errno::ECONNREFUSED);
}

#[test]
fn write_queue_accounting() {
    let mut ctx = init_with_context();
    let sock = ctx.new_tcp(None).unwrap();
    // Unconnected socket: writes are refused, the queue stays empty.
    assert!(ctx.write(sock, "data", Continuation::none()).is_err());
    assert_eq!(ctx.write_queue_size(sock).unwrap(), 0);
    ctx.close(sock, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn socket_options() {
    let mut ctx = init_with_context();
    let sock = ctx.new_tcp(Some(evio::TcpFamily::Inet)).unwrap();
    ctx.tcp_nodelay(sock, true).unwrap();
    ctx.tcp_keepalive(sock, true, Some(30)).unwrap();
    ctx.tcp_simultaneous_accepts(sock, true).unwrap();
    let size = ctx.send_buffer_size(sock, None).unwrap();
    assert!(size > 0);
    assert_eq!(ctx.handle_type(sock).unwrap(), evio::HandleType::Tcp);
    let fd = ctx.fileno(sock).unwrap();
    assert_eq!(ctx.guess_handle(fd), "tcp");
    ctx.close(sock, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn double_close_is_an_error() {
    let mut ctx = init_with_context();
    let sock = ctx.new_tcp(None).unwrap();
    ctx.close(sock, None).unwrap();
    assert!(ctx.close(sock, None).is_err());
    ctx.run(RunMode::NoWait).unwrap();
}
