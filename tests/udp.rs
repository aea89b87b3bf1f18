use std::cell::RefCell;
use std::rc::Rc;

use evio::{Continuation, Family, RunMode, StreamStatus};

mod util;

use util::init_with_context;

#[test]
fn send_and_recv() {
    let mut ctx = init_with_context();

    let receiver = ctx.new_udp(None, None).unwrap();
    ctx.udp_bind(receiver, "127.0.0.1", 0, false, false).unwrap();
    let addr = ctx.udp_getsockname(receiver).unwrap();
    assert_eq!(addr.family, Family::Inet);

    let sender = ctx.new_udp(None, None).unwrap();

    let got = Rc::new(RefCell::new(None));
    {
        let got = Rc::clone(&got);
        ctx.udp_recv_start(receiver, move |ctx, recv| {
            let (data, from, flags) = recv.unwrap().expect("datagram, not a spurious wakeup");
            assert!(!flags.partial);
            assert!(!flags.mmsg_chunk);
            *got.borrow_mut() = Some((data, from));
            ctx.close(receiver, None).unwrap();
            ctx.close(sender, None).unwrap();
        })
        .unwrap();
    }

    let port = addr.port;
    ctx.udp_send(
        sender,
        "datagram",
        Some(("127.0.0.1", port)),
        Continuation::call(|_, status: StreamStatus| status.unwrap()),
    )
    .unwrap();

    ctx.run(RunMode::Default).unwrap();

    let (data, from) = got.borrow_mut().take().expect("datagram arrived");
    assert_eq!(data, b"datagram");
    let from = from.expect("sender address reported");
    assert_eq!(from.ip, "127.0.0.1");
}

#[test]
fn connected_send_omits_address() {
    let mut ctx = init_with_context();

    let receiver = ctx.new_udp(None, None).unwrap();
    ctx.udp_bind(receiver, "127.0.0.1", 0, false, false).unwrap();
    let port = ctx.udp_getsockname(receiver).unwrap().port;

    let sender = ctx.new_udp(None, None).unwrap();
    ctx.udp_connect(sender, "127.0.0.1", port).unwrap();
    let peer = ctx.udp_getpeername(sender).unwrap();
    assert_eq!(peer.port, port);

    // Addressed sends on a connected socket are refused; unaddressed sends
    // on an unconnected one likewise.
    assert!(ctx
        .udp_send(sender, "x", Some(("127.0.0.1", port)), Continuation::none())
        .is_err());
    assert!(ctx
        .udp_send(receiver, "x", None, Continuation::none())
        .is_err());

    let got = Rc::new(RefCell::new(None));
    {
        let got = Rc::clone(&got);
        ctx.udp_recv_start(receiver, move |ctx, recv| {
            let (data, _, _) = recv.unwrap().unwrap();
            *got.borrow_mut() = Some(data);
            ctx.close(receiver, None).unwrap();
            ctx.close(sender, None).unwrap();
        })
        .unwrap();
    }
    ctx.udp_send(sender, "linked", None, Continuation::none()).unwrap();

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(got.borrow_mut().take().unwrap(), b"linked");

    // Disconnect tears the association back down.
    // (The handles are already closed; a fresh pair shows the round trip.)
    let sock = ctx.new_udp(None, None).unwrap();
    ctx.udp_connect(sock, "127.0.0.1", port).unwrap();
    ctx.udp_disconnect(sock).unwrap();
    assert!(ctx.udp_getpeername(sock).is_err());
    ctx.close(sock, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn try_send_is_immediate() {
    let mut ctx = init_with_context();

    let receiver = ctx.new_udp(None, None).unwrap();
    ctx.udp_bind(receiver, "127.0.0.1", 0, false, false).unwrap();
    let port = ctx.udp_getsockname(receiver).unwrap().port;

    let sender = ctx.new_udp(None, None).unwrap();
    let n = ctx
        .udp_try_send(sender, "now", Some(("127.0.0.1", port)))
        .unwrap();
    assert_eq!(n, 3);
    assert_eq!(ctx.udp_get_send_queue_size(sender).unwrap(), 0);
    assert_eq!(ctx.udp_get_send_queue_count(sender).unwrap(), 0);

    ctx.close(sender, None).unwrap();
    ctx.close(receiver, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn socket_options() {
    let mut ctx = init_with_context();
    let sock = ctx.new_udp(Some(evio::TcpFamily::Inet), None).unwrap();
    ctx.udp_set_broadcast(sock, true).unwrap();
    ctx.udp_set_ttl(sock, 32).unwrap();
    ctx.udp_set_multicast_loop(sock, true).unwrap();
    ctx.udp_set_multicast_ttl(sock, 2).unwrap();
    ctx.udp_set_membership(sock, "239.1.2.3", None, true).unwrap();
    ctx.udp_set_membership(sock, "239.1.2.3", None, false).unwrap();
    ctx.close(sock, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}
