use std::cell::RefCell;
use std::rc::Rc;

use evio::{pipe_pair, Continuation, RunMode, StreamStatus};

mod util;

use util::{init_with_context, live_handles};

// A descriptor rides an IPC pipe: the server passes the write end of an
// anonymous pipe to the client, the client adopts it and writes through it,
// and the bytes surface at the read end back in this process.
#[test]
fn descriptor_passing_end_to_end() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let sock_path = dir.path().join("ipc.sock");

    let (tunnel_read, tunnel_write) = pipe_pair(true, true).unwrap();
    let reader = ctx.new_pipe(false);
    ctx.pipe_open(reader, tunnel_read).unwrap();
    let aux = ctx.new_pipe(false);
    ctx.pipe_open(aux, tunnel_write).unwrap();

    let server = ctx.new_pipe(true);
    ctx.pipe_bind(server, &sock_path).unwrap();
    assert!(ctx
        .pipe_getsockname(server)
        .unwrap()
        .unwrap()
        .ip
        .ends_with("ipc.sock"));

    ctx.listen(server, 16, move |ctx, status| {
        status.unwrap();
        let conn = ctx.new_pipe(true);
        ctx.accept(server, conn).unwrap();
        ctx.write2(
            conn,
            "x",
            aux,
            Continuation::call(move |ctx, status: StreamStatus| {
                status.unwrap();
                ctx.close(conn, None).unwrap();
                ctx.close(server, None).unwrap();
                ctx.close(aux, None).unwrap();
            }),
        )
        .unwrap();
    })
    .unwrap();

    let client = ctx.new_pipe(true);
    ctx.pipe_connect(
        client,
        &sock_path,
        Continuation::call(move |ctx, status: StreamStatus| {
            status.unwrap();
            ctx.read_start(client, move |ctx, result| match result {
                Ok(Some(data)) => {
                    assert_eq!(data, b"x");
                    assert_eq!(ctx.pipe_pending_count(client).unwrap(), 1);
                    assert_eq!(ctx.pipe_pending_type(client).unwrap(), "pipe");
                    let adopted = ctx.new_pipe(false);
                    ctx.accept(client, adopted).unwrap();
                    ctx.write(
                        adopted,
                        "tunnel",
                        Continuation::call(move |ctx, status: StreamStatus| {
                            status.unwrap();
                            ctx.close(adopted, None).unwrap();
                            ctx.close(client, None).unwrap();
                        }),
                    )
                    .unwrap();
                }
                Ok(None) => {}
                Err(err) => panic!("client read error: {}", err),
            })
            .unwrap();
        }),
    )
    .unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    {
        let got = Rc::clone(&got);
        ctx.read_start(reader, move |ctx, result| match result {
            Ok(Some(chunk)) => {
                got.borrow_mut().extend_from_slice(&chunk);
                if got.borrow().as_slice() == b"tunnel" {
                    ctx.close(reader, None).unwrap();
                }
            }
            Ok(None) => ctx.close(reader, None).unwrap(),
            Err(err) => panic!("tunnel read error: {}", err),
        })
        .unwrap();
    }

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(got.borrow().as_slice(), b"tunnel");
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn write2_requires_an_ipc_pipe() {
    let mut ctx = init_with_context();
    let plain = ctx.new_pipe(false);
    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    ctx.pipe_open(plain, write_fd).unwrap();
    let aux = ctx.new_pipe(false);
    ctx.pipe_open(aux, read_fd).unwrap();

    assert!(matches!(
        ctx.write2(plain, "x", aux, Continuation::none()),
        Err(evio::Error::Arg { .. })
    ));

    ctx.close(plain, None).unwrap();
    ctx.close(aux, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}
