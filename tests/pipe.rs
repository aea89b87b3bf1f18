use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::{pipe_pair, Continuation, RunMode, StreamStatus};

mod util;

use util::init_with_context;

const PAYLOAD: usize = 256 * 1024;

#[test]
fn partial_write_backpressure() {
    let mut ctx = init_with_context();

    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    // Shrink the kernel buffer so one write cannot fit.
    unsafe {
        libc::fcntl(write_fd, libc::F_SETPIPE_SZ, 4096);
    }

    let reader = ctx.new_pipe(false);
    let writer = ctx.new_pipe(false);
    ctx.pipe_open(reader, read_fd).unwrap();
    ctx.pipe_open(writer, write_fd).unwrap();

    let completions = Rc::new(Cell::new(0u32));
    let received = Rc::new(Cell::new(0usize));

    let payload = vec![0xabu8; PAYLOAD];
    {
        let completions = Rc::clone(&completions);
        ctx.write(
            writer,
            payload,
            Continuation::call(move |ctx, status: StreamStatus| {
                status.unwrap();
                completions.set(completions.get() + 1);
                assert_eq!(ctx.write_queue_size(writer).unwrap(), 0);
                ctx.close(writer, None).unwrap();
            }),
        )
        .unwrap();
    }

    // The kernel buffer is smaller than the payload, so a tail must be
    // queued and the watcher armed.
    let queued = ctx.write_queue_size(writer).unwrap();
    assert!(queued > 0, "whole payload fit in the kernel buffer");
    assert!(queued < PAYLOAD);

    {
        let received = Rc::clone(&received);
        ctx.read_start(reader, move |ctx, result| match result {
            Ok(Some(chunk)) => {
                received.set(received.get() + chunk.len());
            }
            Ok(None) => ctx.close(reader, None).unwrap(),
            Err(err) => panic!("read error: {}", err),
        })
        .unwrap();
    }

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(completions.get(), 1);
    assert_eq!(received.get(), PAYLOAD);
}

#[test]
fn vectored_write_and_queue_invariant() {
    let mut ctx = init_with_context();

    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    let reader = ctx.new_pipe(false);
    let writer = ctx.new_pipe(false);
    ctx.pipe_open(reader, read_fd).unwrap();
    ctx.pipe_open(writer, write_fd).unwrap();

    let bufs: Vec<Vec<u8>> = vec![b"hello ".to_vec(), b"vectored ".to_vec(), b"world".to_vec()];
    let total: usize = bufs.iter().map(Vec::len).sum();

    let got = Rc::new(RefCell::new(Vec::new()));
    {
        let got = Rc::clone(&got);
        ctx.read_start(reader, move |ctx, result| match result {
            Ok(Some(chunk)) => {
                got.borrow_mut().extend_from_slice(&chunk);
                if got.borrow().len() == total {
                    ctx.close(reader, None).unwrap();
                }
            }
            Ok(None) => ctx.close(reader, None).unwrap(),
            Err(err) => panic!("read error: {}", err),
        })
        .unwrap();
    }
    ctx.write(
        writer,
        bufs,
        Continuation::call(move |ctx, status: StreamStatus| {
            status.unwrap();
            ctx.close(writer, None).unwrap();
        }),
    )
    .unwrap();

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(got.borrow().as_slice(), b"hello vectored world");
}

#[test]
fn cancelled_writes_on_close() {
    let mut ctx = init_with_context();

    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    unsafe {
        libc::fcntl(write_fd, libc::F_SETPIPE_SZ, 4096);
    }
    let writer = ctx.new_pipe(false);
    ctx.pipe_open(writer, write_fd).unwrap();

    // Nobody reads; the tail stays queued until close cancels it.
    let status = Rc::new(RefCell::new(None));
    {
        let status = Rc::clone(&status);
        ctx.write(
            writer,
            vec![0u8; PAYLOAD],
            Continuation::call(move |_, result: StreamStatus| {
                *status.borrow_mut() = Some(result);
            }),
        )
        .unwrap();
    }
    assert!(ctx.write_queue_size(writer).unwrap() > 0);

    let closed = Rc::new(Cell::new(false));
    {
        let closed = Rc::clone(&closed);
        ctx.close(writer, Some(Box::new(move |_| closed.set(true))))
            .unwrap();
    }
    ctx.run(RunMode::Default).unwrap();

    // The write completion fired exactly once, with the cancellation
    // status, before the close callback.
    let result = status.borrow_mut().take().expect("completion fired");
    assert_eq!(result.unwrap_err(), evio::Errno::ECANCELED);
    assert!(closed.get());

    unsafe {
        libc::close(read_fd);
    }
}

#[test]
fn try_write_never_queues() {
    let mut ctx = init_with_context();

    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    unsafe {
        libc::fcntl(write_fd, libc::F_SETPIPE_SZ, 4096);
    }
    let writer = ctx.new_pipe(false);
    ctx.pipe_open(writer, write_fd).unwrap();

    let mut sent = 0;
    loop {
        match ctx.try_write(writer, vec![0x55u8; 4096]) {
            Ok(n) => sent += n,
            Err(err) => {
                assert_eq!(err.errno(), Some(evio::Errno::EAGAIN));
                break;
            }
        }
    }
    assert!(sent > 0);
    assert_eq!(ctx.write_queue_size(writer).unwrap(), 0);

    ctx.close(writer, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
    unsafe {
        libc::close(read_fd);
    }
}
