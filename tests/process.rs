use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Mutex;

use evio::{Continuation, RunMode, SpawnOptions, StdioEntry, StreamStatus};

mod util;

use util::{init_with_context, live_handles};

// Child-exit routing is per-process state; run these one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> std::sync::MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[test]
fn spawn_with_stdio_pipes() {
    let _guard = serial();
    let mut ctx = init_with_context();

    let stdin_pipe = ctx.new_pipe(false);
    let stdout_pipe = ctx.new_pipe(false);

    let exit = Rc::new(Cell::new(None));
    let (child, pid) = {
        let exit = Rc::clone(&exit);
        ctx.spawn(
            "tr",
            SpawnOptions {
                args: vec!["a-z".to_string(), "A-Z".to_string()],
                stdio: vec![
                    StdioEntry::Stream(stdin_pipe),
                    StdioEntry::Stream(stdout_pipe),
                    StdioEntry::Ignore,
                ],
                ..Default::default()
            },
            move |_, status, signal| {
                exit.set(Some((status, signal)));
            },
        )
        .unwrap()
    };
    assert!(pid > 0);
    assert_eq!(ctx.process_get_pid(child).unwrap(), pid);

    let output = Rc::new(RefCell::new(Vec::new()));
    {
        let output = Rc::clone(&output);
        ctx.read_start(stdout_pipe, move |ctx, result| match result {
            Ok(Some(chunk)) => output.borrow_mut().extend_from_slice(&chunk),
            Ok(None) => ctx.close(stdout_pipe, None).unwrap(),
            Err(err) => panic!("stdout read error: {}", err),
        })
        .unwrap();
    }
    ctx.write(stdin_pipe, "hello\n", Continuation::none()).unwrap();
    ctx.shutdown(
        stdin_pipe,
        Continuation::call(move |ctx, status: StreamStatus| {
            status.unwrap();
            ctx.close(stdin_pipe, None).unwrap();
        }),
    )
    .unwrap();

    ctx.run(RunMode::Default).unwrap();

    assert_eq!(exit.get(), Some((0, 0)));
    assert_eq!(output.borrow().as_slice(), b"HELLO\n");

    ctx.close(child, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn kill_reports_term_signal() {
    let _guard = serial();
    let mut ctx = init_with_context();

    let exit = Rc::new(Cell::new(None));
    let (child, _pid) = {
        let exit = Rc::clone(&exit);
        ctx.spawn(
            "sleep",
            SpawnOptions {
                args: vec!["10".to_string()],
                ..Default::default()
            },
            move |_, status, signal| {
                exit.set(Some((status, signal)));
            },
        )
        .unwrap()
    };
    ctx.process_kill(child, "TERM".into()).unwrap();
    ctx.run(RunMode::Default).unwrap();

    assert_eq!(exit.get(), Some((0, libc::SIGTERM)));
    ctx.close(child, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn spawn_missing_program_fails() {
    let _guard = serial();
    let mut ctx = init_with_context();
    let err = ctx
        .spawn(
            "/definitely/not/a/real/binary",
            SpawnOptions::default(),
            |_, _, _| {},
        )
        .unwrap_err();
    assert_eq!(err.errno(), Some(evio::Errno::ENOENT));
}
