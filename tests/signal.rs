use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::RunMode;

mod util;

use util::init_with_context;

fn raise_self(signum: i32) {
    unsafe {
        libc::kill(libc::getpid(), signum);
    }
}

#[test]
fn watch_and_fire() {
    let mut ctx = init_with_context();

    let watcher = ctx.new_signal();
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        ctx.signal_start(watcher, "SIGUSR1".into(), move |ctx, name| {
            seen.borrow_mut().push(name);
            ctx.close(watcher, None).unwrap();
        })
        .unwrap();
    }

    let kicker = ctx.new_timer();
    ctx.timer_start(kicker, 10, 0, move |ctx| {
        raise_self(libc::SIGUSR1);
        ctx.close(kicker, None).unwrap();
    })
    .unwrap();

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(seen.borrow().as_slice(), &["SIGUSR1"]);
}

#[test]
fn oneshot_stops_itself() {
    let mut ctx = init_with_context();

    // A long-lived watcher keeps the disposition owned while the oneshot
    // comes and goes; it also drives the second raise.
    let keeper = ctx.new_signal();
    let keeper_fired = Rc::new(Cell::new(0u32));
    let oneshot = ctx.new_signal();
    let oneshot_fired = Rc::new(Cell::new(0u32));

    {
        let fired = Rc::clone(&oneshot_fired);
        ctx.signal_start_oneshot(oneshot, "usr2".into(), move |_, name| {
            assert_eq!(name, "SIGUSR2");
            fired.set(fired.get() + 1);
        })
        .unwrap();
    }
    {
        let fired = Rc::clone(&keeper_fired);
        ctx.signal_start(keeper, "SIGUSR2".into(), move |ctx, _| {
            fired.set(fired.get() + 1);
            match fired.get() {
                1 => raise_self(libc::SIGUSR2),
                _ => {
                    ctx.close(keeper, None).unwrap();
                    ctx.close(oneshot, None).unwrap();
                }
            }
        })
        .unwrap();
    }

    let kicker = ctx.new_timer();
    ctx.timer_start(kicker, 10, 0, move |ctx| {
        raise_self(libc::SIGUSR2);
        ctx.close(kicker, None).unwrap();
    })
    .unwrap();

    ctx.run(RunMode::Default).unwrap();

    // Two deliveries total; the oneshot stopped itself after the first.
    assert_eq!(keeper_fired.get(), 2);
    assert_eq!(oneshot_fired.get(), 1);
}

#[test]
fn bad_names_are_argument_errors() {
    let mut ctx = init_with_context();
    let watcher = ctx.new_signal();
    assert!(matches!(
        ctx.signal_start(watcher, "SIGNOPE".into(), |_, _| {}),
        Err(evio::Error::Arg { .. })
    ));
    ctx.close(watcher, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}
