use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use evio::RunMode;

mod util;

use util::{init_with_context, live_handles};

#[test]
fn one_shot_and_repeat() {
    let mut ctx = init_with_context();

    let one_shot_fired = Rc::new(Cell::new(0u32));
    let one_shot_closed = Rc::new(Cell::new(0u32));
    for i in 0..10u64 {
        let timer = ctx.new_timer();
        let fired = Rc::clone(&one_shot_fired);
        let closed = Rc::clone(&one_shot_closed);
        ctx.timer_start(timer, i * 50, 0, move |ctx| {
            fired.set(fired.get() + 1);
            let closed = Rc::clone(&closed);
            ctx.close(
                timer,
                Some(Box::new(move |_| closed.set(closed.get() + 1))),
            )
            .unwrap();
        })
        .unwrap();
    }

    let repeat_fired = Rc::new(Cell::new(0u32));
    let repeat_closed = Rc::new(Cell::new(0u32));
    let repeater = ctx.new_timer();
    {
        let fired = Rc::clone(&repeat_fired);
        let closed = Rc::clone(&repeat_closed);
        ctx.timer_start(repeater, 100, 100, move |ctx| {
            fired.set(fired.get() + 1);
            if fired.get() == 5 {
                let closed = Rc::clone(&closed);
                ctx.close(
                    repeater,
                    Some(Box::new(move |_| closed.set(closed.get() + 1))),
                )
                .unwrap();
            }
        })
        .unwrap();
    }

    // Started, stopped, unreferenced: must neither fire nor keep the loop
    // alive.
    let never = ctx.new_timer();
    let never_fired = Rc::new(Cell::new(0u32));
    {
        let fired = Rc::clone(&never_fired);
        ctx.timer_start(never, 100, 100, move |_| fired.set(fired.get() + 1))
            .unwrap();
    }
    ctx.timer_stop(never).unwrap();
    ctx.unref_handle(never).unwrap();

    let start = Instant::now();
    let more = ctx.run(RunMode::Default).unwrap();

    assert!(!more);
    assert!(start.elapsed().as_millis() >= 500);
    assert_eq!(one_shot_fired.get(), 10);
    assert_eq!(one_shot_closed.get(), 10);
    assert_eq!(repeat_fired.get(), 5);
    assert_eq!(repeat_closed.get(), 1);
    assert_eq!(never_fired.get(), 0);

    // Only the stopped timer is still around.
    assert_eq!(live_handles(&mut ctx), 1);
    ctx.close(never, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn repeat_accessors_and_again() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();

    // `again` before any start has no callback to fire.
    assert!(ctx.timer_again(timer).is_err());

    let fired = Rc::new(Cell::new(0u32));
    {
        let fired = Rc::clone(&fired);
        ctx.timer_start(timer, 10, 20, move |ctx| {
            fired.set(fired.get() + 1);
            if fired.get() == 2 {
                ctx.close(timer, None).unwrap();
            }
        })
        .unwrap();
    }
    assert_eq!(ctx.timer_get_repeat(timer).unwrap(), 20);
    ctx.timer_set_repeat(timer, 30).unwrap();
    assert_eq!(ctx.timer_get_repeat(timer).unwrap(), 30);
    assert!(ctx.timer_get_due_in(timer).unwrap() <= 10);

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(fired.get(), 2);
}

#[test]
fn stop_inside_callback() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    let fired = Rc::new(Cell::new(0u32));
    {
        let fired = Rc::clone(&fired);
        ctx.timer_start(timer, 1, 1, move |ctx| {
            fired.set(fired.get() + 1);
            ctx.timer_stop(timer).unwrap();
        })
        .unwrap();
    }
    ctx.run(RunMode::Default).unwrap();
    assert_eq!(fired.get(), 1);
    ctx.close(timer, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn run_once_and_nowait() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    let fired = Rc::new(Cell::new(0u32));
    {
        let fired = Rc::clone(&fired);
        ctx.timer_start(timer, 20, 0, move |ctx| {
            fired.set(fired.get() + 1);
            ctx.close(timer, None).unwrap();
        })
        .unwrap();
    }
    // NoWait polls without blocking; the timer is not due yet.
    ctx.run(RunMode::NoWait).unwrap();
    assert_eq!(fired.get(), 0);
    // Once blocks until the timer fires.
    while fired.get() == 0 {
        ctx.run(RunMode::Once).unwrap();
    }
    assert_eq!(fired.get(), 1);
    assert!(!ctx.loop_alive());
}
