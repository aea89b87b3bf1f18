use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::{LoopOption, RunMode};

mod util;

use util::{init_with_context, live_handles};

#[test]
fn idle_prepare_check_order() {
    let mut ctx = init_with_context();

    let order = Rc::new(RefCell::new(Vec::new()));
    let idle = ctx.new_idle();
    let prepare = ctx.new_prepare();
    let check = ctx.new_check();

    {
        let order = Rc::clone(&order);
        ctx.idle_start(idle, move |ctx| {
            order.borrow_mut().push("idle");
            ctx.idle_stop(idle).unwrap();
        })
        .unwrap();
    }
    {
        let order = Rc::clone(&order);
        ctx.prepare_start(prepare, move |ctx| {
            order.borrow_mut().push("prepare");
            ctx.prepare_stop(prepare).unwrap();
        })
        .unwrap();
    }
    {
        let order = Rc::clone(&order);
        ctx.check_start(check, move |ctx| {
            order.borrow_mut().push("check");
            ctx.check_stop(check).unwrap();
        })
        .unwrap();
    }

    ctx.run(RunMode::Once).unwrap();
    assert_eq!(order.borrow().as_slice(), &["idle", "prepare", "check"]);

    for h in [idle, prepare, check] {
        ctx.close(h, None).unwrap();
    }
    ctx.run(RunMode::NoWait).unwrap();
    assert_eq!(live_handles(&mut ctx), 0);
}

#[test]
fn walk_visits_all_handles() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    let idle = ctx.new_idle();

    let mut seen = Vec::new();
    ctx.walk(|ctx, h| seen.push(ctx.handle_type(h).unwrap()));
    seen.sort_by_key(|t| t.name());
    assert_eq!(seen, vec![evio::HandleType::Idle, evio::HandleType::Timer]);

    ctx.close(timer, None).unwrap();
    ctx.close(idle, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
}

#[test]
fn reentrant_run_is_refused() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    let inner = Rc::new(Cell::new(false));
    {
        let inner = Rc::clone(&inner);
        ctx.timer_start(timer, 1, 0, move |ctx| {
            assert_eq!(ctx.mode(), Some(RunMode::Default));
            inner.set(ctx.run(RunMode::NoWait).is_err());
            ctx.close(timer, None).unwrap();
        })
        .unwrap();
    }
    assert_eq!(ctx.mode(), None);
    ctx.run(RunMode::Default).unwrap();
    assert!(inner.get());
}

#[test]
fn stop_breaks_out() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    let fired = Rc::new(Cell::new(0u32));
    {
        let fired = Rc::clone(&fired);
        ctx.timer_start(timer, 1, 1, move |ctx| {
            fired.set(fired.get() + 1);
            ctx.stop();
        })
        .unwrap();
    }
    let more = ctx.run(RunMode::Default).unwrap();
    // The repeating timer is still armed; stop interrupted, not drained.
    assert!(more);
    assert_eq!(fired.get(), 1);
    ctx.close(timer, None).unwrap();
    ctx.run(RunMode::Default).unwrap();
}

#[test]
fn metrics_and_timeouts() {
    let mut ctx = init_with_context();
    ctx.configure(LoopOption::MetricsIdleTime(true)).unwrap();

    // Empty loop: no timer, nothing pending.
    assert_eq!(ctx.backend_timeout(), 0);
    assert!(ctx.backend_fd().is_some());

    let timer = ctx.new_timer();
    ctx.timer_start(timer, 50, 0, move |ctx| ctx.close(timer, None).unwrap())
        .unwrap();
    let timeout = ctx.backend_timeout();
    assert!(timeout > 0 && timeout <= 50);

    ctx.run(RunMode::Default).unwrap();
    let info = ctx.metrics_info();
    assert!(info.loop_count > 0);
    assert!(ctx.metrics_idle_time() > 0);
}

#[test]
fn uncaught_errors_reach_the_handler() {
    let mut ctx = init_with_context();
    let caught = Rc::new(RefCell::new(Vec::new()));
    {
        let caught = Rc::clone(&caught);
        ctx.set_uncaught_handler(move |msg| caught.borrow_mut().push(msg.to_string()));
    }

    let timer = ctx.new_timer();
    ctx.timer_start(timer, 1, 0, move |ctx| {
        ctx.close(timer, None).unwrap();
        panic!("callback exploded");
    })
    .unwrap();
    ctx.run(RunMode::Default).unwrap();

    let caught = caught.borrow();
    assert_eq!(caught.len(), 1);
    assert!(caught[0].contains("callback exploded"));
    assert!(caught[0].contains("traceback"));
}

#[test]
fn loop_close_refuses_live_handles() {
    let mut ctx = init_with_context();
    let timer = ctx.new_timer();
    assert_eq!(
        ctx.loop_close().unwrap_err().errno(),
        Some(evio::Errno::EBUSY)
    );
    ctx.close(timer, None).unwrap();
    ctx.run(RunMode::NoWait).unwrap();
    ctx.loop_close().unwrap();
}
