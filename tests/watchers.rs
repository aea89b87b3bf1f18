use std::cell::RefCell;
use std::rc::Rc;

use evio::{pipe_pair, RunMode};

mod util;

use util::init_with_context;

#[test]
fn poll_handle_reports_writable() {
    let mut ctx = init_with_context();

    let (read_fd, write_fd) = pipe_pair(true, true).unwrap();
    let poll = ctx.new_poll(write_fd).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        ctx.poll_start(poll, "w", move |ctx, result| {
            let events = result.unwrap();
            seen.borrow_mut().push(events.as_str());
            ctx.poll_stop(poll).unwrap();
            ctx.close(poll, None).unwrap();
        })
        .unwrap();
    }

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(seen.borrow().as_slice(), &["w"]);

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn fs_event_sees_creation() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_str().unwrap().to_string();

    let watcher = ctx.new_fs_event();
    let seen = Rc::new(RefCell::new(Vec::new()));
    {
        let seen = Rc::clone(&seen);
        ctx.fs_event_start(watcher, &base, false, move |ctx, event| {
            let (name, flags) = event.unwrap();
            assert!(flags.rename || flags.change);
            seen.borrow_mut().push(name);
            ctx.close(watcher, None).unwrap();
        })
        .unwrap();
    }

    let trigger = ctx.new_timer();
    let path = format!("{}/fresh.txt", base);
    ctx.timer_start(trigger, 10, 0, move |ctx| {
        let fd = ctx.fs_open_sync(&path, "w", 0o644).unwrap() as i32;
        ctx.fs_close_sync(fd).unwrap();
        ctx.close(trigger, None).unwrap();
    })
    .unwrap();

    ctx.run(RunMode::Default).unwrap();
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].as_deref(), Some("fresh.txt"));
}

#[test]
fn fs_poll_sees_size_change() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("polled.txt");
    let path = path.to_str().unwrap().to_string();

    let fd = ctx.fs_open_sync(&path, "w", 0o644).unwrap() as i32;
    ctx.fs_write_sync(fd, b"v1".to_vec(), -1).unwrap();
    ctx.fs_close_sync(fd).unwrap();

    let poller = ctx.new_fs_poll();
    let seen = Rc::new(RefCell::new(None));
    {
        let seen = Rc::clone(&seen);
        ctx.fs_poll_start(poller, &path, 20, move |ctx, event| {
            let (prev, curr) = event.unwrap();
            *seen.borrow_mut() = Some((prev.size, curr.size));
            ctx.close(poller, None).unwrap();
        })
        .unwrap();
    }
    assert_eq!(ctx.fs_poll_getpath(poller).unwrap(), path);

    let grower = ctx.new_timer();
    let path2 = path.clone();
    ctx.timer_start(grower, 40, 0, move |ctx| {
        let fd = ctx.fs_open_sync(&path2, "a", 0o644).unwrap() as i32;
        ctx.fs_write_sync(fd, b" and more".to_vec(), -1).unwrap();
        ctx.fs_close_sync(fd).unwrap();
        ctx.close(grower, None).unwrap();
    })
    .unwrap();

    ctx.run(RunMode::Default).unwrap();
    let (prev, curr) = seen.borrow_mut().take().expect("change reported");
    assert_eq!(prev, 2);
    assert_eq!(curr, 11);
}
