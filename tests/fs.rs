use std::cell::RefCell;
use std::rc::Rc;

use evio::{CoResume, CoState, Context, Continuation, Coroutine, FsResult, FsValue, RunMode};

mod util;

use util::init_with_context;

#[test]
fn sync_round_trip() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_str().unwrap().to_string();

    let sub = format!("{}/sub", base);
    ctx.fs_mkdir_sync(&sub, 0o755).unwrap();
    let stat = ctx.fs_stat_sync(&sub).unwrap();
    assert!(stat.is_directory);
    assert!(!stat.is_file);

    let file = format!("{}/data.txt", base);
    let fd = ctx.fs_open_sync(&file, "w", 0o644).unwrap() as i32;
    assert_eq!(ctx.fs_write_sync(fd, b"payload".to_vec(), -1).unwrap(), 7);
    ctx.fs_fsync_sync(fd).unwrap();
    ctx.fs_close_sync(fd).unwrap();

    let stat = ctx.fs_stat_sync(&file).unwrap();
    assert!(stat.is_file);
    assert_eq!(stat.size, 7);

    let fd = ctx.fs_open_sync(&file, "r", 0).unwrap() as i32;
    assert_eq!(ctx.fs_read_sync(fd, 64, 0).unwrap(), b"payload");
    ctx.fs_close_sync(fd).unwrap();

    let renamed = format!("{}/renamed.txt", base);
    ctx.fs_rename_sync(&file, &renamed).unwrap();

    let link = format!("{}/link", base);
    ctx.fs_symlink_sync(&renamed, &link).unwrap();
    assert_eq!(ctx.fs_readlink_sync(&link).unwrap(), renamed);
    let lstat = ctx.fs_lstat_sync(&link).unwrap();
    assert!(lstat.is_symbolic_link);

    let mut entries = ctx.fs_readdir_sync(&base).unwrap();
    entries.sort();
    assert_eq!(entries, vec!["link", "renamed.txt", "sub"]);

    ctx.fs_unlink_sync(&link).unwrap();
    ctx.fs_unlink_sync(&renamed).unwrap();
    ctx.fs_rmdir_sync(&sub).unwrap();
    assert!(ctx.fs_readdir_sync(&base).unwrap().is_empty());

    // Unknown open-mode strings are argument errors, not syscall errors.
    assert!(matches!(
        ctx.fs_open_sync(&file, "rw", 0),
        Err(evio::Error::Arg { .. })
    ));
}

#[test]
fn async_chain() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("async.txt");
    let path = path.to_str().unwrap().to_string();

    let read_back = Rc::new(RefCell::new(None));
    {
        let read_back = Rc::clone(&read_back);
        ctx.fs_open(
            &path,
            "w+",
            0o644,
            Continuation::call(move |ctx: &mut Context, result: FsResult| {
                let fd = match result.unwrap() {
                    FsValue::Int(fd) => fd as i32,
                    other => panic!("unexpected open result {:?}", other),
                };
                ctx.fs_write(
                    fd,
                    b"deep in the pool".to_vec(),
                    -1,
                    Continuation::call(move |ctx: &mut Context, result: FsResult| {
                        assert_eq!(result.unwrap(), FsValue::Int(16));
                        ctx.fs_read(
                            fd,
                            64,
                            0,
                            Continuation::call(move |ctx: &mut Context, result: FsResult| {
                                *read_back.borrow_mut() = Some(result.unwrap());
                                ctx.fs_close(fd, Continuation::none()).unwrap();
                            }),
                        )
                        .unwrap();
                    }),
                )
                .unwrap();
            }),
        )
        .unwrap();
    }

    ctx.run(RunMode::Default).unwrap();
    assert_eq!(
        read_back.borrow_mut().take().unwrap(),
        FsValue::Data(b"deep in the pool".to_vec())
    );
}

/// A minimal suspended micro-thread parked on one fs request.
struct StatWaiter {
    state: CoState,
    result: Rc<RefCell<Option<FsResult>>>,
}

impl Coroutine<FsResult> for StatWaiter {
    fn state(&self) -> CoState {
        self.state
    }

    fn resume(&mut self, _ctx: &mut Context, value: FsResult) -> CoResume {
        self.state = CoState::Done;
        *self.result.borrow_mut() = Some(value);
        CoResume::Return
    }
}

#[test]
fn coroutine_continuation() {
    let mut ctx = init_with_context();
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().to_str().unwrap().to_string();

    let result = Rc::new(RefCell::new(None));
    let co: Rc<RefCell<dyn Coroutine<FsResult>>> = Rc::new(RefCell::new(StatWaiter {
        state: CoState::Suspended,
        result: Rc::clone(&result),
    }));
    ctx.fs_stat(&base, Continuation::coroutine(Rc::clone(&co)).unwrap())
        .unwrap();
    ctx.run(RunMode::Default).unwrap();

    let stat = match result.borrow_mut().take().expect("coroutine resumed") {
        Ok(FsValue::Stat(stat)) => stat,
        other => panic!("unexpected stat result {:?}", other),
    };
    assert!(stat.is_directory);

    // A finished coroutine cannot be parked again.
    assert!(Continuation::coroutine(co).is_err());
}

#[test]
fn missing_path_projects_enoent() {
    let mut ctx = init_with_context();
    let err = ctx.fs_stat_sync("/definitely/not/here").unwrap_err();
    assert_eq!(err.errno(), Some(evio::Errno::ENOENT));
    assert_eq!(err.to_string(), "ENOENT: no such file or directory");
}
