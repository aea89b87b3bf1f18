use std::cell::{Cell, RefCell};
use std::rc::Rc;

use evio::{RunMode, Value};

mod util;

use util::init_with_context;

#[test]
fn queue_and_after_work() {
    let mut ctx = init_with_context();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let work = {
        let seen = Rc::clone(&seen);
        ctx.new_work(
            |env, args| {
                assert!(env.thread);
                let n = args[0].as_int().expect("first argument is a number");
                let s = args[1].as_str().expect("second argument is a string");
                let mut s = String::from_utf8(s.to_vec()).unwrap();
                s.push('!');
                Ok(vec![Value::Int(n + 1), Value::from(s)])
            },
            move |_, result| {
                seen.borrow_mut().push(result);
            },
        )
    };

    // Two back-to-back rounds through the same context; nothing leaks
    // between them.
    for _ in 0..2 {
        assert!(ctx.queue_work(work, vec![Value::Int(41), Value::from("hi")]).unwrap());
        ctx.run(RunMode::Default).unwrap();
    }

    let seen = seen.borrow();
    assert_eq!(seen.len(), 2);
    for result in seen.iter() {
        let values = result.as_ref().expect("work succeeded");
        assert_eq!(values[0], Value::Int(42));
        assert_eq!(values[1], Value::from("hi!"));
    }
}

#[test]
fn worker_error_never_kills_the_loop() {
    let mut ctx = init_with_context();

    let seen = Rc::new(RefCell::new(None));
    let work = {
        let seen = Rc::clone(&seen);
        ctx.new_work(
            |_, _| Err("entry is not callable here".to_string()),
            move |_, result| {
                *seen.borrow_mut() = Some(result);
            },
        )
    };
    ctx.queue_work(work, vec![]).unwrap();
    ctx.run(RunMode::Default).unwrap();

    let result = seen.borrow_mut().take().expect("after-work ran");
    assert!(result.unwrap_err().contains("not callable"));
}

#[test]
fn worker_panic_is_contained() {
    let mut ctx = init_with_context();

    let seen = Rc::new(RefCell::new(None));
    let work = {
        let seen = Rc::clone(&seen);
        ctx.new_work(
            |_, _| panic!("boom in the pool"),
            move |_, result| {
                *seen.borrow_mut() = Some(result);
            },
        )
    };
    ctx.queue_work(work, vec![]).unwrap();
    ctx.run(RunMode::Default).unwrap();

    let result = seen.borrow_mut().take().expect("after-work ran");
    assert!(result.unwrap_err().contains("boom"));
}

#[test]
fn argument_cap_enforced() {
    let mut ctx = init_with_context();
    let work = ctx.new_work(|_, _| Ok(vec![]), |_, _| {});
    let too_many: Vec<Value> = (0..10).map(Value::Int).collect();
    assert!(ctx.queue_work(work, too_many).is_err());
    ctx.release_work(work).unwrap();
}

#[test]
fn completions_keep_submission_values_intact() {
    let mut ctx = init_with_context();

    let seen = Rc::new(Cell::new(0u32));
    let work = {
        let seen = Rc::clone(&seen);
        ctx.new_work(
            |_, args| Ok(args.to_vec()),
            move |_, result| {
                let values = result.unwrap();
                assert_eq!(
                    values,
                    vec![
                        Value::Nil,
                        Value::Bool(true),
                        Value::Num(1.5),
                        Value::from("bytes"),
                    ]
                );
                seen.set(seen.get() + 1);
            },
        )
    };
    ctx.queue_work(
        work,
        vec![
            Value::Nil,
            Value::Bool(true),
            Value::Num(1.5),
            Value::from("bytes"),
        ],
    )
    .unwrap();
    ctx.run(RunMode::Default).unwrap();
    assert_eq!(seen.get(), 1);
}
