// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::sync::Once;

use evio::Context;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn init_with_context() -> Context {
    init();
    Context::new().expect("unable to create loop context")
}

/// Count the live (non-internal) handles the context still owns.
pub fn live_handles(ctx: &mut Context) -> usize {
    let mut count = 0;
    ctx.walk(|_, _| count += 1);
    count
}
