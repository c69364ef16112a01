//! Background eviction of idle workers.
//!
//! One named thread per pool wakes every `clean_interval`, sweeps the
//! inactive list for containers idle longer than `max_idle`, and exits when
//! the pool signals shutdown. Shutdown is advisory: a signalled cleaner
//! still completes the pass it was woken for.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::pool::standard::{cleaner_access, Shared};

pub(crate) fn spawn(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("pool-cleaner".to_string())
        .spawn(move || run(shared))
        .expect("failed to spawn pool cleaner thread")
}

fn run(shared: Arc<Shared>) {
    trace!("pool cleaner started");
    let mut st = cleaner_access::lock(&shared);
    loop {
        let interval = cleaner_access::clean_interval(&st);
        let (guard, _) = shared
            .cleaner_tick
            .wait_timeout(st, interval)
            .expect("pool mutex poisoned");
        st = guard;

        let evicted = cleaner_access::sweep(&mut st);
        if evicted > 0 {
            debug!(evicted, "idle sweep finished");
            cleaner_access::notify_capacity(&shared);
        }

        if cleaner_access::is_shutdown(&st) {
            break;
        }
    }
    trace!("pool cleaner stopped");
}
