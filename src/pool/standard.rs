//! The standard in-process application pool.
//!
//! All pool state lives behind a single non-recursive mutex. Long
//! operations that must stay consistent with that state (the spawn call,
//! the restart-trigger check, the worker connect) run while holding the
//! lock; acquirers serialize on the same structure anyway, and the
//! invariant story stays simple. One condition variable signals capacity
//! changes to blocked acquirers; session release and the idle cleaner both
//! signal it.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::pool::cleaner;
use crate::pool::list::{Arena, Chain, Container, Handle, List};
use crate::pool::restart::needs_restart;
use crate::pool::{GetOptions, Pool, PoolConfig};
use crate::session::Session;
use crate::spawn::SpawnService;

/// Upper bound on acquisition retries after worker deaths.
const MAX_ATTEMPTS: u32 = 10;

/// Hard deadline for one `get` call. Authoritative: any wait or retry that
/// would continue past it yields `Busy` instead.
const GET_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest single condvar wait, so cancellation is observed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Point-in-time counters, exposed for tests and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of containers in the pool.
    pub count: u32,
    /// Containers with at least one outstanding session.
    pub active: u32,
    /// Containers in the inactive list (`count - active`).
    pub idle: u32,
    /// Number of app roots with at least one container.
    pub app_roots: u32,
}

pub(crate) struct PoolState {
    arena: Arena,
    /// Non-empty groups only, keyed by app root.
    groups: HashMap<String, List>,
    /// Zero-session containers ordered by `last_used` ascending.
    idle: List,
    count: u32,
    active: u32,
    max: u32,
    max_per_app: u32,
    max_idle: Duration,
    clean_interval: Duration,
    restart_mtimes: HashMap<String, SystemTime>,
    spawner: Box<dyn SpawnService>,
    shutdown: bool,
}

pub(crate) struct Shared {
    state: Mutex<PoolState>,
    /// Signalled whenever capacity may have been freed.
    capacity: Condvar,
    /// Wakes the cleaner early (shutdown, tests).
    pub(crate) cleaner_tick: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().expect("pool mutex poisoned")
    }
}

/// The pool described in the module docs: bounded worker reuse with
/// per-app caps, idle eviction, restart triggers, and transparent recovery
/// from worker deaths.
pub struct StandardPool {
    shared: Arc<Shared>,
    cleaner: Option<JoinHandle<()>>,
}

impl StandardPool {
    /// Create a pool around a spawn service and start the idle cleaner.
    pub fn new(spawner: Box<dyn SpawnService>, config: PoolConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                arena: Arena::new(),
                groups: HashMap::new(),
                idle: List::new(Chain::Idle),
                count: 0,
                active: 0,
                max: config.max,
                max_per_app: config.max_per_app,
                max_idle: config.max_idle,
                clean_interval: config.clean_interval,
                restart_mtimes: HashMap::new(),
                spawner,
                shutdown: false,
            }),
            capacity: Condvar::new(),
            cleaner_tick: Condvar::new(),
        });
        let cleaner = cleaner::spawn(shared.clone());
        Self {
            shared,
            cleaner: Some(cleaner),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let st = self.shared.lock();
        PoolStats {
            count: st.count,
            active: st.active,
            idle: st.idle.len(),
            app_roots: st.groups.len() as u32,
        }
    }

    /// Number of containers for one app root. Test hook.
    pub fn app_count(&self, app_root: &str) -> u32 {
        let st = self.shared.lock();
        st.app_count(app_root)
    }

    fn acquire(&self, opts: &GetOptions) -> Result<Session> {
        let app_root = opts.spawn.app_root.as_str();
        let deadline = Instant::now() + GET_TIMEOUT;
        let mut st = self.shared.lock();

        for attempt in 1..=MAX_ATTEMPTS {
            if opts.interrupt.is_interrupted() {
                return Err(Error::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(Error::Busy);
            }

            // Honor a pending restart trigger before touching the group.
            if st.groups.contains_key(app_root)
                && needs_restart(app_root, &mut st.restart_mtimes)
            {
                let dropped = PoolState::discard_group(&mut st, app_root);
                debug!(app_root, dropped, "restart trigger: discarded app group");
                if let Err(e) = st.spawner.reload(app_root) {
                    warn!(app_root, error = %e, "spawn service reload failed");
                }
                self.shared.capacity.notify_all();
            }

            let handle = if st.groups.contains_key(app_root) {
                PoolState::checkout_from_group(&mut st, opts)?
            } else {
                st = self.wait_for_capacity(st, opts, deadline)?;
                if st.count >= st.max {
                    PoolState::evict_oldest_idle(&mut st);
                }
                PoolState::spawn_container(&mut st, opts)?
            };

            // Account the session before connecting, so a concurrent
            // observer never sees a serving container marked idle.
            {
                let state: &mut PoolState = &mut st;
                let node = state.arena.node_mut(handle);
                if node.sessions == 0 {
                    if node.in_idle {
                        node.in_idle = false;
                        state.idle.unlink(&mut state.arena, handle);
                    }
                    state.active += 1;
                }
                state.arena.node_mut(handle).sessions += 1;
            }

            let worker = st.arena.node(handle).worker.clone();
            match worker.connect() {
                Ok(stream) => {
                    st.validate();
                    let pid = worker.pid();
                    let hook = release_hook(&self.shared, handle, worker);
                    trace!(app_root, pid, attempt, "session opened");
                    return Ok(Session::new(stream, pid, Some(hook)));
                }
                Err(err) => {
                    warn!(
                        app_root,
                        pid = worker.pid(),
                        attempt,
                        error = %err,
                        "worker died; discarding container"
                    );
                    PoolState::discard_poisoned(&mut st, handle);
                    self.shared.capacity.notify_all();
                    st.validate();
                    if attempt == MAX_ATTEMPTS {
                        return Err(err);
                    }
                }
            }
        }
        Err(Error::Busy)
    }

    /// Block until a new container for `opts` may be created.
    fn wait_for_capacity<'a>(
        &'a self,
        mut st: MutexGuard<'a, PoolState>,
        opts: &GetOptions,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, PoolState>> {
        loop {
            let per_app_ok =
                st.max_per_app == 0 || st.app_count(&opts.spawn.app_root) < st.max_per_app;
            if st.active < st.max && per_app_ok {
                return Ok(st);
            }
            if opts.interrupt.is_interrupted() {
                return Err(Error::Interrupted);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(app_root = %opts.spawn.app_root, "gave up waiting for capacity");
                return Err(Error::Busy);
            }
            let slice = WAIT_SLICE.min(deadline - now);
            let (guard, _) = self
                .shared
                .capacity
                .wait_timeout(st, slice)
                .expect("pool mutex poisoned");
            st = guard;
        }
    }
}

impl Pool for StandardPool {
    fn get(&self, opts: &GetOptions) -> Result<Session> {
        self.acquire(opts)
    }

    fn clear(&self) -> Result<()> {
        let mut st = self.shared.lock();
        let roots: Vec<String> = st.groups.keys().cloned().collect();
        for root in roots {
            PoolState::discard_group(&mut st, &root);
        }
        st.restart_mtimes.clear();
        debug!("pool cleared");
        self.shared.capacity.notify_all();
        st.validate();
        Ok(())
    }

    fn set_max(&self, max: u32) -> Result<()> {
        let mut st = self.shared.lock();
        st.max = max;
        self.shared.capacity.notify_all();
        Ok(())
    }

    fn set_max_per_app(&self, max_per_app: u32) -> Result<()> {
        let mut st = self.shared.lock();
        st.max_per_app = max_per_app;
        self.shared.capacity.notify_all();
        Ok(())
    }

    fn set_max_idle_time(&self, seconds: u64) -> Result<()> {
        let mut st = self.shared.lock();
        st.max_idle = Duration::from_secs(seconds);
        drop(st);
        // Let the cleaner re-evaluate with the new horizon.
        self.shared.cleaner_tick.notify_all();
        Ok(())
    }

    fn active(&self) -> Result<u32> {
        Ok(self.shared.lock().active)
    }

    fn count(&self) -> Result<u32> {
        Ok(self.shared.lock().count)
    }

    fn spawn_server_pid(&self) -> Result<i32> {
        Ok(self.shared.lock().spawner.server_pid())
    }
}

impl Drop for StandardPool {
    fn drop(&mut self) {
        {
            let mut st = self.shared.lock();
            st.shutdown = true;
        }
        self.shared.cleaner_tick.notify_all();
        if let Some(cleaner) = self.cleaner.take() {
            let _ = cleaner.join();
        }
    }
}

impl PoolState {
    fn app_count(&self, app_root: &str) -> u32 {
        self.groups.get(app_root).map_or(0, List::len)
    }

    /// Steps for an existing group: reuse the idle front, share the least
    /// loaded worker when capped, or grow the group.
    fn checkout_from_group(st: &mut PoolState, opts: &GetOptions) -> Result<Handle> {
        let app_root = opts.spawn.app_root.as_str();
        let group = st.groups.get_mut(app_root).expect("group disappeared");
        let front = group.front().expect("groups are never empty");

        if st.arena.node(front).sessions == 0 {
            // Reuse the most recently released worker.
            group.unlink(&mut st.arena, front);
            group.push_back(&mut st.arena, front);
            trace!(app_root, "reusing idle worker");
            return Ok(front);
        }

        let capped =
            st.count >= st.max || (st.max_per_app > 0 && group.len() >= st.max_per_app);
        if capped {
            // Every worker is busy and we may not grow: share the one with
            // the fewest outstanding sessions (stable on ties). The session
            // queues in the worker's own admission queue.
            let chosen = group
                .handles(&st.arena)
                .into_iter()
                .min_by_key(|&h| st.arena.node(h).sessions)
                .expect("groups are never empty");
            group.unlink(&mut st.arena, chosen);
            group.push_back(&mut st.arena, chosen);
            trace!(app_root, sessions = st.arena.node(chosen).sessions, "sharing busy worker");
            return Ok(chosen);
        }

        PoolState::spawn_container(st, opts)
    }

    /// Spawn a worker and insert a fresh container at the back of its
    /// group, creating the group if needed. On spawn failure the pool state
    /// is untouched.
    fn spawn_container(st: &mut PoolState, opts: &GetOptions) -> Result<Handle> {
        let worker = st.spawner.spawn_worker(&opts.spawn)?;
        let app_root = opts.spawn.app_root.clone();
        debug!(app_root = %app_root, pid = worker.pid(), "spawned worker");
        let handle = st.arena.insert(Container::new(worker, &app_root));
        st.groups
            .entry(app_root)
            .or_insert_with(|| List::new(Chain::Group))
            .push_back(&mut st.arena, handle);
        st.count += 1;
        Ok(handle)
    }

    /// Drop every container of one app group. Returns how many were
    /// discarded.
    fn discard_group(st: &mut PoolState, app_root: &str) -> u32 {
        let Some(group) = st.groups.remove(app_root) else {
            return 0;
        };
        let handles = group.handles(&st.arena);
        for &handle in &handles {
            let node = st.arena.node(handle);
            if node.in_idle {
                st.idle.unlink(&mut st.arena, handle);
            } else {
                debug_assert!(node.sessions > 0);
                st.active -= 1;
            }
            st.count -= 1;
            st.arena.remove(handle);
        }
        st.restart_mtimes.remove(app_root);
        handles.len() as u32
    }

    /// Evict the globally oldest idle container to make room for another
    /// app.
    fn evict_oldest_idle(st: &mut PoolState) {
        let Some(victim) = st.idle.front() else {
            return;
        };
        st.idle.unlink(&mut st.arena, victim);
        let app_root = st.arena.node(victim).app_root.clone();
        debug!(app_root = %app_root, pid = st.arena.node(victim).worker.pid(), "evicting oldest idle worker");
        let group = st.groups.get_mut(&app_root).expect("idle container without group");
        group.unlink(&mut st.arena, victim);
        if group.is_empty() {
            st.groups.remove(&app_root);
            st.restart_mtimes.remove(&app_root);
        }
        st.arena.remove(victim);
        st.count -= 1;
    }

    /// Remove a container whose worker failed mid-checkout. Inverts exactly
    /// the bookkeeping the current attempt performed: the attempt always
    /// left the container accounted active with our session added, so both
    /// counters come back down along with the container itself.
    fn discard_poisoned(st: &mut PoolState, handle: Handle) {
        let node = st.arena.node_mut(handle);
        debug_assert!(node.sessions > 0 && !node.in_idle);
        node.sessions -= 1;
        let app_root = node.app_root.clone();

        let group = st.groups.get_mut(&app_root).expect("poisoned container without group");
        group.unlink(&mut st.arena, handle);
        if group.is_empty() {
            st.groups.remove(&app_root);
            st.restart_mtimes.remove(&app_root);
        }
        st.arena.remove(handle);
        st.count -= 1;
        st.active -= 1;
    }

    /// Session-closed event.
    fn release(st: &mut PoolState, handle: Handle) -> bool {
        // The container may be gone: cleared, restarted or evicted while
        // the session was in flight. Stale handles no-op.
        let Some(node) = st.arena.get_mut(handle) else {
            return false;
        };
        node.last_used = Instant::now();
        debug_assert!(node.sessions > 0);
        node.sessions -= 1;
        if node.sessions > 0 {
            return false;
        }
        let app_root = node.app_root.clone();
        node.in_idle = true;

        // Freshly idle: preferred reuse target within its group, youngest
        // entry of the global idle list.
        let group = st.groups.get_mut(&app_root).expect("released container without group");
        group.unlink(&mut st.arena, handle);
        group.push_front(&mut st.arena, handle);
        st.idle.push_back(&mut st.arena, handle);
        st.active -= 1;
        true
    }

    #[cfg(debug_assertions)]
    fn validate(&self) {
        let mut count = 0u32;
        let mut active = 0u32;
        for (root, group) in &self.groups {
            assert!(!group.is_empty(), "empty group retained for {root}");
            let mut seen_serving = false;
            for handle in group.handles(&self.arena) {
                let node = self.arena.node(handle);
                assert_eq!(&node.app_root, root);
                count += 1;
                if node.sessions > 0 {
                    seen_serving = true;
                    active += 1;
                    assert!(!node.in_idle);
                } else {
                    assert!(!seen_serving, "idle container behind a serving one in {root}");
                    assert!(node.in_idle);
                }
            }
        }
        assert_eq!(self.count, count);
        assert_eq!(self.active, active);
        assert_eq!(self.idle.len(), self.count - self.active);
        assert_eq!(self.arena.len(), count as usize);

        let mut prev: Option<Instant> = None;
        for handle in self.idle.handles(&self.arena) {
            let node = self.arena.node(handle);
            assert_eq!(node.sessions, 0);
            assert!(node.in_idle);
            assert!(prev.is_none_or(|p| p <= node.last_used), "idle list out of order");
            prev = Some(node.last_used);
        }

        for root in self.restart_mtimes.keys() {
            assert!(self.groups.contains_key(root), "restart mtime for dead group {root}");
        }
    }

    #[cfg(not(debug_assertions))]
    fn validate(&self) {}
}

/// Build the hook a session fires on drop. Holds the worker alive for the
/// session's lifetime and a weak pool reference so sessions may outlive the
/// pool during shutdown.
fn release_hook(
    shared: &Arc<Shared>,
    handle: Handle,
    worker: Arc<crate::worker::Worker>,
) -> crate::session::ReleaseHook {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    Box::new(move || {
        let _keep_alive = worker;
        if let Some(shared) = weak.upgrade() {
            let mut st = shared.lock();
            if PoolState::release(&mut st, handle) {
                shared.capacity.notify_all();
            }
            st.validate();
        }
    })
}

pub(crate) mod cleaner_access {
    //! Narrow view of the pool state for the cleaner thread.

    use super::*;

    pub(crate) fn lock(shared: &Shared) -> MutexGuard<'_, PoolState> {
        shared.lock()
    }

    /// Wake acquirers blocked on capacity after a sweep freed some.
    pub(crate) fn notify_capacity(shared: &Shared) {
        shared.capacity.notify_all();
    }

    pub(crate) fn is_shutdown(st: &PoolState) -> bool {
        st.shutdown
    }

    pub(crate) fn clean_interval(st: &PoolState) -> Duration {
        st.clean_interval
    }

    /// Remove idle containers older than `max_idle`. Returns the number
    /// evicted.
    pub(crate) fn sweep(st: &mut PoolState) -> u32 {
        if st.max_idle.is_zero() {
            // An idle time of zero disables eviction.
            return 0;
        }
        let now = Instant::now();
        let mut evicted = 0;
        while let Some(front) = st.idle.front() {
            let age = now.duration_since(st.arena.node(front).last_used);
            if age <= st.max_idle {
                // The idle list is ordered oldest-first; the rest is newer.
                break;
            }
            debug!(
                app_root = %st.arena.node(front).app_root,
                pid = st.arena.node(front).worker.pid(),
                idle_secs = age.as_secs(),
                "evicting idle worker"
            );
            PoolState::evict_oldest_idle(st);
            evicted += 1;
        }
        if evicted > 0 {
            st.validate();
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Channel;
    use crate::spawn::{SpawnOptions, SpawnService};
    use crate::worker::{Worker, SESSION_COMMAND};
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
    use std::thread;

    /// Spawn service whose workers are in-process threads speaking the
    /// worker control protocol over a socketpair.
    struct ThreadSpawner {
        spawned: Arc<AtomicUsize>,
        next_pid: AtomicI32,
        fail: bool,
    }

    impl ThreadSpawner {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let spawned = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    spawned: spawned.clone(),
                    next_pid: AtomicI32::new(1000),
                    fail: false,
                },
                spawned,
            )
        }

        fn failing() -> Self {
            let (mut s, _) = Self::new();
            s.fail = true;
            s
        }
    }

    fn worker_main(mut control: Channel) {
        while let Ok(Some(frame)) = control.read_frame() {
            if frame[0] != SESSION_COMMAND {
                break;
            }
            let (mine, theirs) = UnixStream::pair().unwrap();
            if control.write_frame(&["ok"]).is_err() || control.send_fd(theirs.as_fd()).is_err() {
                break;
            }
            drop(theirs);
            thread::spawn(move || {
                use std::io::{Read, Write};
                let mut stream = mine;
                let mut buf = Vec::new();
                let _ = stream.read_to_end(&mut buf);
                let _ = stream.write_all(b"ok");
            });
        }
    }

    impl SpawnService for ThreadSpawner {
        fn spawn_worker(&mut self, opts: &SpawnOptions) -> Result<Worker> {
            if self.fail {
                return Err(Error::Spawn {
                    message: "refused".into(),
                    page: None,
                });
            }
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (ours, theirs) = Channel::pair().unwrap();
            thread::spawn(move || worker_main(theirs));
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            Ok(Worker::new(pid, &opts.app_root, ours))
        }

        fn reload(&mut self, _app_root: &str) -> Result<()> {
            Ok(())
        }

        fn server_pid(&self) -> i32 {
            1
        }
    }

    fn pool() -> (StandardPool, Arc<AtomicUsize>) {
        let (spawner, spawned) = ThreadSpawner::new();
        let config = PoolConfig {
            clean_interval: Duration::from_millis(50),
            ..PoolConfig::default()
        };
        (StandardPool::new(Box::new(spawner), config), spawned)
    }

    #[test]
    fn get_then_drop_keeps_the_worker() {
        let (pool, _) = pool();
        let session = pool.get(&GetOptions::new("/srv/a")).unwrap();
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.stats().count, 1);
        drop(session);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().count, 1);
    }

    #[test]
    fn reuse_avoids_a_second_spawn() {
        let (pool, spawned) = pool();
        drop(pool.get(&GetOptions::new("/srv/a")).unwrap());
        drop(pool.get(&GetOptions::new("/srv/a")).unwrap());
        assert_eq!(spawned.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().count, 1);
    }

    #[test]
    fn concurrent_sessions_use_two_workers() {
        let (pool, spawned) = pool();
        let s1 = pool.get(&GetOptions::new("/srv/a")).unwrap();
        let s2 = pool.get(&GetOptions::new("/srv/a")).unwrap();
        assert_eq!(spawned.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().active, 2);
        drop(s1);
        drop(s2);
    }

    #[test]
    fn spawn_failure_leaves_state_untouched() {
        let config = PoolConfig::default();
        let pool = StandardPool::new(Box::new(ThreadSpawner::failing()), config);
        let err = pool.get(&GetOptions::new("/srv/a")).unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
        assert_eq!(pool.stats(), PoolStats { count: 0, active: 0, idle: 0, app_roots: 0 });
    }

    #[test]
    fn clear_empties_everything() {
        let (pool, _) = pool();
        let held = pool.get(&GetOptions::new("/srv/a")).unwrap();
        drop(pool.get(&GetOptions::new("/srv/b")).unwrap());
        pool.clear().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.active, 0);
        assert_eq!(stats.app_roots, 0);
        // The held session must release without corrupting anything.
        drop(held);
        assert_eq!(pool.stats().count, 0);
    }

    #[test]
    fn interrupt_aborts_a_blocked_get() {
        let (pool, _) = pool();
        pool.set_max(1).unwrap();
        let _held = pool.get(&GetOptions::new("/srv/a")).unwrap();

        let interrupt = crate::pool::Interrupt::new();
        let opts = GetOptions::new("/srv/b").with_interrupt(interrupt.clone());
        let pool = Arc::new(pool);
        let pool2 = pool.clone();
        let t = thread::spawn(move || pool2.get(&opts).map(drop));
        thread::sleep(Duration::from_millis(150));
        interrupt.interrupt();
        let result = t.join().unwrap();
        assert!(matches!(result, Err(Error::Interrupted)));
    }
}
