//! Shared test support: a spawn service whose workers are in-process
//! threads speaking the worker control protocol over socketpairs.

// Each test binary uses a different subset of this module.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use appool::error::{Error, Result};
use appool::ipc::Channel;
use appool::spawn::{SpawnOptions, SpawnService};
use appool::worker::{SESSION_COMMAND, Worker};

/// Test-side controls for a [`StubSpawnService`].
#[derive(Clone)]
pub struct StubHandles {
    /// Total spawn requests served.
    pub spawned: Arc<AtomicUsize>,
    /// When set, the next spawn fails with a spawn error and error page.
    pub fail_next: Arc<AtomicBool>,
    /// One kill switch per spawned worker, in spawn order.
    pub kill_switches: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl StubHandles {
    /// Make every live worker refuse its next session request, simulating
    /// worker death.
    pub fn kill_all_workers(&self) {
        for switch in self.kill_switches.lock().unwrap().iter() {
            switch.store(true, Ordering::SeqCst);
        }
    }
}

/// In-process spawn service for tests.
pub struct StubSpawnService {
    handles: StubHandles,
    next_pid: AtomicI32,
}

/// Build a stub spawn service plus the handles tests use to observe and
/// steer it.
pub fn stub_spawner() -> (StubSpawnService, StubHandles) {
    let handles = StubHandles {
        spawned: Arc::new(AtomicUsize::new(0)),
        fail_next: Arc::new(AtomicBool::new(false)),
        kill_switches: Arc::new(Mutex::new(Vec::new())),
    };
    (
        StubSpawnService {
            handles: handles.clone(),
            next_pid: AtomicI32::new(1000),
        },
        handles,
    )
}

impl SpawnService for StubSpawnService {
    fn spawn_worker(&mut self, opts: &SpawnOptions) -> Result<Worker> {
        if self.handles.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Spawn {
                message: "stub spawn refused".into(),
                page: Some("<html><body>stub error page</body></html>".into()),
            });
        }
        self.handles.spawned.fetch_add(1, Ordering::SeqCst);

        let dead = Arc::new(AtomicBool::new(false));
        self.handles.kill_switches.lock().unwrap().push(dead.clone());

        let (ours, theirs) = Channel::pair().expect("socketpair");
        let app_root = opts.app_root.clone();
        thread::spawn(move || worker_main(theirs, &app_root, &dead));

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(Worker::new(pid, &opts.app_root, ours))
    }

    fn reload(&mut self, _app_root: &str) -> Result<()> {
        Ok(())
    }

    fn server_pid(&self) -> i32 {
        42
    }
}

/// Control loop of one stub worker. A tripped kill switch makes the worker
/// drop its control channel without answering, which the pool observes as
/// a dead worker.
fn worker_main(mut control: Channel, app_root: &str, dead: &AtomicBool) {
    while let Ok(Some(frame)) = control.read_frame() {
        if dead.load(Ordering::SeqCst) || frame[0] != SESSION_COMMAND {
            break;
        }
        let (mine, theirs) = UnixStream::pair().expect("socketpair");
        if control.write_frame(&["ok"]).is_err() || control.send_fd(theirs.as_fd()).is_err() {
            break;
        }
        drop(theirs);
        let body = format!("hello from {}", app_root);
        thread::spawn(move || serve_session(mine, &body));
    }
}

/// Read the request until the peer half-closes, then answer with `body`.
fn serve_session(mut stream: UnixStream, body: &str) {
    let mut request = Vec::new();
    let _ = stream.read_to_end(&mut request);
    let _ = stream.write_all(body.as_bytes());
}

/// Drive a session through a full request/response cycle and return the
/// response body.
pub fn run_request(session: &mut appool::session::Session) -> String {
    let headers = appool::session::encode_cgi_headers(&[
        ("REQUEST_METHOD", "GET"),
        ("REQUEST_URI", "/"),
    ]);
    session.send_headers(&headers).expect("send headers");
    session.shutdown_writer().expect("shutdown writer");
    let mut body = String::new();
    let mut stream = session.stream().expect("session stream open");
    stream.read_to_string(&mut body).expect("read response");
    body
}
