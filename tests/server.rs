//! End-to-end tests of the pool server and client over a real socket.

mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::tempdir;

use appool::error::Error;
use appool::pool::{GetOptions, Pool, PoolConfig, StandardPool};
use appool::server::{PoolClient, PoolServer};

use common::{StubHandles, run_request, stub_spawner};

/// Start a pool server on a fresh socket. The server thread runs until the
/// test process exits.
fn start_server() -> (Arc<StandardPool>, StubHandles, PoolClient, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let socket_path = dir.path().join("pool.sock");

    let (spawner, handles) = stub_spawner();
    let config = PoolConfig {
        clean_interval: Duration::from_millis(50),
        ..PoolConfig::default()
    };
    let pool = Arc::new(StandardPool::new(Box::new(spawner), config));

    let server = PoolServer::bind(pool.clone(), &socket_path).unwrap();
    thread::spawn(move || {
        let _ = server.run();
    });

    let client = PoolClient::connect(&socket_path).unwrap();
    (pool, handles, client, dir)
}

#[test]
fn get_over_the_wire_serves_a_request() {
    let (pool, _, client, _dir) = start_server();

    let mut session = client.get(&GetOptions::new("/srv/a")).unwrap();
    assert!(session.pid() >= 1000);
    assert_eq!(pool.stats().active, 1);

    assert_eq!(run_request(&mut session), "hello from /srv/a");

    // Dropping the client-side session tells the server to release; the
    // close exchange is synchronous, so the slot is free on return.
    drop(session);
    assert_eq!(pool.stats().active, 0);
    assert_eq!(pool.stats().count, 1);
}

#[test]
fn counters_and_caps_mirror_the_pool() {
    let (_pool, _, client, _dir) = start_server();

    assert_eq!(client.count().unwrap(), 0);
    assert_eq!(client.active().unwrap(), 0);
    assert_eq!(client.spawn_server_pid().unwrap(), 42);

    client.set_max(7).unwrap();
    client.set_max_per_app(2).unwrap();
    client.set_max_idle_time(300).unwrap();

    let session = client.get(&GetOptions::new("/srv/a")).unwrap();
    assert_eq!(client.count().unwrap(), 1);
    assert_eq!(client.active().unwrap(), 1);
    drop(session);
    assert_eq!(client.active().unwrap(), 0);

    client.clear().unwrap();
    assert_eq!(client.count().unwrap(), 0);
}

#[test]
fn spawn_errors_cross_the_wire_with_their_page() {
    let (_pool, handles, client, _dir) = start_server();
    handles
        .fail_next
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let err = client.get(&GetOptions::new("/srv/a")).unwrap_err();
    match err {
        Error::Spawn { message, page } => {
            assert!(message.contains("stub spawn refused"));
            assert!(page.unwrap().contains("stub error page"));
        }
        other => panic!("expected a spawn error, got {:?}", other),
    }

    // The connection survives the error.
    drop(client.get(&GetOptions::new("/srv/a")).unwrap());
}

#[test]
fn client_disconnect_releases_outstanding_sessions() {
    let (pool, _, client, dir) = start_server();

    let second = PoolClient::connect(dir.path().join("pool.sock")).unwrap();
    let session = second.get(&GetOptions::new("/srv/a")).unwrap();
    assert_eq!(pool.stats().active, 1);

    // Drop the client first so the session's close hook has nowhere to go;
    // the server must clean up when the connection closes.
    drop(second);
    drop(session);

    let deadline = Instant::now() + Duration::from_secs(2);
    while pool.stats().active != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(pool.stats().active, 0);
    drop(client);
}

#[test]
fn two_clients_share_one_pool() {
    let (pool, handles, client, dir) = start_server();
    let second = PoolClient::connect(dir.path().join("pool.sock")).unwrap();

    drop(client.get(&GetOptions::new("/srv/a")).unwrap());
    drop(second.get(&GetOptions::new("/srv/a")).unwrap());

    // The second client reused the worker the first one spawned.
    assert_eq!(handles.spawned.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(pool.stats().count, 1);
}
