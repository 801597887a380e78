//! TcpClient end-to-end tests: echo round trip, graceful disconnect,
//! connect retry with backoff.

use std::net::TcpListener;
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::{Duration, Instant};

use muxio::{LoopThread, TcpClient, TcpServer};

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn client_echo_and_graceful_shutdown() {
    init_logging();
    let boss = LoopThread::start("cli-echo-boss").unwrap();
    let server = TcpServer::new(boss.handle(), "cli-echo", "tcp://127.0.0.1:0", 1).unwrap();
    server.set_on_message(Arc::new(|conn, buf, _| {
        let data = buf.next_all().to_vec();
        let _ = conn.write(&data);
    }));
    server.start().unwrap();

    let client_loop = LoopThread::start("cli-echo-client").unwrap();
    let client = TcpClient::new(
        client_loop.handle(),
        &format!("tcp://{}", server.local_addr()),
    )
    .unwrap();

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    client.set_on_connect(Arc::new(|conn| {
        if conn.is_connected() {
            let _ = conn.write(b"ping");
        }
    }));
    let received2 = received.clone();
    client.set_on_message(Arc::new(move |conn, buf, _| {
        received2.lock().unwrap().extend_from_slice(buf.next_all());
        // Half-close once the echo came back; the server observes EOF and
        // tears the connection down, which bounces back to us as EOF too.
        conn.shutdown_write();
    }));
    client.connect();

    assert!(wait_until(Duration::from_secs(5), || {
        received.lock().unwrap().as_slice() == b"ping"
    }));
    assert!(wait_until(Duration::from_secs(5), || {
        client.connection().is_none()
    }));

    server.stop();
    boss.stop();
    client_loop.stop();
}

#[test]
fn connect_retries_with_backoff_until_listener_appears() {
    init_logging();
    // Reserve a port, then release it so the first attempts are refused.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client_loop = LoopThread::start("retry-client").unwrap();
    let client = TcpClient::new(client_loop.handle(), &format!("tcp://127.0.0.1:{port}")).unwrap();

    let connected_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let connected_at2 = connected_at.clone();
    client.set_on_connect(Arc::new(move |conn| {
        if conn.is_connected() {
            *connected_at2.lock().unwrap() = Some(Instant::now());
        }
    }));

    let start = Instant::now();
    client.connect();

    // Attempts at ~0 ms and ~500 ms fail; the listener comes up before the
    // ~1.5 s attempt, which succeeds.
    thread::sleep(Duration::from_millis(600));
    let _listener = TcpListener::bind(("127.0.0.1", port)).unwrap();

    assert!(wait_until(Duration::from_secs(10), || {
        connected_at.lock().unwrap().is_some()
    }));
    let elapsed = connected_at.lock().unwrap().unwrap() - start;
    assert!(
        elapsed >= Duration::from_millis(1300),
        "connected too early for 500ms/1s backoff: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(3400),
        "connected too late: {elapsed:?}"
    );

    client.stop();
    client_loop.stop();
}

#[test]
fn stop_cancels_a_pending_retry() {
    init_logging();
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let client_loop = LoopThread::start("stop-client").unwrap();
    let client = TcpClient::new(client_loop.handle(), &format!("tcp://127.0.0.1:{port}")).unwrap();

    let connected = Arc::new(Mutex::new(false));
    let connected2 = connected.clone();
    client.set_on_connect(Arc::new(move |conn| {
        if conn.is_connected() {
            *connected2.lock().unwrap() = true;
        }
    }));
    client.connect();
    thread::sleep(Duration::from_millis(100));
    client.stop();

    // Even with the listener up, the canceled retry never dials.
    let _listener = TcpListener::bind(("127.0.0.1", port)).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert!(!*connected.lock().unwrap());

    client_loop.stop();
}

#[test]
fn retry_reconnects_after_the_server_drops_the_connection() {
    init_logging();
    let boss = LoopThread::start("recon-boss").unwrap();
    let server = TcpServer::new(boss.handle(), "recon", "tcp://127.0.0.1:0", 1).unwrap();
    // Server half-closes every connection as soon as it is up.
    server.set_on_connect(Arc::new(|conn| {
        if conn.is_connected() {
            conn.shutdown_write();
        }
    }));
    server.start().unwrap();

    let client_loop = LoopThread::start("recon-client").unwrap();
    let client = TcpClient::new(
        client_loop.handle(),
        &format!("tcp://{}", server.local_addr()),
    )
    .unwrap();
    client.set_retry(true);

    let established = Arc::new(Mutex::new(0u32));
    let established2 = established.clone();
    client.set_on_connect(Arc::new(move |conn| {
        if conn.is_connected() {
            *established2.lock().unwrap() += 1;
            // Answer the server's FIN with our own so the teardown finishes.
            conn.shutdown_write();
        }
    }));
    client.connect();

    assert!(wait_until(Duration::from_secs(10), || {
        *established.lock().unwrap() >= 2
    }));

    client.stop();
    server.stop();
    boss.stop();
    client_loop.stop();
}
