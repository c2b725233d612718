//! End-to-end scenarios that only make sense with the full stack wired
//! together: a real listening socket, a worker pool, and real client
//! connections. Unit coverage for individual pieces (Channel dispatch order,
//! TimerQueue cancellation, ConsistentHash invariants, ...) lives alongside
//! each module instead.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor::event_loop::EventLoop;
use reactor::inet_addr::InetAddr;
use reactor::tcp_server::{ServerOptions, TcpServer};

fn any_loopback_addr() -> InetAddr {
    InetAddr::new("127.0.0.1:0".parse().unwrap())
}

#[test]
fn echo_round_trip_through_a_multi_worker_server() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let server = TcpServer::new(
        handle,
        any_loopback_addr(),
        "it-echo",
        ServerOptions::default().thread_num(2),
    );
    server.set_message_callback(|conn, buf, _ts| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });
    server.start();
    let bound = server.local_addr().expect("local_addr").socket_addr();

    let driver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let joins: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(bound).expect("connect");
                    let msg = format!("hello-{i}");
                    stream.write_all(msg.as_bytes()).unwrap();
                    let mut buf = vec![0u8; msg.len()];
                    stream.read_exact(&mut buf).expect("echo");
                    assert_eq!(buf, msg.as_bytes());
                })
            })
            .collect();
        for j in joins {
            j.join().unwrap();
        }
        handle.quit();
    });

    loop_.run();
    driver.join().unwrap();
}

#[test]
fn connection_callback_observes_connect_then_disconnect() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let server = TcpServer::new(
        handle,
        any_loopback_addr(),
        "it-disconnect",
        ServerOptions::default(),
    );
    let events = Arc::new(Mutex::new(Vec::new()));
    let events2 = events.clone();
    server.set_connection_callback(move |conn| {
        events2.lock().unwrap().push(conn.connected());
    });
    server.start();
    let bound = server.local_addr().expect("local_addr").socket_addr();

    let driver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        {
            let _stream = TcpStream::connect(bound).expect("connect");
            // Dropped immediately: the server observes the client hang up.
        }
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    loop_.run();
    driver.join().unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events.as_slice(),
        &[true, false],
        "expected one connect then one disconnect notification"
    );
}

#[test]
fn high_water_mark_callback_fires_at_most_once_per_crossing() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let server = TcpServer::new(
        handle,
        any_loopback_addr(),
        "it-backpressure",
        ServerOptions::default().high_water_mark(1024),
    );
    let crossings = Arc::new(AtomicUsize::new(0));
    let crossings2 = crossings.clone();
    server.set_high_water_mark_callback(move |_conn, _size| {
        crossings2.fetch_add(1, Ordering::SeqCst);
    });
    // Echo every byte straight back: with the client not reading, the
    // server's own output buffer is what grows past `high_water_mark`.
    server.set_message_callback(|conn, buf, _ts| {
        let data = buf.retrieve_all_as_bytes();
        conn.send(&data);
    });
    server.start();
    let bound = server.local_addr().expect("local_addr").socket_addr();

    let driver = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut stream = TcpStream::connect(bound).expect("connect");
        // Push far more than the high-water-mark and never read the echo
        // back, so the server's output buffer is forced to grow.
        let chunk = vec![7u8; 512 * 1024];
        let _ = stream.write_all(&chunk);
        thread::sleep(Duration::from_millis(100));
        handle.quit();
    });

    loop_.run();
    driver.join().unwrap();
    assert!(
        crossings.load(Ordering::SeqCst) >= 1,
        "expected at least one high-water-mark crossing when flooding a 1KiB mark with 512KiB"
    );
}

#[test]
fn repeating_timer_fires_multiple_times_before_quit() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let ticks = Arc::new(AtomicUsize::new(0));
    let ticks2 = ticks.clone();
    loop_.run_every(Duration::from_millis(10), move || {
        ticks2.fetch_add(1, Ordering::SeqCst);
    });

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(55));
        handle.quit();
    });

    loop_.run();
    quitter.join().unwrap();

    assert!(
        ticks.load(Ordering::SeqCst) >= 3,
        "expected several repeating-timer fires within 55ms at a 10ms interval, got {}",
        ticks.load(Ordering::SeqCst)
    );
}

#[test]
fn timer_cancelled_before_it_fires_never_runs() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let id = loop_.run_after(Duration::from_millis(30), move || {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    loop_.cancel_timer(id);

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        handle.quit();
    });
    loop_.run();
    quitter.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn repeating_timer_can_cancel_itself_from_within_its_own_callback() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let fires = Arc::new(AtomicUsize::new(0));
    let fires2 = fires.clone();
    let id_slot: Arc<Mutex<Option<reactor::TimerId>>> = Arc::new(Mutex::new(None));
    let id_slot2 = id_slot.clone();

    let id = loop_.run_every(Duration::from_millis(10), move || {
        fires2.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = *id_slot2.lock().unwrap() {
            // Cancelling while this very timer is in the batch `handle_read`
            // is currently dispatching must still stop it from re-arming.
            handle.cancel_timer(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        handle.quit();
    });
    loop_.run();
    quitter.join().unwrap();

    assert_eq!(
        fires.load(Ordering::SeqCst),
        1,
        "self-cancel from within the firing callback must prevent any further fires"
    );
}

#[test]
fn cross_thread_quit_terminates_a_multi_worker_server_cleanly() {
    let loop_ = EventLoop::new().expect("EventLoop::new");
    let handle = loop_.handle();
    let server = TcpServer::new(
        handle,
        any_loopback_addr(),
        "it-quit",
        ServerOptions::default().thread_num(3),
    );
    server.start();
    assert!(!handle.is_looping());

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(30));
        handle.quit();
    });

    loop_.run();
    quitter.join().unwrap();
    assert!(!handle.is_looping());
}
