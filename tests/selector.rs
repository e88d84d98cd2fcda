//! Exercises the raw selector API: permits, cancellation, deadlines, scope
//! checks and shutdown draining.

use std::os::unix::io::AsRawFd;
use std::thread;
use std::time::{Duration, Instant};

use futures::executor::block_on;
use futures::future::join_all;

use selio::{ArmError, Error, Interest, Selector};

mod util;
use util::{any_local_address, init_with_selector, tcp_pair};

#[test]
fn selector_handle_is_send_and_sync() {
    util::assert_send::<Selector>();
    util::assert_sync::<Selector>();
}

#[test]
fn register_deregister_roundtrip_restores_table() {
    let selector = init_with_selector();
    let (stream, _peer) = tcp_pair();

    assert_eq!(selector.registration_count(), 0);
    for _ in 0..3 {
        let (_id, token) =
            block_on(selector.register(stream.as_raw_fd(), Interest::READABLE)).unwrap();
        assert_eq!(selector.registration_count(), 1);
        block_on(selector.deregister(token)).unwrap();
        assert_eq!(selector.registration_count(), 0);
    }
    selector.shutdown();
}

#[test]
fn permit_resolves_arm_synchronously() {
    let selector = init_with_selector();
    let (stream, mut peer) = tcp_pair();

    use std::io::Write;
    peer.write_all(b"x").unwrap();

    let (_id, token) =
        block_on(selector.register(stream.as_raw_fd(), Interest::READABLE)).unwrap();
    // Give the poll thread time to observe the readiness; with nothing
    // armed it must persist as a permit.
    thread::sleep(Duration::from_millis(200));

    let (token, event) = block_on(selector.arm(token, Interest::READABLE)).unwrap();
    assert!(event.is_readable());

    // Drain the socket, then prove the permit is gone: the next arm has to
    // go to the kernel and runs into its deadline.
    use std::io::Read;
    let mut buf = [0; 8];
    let mut stream_ref = &stream;
    assert_eq!(stream_ref.read(&mut buf).unwrap(), 1);

    let deadline = Instant::now() + Duration::from_millis(200);
    match block_on(selector.arm_deadline(token, Interest::READABLE, deadline)) {
        Err(ArmError::TimedOut { token }) => {
            block_on(selector.deregister(token)).unwrap();
        }
        Ok((_, event)) => panic!("permit cache should be empty, got {:?}", event),
        Err(err) => panic!("unexpected arm outcome: {}", err),
    }
    selector.shutdown();
}

#[test]
fn cancel_while_armed_then_rearm() {
    let selector = init_with_selector();
    let (stream, mut peer) = tcp_pair();

    let (_id, token) =
        block_on(selector.register(stream.as_raw_fd(), Interest::READABLE)).unwrap();

    let arm = selector.arm(token, Interest::READABLE);
    let canceller = arm.canceller();
    let waiter = thread::spawn(move || block_on(arm));

    thread::sleep(Duration::from_millis(100));
    canceller.cancel();

    let token = match waiter.join().unwrap() {
        Err(ArmError::Cancelled { token }) => token,
        other => panic!("expected cancellation, got {:?}", other),
    };

    // The registration survived the cancellation; a fresh arm observes data.
    use std::io::Write;
    peer.write_all(b"y").unwrap();
    let (token, event) = block_on(selector.arm(token, Interest::READABLE)).unwrap();
    assert!(event.is_readable());

    block_on(selector.deregister(token)).unwrap();
    selector.shutdown();
}

#[test]
fn arm_deadline_times_out() {
    let selector = init_with_selector();
    let (stream, _peer) = tcp_pair();

    let (_id, token) =
        block_on(selector.register(stream.as_raw_fd(), Interest::READABLE)).unwrap();

    let started = Instant::now();
    let deadline = started + Duration::from_millis(150);
    match block_on(selector.arm_deadline(token, Interest::READABLE, deadline)) {
        Err(ArmError::TimedOut { token }) => {
            assert!(started.elapsed() >= Duration::from_millis(100));
            block_on(selector.deregister(token)).unwrap();
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    selector.shutdown();
}

#[test]
fn cross_selector_token_is_rejected() {
    let selector = init_with_selector();
    let other = Selector::new().unwrap();
    let (stream, _peer) = tcp_pair();

    let (_id, token) =
        block_on(selector.register(stream.as_raw_fd(), Interest::READABLE)).unwrap();

    match block_on(other.arm(token, Interest::READABLE)) {
        Err(ArmError::ScopeMismatch { token }) => {
            // Still usable on the selector that minted it.
            block_on(selector.deregister(token)).unwrap();
        }
        result => panic!("expected a scope mismatch, got {:?}", result),
    }
    selector.shutdown();
    other.shutdown();
}

#[test]
fn modify_roundtrip() {
    let selector = init_with_selector();
    let (stream, mut peer) = tcp_pair();

    let (_id, token) = block_on(
        selector.register(stream.as_raw_fd(), Interest::READABLE | Interest::WRITABLE),
    )
    .unwrap();
    block_on(selector.modify(&token, Interest::READABLE)).unwrap();

    use std::io::Write;
    peer.write_all(b"z").unwrap();
    let (token, event) = block_on(selector.arm(token, Interest::READABLE)).unwrap();
    assert!(event.is_readable());

    block_on(selector.deregister(token)).unwrap();
    selector.shutdown();
}

#[test]
fn shutdown_drains_all_waiters() {
    let selector = init_with_selector();

    let sockets: Vec<std::net::UdpSocket> = (0..100)
        .map(|_| {
            let socket = std::net::UdpSocket::bind(any_local_address()).unwrap();
            socket.set_nonblocking(true).unwrap();
            socket
        })
        .collect();

    let tokens: Vec<_> = block_on(join_all(
        sockets
            .iter()
            .map(|socket| selector.register(socket.as_raw_fd(), Interest::READABLE)),
    ))
    .into_iter()
    .map(|result| result.unwrap().1)
    .collect();

    let waiters = {
        let selector = selector.clone();
        thread::spawn(move || {
            block_on(join_all(
                tokens
                    .into_iter()
                    .map(|token| selector.arm(token, Interest::READABLE)),
            ))
        })
    };

    thread::sleep(Duration::from_millis(200));
    selector.shutdown();

    let results = waiters.join().unwrap();
    assert_eq!(results.len(), 100);
    for result in results {
        assert!(matches!(result, Err(ArmError::Shutdown)));
    }

    // The gate rejects new registrations after shutdown.
    let socket = std::net::UdpSocket::bind(any_local_address()).unwrap();
    socket.set_nonblocking(true).unwrap();
    match block_on(selector.register(socket.as_raw_fd(), Interest::READABLE)) {
        Err(Error::ShutdownInProgress) => {}
        other => panic!("expected shutdown-in-progress, got {:?}", other.map(|_| ())),
    }

    // Repeated shutdown is a no-op.
    selector.shutdown();
}
