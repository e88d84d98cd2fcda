// Not all functions are used by all tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Once;

use selio::Selector;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn init_with_selector() -> Selector {
    init();
    Selector::new().expect("unable to create Selector instance")
}

pub fn any_local_address() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// A connected TCP pair: the first half non-blocking (for raw selector
/// registration), the second a blocking peer to drive from the test.
pub fn tcp_pair() -> (std::net::TcpStream, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind(any_local_address()).unwrap();
    let connected = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    connected.set_nonblocking(true).unwrap();
    (connected, accepted)
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}
