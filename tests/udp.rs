//! UDP datagram round-trips, including connected mode.

use futures::executor::block_on;

use selio::net::UdpSocket;

mod util;
use util::{any_local_address, init_with_selector};

#[test]
fn is_send_and_sync() {
    util::assert_send::<UdpSocket>();
    util::assert_sync::<UdpSocket>();
}

#[test]
fn send_to_and_recv_from() {
    let selector = init_with_selector();

    block_on(async {
        let mut alpha = UdpSocket::bind(&selector, any_local_address()).await.unwrap();
        let mut beta = UdpSocket::bind(&selector, any_local_address()).await.unwrap();
        let beta_addr = beta.local_addr().unwrap();

        assert_eq!(alpha.send_to(b"ping", beta_addr).await.unwrap(), 4);

        let mut buf = [0; 16];
        let (n, from) = beta.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, alpha.local_addr().unwrap());

        alpha.close().await.unwrap();
        beta.close().await.unwrap();
    });
    selector.shutdown();
}

#[test]
fn connected_mode_send_and_recv() {
    let selector = init_with_selector();

    block_on(async {
        let mut alpha = UdpSocket::bind(&selector, any_local_address()).await.unwrap();
        let mut beta = UdpSocket::bind(&selector, any_local_address()).await.unwrap();

        alpha.connect(beta.local_addr().unwrap()).unwrap();
        beta.connect(alpha.local_addr().unwrap()).unwrap();

        assert_eq!(alpha.send(b"marco").await.unwrap(), 5);
        let mut buf = [0; 16];
        assert_eq!(beta.recv(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"marco");

        assert_eq!(beta.send(b"polo").await.unwrap(), 4);
        let n = alpha.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"polo");

        alpha.close().await.unwrap();
        beta.close().await.unwrap();
    });
    selector.shutdown();
}
