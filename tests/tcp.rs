//! End-to-end TCP scenarios: loopback echo, half-close discipline, the
//! partial-write loop and error-flag synthesis.

use std::io::Read;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use selio::net::{TcpListener, TcpStream};
use selio::Error;

mod util;
use util::{any_local_address, init_with_selector};

#[test]
fn is_send_and_sync() {
    util::assert_send::<TcpStream>();
    util::assert_sync::<TcpStream>();
    util::assert_send::<TcpListener>();
    util::assert_sync::<TcpListener>();
}

#[test]
fn loopback_echo() {
    let selector = init_with_selector();

    block_on(async {
        let mut listener = TcpListener::bind(&selector, any_local_address())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = TcpStream::connect(&selector, addr).await.unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0; 32];
        let mut read = 0;
        while read < 5 {
            let n = server.read(&mut buf[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&buf[..5], b"hello");

        server.write_all(&buf[..5]).await.unwrap();
        let mut echoed = [0; 32];
        let mut read = 0;
        while read < 5 {
            let n = client.read(&mut echoed[read..]).await.unwrap();
            assert!(n > 0);
            read += n;
        }
        assert_eq!(&echoed[..5], b"hello");

        client.shutdown_write().unwrap();
        server.shutdown_write().unwrap();
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        assert_eq!(client.read(&mut echoed).await.unwrap(), 0);

        client.close().await.unwrap();
        server.close().await.unwrap();
        listener.close().await.unwrap();
    });

    assert_eq!(selector.registration_count(), 0);
    selector.shutdown();
}

#[test]
fn half_close_is_idempotent() {
    let selector = init_with_selector();

    block_on(async {
        let mut listener = TcpListener::bind(&selector, any_local_address())
            .await
            .unwrap();
        let mut client = TcpStream::connect(&selector, listener.local_addr().unwrap())
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.shutdown_write().unwrap();
        client.shutdown_write().unwrap();
        match client.write(b"nope").await {
            Err(Error::WriteClosed) => {}
            other => panic!("expected WriteClosed, got {:?}", other),
        }

        client.shutdown_read().unwrap();
        client.shutdown_read().unwrap();
        let mut buf = [0; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        // The peer observes EOF from the write-half shutdown.
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);

        client.close().await.unwrap();
        client.close().await.unwrap();
        server.close().await.unwrap();
        listener.close().await.unwrap();
    });
    selector.shutdown();
}

#[test]
fn zero_length_buffers_short_circuit() {
    let selector = init_with_selector();

    block_on(async {
        let mut listener = TcpListener::bind(&selector, any_local_address())
            .await
            .unwrap();
        let mut client = TcpStream::connect(&selector, listener.local_addr().unwrap())
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let mut empty = [0; 0];
        assert_eq!(client.read(&mut empty).await.unwrap(), 0);
        assert_eq!(client.write(&[]).await.unwrap(), 0);

        // Neither call may have transitioned the half-close state.
        client.write_all(b"still open").await.unwrap();
        let mut buf = [0; 16];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &b"still open"[..n]);

        client.close().await.unwrap();
        server.close().await.unwrap();
        listener.close().await.unwrap();
    });
    selector.shutdown();
}

#[test]
fn partial_write_loop_delivers_everything() {
    const PAYLOAD: usize = 1024 * 1024;

    let selector = init_with_selector();

    // A deliberately slow std peer, so the writer runs into a full socket
    // buffer and has to arm for writability repeatedly.
    let listener = std::net::TcpListener::bind(any_local_address()).unwrap();
    let addr = listener.local_addr().unwrap();
    let reader = thread::spawn(move || {
        let (mut peer, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            match peer.read(&mut buf) {
                Ok(0) => return total,
                Ok(n) => {
                    total += n;
                    thread::sleep(Duration::from_millis(2));
                }
                Err(err) => panic!("peer read failed: {}", err),
            }
        }
    });

    block_on(async {
        let mut stream = TcpStream::connect(&selector, addr).await.unwrap();
        let payload = vec![0x5a; PAYLOAD];
        stream.write_all(&payload).await.unwrap();
        stream.shutdown_write().unwrap();

        let mut buf = [0; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        stream.close().await.unwrap();
    });

    assert_eq!(reader.join().unwrap(), PAYLOAD);
    selector.shutdown();
}

#[test]
fn connect_refused_surfaces_econnrefused() {
    let selector = init_with_selector();

    // Bind, learn the port, drop: nothing listens there anymore.
    let addr = {
        let listener = std::net::TcpListener::bind(any_local_address()).unwrap();
        listener.local_addr().unwrap()
    };

    match block_on(TcpStream::connect(&selector, addr)) {
        Err(Error::Os(err)) => assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED)),
        Ok(_) => panic!("connect to a dead port succeeded"),
        Err(err) => panic!("expected ECONNREFUSED, got {}", err),
    }
    selector.shutdown();
}
