//! Contended pool check-outs: reservation hand-off, waiter bounds and
//! destroy-while-waiting.

use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use selio::pool::Pool;
use selio::Error;

mod util;
use util::init;

#[test]
fn contended_checkout_hands_off_via_reservation() {
    init();
    let pool = Pool::new();
    pool.insert(1, 0u32).unwrap();

    let guard = block_on(pool.checkout(1)).unwrap();

    let contender = {
        let pool = pool.clone();
        thread::spawn(move || {
            block_on(pool.transaction(1, |value| {
                *value += 1;
                *value
            }))
        })
    };

    // Let the contender park, then hand the resource over: check-in reserves
    // it for the parked waiter before waking it.
    thread::sleep(Duration::from_millis(100));
    drop(guard);

    assert_eq!(contender.join().unwrap().unwrap(), 1);
    assert_eq!(*block_on(pool.checkout(1)).unwrap(), 1);
}

#[test]
fn many_waiters_each_get_a_turn() {
    init();
    let pool = Pool::new();
    pool.insert(1, 0u32).unwrap();

    let guard = block_on(pool.checkout(1)).unwrap();

    let contenders: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || block_on(pool.transaction(1, |value| *value += 1)))
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    drop(guard);

    for contender in contenders {
        contender.join().unwrap().unwrap();
    }
    assert_eq!(*block_on(pool.checkout(1)).unwrap(), 8);
}

#[test]
fn destroy_while_waiting_reports_invalid_id() {
    init();
    let pool = Pool::new();
    pool.insert(1, String::from("gone")).unwrap();

    let guard = block_on(pool.checkout(1)).unwrap();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || block_on(pool.checkout(1)).map(|_| ()))
    };

    thread::sleep(Duration::from_millis(100));
    assert_eq!(pool.remove(1), None);

    match waiter.join().unwrap() {
        Err(Error::InvalidId) => {}
        other => panic!("expected InvalidId, got {:?}", other.map(|_| ())),
    }

    // Check-in of the destroyed entry drops the resource and the entry.
    drop(guard);
    assert!(pool.is_empty());
}
