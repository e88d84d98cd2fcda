//! The dedicated OS thread that owns the driver handle.

use std::sync::Arc;

use log::{debug, error, warn};

use super::request::{ReplyError, Request};
use super::Shared;
use crate::driver::Driver;
use crate::Event;

/// Size of the reusable batch buffer, matching the drivers' fetch capacity.
const EVENTS_CAPACITY: usize = 1024;

pub(crate) fn run(mut driver: Box<dyn Driver>, shared: Arc<Shared>) {
    let mut events: Vec<Event> = Vec::with_capacity(EVENTS_CAPACITY);

    loop {
        if shared.shutdown_flag() {
            break;
        }

        while let Ok(request) = shared.requests.pop() {
            handle_request(&mut *driver, &shared, request);
        }

        let timeout = shared.next_poll_timeout();
        events.clear();
        match driver.poll(timeout, &mut events) {
            Ok(0) => {
                // Timeout or pure wakeup; let the coordinator look at its
                // timers if a published deadline has passed.
                if shared.deadline_expired() {
                    shared.bridge.kick();
                }
            }
            Ok(_) => {
                shared.bridge.push(std::mem::replace(
                    &mut events,
                    Vec::with_capacity(EVENTS_CAPACITY),
                ));
                if shared.deadline_expired() {
                    shared.bridge.kick();
                }
            }
            Err(err) => {
                error!("selector poll failed, shutting down: {}", err);
                shutdown_tail(&mut *driver, &shared);
                return;
            }
        }
    }

    debug!("selector poll thread shutting down");
    shutdown_tail(&mut *driver, &shared);
}

/// Drains the queue one final time: deregistrations are honored (errors
/// ignored), anything needing a live driver afterwards is rejected. Closing
/// the queue first makes later pushes fail fast with a typed shutdown error.
fn shutdown_tail(driver: &mut dyn Driver, shared: &Shared) {
    shared.requests.close();
    while let Ok(request) = shared.requests.pop() {
        match request {
            Request::Deregister { id, reply } => {
                let _ = driver.deregister(id);
                if let Some(reply) = reply {
                    shared.post_reply(reply, Ok(()));
                }
            }
            Request::DeregisterAll => driver.deregister_all(),
            Request::Register { reply, .. } | Request::Modify { reply, .. } => {
                shared.post_reply(reply, Err(ReplyError::Shutdown));
            }
            Request::Arm { .. } => {}
        }
    }
    driver.deregister_all();
    // The driver handle is consumed here; dropping it closes the kernel
    // object.
    shared.bridge.shutdown();
}

fn handle_request(driver: &mut dyn Driver, shared: &Shared, request: Request) {
    match request {
        Request::Register {
            id,
            fd,
            interest,
            reply,
        } => {
            let result = driver.register(id, fd, interest).map_err(ReplyError::Os);
            shared.post_reply(reply, result);
        }
        Request::Modify {
            id,
            interest,
            reply,
        } => {
            let result = driver.modify(id, interest).map_err(ReplyError::Os);
            shared.post_reply(reply, result);
        }
        Request::Deregister { id, reply } => {
            let result = driver.deregister(id);
            match reply {
                Some(reply) => shared.post_reply(reply, result.map_err(ReplyError::Os)),
                None => {
                    if let Err(err) = result {
                        debug!("orphan deregister of {:?} failed: {}", id, err);
                    }
                }
            }
        }
        Request::Arm { id, interest } => {
            // Fire-and-forget: the waiter is resumed by a later event or by
            // cancellation/shutdown, never by an arm failure.
            if let Err(err) = driver.arm(id, interest) {
                warn!("arming {:?} for {:?} failed: {}", id, interest, err);
            }
        }
        Request::DeregisterAll => driver.deregister_all(),
    }
}
