//! The coordinator's dispatch loop.
//!
//! This thread is the single funnel for resuming suspended tasks: events,
//! reply records, cancellation drains, timer expiries and the shutdown sweep
//! all take waiter cells here and wake the collected handles only after every
//! lock is released.

use std::sync::Arc;
use std::task::Waker;

use log::{debug, trace};

use super::bridge::Turn;
use super::request::{ReplyError, Request};
use super::{Resume, Shared};
use crate::event::EventFlags;
use crate::Event;

pub(crate) fn run(shared: Arc<Shared>) {
    while let Some(turn) = shared.bridge.next() {
        let mut wakers = Vec::new();
        drain_replies(&shared, &mut wakers);
        drain_notices(&shared, &mut wakers);
        process_timers(&shared, &mut wakers);
        if let Turn::Batch(events) = turn {
            route_batch(&shared, events, &mut wakers);
        }
        for waker in wakers {
            waker.wake();
        }
    }

    debug!("selector dispatch thread draining for shutdown");
    shutdown_sweep(&shared);
}

/// Completes pending reply slots with the records posted by the poll thread.
fn drain_replies(shared: &Shared, wakers: &mut Vec<Waker>) {
    while let Ok((reply_id, result)) = shared.reply_records.pop() {
        let record = {
            let mut replies = shared.replies.lock().unwrap();
            replies.try_remove(reply_id)
        };
        let Some(record) = record else { continue };

        let succeeded = result.is_ok();
        match record.cell.resume(result) {
            Some((waker, false)) => wakers.push(waker),
            resumed => {
                // The awaiting future is gone: unwind its provisional table
                // entry, and a registration that made it into the kernel
                // anyway must not leak either.
                if let Some(id) = record.cleanup {
                    shared.remove_registration(id, succeeded);
                }
                if let Some((waker, _)) = resumed {
                    wakers.push(waker);
                }
            }
        }
    }
}

/// Drains waiters whose cancellation bit was flipped since the last touch.
fn drain_notices(shared: &Shared, wakers: &mut Vec<Waker>) {
    let mut timer_removals = Vec::new();
    while let Ok(notice) = shared.drains.pop() {
        if let Some((waker, _)) = notice.cell.take_for_resume() {
            wakers.push(waker);
        }
        let mut table = shared.registrations.lock().unwrap();
        if let Some(entry) = table.get_mut(&notice.id.as_u64()) {
            let ours = entry
                .waiter
                .as_ref()
                .is_some_and(|waiter| Arc::ptr_eq(&waiter.cell, &notice.cell));
            if ours {
                let waiter = entry.waiter.take().unwrap();
                if let Some(deadline) = waiter.deadline {
                    timer_removals.push((deadline, notice.id.as_u64()));
                }
            }
        }
    }
    shared.remove_timers(timer_removals);
}

/// Resumes waiters whose deadline passed.
fn process_timers(shared: &Shared, wakers: &mut Vec<Waker>) {
    let now = shared.now_nanos();
    if shared.next_deadline() > now {
        return;
    }

    let due: Vec<_> = {
        let mut timers = shared.timers.lock().unwrap();
        let pending = timers.split_off(&(now + 1, 0));
        let due = std::mem::replace(&mut *timers, pending);
        shared.publish_next_deadline(&timers);
        due.into_iter().collect()
    };

    let mut table = shared.registrations.lock().unwrap();
    for ((_, raw_id), cell) in due {
        if let Some(entry) = table.get_mut(&raw_id) {
            let ours = entry
                .waiter
                .as_ref()
                .is_some_and(|waiter| Arc::ptr_eq(&waiter.cell, &cell));
            if ours {
                entry.waiter = None;
            }
        }
        if let Some((waker, _)) = cell.resume(Resume::TimedOut) {
            wakers.push(waker);
        }
    }
}

fn route_batch(shared: &Shared, events: Vec<Event>, wakers: &mut Vec<Waker>) {
    let mut timer_removals = Vec::new();
    {
        let mut table = shared.registrations.lock().unwrap();
        for event in events {
            trace!("dispatching {:?}", event);
            let Some(entry) = table.get_mut(&event.id().as_u64()) else {
                // Deregistered while the batch was in flight.
                continue;
            };

            // A waiter armed for any of the ready classes receives the whole
            // event; classes outside its interest persist as permits.
            let eligible = entry
                .waiter
                .as_ref()
                .is_some_and(|waiter| waiter.interest.intersects(event.ready()));
            let delivered = if eligible {
                let waiter = entry.waiter.take().unwrap();
                if let Some((waker, _)) = waiter.cell.resume(Resume::Event(event)) {
                    wakers.push(waker);
                }
                if let Some(deadline) = waiter.deadline {
                    timer_removals.push((deadline, event.id().as_u64()));
                }
                Some(waiter.interest)
            } else {
                None
            };

            for class in event.ready().classes() {
                if delivered.is_some_and(|interest| interest.intersects(class)) {
                    continue;
                }
                let permit = entry.permits[class.class_index()]
                    .get_or_insert(EventFlags::empty());
                *permit |= event.flags();
            }
        }
    }
    shared.remove_timers(timer_removals);
}

/// Final drain: every suspension handle still parked anywhere is resumed
/// with a shutdown outcome. After this sweep the selector holds no handles.
fn shutdown_sweep(shared: &Shared) {
    shared.begin_shutdown_lifecycle();

    let mut wakers = Vec::new();

    {
        let mut replies = shared.replies.lock().unwrap();
        for record in replies.drain() {
            if let Some((waker, _)) = record.cell.resume(Err(ReplyError::Shutdown)) {
                wakers.push(waker);
            }
        }
    }
    while let Ok((_, _)) = shared.reply_records.pop() {}

    {
        let mut table = shared.registrations.lock().unwrap();
        for (_, entry) in table.iter_mut() {
            if let Some(waiter) = entry.waiter.take() {
                if let Some((waker, _)) = waiter.cell.resume(Resume::Shutdown) {
                    wakers.push(waker);
                }
            }
        }
        table.clear();
    }

    while let Ok(notice) = shared.drains.pop() {
        if let Some((waker, _)) = notice.cell.take_for_resume() {
            wakers.push(waker);
        }
    }

    {
        let mut timers = shared.timers.lock().unwrap();
        for (_, cell) in std::mem::take(&mut *timers) {
            if let Some((waker, _)) = cell.resume(Resume::Shutdown) {
                wakers.push(waker);
            }
        }
        shared.publish_next_deadline(&timers);
    }

    for waker in wakers {
        waker.wake();
    }
}

impl Shared {
    /// Fire-and-forget deregister for a registration nobody owns anymore.
    pub(crate) fn enqueue_orphan_deregister(&self, id: crate::RegistrationId) {
        let pushed = self
            .requests
            .push(Request::Deregister { id, reply: None })
            .is_ok();
        if pushed {
            self.wake_poll_thread();
        }
    }
}
