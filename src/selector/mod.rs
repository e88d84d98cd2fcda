//! The selector runtime: a serialized coordinator coupled to a dedicated
//! poll thread.
//!
//! The poll thread owns the driver handle and blocks in the kernel readiness
//! API; the coordinator owns the registration table, waiters, permits and
//! timers. The two communicate only through the event bridge, the request
//! queue, the reply records, the shutdown flag and the kernel-visible wakeup
//! object; every suspended task is resumed by the dispatch thread and never
//! while a lock is held.

mod bridge;
mod dispatch;
mod poll_thread;
mod request;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{debug, trace, warn};
use slab::Slab;

use crate::driver::{Driver, Wakeup};
use crate::event::EventFlags;
use crate::interest::INTEREST_CLASSES;
use crate::token::{Armed, Phase, Registering, Token};
use crate::waiter::{Resumption, WaiterCell};
use crate::{ArmError, Error, Event, Interest, RegistrationId};

use self::bridge::EventBridge;
use self::request::{DrainNotice, PendingReply, ReplyError, ReplyResult, Request};

const RUNNING: u8 = 0;
const SHUTTING_DOWN: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Scope stamp source; identifies the owning selector inside ids.
static NEXT_SCOPE: AtomicU16 = AtomicU16::new(1);

/// Resumption payload of a selector waiter.
pub(crate) enum Resume {
    Event(Event),
    Shutdown,
    TimedOut,
}

/// A waiter recorded in the registration table.
struct TableWaiter {
    interest: Interest,
    cell: Arc<WaiterCell<Resume>>,
    /// Key half of the timer entry, for removal on early resumption.
    deadline: Option<u64>,
}

/// One registration, owned by the coordinator.
struct Entry {
    fd: RawFd,
    interest: Interest,
    waiter: Option<TableWaiter>,
    /// Readiness that arrived with no waiter armed, per interest class.
    permits: [Option<EventFlags>; INTEREST_CLASSES],
}

type Timers = BTreeMap<(u64, u64), Arc<WaiterCell<Resume>>>;

/// State shared between the handle, the poll thread and the dispatch thread.
pub(crate) struct Shared {
    scope: u16,
    next_sequence: AtomicU64,
    lifecycle: AtomicU8,
    shutdown: AtomicBool,
    origin: Instant,
    next_deadline: AtomicU64,

    registrations: Mutex<HashMap<u64, Entry>>,
    replies: Mutex<Slab<PendingReply>>,
    timers: Mutex<Timers>,

    pub(crate) requests: ConcurrentQueue<Request>,
    reply_records: ConcurrentQueue<(usize, ReplyResult)>,
    drains: ConcurrentQueue<DrainNotice>,
    pub(crate) bridge: EventBridge,
    wakeup: Arc<dyn Wakeup>,
}

impl Shared {
    fn lifecycle(&self) -> u8 {
        self.lifecycle.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_flag(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> RegistrationId {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        RegistrationId::new(self.scope, sequence)
    }

    /// Poll-thread side: posts a reply record and nudges the dispatcher.
    pub(crate) fn post_reply(&self, reply: usize, result: ReplyResult) {
        let _ = self.reply_records.push((reply, result));
        self.bridge.kick();
    }

    fn wake_poll_thread(&self) {
        if let Err(err) = self.wakeup.wake() {
            warn!("failed to wake the poll thread: {}", err);
        }
    }

    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn deadline_nanos(&self, deadline: Instant) -> u64 {
        let nanos = deadline.saturating_duration_since(self.origin).as_nanos();
        nanos.min(u64::MAX as u128 - 1) as u64
    }

    fn next_deadline(&self) -> u64 {
        self.next_deadline.load(Ordering::SeqCst)
    }

    /// Poll-thread side: the timeout parameterizing the next blocking poll.
    pub(crate) fn next_poll_timeout(&self) -> Option<Duration> {
        let deadline = self.next_deadline();
        if deadline == u64::MAX {
            return None;
        }
        Some(Duration::from_nanos(deadline.saturating_sub(self.now_nanos())))
    }

    pub(crate) fn deadline_expired(&self) -> bool {
        let deadline = self.next_deadline();
        deadline != u64::MAX && self.now_nanos() >= deadline
    }

    fn publish_next_deadline(&self, timers: &Timers) {
        let next = timers.keys().next().map(|(nanos, _)| *nanos).unwrap_or(u64::MAX);
        self.next_deadline.store(next, Ordering::SeqCst);
    }

    fn remove_timers(&self, removals: Vec<(u64, u64)>) {
        if removals.is_empty() {
            return;
        }
        let mut timers = self.timers.lock().unwrap();
        for key in removals {
            timers.remove(&key);
        }
        self.publish_next_deadline(&timers);
    }

    fn register_timer(&self, nanos: u64, id: RegistrationId, cell: Arc<WaiterCell<Resume>>) {
        let lowered;
        {
            let mut timers = self.timers.lock().unwrap();
            timers.insert((nanos, id.as_u64()), cell);
            lowered = nanos < self.next_deadline();
            self.publish_next_deadline(&timers);
        }
        if lowered {
            self.wake_poll_thread();
        }
    }

    /// Removes a table entry; `deregister_driver` also queues the
    /// driver-side removal for registrations the kernel has seen.
    pub(crate) fn remove_registration(&self, id: RegistrationId, deregister_driver: bool) {
        self.registrations.lock().unwrap().remove(&id.as_u64());
        if deregister_driver {
            self.enqueue_orphan_deregister(id);
        }
    }

    /// Gate transition used by the dispatch thread when the poll thread died
    /// without an explicit `shutdown` call.
    pub(crate) fn begin_shutdown_lifecycle(&self) {
        let _ = self.lifecycle.compare_exchange(
            RUNNING,
            SHUTTING_DOWN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

struct Threads {
    poll: thread::JoinHandle<()>,
    dispatch: thread::JoinHandle<()>,
}

/// Routes readiness events between the kernel and suspended tasks.
///
/// A `Selector` is a cheaply cloneable handle; all clones drive the same pair
/// of threads and the same registration table. Registrations are created with
/// [`register`], awaited with [`arm`] and released with [`deregister`] or
/// [`shutdown`].
///
/// [`register`]: Selector::register
/// [`arm`]: Selector::arm
/// [`deregister`]: Selector::deregister
/// [`shutdown`]: Selector::shutdown
#[derive(Clone)]
pub struct Selector {
    shared: Arc<Shared>,
    threads: Arc<Mutex<Option<Threads>>>,
}

impl Selector {
    /// Creates a selector over the platform driver (epoll or kqueue).
    pub fn new() -> io::Result<Selector> {
        Selector::create(crate::sys::OsDriver::new()?)
    }

    /// Creates a selector over a caller-provided driver.
    pub fn create<D: Driver>(driver: D) -> io::Result<Selector> {
        let wakeup = driver.wakeup();
        let shared = Arc::new(Shared {
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            next_sequence: AtomicU64::new(1),
            lifecycle: AtomicU8::new(RUNNING),
            shutdown: AtomicBool::new(false),
            origin: Instant::now(),
            next_deadline: AtomicU64::new(u64::MAX),
            registrations: Mutex::new(HashMap::new()),
            replies: Mutex::new(Slab::new()),
            timers: Mutex::new(BTreeMap::new()),
            requests: ConcurrentQueue::unbounded(),
            reply_records: ConcurrentQueue::unbounded(),
            drains: ConcurrentQueue::unbounded(),
            bridge: EventBridge::new(),
            wakeup,
        });

        let driver: Box<dyn Driver> = Box::new(driver);
        let poll = thread::Builder::new().name("selio-poll".into()).spawn({
            let shared = shared.clone();
            move || poll_thread::run(driver, shared)
        })?;
        let dispatch = thread::Builder::new().name("selio-dispatch".into()).spawn({
            let shared = shared.clone();
            move || dispatch::run(shared)
        })?;

        Ok(Selector {
            shared,
            threads: Arc::new(Mutex::new(Some(Threads { poll, dispatch }))),
        })
    }

    /// Registers a descriptor, arming `interest` one-shot.
    ///
    /// The descriptor must already be non-blocking and stay open until
    /// [`deregister`]. Readiness arriving before the first [`arm`] is kept as
    /// a permit, so nothing observed by the kernel in between is lost.
    ///
    /// [`arm`]: Selector::arm
    /// [`deregister`]: Selector::deregister
    pub fn register(&self, fd: RawFd, interest: Interest) -> Register {
        Register {
            shared: self.shared.clone(),
            fd,
            interest,
            state: RegisterState::Init,
        }
    }

    /// Awaits readiness for `interest`, consuming the token.
    ///
    /// Resolves synchronously when a permit for one of the classes is
    /// cached. Dropping the returned future cancels the wait; an explicit
    /// [`Canceller`] does the same from another task or thread.
    pub fn arm<P: Phase>(&self, token: Token<P>, interest: Interest) -> Arm {
        self.arm_inner(token.id(), interest, None)
    }

    /// Like [`arm`], bounded by a deadline. Expiry resolves to
    /// [`ArmError::TimedOut`], returning the token.
    ///
    /// [`arm`]: Selector::arm
    pub fn arm_deadline<P: Phase>(
        &self,
        token: Token<P>,
        interest: Interest,
        deadline: Instant,
    ) -> Arm {
        self.arm_inner(token.id(), interest, Some(deadline))
    }

    fn arm_inner(&self, id: RegistrationId, interest: Interest, deadline: Option<Instant>) -> Arm {
        Arm {
            shared: self.shared.clone(),
            id,
            interest,
            deadline,
            cell: Arc::new(WaiterCell::new()),
            state: ArmState::Init,
        }
    }

    /// Replaces the registration's interest set.
    ///
    /// Permits for classes dropped from the set are purged before the kernel
    /// object is updated.
    pub fn modify<P: Phase>(&self, token: &Token<P>, interest: Interest) -> Modify {
        Modify {
            shared: self.shared.clone(),
            id: token.id(),
            interest,
            state: ReplyState::Init,
        }
    }

    /// Releases the registration, consuming the token.
    ///
    /// A registration the kernel already forgot (for example because the
    /// descriptor was closed) is not an error.
    pub fn deregister<P: Phase>(&self, token: Token<P>) -> Deregister {
        Deregister {
            shared: self.shared.clone(),
            id: token.id(),
            state: ReplyState::Init,
        }
    }

    /// Shuts the selector down, draining every waiter with
    /// [`Error::ShutdownInProgress`] and joining both threads.
    ///
    /// Idempotent; concurrent and repeated calls after the first return
    /// immediately. When this returns no suspension handle remains parked
    /// inside the selector.
    pub fn shutdown(&self) {
        let threads = self.threads.lock().unwrap().take();
        let Some(threads) = threads else { return };

        debug!("shutting down selector scope {}", self.shared.scope);
        self.shared.begin_shutdown_lifecycle();
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.requests.push(Request::DeregisterAll);
        self.shared.wake_poll_thread();

        let _ = threads.poll.join();
        let _ = threads.dispatch.join();
        self.shared.lifecycle.store(SHUTDOWN, Ordering::SeqCst);
    }

    /// Number of live registrations; used by tests and diagnostics.
    pub fn registration_count(&self) -> usize {
        self.shared.registrations.lock().unwrap().len()
    }

    /// Synchronously removes a registration on behalf of a dropped owner
    /// that cannot await [`deregister`].
    ///
    /// [`deregister`]: Selector::deregister
    pub(crate) fn drop_registration(&self, id: RegistrationId) {
        self.shared.remove_registration(id, true);
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("scope", &self.shared.scope)
            .finish_non_exhaustive()
    }
}

/// Cancels a pending [`Arm`] from any thread.
///
/// Cancellation is a synchronous state flip on the waiter cell; the actual
/// resumption happens on the dispatch thread, which observes the flip on its
/// next touch. Never blocks, never allocates on the cancellation path.
#[derive(Clone)]
pub struct Canceller {
    id: RegistrationId,
    cell: Arc<WaiterCell<Resume>>,
    shared: Weak<Shared>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cell.cancel();
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.drains.push(DrainNotice {
                id: self.id,
                cell: self.cell.clone(),
            });
            shared.bridge.kick();
        }
    }
}

// ===== impl Register =====

enum RegisterState {
    Init,
    Waiting {
        id: RegistrationId,
        cell: Arc<WaiterCell<ReplyResult>>,
    },
    Done,
}

/// Future returned by [`Selector::register`].
pub struct Register {
    shared: Arc<Shared>,
    fd: RawFd,
    interest: Interest,
    state: RegisterState,
}

impl Future for Register {
    type Output = Result<(RegistrationId, Token<Registering>), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &this.state {
                RegisterState::Init => {
                    if this.shared.lifecycle() != RUNNING {
                        this.state = RegisterState::Done;
                        return Poll::Ready(Err(Error::ShutdownInProgress));
                    }

                    let id = this.shared.allocate_id();
                    let cell = Arc::new(WaiterCell::new());
                    cell.arm(cx.waker());

                    // The table entry goes in before the driver sees the
                    // descriptor: readiness delivered before this future is
                    // polled again must find the entry and persist as a
                    // permit. The entry is unwound if the driver refuses.
                    {
                        let mut table = this.shared.registrations.lock().unwrap();
                        if this.shared.lifecycle() != RUNNING {
                            this.state = RegisterState::Done;
                            return Poll::Ready(Err(Error::ShutdownInProgress));
                        }
                        table.insert(
                            id.as_u64(),
                            Entry {
                                fd: this.fd,
                                interest: this.interest,
                                waiter: None,
                                permits: [None; INTEREST_CLASSES],
                            },
                        );
                    }

                    let reply_id = {
                        let mut replies = this.shared.replies.lock().unwrap();
                        if this.shared.lifecycle() != RUNNING {
                            this.shared.remove_registration(id, false);
                            this.state = RegisterState::Done;
                            return Poll::Ready(Err(Error::ShutdownInProgress));
                        }
                        replies.insert(PendingReply {
                            cell: cell.clone(),
                            cleanup: Some(id),
                        })
                    };

                    trace!("registering fd {} as {:?} ({:?})", this.fd, id, this.interest);
                    let pushed = this.shared.requests.push(Request::Register {
                        id,
                        fd: this.fd,
                        interest: this.interest,
                        reply: reply_id,
                    });
                    match pushed {
                        Ok(()) => this.shared.wake_poll_thread(),
                        // Queue closed mid-shutdown; the sweep resumes the
                        // reply slot with a shutdown outcome.
                        Err(_) => debug!("register hit a closing selector"),
                    }
                    this.state = RegisterState::Waiting { id, cell };
                    return Poll::Pending;
                }
                RegisterState::Waiting { id, cell } => match cell.try_take() {
                    None => {
                        if cell.arm(cx.waker()) {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    Some(Resumption::Delivered(Ok(()))) => {
                        let id = *id;
                        this.state = RegisterState::Done;
                        if this.shared.lifecycle() != RUNNING {
                            this.shared.remove_registration(id, true);
                            return Poll::Ready(Err(Error::ShutdownInProgress));
                        }
                        return Poll::Ready(Ok((id, Token::new(id))));
                    }
                    Some(Resumption::Delivered(Err(err))) => {
                        let id = *id;
                        this.state = RegisterState::Done;
                        this.shared.remove_registration(id, false);
                        return Poll::Ready(Err(reply_error(err)));
                    }
                    Some(Resumption::Cancelled) => {
                        let id = *id;
                        this.state = RegisterState::Done;
                        this.shared.remove_registration(id, false);
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                },
                RegisterState::Done => panic!("Register polled after completion"),
            }
        }
    }
}

impl Drop for Register {
    fn drop(&mut self) {
        if let RegisterState::Waiting { id, cell } = &self.state {
            cell.cancel();
            // Whoever observes the other side's move cleans up: if the reply
            // already landed the registration is ours to unwind, otherwise
            // the dispatch thread sees the cancelled bit when it arrives.
            match cell.try_take() {
                Some(Resumption::Delivered(result)) => {
                    self.shared.remove_registration(*id, result.is_ok());
                }
                Some(Resumption::Cancelled) | None => {}
            }
        }
    }
}

fn reply_error(err: ReplyError) -> Error {
    match err {
        ReplyError::Os(err) => Error::Os(err),
        ReplyError::Shutdown => Error::ShutdownInProgress,
    }
}

// ===== impl Arm =====

enum ArmState {
    Init,
    Waiting,
    Done,
}

/// Future returned by [`Selector::arm`].
///
/// Dropping a pending `Arm` cancels the wait; the registration survives and
/// can be armed again.
pub struct Arm {
    shared: Arc<Shared>,
    id: RegistrationId,
    interest: Interest,
    deadline: Option<Instant>,
    cell: Arc<WaiterCell<Resume>>,
    state: ArmState,
}

impl Arm {
    /// A handle that cancels this wait from any thread.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            id: self.id,
            cell: self.cell.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl Future for Arm {
    type Output = Result<(Token<Armed>, Event), ArmError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.state {
                ArmState::Init => {
                    if this.id.scope() != this.shared.scope {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::ScopeMismatch {
                            token: Token::new(this.id),
                        }));
                    }
                    if this.shared.lifecycle() != RUNNING {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::Shutdown));
                    }
                    if this.cell.is_cancelled() {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::Cancelled {
                            token: Token::new(this.id),
                        }));
                    }

                    let deadline_nanos = {
                        let mut table = this.shared.registrations.lock().unwrap();
                        if this.shared.lifecycle() != RUNNING {
                            this.state = ArmState::Done;
                            return Poll::Ready(Err(ArmError::Shutdown));
                        }
                        let Some(entry) = table.get_mut(&this.id.as_u64()) else {
                            debug_assert!(false, "armed token without a registration");
                            this.state = ArmState::Done;
                            return Poll::Ready(Err(ArmError::Internal));
                        };

                        // Permits beat a fresh arm: readiness that arrived
                        // between register and arm resolves synchronously.
                        for class in this.interest.classes() {
                            if let Some(flags) = entry.permits[class.class_index()].take() {
                                trace!("arm of {:?} consumed a {:?} permit", this.id, class);
                                this.state = ArmState::Done;
                                return Poll::Ready(Ok((
                                    Token::new(this.id),
                                    Event::new(this.id, class, flags),
                                )));
                            }
                        }

                        match &entry.waiter {
                            Some(waiter) if !waiter.cell.is_cancelled() => {
                                debug_assert!(false, "registration armed twice");
                                this.state = ArmState::Done;
                                return Poll::Ready(Err(ArmError::Internal));
                            }
                            // A cancelled predecessor is drained through its
                            // own notice; the slot is free to reuse.
                            _ => {}
                        }

                        // Handle first, then the table record, then the
                        // request: an event processed in between always finds
                        // an armed cell.
                        this.cell.arm(cx.waker());
                        let deadline_nanos =
                            this.deadline.map(|deadline| this.shared.deadline_nanos(deadline));
                        entry.waiter = Some(TableWaiter {
                            interest: this.interest,
                            cell: this.cell.clone(),
                            deadline: deadline_nanos,
                        });
                        deadline_nanos
                    };

                    if let Some(nanos) = deadline_nanos {
                        this.shared.register_timer(nanos, this.id, this.cell.clone());
                    }

                    let pushed = this.shared.requests.push(Request::Arm {
                        id: this.id,
                        interest: this.interest,
                    });
                    match pushed {
                        Ok(()) => this.shared.wake_poll_thread(),
                        // Queue closed mid-shutdown; the sweep drains us.
                        Err(_) => debug!("arm hit a closing selector"),
                    }
                    this.state = ArmState::Waiting;
                    return Poll::Pending;
                }
                ArmState::Waiting => match this.cell.try_take() {
                    None => {
                        if this.cell.arm(cx.waker()) {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    Some(Resumption::Delivered(Resume::Event(event))) => {
                        this.state = ArmState::Done;
                        return Poll::Ready(Ok((Token::new(this.id), event)));
                    }
                    Some(Resumption::Delivered(Resume::Shutdown)) => {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::Shutdown));
                    }
                    Some(Resumption::Delivered(Resume::TimedOut)) => {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::TimedOut {
                            token: Token::new(this.id),
                        }));
                    }
                    Some(Resumption::Cancelled) => {
                        this.state = ArmState::Done;
                        return Poll::Ready(Err(ArmError::Cancelled {
                            token: Token::new(this.id),
                        }));
                    }
                },
                ArmState::Done => panic!("Arm polled after completion"),
            }
        }
    }
}

impl Drop for Arm {
    fn drop(&mut self) {
        if matches!(self.state, ArmState::Waiting) && !self.cell.is_drained() {
            self.cell.cancel();
            let pushed = self.shared.drains.push(DrainNotice {
                id: self.id,
                cell: self.cell.clone(),
            });
            if pushed.is_ok() {
                self.shared.bridge.kick();
            }
        }
    }
}

// ===== impl Modify / Deregister =====

enum ReplyState {
    Init,
    Waiting { cell: Arc<WaiterCell<ReplyResult>> },
    Done,
}

/// Future returned by [`Selector::modify`].
pub struct Modify {
    shared: Arc<Shared>,
    id: RegistrationId,
    interest: Interest,
    state: ReplyState,
}

impl Future for Modify {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &this.state {
                ReplyState::Init => {
                    if let Err(err) = check_scope_and_gate(&this.shared, this.id) {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(err));
                    }

                    let cell = Arc::new(WaiterCell::new());
                    cell.arm(cx.waker());
                    {
                        let mut table = this.shared.registrations.lock().unwrap();
                        let Some(entry) = table.get_mut(&this.id.as_u64()) else {
                            debug_assert!(false, "modify of an unknown registration");
                            this.state = ReplyState::Done;
                            return Poll::Ready(Err(Error::InvalidId));
                        };
                        // Permits for classes leaving the set are stale.
                        for index in 0..INTEREST_CLASSES {
                            if !this.interest.contains(Interest::from_class_index(index)) {
                                entry.permits[index] = None;
                            }
                        }
                        entry.interest = this.interest;
                    }

                    let reply_id = {
                        let mut replies = this.shared.replies.lock().unwrap();
                        if this.shared.lifecycle() != RUNNING {
                            this.state = ReplyState::Done;
                            return Poll::Ready(Err(Error::ShutdownInProgress));
                        }
                        replies.insert(PendingReply {
                            cell: cell.clone(),
                            cleanup: None,
                        })
                    };

                    let pushed = this.shared.requests.push(Request::Modify {
                        id: this.id,
                        interest: this.interest,
                        reply: reply_id,
                    });
                    match pushed {
                        Ok(()) => this.shared.wake_poll_thread(),
                        Err(_) => debug!("modify hit a closing selector"),
                    }
                    this.state = ReplyState::Waiting { cell };
                    return Poll::Pending;
                }
                ReplyState::Waiting { cell } => match cell.try_take() {
                    None => {
                        if cell.arm(cx.waker()) {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    Some(Resumption::Delivered(Ok(()))) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    Some(Resumption::Delivered(Err(err))) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(reply_error(err)));
                    }
                    Some(Resumption::Cancelled) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                },
                ReplyState::Done => panic!("Modify polled after completion"),
            }
        }
    }
}

impl Drop for Modify {
    fn drop(&mut self) {
        if let ReplyState::Waiting { cell } = &self.state {
            cell.cancel();
        }
    }
}

/// Future returned by [`Selector::deregister`].
pub struct Deregister {
    shared: Arc<Shared>,
    id: RegistrationId,
    state: ReplyState,
}

impl Future for Deregister {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match &this.state {
                ReplyState::Init => {
                    if let Err(err) = check_scope_and_gate(&this.shared, this.id) {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(err));
                    }

                    {
                        let mut table = this.shared.registrations.lock().unwrap();
                        match table.remove(&this.id.as_u64()) {
                            Some(entry) => {
                                // The token was consumed to get here, so any
                                // leftover waiter is a cancelled husk already
                                // on the drain queue.
                                debug_assert!(entry
                                    .waiter
                                    .as_ref()
                                    .map_or(true, |waiter| waiter.cell.is_cancelled()
                                        || waiter.cell.is_drained()));
                            }
                            None => {
                                debug_assert!(false, "deregister of an unknown registration");
                                this.state = ReplyState::Done;
                                return Poll::Ready(Err(Error::InvalidId));
                            }
                        }
                    }

                    let cell = Arc::new(WaiterCell::new());
                    cell.arm(cx.waker());
                    let reply_id = {
                        let mut replies = this.shared.replies.lock().unwrap();
                        if this.shared.lifecycle() != RUNNING {
                            this.state = ReplyState::Done;
                            return Poll::Ready(Err(Error::ShutdownInProgress));
                        }
                        replies.insert(PendingReply {
                            cell: cell.clone(),
                            cleanup: None,
                        })
                    };

                    trace!("deregistering {:?}", this.id);
                    let pushed = this.shared.requests.push(Request::Deregister {
                        id: this.id,
                        reply: Some(reply_id),
                    });
                    match pushed {
                        Ok(()) => this.shared.wake_poll_thread(),
                        Err(_) => debug!("deregister hit a closing selector"),
                    }
                    this.state = ReplyState::Waiting { cell };
                    return Poll::Pending;
                }
                ReplyState::Waiting { cell } => match cell.try_take() {
                    None => {
                        if cell.arm(cx.waker()) {
                            return Poll::Pending;
                        }
                        continue;
                    }
                    Some(Resumption::Delivered(Ok(()))) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Ok(()));
                    }
                    Some(Resumption::Delivered(Err(err))) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(reply_error(err)));
                    }
                    Some(Resumption::Cancelled) => {
                        this.state = ReplyState::Done;
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                },
                ReplyState::Done => panic!("Deregister polled after completion"),
            }
        }
    }
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let ReplyState::Waiting { cell } = &self.state {
            // The table entry is already gone and the driver-side removal is
            // in flight; nothing to undo.
            cell.cancel();
        }
    }
}

fn check_scope_and_gate(shared: &Shared, id: RegistrationId) -> Result<(), Error> {
    if id.scope() != shared.scope {
        return Err(Error::ScopeMismatch);
    }
    if shared.lifecycle() != RUNNING {
        return Err(Error::ShutdownInProgress);
    }
    Ok(())
}

macro_rules! impl_future_debug {
    ($($name: ident),*) => {
        $(
            impl std::fmt::Debug for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.debug_struct(stringify!($name)).finish_non_exhaustive()
                }
            }
        )*
    };
}

impl_future_debug!(Register, Arm, Modify, Deregister);

impl std::fmt::Debug for Canceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canceller").field("id", &self.id).finish_non_exhaustive()
    }
}
