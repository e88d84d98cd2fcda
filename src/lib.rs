//! Selio is a readiness-driven asynchronous I/O runtime.
//!
//! It couples a dedicated polling thread, blocking in the kernel's readiness
//! API (epoll on Linux, kqueue on the BSDs and macOS), to a serialized
//! coordinator that owns all registration state. User tasks register file
//! descriptors, await readiness and retry non-blocking syscalls; every
//! suspension is resumed exactly once, through a single funnel, with typed
//! cancellation, timeout and shutdown outcomes.
//!
//! # Guiding principles
//!
//! * **One-shot arming.** Readiness notification is armed explicitly per
//!   wait. Readiness that arrives while nothing is armed is kept as a
//!   *permit* and resolves the next wait synchronously, so no event is lost
//!   between registering and arming.
//! * **Move-only capabilities.** A registration is driven through a
//!   [`Token`] whose phantom phase tracks what is legal next; double-arming
//!   or use-after-deregister fails at compile time.
//! * **Cancellation is a state flip.** Cancelling a wait never resumes
//!   anything itself; the coordinator drains the waiter on its next touch
//!   and the waker fires outside every lock.
//!
//! # Example
//!
//! ```no_run
//! use selio::net::{TcpListener, TcpStream};
//! use selio::Selector;
//!
//! # fn main() -> Result<(), selio::Error> {
//! futures::executor::block_on(async {
//!     let selector = Selector::new()?;
//!
//!     let mut listener =
//!         TcpListener::bind(&selector, "127.0.0.1:0".parse().unwrap()).await?;
//!     let mut client =
//!         TcpStream::connect(&selector, listener.local_addr()?).await?;
//!     client.write_all(b"hello").await?;
//!
//!     let (mut server, _peer) = listener.accept().await?;
//!     let mut buf = [0; 8];
//!     let n = server.read(&mut buf).await?;
//!     assert_eq!(&buf[..n], b"hello");
//!
//!     client.close().await?;
//!     server.close().await?;
//!     listener.close().await?;
//!     selector.shutdown();
//!     Ok(())
//! })
//! # }
//! ```

#![warn(missing_debug_implementations)]

mod driver;
mod error;
mod event;
mod interest;
pub mod net;
pub mod pool;
mod selector;
mod sys;
mod token;
mod waiter;

pub use crate::driver::{Driver, Wakeup};
pub use crate::error::{ArmError, Error};
pub use crate::event::{Event, EventFlags};
pub use crate::interest::Interest;
pub use crate::selector::{Arm, Canceller, Deregister, Modify, Register, Selector};
pub use crate::token::{Armed, Phase, Registering, RegistrationId, Token};
