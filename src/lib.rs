//! `fibra`: a single-threaded cooperative fiber runtime.
//!
//! Three subsystems, leaves first:
//!
//! - [`wheel`]/[`scheduler`]: a hierarchical timer wheel driving a
//!   single-threaded ready-queue scheduler. See [`Scheduler`].
//! - [`event`]: a CML-style synchronous event algebra — [`Event`]s are
//!   built, composed with [`Event::choice`] and friends, and performed via
//!   [`Fiber::perform`], which either commits immediately or suspends the
//!   calling fiber until one of its branches does.
//! - [`scope`]: a structured-concurrency tree. Every [`Fiber`] is spawned
//!   into exactly one [`Scope`]; a scope only finishes once every fiber and
//!   child scope it owns has finished, and a failing fiber fails its scope
//!   and fail-fast cancels its siblings.
//!
//! ```no_run
//! use fibra::run;
//!
//! run(|scope, fiber| async move {
//!     let cond = fibra::condition::Condition::new();
//!     scope.spawn({
//!         let cond = cond.clone();
//!         move |_fiber| async move {
//!             cond.signal();
//!             Ok(())
//!         }
//!     })?;
//!     fiber.perform(cond.wait_op()).await;
//!     Ok(())
//! })
//! .unwrap();
//! ```
//!
//! Platform-specific collaborators (fd/epoll pollers, process reaping,
//! byte buffers, time sources beyond [`clock::SystemClock`]) are
//! deliberately out of scope for this crate; [`scheduler::TaskSource`] and
//! [`clock::TimeSource`] are the seams an embedder implements them behind.

pub mod channel;
pub mod clock;
pub mod condition;
pub mod error;
pub mod event;
pub mod fiber;
pub mod oneshot;
pub mod scheduler;
pub mod scope;
pub mod sleep;
pub mod time;
pub mod waitset;
pub mod wheel;

pub use error::{Error, Result};
pub use event::{boolean_choice, bracket, first_ready, named_choice, race, Event, TryOutcome};
pub use fiber::Fiber;
pub use scheduler::Scheduler;
pub use scope::{Scope, ScopeOutcome, ScopeStatus};

use std::future::Future;

/// Runs `body` to completion as the sole fiber of a freshly created root
/// scope, driving a freshly created [`Scheduler`] to quiescence, and
/// returns the root scope's outcome.
///
/// This is the "host program" entry point described in the crate's
/// external-interfaces contract: the one place an unhandled root-scope
/// failure surfaces as a plain [`Result`] rather than a value observed via
/// [`Scope::not_ok_op`]. Everything `body` spawns (further fibers, child
/// scopes, timers, channel waits) runs to completion, cancellation, or
/// failure before this function returns.
pub fn run<F, Fut>(body: F) -> Result<()>
where
    F: FnOnce(Scope, Fiber) -> Fut + 'static,
    Fut: Future<Output = Result<()>> + 'static,
{
    let scheduler = Scheduler::new();
    let root = Scope::root(scheduler.clone());
    let entry = root.clone();
    root.spawn(move |fiber| body(entry, fiber))?;
    scheduler.main();

    match root.status() {
        Some(ScopeStatus::Ok) | None => Ok(()),
        Some(status) => {
            let primary = root
                .failures()
                .into_iter()
                .next()
                .expect("a failed or cancelled root scope always records a primary error");
            Err(match status {
                ScopeStatus::Cancelled => Error::cancelled(primary),
                _ => Error::FiberFailure(primary.to_string()),
            })
        }
    }
}
