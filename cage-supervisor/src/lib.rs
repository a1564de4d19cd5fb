//! Lifecycle supervision for the services that make up a sandbox: the
//! userspace network stack, the egress NAT, the socket monitor, and anything
//! else that runs for the lifetime of the workload.
//!
//! A [`Group`] manages a set of *actors*, each an `(execute, interrupt)`
//! pair. It differs from typical actor-group libraries in a few deliberate
//! ways:
//!
//! - [`Group::start`] launches the execute future immediately, instead of
//!   deferring all launches to [`Group::run`].
//! - An actor resolving to `Ok(())` is a *task* that finished its job; it
//!   does **not** interrupt its peers.
//! - The first actor to resolve to an error interrupts every other actor, in
//!   the reverse of start order, each waited to completion.
//! - Starting a new actor after an earlier one has already failed makes
//!   `start` itself perform the group shutdown and return that error.
//!
//! Reverse-order interruption matters because later services usually depend
//! on earlier ones: the bridge is stopped before the network that backs it.

use std::future::Future;

use tokio::sync::{mpsc, oneshot};

/// A single supervised actor: its interrupt hook and completion signal.
///
/// The interrupt is consumed on first use; calling order across the group is
/// strictly reverse-of-start. The `done` receiver resolves (with an error,
/// since the sender is simply dropped) once the execute task has returned.
struct Actor {
    interrupt: Option<Box<dyn FnOnce() + Send>>,
    done: Option<oneshot::Receiver<()>>,
}

/// Manages the lifecycle of a set of services and tasks.
///
/// Each actor must be pre-emptable by its interrupt function: if the
/// interrupt is invoked, the execute future is expected to resolve soon
/// after. It must also be safe to invoke the interrupt after the execute
/// future has already resolved.
///
/// # Example
///
/// ```
/// use cage_supervisor::Group;
/// use tokio::sync::oneshot;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut group: Group<&'static str> = Group::new();
///
/// let (stop_tx, stop_rx) = oneshot::channel();
/// group
///     .start(
///         async move {
///             let _ = stop_rx.await;
///             Ok(())
///         },
///         move || {
///             let _ = stop_tx.send(());
///         },
///     )
///     .await
///     .unwrap();
///
/// group.start(async { Err("boom") }, || {}).await.unwrap();
///
/// assert_eq!(group.run().await, Err("boom"));
/// # }
/// ```
pub struct Group<E> {
    actors: Vec<Actor>,
    err_tx: mpsc::Sender<E>,
    err_rx: mpsc::Receiver<E>,
}

impl<E> Default for Group<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Group<E> {
    /// Create an empty group.
    pub fn new() -> Self {
        // Single-slot buffer: only the first error is retained, later ones
        // are dropped by the failed `try_send`.
        let (err_tx, err_rx) = mpsc::channel(1);
        Self { actors: Vec::new(), err_tx, err_rx }
    }
}

impl<E: Send + 'static> Group<E> {
    /// Run an actor by spawning its execute future and registering it with
    /// the group.
    ///
    /// If a previously started actor has already resolved to an error, the
    /// whole group is interrupted (reverse start order, each actor waited)
    /// and that error is returned without spawning `execute`.
    pub async fn start<F, I>(&mut self, execute: F, interrupt: I) -> Result<(), E>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        I: FnOnce() + Send + 'static,
    {
        if let Ok(err) = self.err_rx.try_recv() {
            self.interrupt_all().await;
            return Err(err);
        }

        let err_tx = self.err_tx.clone();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            if let Err(err) = execute.await {
                let _ = err_tx.try_send(err);
            }
            drop(done_tx);
        });

        self.actors.push(Actor { interrupt: Some(Box::new(interrupt)), done: Some(done_rx) });
        Ok(())
    }

    /// Wait for every started actor to terminate.
    ///
    /// Returns the first error observed; on that first error, all remaining
    /// actors are interrupted in reverse start order, each waited to
    /// completion, before the error is returned. Returns `Ok(())` once all
    /// actors have exited without error.
    pub async fn run(&mut self) -> Result<(), E> {
        for i in 0..self.actors.len() {
            let Some(mut done) = self.actors[i].done.take() else { continue };

            let raced = {
                let err_rx = &mut self.err_rx;
                tokio::select! {
                    err = err_rx.recv() => Some(err.expect("group keeps an error sender alive")),
                    _ = &mut done => None,
                }
            };

            if let Some(err) = raced {
                self.actors[i].done = Some(done);
                self.interrupt_all().await;
                return Err(err);
            }
        }

        match self.err_rx.try_recv() {
            Ok(err) => Err(err),
            Err(_) => Ok(()),
        }
    }

    /// Interrupt every actor in reverse start order, waiting for each to
    /// terminate before moving to the one started before it.
    async fn interrupt_all(&mut self) {
        for (idx, actor) in self.actors.iter_mut().enumerate().rev() {
            if let Some(interrupt) = actor.interrupt.take() {
                tracing::debug!(actor = idx, "interrupting");
                interrupt();
            }
            if let Some(done) = actor.done.take() {
                let _ = done.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use tokio::sync::oneshot;

    use super::Group;

    type TestError = &'static str;

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_group_runs_clean() {
        let mut group: Group<TestError> = Group::new();
        let res = tokio::time::timeout(Duration::from_millis(100), group.run()).await;
        assert_eq!(res.expect("run should not block"), Ok(()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn single_error_is_returned() {
        let mut group: Group<TestError> = Group::new();
        group.start(async { Err("foobar") }, || {}).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(100), group.run()).await;
        assert_eq!(res.expect("run should not block"), Err("foobar"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn error_interrupts_running_actors() {
        let mut group: Group<TestError> = Group::new();

        let (fail_tx, fail_rx) = oneshot::channel::<()>();
        group
            .start(
                async move {
                    let _ = fail_rx.await;
                    Err("interrupt")
                },
                || {},
            )
            .await
            .unwrap();

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        group
            .start(
                async move {
                    let _ = cancel_rx.await;
                    Ok(())
                },
                move || {
                    let _ = cancel_tx.send(());
                },
            )
            .await
            .unwrap();

        fail_tx.send(()).unwrap();

        let res = tokio::time::timeout(Duration::from_millis(100), group.run()).await;
        assert_eq!(res.expect("run should not block"), Err("interrupt"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_after_error_shuts_down_group() {
        let mut group: Group<TestError> = Group::new();
        group.start(async { Err("interrupt") }, || {}).await.unwrap();

        // Let the failed actor's error land in the single-slot buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let res = group
            .start(
                async move {
                    let _ = cancel_rx.await;
                    Ok(())
                },
                move || {
                    let _ = cancel_tx.send(());
                },
            )
            .await;
        assert_eq!(res, Err("interrupt"));
    }

    /// Three long-running actors started in order A, B, C, one instant task,
    /// and one failing actor: the failure must interrupt C, B, A in that
    /// order, each exactly once, and `run` must surface the failure.
    #[tokio::test(flavor = "multi_thread")]
    async fn interrupts_fire_in_reverse_start_order() {
        let mut group: Group<TestError> = Group::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["A", "B", "C"] {
            let order = Arc::clone(&order);
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            group
                .start(
                    async move {
                        let _ = stop_rx.await;
                        Ok(())
                    },
                    move || {
                        order.lock().unwrap().push(name);
                        let _ = stop_tx.send(());
                    },
                )
                .await
                .unwrap();
        }

        // A task that completes successfully must not trigger interrupts.
        group.start(async { Ok(()) }, || {}).await.unwrap();

        group.start(async { Err("interrupt") }, || {}).await.unwrap();

        let res = tokio::time::timeout(Duration::from_millis(200), group.run()).await;
        assert_eq!(res.expect("run should not block"), Err("interrupt"));
        assert_eq!(*order.lock().unwrap(), vec!["C", "B", "A"]);
    }
}
