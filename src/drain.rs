// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

pub use internal::DrainMode;
pub use internal::ReleaseShutdown as DrainBlocker;
pub use internal::Signal as DrainTrigger;
pub use internal::Watch as DrainWatcher;

/// Creates a stop broadcast.
/// * DrainTrigger starts the stop and waits until every watcher is gone.
/// * DrainWatcher is cloned into every task that must observe the stop. Holding one
///   keeps the trigger waiting, so it doubles as a "still running" marker.
pub fn new() -> (DrainTrigger, DrainWatcher) {
    internal::channel()
}

/// Runs `make_future` until `drain` is signaled. The future gets its own watcher to
/// hand out to the work it spawns; once the outer drain fires the future is
/// dropped and that work is given up to `deadline` to release its watchers.
pub async fn run_with_drain<F, Fut>(
    component: String,
    drain: DrainWatcher,
    deadline: Duration,
    make_future: F,
) where
    F: FnOnce(DrainWatcher) -> Fut,
    Fut: Future<Output = ()>,
{
    let (sub_trigger, sub_drain) = new();
    let fut = make_future(sub_drain);
    tokio::select! {
        _ = fut => {
            debug!(component, "finished");
        }
        res = drain.wait_for_drain() => {
            let mode = res.mode();
            if tokio::time::timeout(deadline, sub_trigger.start_drain_and_wait(mode)).await.is_err() {
                warn!(component, "tasks did not stop within {deadline:?}");
            }
            debug!(component, ?mode, "stopped");
            drop(res);
        }
    }
}

mod internal {
    use tokio::sync::{mpsc, watch};

    pub fn channel() -> (Signal, Watch) {
        let (signal_tx, signal_rx) = watch::channel(None);
        let (drained_tx, drained_rx) = mpsc::channel(1);
        (
            Signal {
                drained_rx,
                signal_tx,
            },
            Watch {
                drained_tx,
                signal_rx,
            },
        )
    }

    enum Never {}

    /// How the stop was requested: `Graceful` comes from an operator shutdown,
    /// `Immediate` from a failure or from the trigger going away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum DrainMode {
        Immediate,
        Graceful,
    }

    pub struct Signal {
        drained_rx: mpsc::Receiver<Never>,
        signal_tx: watch::Sender<Option<DrainMode>>,
    }

    /// Watch observes a stop. Every clone must be dropped before
    /// `Signal::start_drain_and_wait` completes.
    #[derive(Clone)]
    pub struct Watch {
        drained_tx: mpsc::Sender<Never>,
        signal_rx: watch::Receiver<Option<DrainMode>>,
    }

    /// Held after a stop was observed, until the holder finished its cleanup.
    #[must_use = "dropping ReleaseShutdown releases the drain"]
    pub struct ReleaseShutdown(#[allow(dead_code)] mpsc::Sender<Never>, DrainMode);

    impl ReleaseShutdown {
        pub fn mode(&self) -> DrainMode {
            self.1
        }
    }

    impl Signal {
        /// Completes once every watcher is gone, without signaling them.
        pub async fn closed(&mut self) {
            self.signal_tx.closed().await;
        }

        /// Signals every watcher and waits until all of them were dropped.
        pub async fn start_drain_and_wait(mut self, mode: DrainMode) {
            let _ = self.signal_tx.send(Some(mode));
            match self.drained_rx.recv().await {
                None => {}
                Some(n) => match n {},
            }
        }
    }

    impl Watch {
        /// Completes once a stop was signaled. The returned handle keeps the
        /// trigger waiting until it is dropped.
        pub async fn wait_for_drain(mut self) -> ReleaseShutdown {
            let mode = match self.signal_rx.wait_for(Option::is_some).await {
                Ok(mode) => (*mode).unwrap_or(DrainMode::Immediate),
                // The trigger itself is gone; nobody is waiting for a graceful stop.
                Err(_) => DrainMode::Immediate,
            };
            ReleaseShutdown(self.drained_tx, mode)
        }

        /// Whether a stop was already signaled.
        pub fn is_signaled(&self) -> bool {
            self.signal_rx.borrow().is_some()
        }
    }

    impl std::fmt::Debug for Signal {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DrainTrigger").finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for Watch {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DrainWatcher")
                .field("signaled", &self.is_signaled())
                .finish_non_exhaustive()
        }
    }

    impl std::fmt::Debug for ReleaseShutdown {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_tuple("DrainBlocker").field(&self.1).finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_waits_for_every_watcher() {
        let (trigger, watcher) = new();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel::<DrainMode>(2);
        for _ in 0..2 {
            let w = watcher.clone();
            let done = done_tx.clone();
            tokio::spawn(async move {
                let release = w.wait_for_drain().await;
                done.send(release.mode()).await.unwrap();
            });
        }
        drop(watcher);
        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        assert_eq!(done_rx.recv().await, Some(DrainMode::Graceful));
        assert_eq!(done_rx.recv().await, Some(DrainMode::Graceful));
    }

    #[tokio::test]
    async fn dropped_trigger_is_immediate() {
        let (trigger, watcher) = new();
        drop(trigger);
        assert!(!watcher.is_signaled());
        assert_eq!(watcher.wait_for_drain().await.mode(), DrainMode::Immediate);
    }

    #[tokio::test]
    async fn run_with_drain_stops_sub_tasks() {
        let (trigger, watcher) = new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let task = tokio::spawn(run_with_drain(
            "test".to_string(),
            watcher,
            Duration::from_secs(5),
            |sub| async move {
                tokio::spawn(async move {
                    let _release = sub.wait_for_drain().await;
                });
                let _ = started_tx.send(());
                std::future::pending::<()>().await
            },
        ));
        started_rx.await.unwrap();
        trigger.start_drain_and_wait(DrainMode::Graceful).await;
        task.await.unwrap();
    }
}
