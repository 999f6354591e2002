//! Task lifecycle plumbing shared by all runtime components.
//!
//! Every logical component (coordinator, region, shard, entity) runs as a
//! spawned task draining one channel. Its handle carries a termination
//! signal that flips exactly once when the task exits, panics included.
//! Watching that signal is the runtime's only cancellation primitive.

use tokio::sync::watch;

/// Flips the paired termination signal when dropped. Owned by the running
/// task so the signal fires no matter how the task exits.
pub(crate) struct ExitGuard {
    tx: watch::Sender<bool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
    }
}

/// Create an exit guard and the termination signal observers clone.
pub(crate) fn exit_pair() -> (ExitGuard, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ExitGuard { tx }, rx)
}

/// Whether the observed task has already exited.
pub(crate) fn has_exited(terminated: &watch::Receiver<bool>) -> bool {
    *terminated.borrow()
}

/// Run `on_exit` once the observed task terminates. Fires immediately when
/// the task is already gone.
pub(crate) fn notify_on_exit<F>(mut terminated: watch::Receiver<bool>, on_exit: F)
where
    F: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        while !*terminated.borrow() {
            if terminated.changed().await.is_err() {
                break;
            }
        }
        on_exit();
    });
}

/// Await termination of the observed task.
pub(crate) async fn wait_for_exit(mut terminated: watch::Receiver<bool>) {
    while !*terminated.borrow() {
        if terminated.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_on_drop() {
        let (guard, rx) = exit_pair();
        assert!(!has_exited(&rx));
        drop(guard);
        assert!(has_exited(&rx));
    }

    #[tokio::test]
    async fn test_notify_on_exit() {
        let (guard, rx) = exit_pair();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        notify_on_exit(rx, move || flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));

        drop(guard);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_notify_after_exit_fires_immediately() {
        let (guard, rx) = exit_pair();
        drop(guard);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        notify_on_exit(rx, move || flag.store(true, Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_wait_for_exit() {
        let (guard, rx) = exit_pair();
        let waiter = tokio::spawn(wait_for_exit(rx));
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
