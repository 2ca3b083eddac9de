//! Platform-aware task spawning and sleeping.
//!
//! Everything in this crate runs on a single cooperative event loop (see
//! SPEC_FULL.md §5): `wasm_bindgen_futures::spawn_local` in the browser,
//! `tokio::task::spawn_local` inside a `LocalSet` off-browser. Neither
//! requires `Send`, which is what lets the rest of the crate use
//! `Rc<RefCell<_>>` instead of `Arc<Mutex<_>>`.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// Spawn a future onto the local cooperative executor.
pub fn spawn_local(fut: impl Future<Output = ()> + 'static) {
    #[cfg(target_arch = "wasm32")]
    {
        wasm_bindgen_futures::spawn_local(fut);
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::task::spawn_local(fut);
    }
}

/// Suspend the current task for `ms` milliseconds.
pub async fn sleep(ms: u32) {
    #[cfg(target_arch = "wasm32")]
    {
        gloo_timers::future::TimeoutFuture::new(ms).await;
    }
    #[cfg(not(target_arch = "wasm32"))]
    {
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
    }
}

/// A cancellable handle for a repeating background task, used by the tab
/// registry's keep-alive write, the signaling transport's burst scheduler,
/// and the call manager's stats poller — the three interval-loop call
/// sites named in SPEC_FULL.md §4.4/§4.5/§4.11.
#[derive(Clone)]
pub struct IntervalHandle {
    cancelled: Rc<Cell<bool>>,
}

impl IntervalHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Run `tick` every `period_ms`, stopping when the returned handle is
/// cancelled or when `tick` itself returns `false`.
pub fn run_interval(period_ms: u32, mut tick: impl FnMut() -> bool + 'static) -> IntervalHandle {
    let cancelled = Rc::new(Cell::new(false));
    let handle = IntervalHandle { cancelled: cancelled.clone() };
    spawn_local(async move {
        loop {
            sleep(period_ms).await;
            if cancelled.get() {
                return;
            }
            if !tick() {
                return;
            }
        }
    });
    handle
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn interval_runs_until_cancelled() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let count = Rc::new(RefCell::new(0));
                let count2 = count.clone();
                let handle = run_interval(1, move || {
                    *count2.borrow_mut() += 1;
                    *count2.borrow() < 3
                });
                // give the loop a chance to tick a few times
                for _ in 0..10 {
                    sleep(1).await;
                    if handle.is_cancelled() || *count.borrow() >= 3 {
                        break;
                    }
                }
                assert_eq!(*count.borrow(), 3);
            })
            .await;
    }
}
