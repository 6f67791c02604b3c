//! Timer loop — the single monotonic tick source.
//!
//! One task ticks at 1 Hz and owns the registered callbacks. Each tick it
//! computes `t % every == 0` per callback: sync callbacks run inline on
//! the loop, async callbacks are spawned with a concurrency cap (one
//! permit per inverter agent). Shutdown is cooperative through a watch
//! flag checked between ticks; in-flight callbacks finish on their own.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{Semaphore, watch};
use tokio::time::MissedTickBehavior;

/// Future type produced by async callbacks.
pub type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A periodic async callback (inverter ticks, discovery flushes).
pub struct AsyncCallback {
    pub name: String,
    pub every: u64,
    callback: Arc<dyn Fn(u64) -> CallbackFuture + Send + Sync>,
}

impl AsyncCallback {
    pub fn new(
        name: &str,
        every: u64,
        callback: impl Fn(u64) -> CallbackFuture + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            every: every.max(1),
            callback: Arc::new(callback),
        }
    }
}

/// A periodic sync callback, run on the loop task itself.
pub struct SyncCallback {
    pub name: String,
    pub every: u64,
    callback: Box<dyn FnMut(u64) + Send>,
}

impl SyncCallback {
    pub fn new(name: &str, every: u64, callback: impl FnMut(u64) + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            every: every.max(1),
            callback: Box::new(callback),
        }
    }
}

pub enum Callback {
    Async(AsyncCallback),
    Sync(SyncCallback),
}

/// Drive the callbacks until the shutdown flag trips.
///
/// `max_concurrent` caps simultaneously running async callbacks; the
/// loop waits for a permit before spawning, which is the backpressure
/// that keeps a slow field bus from piling up ticks.
pub async fn run_callbacks(
    mut callbacks: Vec<Callback>,
    max_concurrent: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: u64 = 0;

    info!(
        "timer loop started: {} callbacks, concurrency {}",
        callbacks.len(),
        max_concurrent.max(1)
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("timer loop stopping");
                    return;
                }
                continue;
            }
        }
        tick += 1;

        for callback in &mut callbacks {
            match callback {
                Callback::Sync(cb) => {
                    if tick % cb.every == 0 {
                        (cb.callback)(tick);
                    }
                }
                Callback::Async(cb) => {
                    if tick % cb.every != 0 {
                        continue;
                    }
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        return; // Semaphore closed, shutting down.
                    };
                    let fut = (cb.callback)(tick);
                    let name = cb.name.clone();
                    tokio::spawn(async move {
                        fut.await;
                        debug!("callback {name} done at tick {tick}");
                        drop(permit);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn counting(name: &str, every: u64, counter: Arc<AtomicU64>) -> Callback {
        Callback::Async(AsyncCallback::new(name, every, move |_t| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_on_their_period() {
        let every1 = Arc::new(AtomicU64::new(0));
        let every5 = Arc::new(AtomicU64::new(0));
        let sync_count = Arc::new(AtomicU64::new(0));

        let sc = Arc::clone(&sync_count);
        let callbacks = vec![
            counting("fast", 1, Arc::clone(&every1)),
            counting("slow", 5, Arc::clone(&every5)),
            Callback::Sync(SyncCallback::new("sync", 2, move |_| {
                sc.fetch_add(1, Ordering::SeqCst);
            })),
        ];

        let (tx, rx) = watch::channel(false);
        let loop_task = tokio::spawn(run_callbacks(callbacks, 2, rx));

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        tx.send(true).unwrap();
        loop_task.await.unwrap();
        // Let the spawned callback tasks drain.
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The interval's first tick fires immediately, so 0..=10s is
        // eleven ticks.
        assert_eq!(every1.load(Ordering::SeqCst), 11);
        assert_eq!(every5.load(Ordering::SeqCst), 2);
        assert_eq!(sync_count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_dispatch() {
        let count = Arc::new(AtomicU64::new(0));
        let callbacks = vec![counting("fast", 1, Arc::clone(&count))];

        let (tx, rx) = watch::channel(false);
        let loop_task = tokio::spawn(run_callbacks(callbacks, 1, rx));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        tx.send(true).unwrap();
        loop_task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let after_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }
}
