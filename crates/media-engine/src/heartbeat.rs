//! Periodic tick thread driving position sync and the sleep timer

use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Calls a closure once per interval on its own thread until stopped.
///
/// The closure returns `false` to end the thread early.
pub struct Heartbeat {
    stop_tx: Option<Sender<()>>,
}

impl Heartbeat {
    pub fn start<F>(interval: Duration, mut on_tick: F) -> std::io::Result<Self>
    where
        F: FnMut(Duration) -> bool + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        thread::Builder::new()
            .name("earshot-heartbeat".to_string())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    select! {
                        recv(ticker) -> at => {
                            let Ok(at) = at else { break };
                            let elapsed = at.saturating_duration_since(last);
                            last = at;
                            if !on_tick(elapsed) {
                                break;
                            }
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                log::trace!("Heartbeat stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
        })
    }

    /// Signals the thread to exit without waiting for it.
    ///
    /// A tick already in flight may still run; its closure must tolerate that.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let mut heartbeat = Heartbeat::start(Duration::from_millis(5), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(60));
        heartbeat.stop();
        thread::sleep(Duration::from_millis(20));
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));

        assert!(after_stop > 0);
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_closure_can_end_thread() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let _heartbeat = Heartbeat::start(Duration::from_millis(2), move |_| {
            counter.fetch_add(1, Ordering::SeqCst) < 2
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
