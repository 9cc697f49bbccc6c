//! Background writer for deferred-write mode
//!
//! Producers announce a session id when its pending queue goes from empty to
//! non-empty. The worker wakes once per poll interval, collects every
//! announced session, and hands each to the flush callback, which drains
//! the session's queue under its own lock.

use crossbeam_channel::{Receiver, Sender, unbounded};
use pagestore_common::{Error, Result, SessionId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Handle to the background writer thread; stopping it (or dropping it)
/// joins the thread
pub struct Flusher {
    sender: Sender<SessionId>,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Flusher {
    /// Spawn the worker thread
    pub fn start<F>(name: String, interval: Duration, flush: F) -> Result<Self>
    where
        F: Fn(&SessionId) + Send + 'static,
    {
        let (sender, receiver) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = Arc::clone(&stop);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                info!("Flusher thread {} started", thread_name);
                run(&receiver, &thread_stop, interval, flush);
                info!("Flusher thread {} stopped", thread_name);
            })
            .map_err(|e| Error::internal(format!("failed to spawn flusher thread: {}", e)))?;

        Ok(Self {
            sender,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Announce that `session` has queued writes
    pub fn notify(&self, session: SessionId) {
        if self.sender.send(session).is_err() {
            debug!("Flusher already stopped, write stays queued until next drain");
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<F>(receiver: &Receiver<SessionId>, stop: &AtomicBool, interval: Duration, flush: F)
where
    F: Fn(&SessionId),
{
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(interval);

        if stop.load(Ordering::Relaxed) {
            break;
        }

        let due: HashSet<SessionId> = receiver.try_iter().collect();
        for session in &due {
            flush(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_flushes_announced_sessions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let flusher = Flusher::start("flusher-test".into(), Duration::from_millis(20), move |id| {
            sink.lock().push(id.clone());
        })
        .unwrap();

        flusher.notify("a".into());
        flusher.notify("a".into());
        flusher.notify("b".into());

        let both_seen = || {
            let seen = seen.lock();
            seen.contains(&SessionId::new("a")) && seen.contains(&SessionId::new("b"))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !both_seen() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        flusher.stop();

        let mut seen = seen.lock().clone();
        seen.sort();
        seen.dedup();
        assert_eq!(seen, vec![SessionId::new("a"), SessionId::new("b")]);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let flusher = Flusher::start("flusher-stop".into(), Duration::from_millis(10), move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        let started = Instant::now();
        flusher.stop();
        assert!(started.elapsed() < Duration::from_secs(2));

        // Announcements after stop are harmless
        flusher.notify("late".into());
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }
}
