//! Directory watcher with a restartable debounce timer
//!
//! Raw notify events are filtered by a relevance predicate and forwarded to a
//! timer thread. Every relevant event restarts the timer; the callback fires
//! once the directory has been quiet for the whole debounce window.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::config::RelevancePredicate;

enum TimerSignal {
    /// A relevant change was observed; (re)arm the timer
    Touch,
    Stop,
}

/// Check whether a notify event kind can change the set of plugin files
pub(crate) fn is_structural(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

/// Restart-or-fire timer running on its own thread.
pub(crate) struct DebounceTimer {
    tx: Sender<TimerSignal>,
}

impl DebounceTimer {
    /// Spawn the timer thread. `on_fire` runs on that thread; its errors and
    /// panics are logged and the timer stays armed.
    pub(crate) fn spawn<F, E>(debounce: Duration, on_fire: F) -> std::io::Result<Self>
    where
        F: Fn() -> Result<(), E> + Send + 'static,
        E: std::fmt::Display,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("plugin-catalog-debounce".to_string())
            .spawn(move || run_timer(rx, debounce, on_fire))?;
        Ok(Self { tx })
    }

    /// Restart the debounce window
    #[cfg(test)]
    fn touch(&self) {
        let _ = self.tx.send(TimerSignal::Touch);
    }

    fn sender(&self) -> Sender<TimerSignal> {
        self.tx.clone()
    }
}

impl Drop for DebounceTimer {
    fn drop(&mut self) {
        // The thread is not joined: it may be the thread dropping us, or it
        // may be waiting on the catalog gate held by the caller.
        let _ = self.tx.send(TimerSignal::Stop);
    }
}

fn run_timer<F, E>(rx: Receiver<TimerSignal>, debounce: Duration, on_fire: F)
where
    F: Fn() -> Result<(), E>,
    E: std::fmt::Display,
{
    loop {
        match rx.recv() {
            Ok(TimerSignal::Touch) => {}
            Ok(TimerSignal::Stop) | Err(_) => break,
        }

        // Burst: keep restarting until the window passes without events
        loop {
            match rx.recv_timeout(debounce) {
                Ok(TimerSignal::Touch) => continue,
                Ok(TimerSignal::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("Debounce timer stopped with a pending rescan");
                    return;
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }

        match catch_unwind(AssertUnwindSafe(&on_fire)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Debounced rescan failed: {}", e),
            Err(_) => error!("Debounced rescan panicked"),
        }
    }
    debug!("Debounce timer exited");
}

/// Non-recursive watch of one plugin directory.
///
/// Dropping the watcher stops both the notify backend and the timer.
pub(crate) struct ChangeWatcher {
    directory: PathBuf,
    _watcher: RecommendedWatcher,
    _timer: DebounceTimer,
}

impl ChangeWatcher {
    pub(crate) fn start<F, E>(
        directory: &Path,
        debounce: Duration,
        is_relevant: RelevancePredicate,
        on_settled: F,
    ) -> Result<Self, notify::Error>
    where
        F: Fn() -> Result<(), E> + Send + 'static,
        E: std::fmt::Display,
    {
        let timer = DebounceTimer::spawn(debounce, on_settled)?;
        let touch = timer.sender();

        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !is_structural(&event.kind) {
                        return;
                    }
                    if event.paths.iter().any(|p| is_relevant(p.as_path())) {
                        debug!(kind = ?event.kind, paths = ?event.paths, "Relevant plugin change");
                        let _ = touch.send(TimerSignal::Touch);
                    }
                }
                Err(e) => warn!("Plugin directory watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(directory, RecursiveMode::NonRecursive)?;

        info!(directory = %directory.display(), ?debounce, "Watching plugin directory");
        Ok(Self {
            directory: directory.to_path_buf(),
            _watcher: watcher,
            _timer: timer,
        })
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        info!(directory = %self.directory.display(), "Stopped watching plugin directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind, RemoveKind};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer(debounce: Duration) -> (DebounceTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = DebounceTimer::spawn(debounce, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), String>(())
        })
        .unwrap();
        (timer, fired)
    }

    #[test]
    fn test_structural_kinds() {
        assert!(is_structural(&EventKind::Create(CreateKind::File)));
        assert!(is_structural(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_structural(&EventKind::Remove(RemoveKind::File)));
        assert!(!is_structural(&EventKind::Access(AccessKind::Any)));
    }

    #[test]
    fn test_burst_fires_once() {
        let (timer, fired) = counting_timer(Duration::from_millis(100));

        for _ in 0..5 {
            timer.touch();
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_rearms_after_firing() {
        let (timer, fired) = counting_timer(Duration::from_millis(50));

        timer.touch();
        thread::sleep(Duration::from_millis(250));
        timer.touch();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_keep_timer_armed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let timer = DebounceTimer::spawn(Duration::from_millis(50), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("first rescan blows up");
            }
            Err::<(), _>("second rescan fails")
        })
        .unwrap();

        timer.touch();
        thread::sleep(Duration::from_millis(250));
        timer.touch();
        thread::sleep(Duration::from_millis(250));
        timer.touch();
        thread::sleep(Duration::from_millis(250));

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_drop_cancels_pending_fire() {
        let (timer, fired) = counting_timer(Duration::from_millis(100));
        timer.touch();
        drop(timer);
        thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
