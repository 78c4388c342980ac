//! Filesystem notification backends.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::{WatchError, WatchResult};

/// A change notification for one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// A file or directory appeared.
    Created(PathBuf),
    /// A file or directory disappeared.
    Removed(PathBuf),
    /// File content or metadata changed.
    Modified(PathBuf),
    /// Notifications were lost. `None` means the whole mirror is affected.
    Overflow(Option<PathBuf>),
}

/// Capability interface over a platform directory-change facility.
///
/// Registration is per directory and never recursive; mirrors register every
/// subdirectory they want to hear about.
pub trait WatchBackend: Send + Sync {
    /// Subscribe to changes of the direct children of `dir`.
    fn register_directory(&self, dir: &Path) -> WatchResult<()>;

    /// Wait up to `timeout` for notifications.
    ///
    /// Returns an empty vector when nothing arrived in time and
    /// `WatchError::Closed` once the backend has been closed.
    fn poll_events(&self, timeout: Duration) -> WatchResult<Vec<FsEvent>>;

    /// Number of events queued since creation. Monotonic.
    fn queued_total(&self) -> u64;

    /// Drop every subscription. Pending and future polls return `Closed`.
    fn close(&self);
}

struct QueueState {
    events: VecDeque<FsEvent>,
    queued: u64,
    closed: bool,
}

/// FIFO of translated events shared between a producer and the mirror loop.
pub struct EventQueue {
    state: Mutex<QueueState>,
    arrived: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                queued: 0,
                closed: false,
            }),
            arrived: Condvar::new(),
        }
    }

    /// Append events. Ignored once closed.
    pub fn push(&self, events: Vec<FsEvent>) {
        if events.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queued += events.len() as u64;
        state.events.extend(events);
        self.arrived.notify_all();
    }

    /// Take every queued event, waiting up to `timeout` for the first one.
    pub fn poll(&self, timeout: Duration) -> WatchResult<Vec<FsEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.events.is_empty() && !state.closed {
            if self.arrived.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        if !state.events.is_empty() {
            return Ok(state.events.drain(..).collect());
        }
        if state.closed {
            return Err(WatchError::Closed);
        }
        Ok(Vec::new())
    }

    pub fn queued_total(&self) -> u64 {
        self.state.lock().queued
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.arrived.notify_all();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Backend using the OS-native notification facility (inotify, FSEvents, ...).
pub struct NotifyBackend {
    watcher: Mutex<Option<RecommendedWatcher>>,
    queue: Arc<EventQueue>,
}

impl NotifyBackend {
    /// Create a backend with no subscriptions.
    pub fn new() -> WatchResult<Self> {
        let queue = Arc::new(EventQueue::new());
        let sink = Arc::clone(&queue);
        let watcher = RecommendedWatcher::new(
            move |received: notify::Result<Event>| {
                let mut out = Vec::new();
                Self::push(received, &mut out);
                sink.push(out);
            },
            Config::default(),
        )?;
        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            queue,
        })
    }

    fn translate(event: Event, out: &mut Vec<FsEvent>) {
        if event.need_rescan() {
            if event.paths.is_empty() {
                out.push(FsEvent::Overflow(None));
            }
            for path in event.paths {
                out.push(FsEvent::Overflow(Some(path)));
            }
            return;
        }

        match event.kind {
            EventKind::Create(_) => {
                out.extend(event.paths.into_iter().map(FsEvent::Created));
            }
            EventKind::Remove(_) => {
                out.extend(event.paths.into_iter().map(FsEvent::Removed));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                out.extend(event.paths.into_iter().map(FsEvent::Removed));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                out.extend(event.paths.into_iter().map(FsEvent::Created));
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let Some(from) = paths.next() {
                    out.push(FsEvent::Removed(from));
                }
                out.extend(paths.map(FsEvent::Created));
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    if path.symlink_metadata().is_ok() {
                        out.push(FsEvent::Created(path));
                    } else {
                        out.push(FsEvent::Removed(path));
                    }
                }
            }
            EventKind::Modify(_) => {
                out.extend(event.paths.into_iter().map(FsEvent::Modified));
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn push(received: notify::Result<Event>, out: &mut Vec<FsEvent>) {
        match received {
            Ok(event) => Self::translate(event, out),
            Err(err) => {
                // The backend lost track of something; resynchronise.
                warn!(error = %err, "watch backend reported an error");
                out.push(FsEvent::Overflow(None));
            }
        }
    }
}

impl WatchBackend for NotifyBackend {
    fn register_directory(&self, dir: &Path) -> WatchResult<()> {
        let mut watcher = self.watcher.lock();
        match watcher.as_mut() {
            Some(w) => Ok(w.watch(dir, RecursiveMode::NonRecursive)?),
            None => Err(WatchError::Closed),
        }
    }

    fn poll_events(&self, timeout: Duration) -> WatchResult<Vec<FsEvent>> {
        self.queue.poll(timeout)
    }

    fn queued_total(&self) -> u64 {
        self.queue.queued_total()
    }

    fn close(&self) {
        self.watcher.lock().take();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_translate_create_and_remove() {
        let mut out = Vec::new();
        NotifyBackend::translate(event(EventKind::Create(CreateKind::File), &["/c/a"]), &mut out);
        NotifyBackend::translate(event(EventKind::Remove(RemoveKind::File), &["/c/b"]), &mut out);

        assert_eq!(
            out,
            vec![
                FsEvent::Created(PathBuf::from("/c/a")),
                FsEvent::Removed(PathBuf::from("/c/b")),
            ]
        );
    }

    #[test]
    fn test_translate_rename_both() {
        let mut out = Vec::new();
        NotifyBackend::translate(
            event(EventKind::Modify(ModifyKind::Name(RenameMode::Both)), &["/c/old", "/c/new"]),
            &mut out,
        );

        assert_eq!(
            out,
            vec![
                FsEvent::Removed(PathBuf::from("/c/old")),
                FsEvent::Created(PathBuf::from("/c/new")),
            ]
        );
    }

    #[test]
    fn test_translate_ignores_access() {
        let mut out = Vec::new();
        NotifyBackend::translate(event(EventKind::Access(AccessKind::Any), &["/c/a"]), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_queue_counts_and_drains() {
        let queue = EventQueue::new();
        queue.push(vec![FsEvent::Created(PathBuf::from("/a"))]);
        queue.push(vec![
            FsEvent::Removed(PathBuf::from("/b")),
            FsEvent::Modified(PathBuf::from("/c")),
        ]);
        assert_eq!(queue.queued_total(), 3);

        let polled = queue.poll(Duration::ZERO).unwrap();
        assert_eq!(polled.len(), 3);
        assert!(queue.poll(Duration::from_millis(5)).unwrap().is_empty());
        assert_eq!(queue.queued_total(), 3);
    }

    #[test]
    fn test_queue_closed() {
        let queue = EventQueue::new();
        queue.close();
        queue.push(vec![FsEvent::Created(PathBuf::from("/a"))]);
        assert_eq!(queue.queued_total(), 0);
        assert!(matches!(queue.poll(Duration::from_secs(1)), Err(WatchError::Closed)));
    }

    #[test]
    fn test_poll_after_close_reports_closed() {
        let backend = NotifyBackend::new().unwrap();
        backend.close();
        assert!(matches!(
            backend.poll_events(Duration::from_millis(10)),
            Err(WatchError::Closed)
        ));
        assert!(matches!(
            backend.register_directory(Path::new("/")),
            Err(WatchError::Closed)
        ));
    }
}
