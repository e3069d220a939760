//! Log sink: a single ordered queue that ships log records to an object store.
//!
//! Handlers submit entries from any thread. One dispatcher thread takes them in
//! order, serializes each one, and hands it to its own upload worker with a
//! deadline, without waiting for the upload to finish. Failed or late uploads
//! are logged and dropped.

mod directory;
mod memory;
mod store;

pub use directory::DirectoryStore;
pub use memory::MemoryStore;
pub use store::{CancelToken, ObjectStore, UploadError};

use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tracing::{debug, error, info, warn};

use crate::log_entry::LogEntry;

/// Messages accepted by the dispatcher thread.
enum SinkCommand {
    /// Ship a record
    Entry(LogEntry),
    /// Finish outstanding uploads and exit
    Close,
}

/// Producer side of the log sink.
///
/// Cheap to clone; every handler thread holds one.
#[derive(Clone)]
pub struct LogSinkHandle {
    tx: Sender<SinkCommand>,
}

impl LogSinkHandle {
    /// Queue a record for upload, blocking only while the queue is full.
    pub fn submit(&self, entry: LogEntry) {
        let trace_id = entry.trace_id;
        if self.tx.send(SinkCommand::Entry(entry)).is_err() {
            error!(%trace_id, "Log sink is closed; record lost");
        }
    }
}

/// Where and how the dispatcher ships records
#[derive(Clone, Debug)]
pub struct SinkSettings {
    /// Leading key segment for every object
    pub key_prefix: Option<String>,
    /// Deadline for each individual upload
    pub upload_deadline: Duration,
    /// Records the queue holds before producers block
    pub queue_capacity: usize,
}

/// Owner of the dispatcher thread.
pub struct LogSink {
    tx: Sender<SinkCommand>,
    thread: JoinHandle<()>,
}

impl LogSink {
    /// Start the dispatcher thread.
    pub fn spawn(store: Arc<dyn ObjectStore>, settings: SinkSettings) -> std::io::Result<Self> {
        let (tx, rx) = bounded(settings.queue_capacity.max(1));
        let dispatcher = Dispatcher {
            store,
            key_prefix: settings.key_prefix,
            upload_deadline: settings.upload_deadline,
            uploads: Vec::new(),
        };
        let thread = Builder::new()
            .name("log-sink".into())
            .spawn(move || dispatcher.run(rx))?;

        Ok(Self { tx, thread })
    }

    /// A new producer handle
    pub fn handle(&self) -> LogSinkHandle {
        LogSinkHandle {
            tx: self.tx.clone(),
        }
    }

    /// Stop accepting records once everything already queued has been dispatched,
    /// and wait for outstanding uploads to finish or hit their deadlines.
    pub fn shutdown(self) -> Result<(), String> {
        self.tx
            .send(SinkCommand::Close)
            .map_err(|_| "Log sink dispatcher exited early".to_string())?;
        self.thread
            .join()
            .map_err(|_| "Log sink dispatcher thread panicked".to_string())
    }
}

struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    key_prefix: Option<String>,
    upload_deadline: Duration,
    uploads: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    fn run(mut self, rx: Receiver<SinkCommand>) {
        // Exits on Close or once every producer is gone
        for command in rx.iter() {
            match command {
                SinkCommand::Entry(entry) => self.dispatch(entry),
                SinkCommand::Close => break,
            }
        }

        let outstanding = self.uploads.len();
        if outstanding > 0 {
            info!("Waiting on {outstanding} outstanding uploads");
        }
        for upload in self.uploads.drain(..) {
            let _ = upload.join();
        }
    }

    fn dispatch(&mut self, entry: LogEntry) {
        // Forget uploads that have already finished
        self.uploads.retain(|upload| !upload.is_finished());

        let key = entry.object_key(self.key_prefix.as_deref());
        let body = match serde_json::to_vec(&entry) {
            Ok(body) => body,
            Err(e) => {
                error!(%key, "{}", UploadError::from(e));
                return;
            }
        };

        let store = Arc::clone(&self.store);
        let deadline = self.upload_deadline;
        let spawned = Builder::new()
            .name("upload".into())
            .spawn(move || upload(store, key, body, deadline));

        match spawned {
            Ok(upload) => self.uploads.push(upload),
            Err(e) => error!(trace_id = %entry.trace_id, "Failed to spawn upload worker: {e}"),
        }
    }
}

/// Run one upload on its own thread and wait for it up to `deadline`.
///
/// On expiry the store is told to cancel and the record is dropped;
/// the store call itself may linger until it notices.
fn upload(store: Arc<dyn ObjectStore>, key: String, body: Vec<u8>, deadline: Duration) {
    let cancel = CancelToken::new();
    let (done_tx, done_rx) = bounded(1);

    let put = {
        let key = key.clone();
        let cancel = cancel.clone();
        Builder::new()
            .name("upload-put".into())
            .spawn(move || {
                let _ = done_tx.send(store.put(&key, &body, &cancel));
            })
    };
    if let Err(e) = put {
        error!(%key, "Failed to spawn upload: {e}");
        return;
    }

    let result = match done_rx.recv_timeout(deadline) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            Err(UploadError::DeadlineExceeded {
                key: key.clone(),
                deadline,
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(UploadError::WorkerLost { key: key.clone() }),
    };

    match result {
        Ok(()) => debug!(%key, "Uploaded log record"),
        Err(e @ UploadError::DeadlineExceeded { .. }) => warn!("Upload canceled due to timeout: {e}"),
        Err(e) => warn!("Failed to upload object: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::log_entry::tests::nat_entry;

    fn settings(deadline: Duration) -> SinkSettings {
        SinkSettings {
            key_prefix: Some("test".into()),
            upload_deadline: deadline,
            queue_capacity: 8,
        }
    }

    #[test]
    fn uploads_every_submitted_entry() {
        let store = MemoryStore::new();
        let sink = LogSink::spawn(Arc::new(store.clone()), settings(Duration::from_secs(5))).unwrap();

        let mut expected = Vec::new();
        let producers: Vec<_> = (0..4)
            .map(|i| {
                let handle = sink.handle();
                let entries: Vec<LogEntry> = (0..25)
                    .map(|j| nat_entry(&format!("10.0.{i}.{j}:4000")))
                    .collect();
                expected.extend(entries.iter().map(|e| e.object_key(Some("test"))));
                thread::spawn(move || {
                    for entry in entries {
                        handle.submit(entry);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        sink.shutdown().unwrap();

        expected.sort();
        assert_eq!(store.keys(), expected);

        let (_, body) = &store.objects()[0];
        let record: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(record["timed_out"], false);
        assert_eq!(record["type"], "nat");
    }

    /// Store that takes far longer than any deadline, and counts cancellations
    #[derive(Serialize, Deserialize, Default)]
    struct StalledStore {
        #[serde(skip)]
        cancelled: Arc<AtomicUsize>,
    }

    #[typetag::serde]
    impl ObjectStore for StalledStore {
        fn put(&self, key: &str, _body: &[u8], cancel: &CancelToken) -> Result<(), UploadError> {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            cancel.check(key)
        }
    }

    #[test]
    fn slow_uploads_are_cancelled_at_deadline() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let store = StalledStore {
            cancelled: Arc::clone(&cancelled),
        };
        let sink = LogSink::spawn(Arc::new(store), settings(Duration::from_millis(100))).unwrap();
        let handle = sink.handle();

        // Queue admission does not wait on the stalled uploads
        let start = Instant::now();
        for port in 0..3 {
            handle.submit(nat_entry(&format!("10.0.0.1:{port}")));
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        sink.shutdown().unwrap();
        // Give the stalled store calls a moment to notice
        let deadline = Instant::now() + Duration::from_secs(2);
        while cancelled.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn submit_after_shutdown_is_dropped() {
        let store = MemoryStore::new();
        let sink = LogSink::spawn(Arc::new(store.clone()), settings(Duration::from_secs(1))).unwrap();
        let handle = sink.handle();
        sink.shutdown().unwrap();

        handle.submit(nat_entry("10.0.0.1:1"));
        assert!(store.is_empty());
    }
}
