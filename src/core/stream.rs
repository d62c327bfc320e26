//! Ordered asynchronous work queues per device.
//!
//! Each device owns one stream per purpose. A stream is a worker thread fed
//! by a channel: tasks on the same stream run in issue order, tasks on
//! different streams are unordered unless the caller synchronizes.
//!
//! ```text
//!   enqueue(copy_a) ─┐
//!   enqueue(copy_b) ─┼─► [ h2d worker ] ──► copy_a, copy_b, ack
//!   synchronize()  ──┘        (fence)
//! ```
//!
//! A failed task poisons its stream. Later tasks are skipped and every
//! subsequent `enqueue`/`synchronize` reports [`Error::DeviceFailure`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::core::block::DeviceId;
use crate::error::{Error, Result};

/// Purpose of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Compute,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Compute,
        StreamKind::HostToDevice,
        StreamKind::DeviceToHost,
        StreamKind::DeviceToDevice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::HostToDevice => "h2d",
            Self::DeviceToHost => "d2h",
            Self::DeviceToDevice => "d2d",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Compute => 0,
            Self::HostToDevice => 1,
            Self::DeviceToHost => 2,
            Self::DeviceToDevice => 3,
        }
    }
}

type Task = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

enum Message {
    Run(Task),
    Fence(Sender<()>),
}

/// One ordered worker queue.
pub struct Stream {
    device: DeviceId,
    kind: StreamKind,
    sender: Option<Sender<Message>>,
    failure: Arc<Mutex<Option<String>>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Spawn the worker thread for `kind` on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceFailure`] if the thread cannot be spawned.
    pub fn new(device: DeviceId, kind: StreamKind) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Message>();
        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let worker_failure = Arc::clone(&failure);

        let worker = thread::Builder::new()
            .name(format!("stream-{device}-{}", kind.as_str()))
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Run(task) => {
                            if worker_failure.lock().is_some() {
                                continue;
                            }
                            let outcome = panic::catch_unwind(AssertUnwindSafe(task))
                                .unwrap_or_else(|_| {
                                    Err(Error::device_failure(device, "stream task panicked"))
                                });
                            if let Err(e) = outcome {
                                error!(device, stream = kind.as_str(), error = %e, "stream task failed");
                                *worker_failure.lock() = Some(e.to_string());
                            }
                        }
                        Message::Fence(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| Error::device_failure(device, format!("spawn stream: {e}")))?;

        Ok(Self {
            device,
            kind,
            sender: Some(sender),
            failure,
            worker: Some(worker),
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether a task on this stream has failed.
    pub fn is_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    /// Queue a task behind everything already issued on this stream.
    pub fn enqueue<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.check()?;
        self.send(Message::Run(Box::new(task)))
    }

    /// Block until every task issued so far has run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceFailure`] if any task on this stream failed.
    pub fn synchronize(&self) -> Result<()> {
        let (ack, done) = channel::bounded(1);
        self.send(Message::Fence(ack))?;
        done.recv().map_err(|_| {
            Error::device_failure(self.device, format!("{} stream exited", self.kind.as_str()))
        })?;
        self.check()
    }

    fn send(&self, message: Message) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(|| {
            Error::device_failure(self.device, format!("{} stream closed", self.kind.as_str()))
        })?;
        sender.send(message).map_err(|_| {
            Error::device_failure(self.device, format!("{} stream exited", self.kind.as_str()))
        })
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().as_ref() {
            Some(message) => Err(Error::device_failure(
                self.device,
                format!("{} stream: {message}", self.kind.as_str()),
            )),
            None => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(device = self.device, stream = self.kind.as_str(), "stream worker panicked");
            }
        }
        debug!(device = self.device, stream = self.kind.as_str(), "stream closed");
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// The four streams of one device.
#[derive(Debug)]
pub struct StreamGroup {
    streams: Vec<Stream>,
}

impl StreamGroup {
    pub fn new(device: DeviceId) -> Result<Self> {
        let streams = StreamKind::ALL
            .iter()
            .map(|&kind| Stream::new(device, kind))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { streams })
    }

    pub fn get(&self, kind: StreamKind) -> &Stream {
        &self.streams[kind.index()]
    }

    /// Synchronize every stream of the device.
    pub fn synchronize_all(&self) -> Result<()> {
        for stream in &self.streams {
            stream.synchronize()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_run_in_issue_order() {
        let stream = Stream::new(0, StreamKind::HostToDevice).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .enqueue(move || {
                    log.lock().push(i);
                    Ok(())
                })
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_failure_poisons_stream() {
        let stream = Stream::new(1, StreamKind::DeviceToHost).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        stream
            .enqueue(|| Err(Error::InvalidArgument("bad copy".into())))
            .unwrap();
        let counter = Arc::clone(&ran);
        let _ = stream.enqueue(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = stream.synchronize().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(stream.is_failed());
        assert!(stream.enqueue(|| Ok(())).unwrap_err().is_fatal());
    }

    #[test]
    fn test_panicking_task_is_a_device_failure() {
        let stream = Stream::new(0, StreamKind::Compute).unwrap();
        stream.enqueue(|| panic!("kernel fault")).unwrap();
        assert!(stream.synchronize().unwrap_err().is_fatal());
    }

    #[test]
    fn test_group_has_every_kind() {
        let group = StreamGroup::new(2).unwrap();
        for kind in StreamKind::ALL {
            assert_eq!(group.get(kind).kind(), kind);
            assert_eq!(group.get(kind).device(), 2);
        }
        group.synchronize_all().unwrap();
    }
}
