//! # StreamMux: per-instance stdio fan-out and stdin fan-in.
//!
//! One [`StreamMux`] wraps the standard I/O of a child process:
//!
//! - Every declared output label gets a reader task that forwards raw
//!   chunks (boundaries preserved as read, no line assumption) to the
//!   event emitter under `stream.<pid>.<label>` with payload
//!   `{data, label, pid}`, and appends them to a bounded ring backlog
//!   so late subscribers can opt in to recent output.
//! - Declaring the same label for stdout and stderr merges both pipes
//!   onto one topic and one backlog.
//! - Stdin writes from any number of producers are queued and written
//!   by a single writer task, so concurrent writes never interleave
//!   within a chunk. The bounded queue is the back-pressure channel:
//!   [`StreamMux::write`] awaits capacity, [`StreamMux::try_write`]
//!   returns [`Error::WouldBlock`] when full.
//!
//! Heartbeats for idle stream subscribers are handled by the emitter's
//! subscription options, not here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Error;
use crate::events::{stream_topic, Event, EventEmitter, EventKind};

/// Bounded byte ring keeping the most recent output of one stream.
struct RingBuffer {
    buf: VecDeque<u8>,
    cap: usize,
}

impl RingBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(4096)),
            cap,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.len() >= self.cap {
            // The chunk alone fills the ring; keep its tail.
            self.buf.clear();
            self.buf.extend(&bytes[bytes.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + bytes.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(bytes);
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

/// Per-instance stdio multiplexer.
pub struct StreamMux {
    pid: u64,
    qname: String,
    emitter: EventEmitter,
    backlog_cap: usize,
    stdin_cap: usize,
    rings: Mutex<HashMap<String, Arc<Mutex<RingBuffer>>>>,
    stdin_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    channels: Mutex<HashSet<String>>,
    token: CancellationToken,
}

impl StreamMux {
    pub(crate) fn new(
        pid: u64,
        qname: impl Into<String>,
        emitter: EventEmitter,
        backlog_cap: usize,
        stdin_cap: usize,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            qname: qname.into(),
            emitter,
            backlog_cap: backlog_cap.max(1),
            stdin_cap: stdin_cap.max(1),
            rings: Mutex::new(HashMap::new()),
            stdin_tx: Mutex::new(None),
            channels: Mutex::new(HashSet::new()),
            token,
        })
    }

    /// The internal pid this mux belongs to.
    pub fn pid(&self) -> u64 {
        self.pid
    }

    /// Declared output and channel labels.
    pub fn labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = lock(&self.rings).keys().cloned().collect();
        labels.extend(lock(&self.channels).iter().cloned());
        labels.sort_unstable();
        labels.dedup();
        labels
    }

    /// True if the label names a declared output or channel.
    pub fn has_label(&self, label: &str) -> bool {
        lock(&self.rings).contains_key(label) || lock(&self.channels).contains(label)
    }

    /// True if stdin redirection is active.
    pub fn stdin_open(&self) -> bool {
        lock(&self.stdin_tx).is_some()
    }

    /// Attaches one OS pipe under a label and starts its reader task.
    ///
    /// Attaching a second pipe under an existing label merges them on
    /// one topic and one backlog (the stderr-into-stdout rule).
    pub(crate) fn attach_output<R>(self: &Arc<Self>, label: &str, stream: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let ring = {
            let mut rings = lock(&self.rings);
            Arc::clone(
                rings
                    .entry(label.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(RingBuffer::new(self.backlog_cap)))),
            )
        };

        let mux = Arc::clone(self);
        let label = label.to_string();
        let token = self.token.clone();
        tokio::spawn(async move {
            let topic = stream_topic(mux.pid, &label);
            let mut stream = stream;
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    read = stream.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let chunk = &buf[..n];
                            lock(&ring).push(chunk);
                            mux.emitter.publish(
                                topic.clone(),
                                Event::now(EventKind::StreamChunk)
                                    .with_name(&mux.qname)
                                    .with_pid(mux.pid)
                                    .with_label(&label)
                                    .with_data(chunk.to_vec()),
                            );
                        }
                        Err(e) => {
                            trace!(pid = mux.pid, %label, error = %e, "stream read failed");
                            break;
                        }
                    }
                }
            }
            debug!(pid = mux.pid, %label, "stream reader finished");
        });
    }

    /// Attaches the writable stdin pipe and starts the writer task.
    pub(crate) fn attach_stdin<W>(self: &Arc<Self>, stdin: W)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.stdin_cap);
        *lock(&self.stdin_tx) = Some(tx);

        let pid = self.pid;
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        None => break,
                        Some(chunk) => {
                            // One queued chunk is one uninterrupted write.
                            if stdin.write_all(&chunk).await.is_err() {
                                break;
                            }
                            if stdin.flush().await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(pid, "stdin writer finished");
        });
    }

    /// Registers an in-process custom channel label.
    pub(crate) fn register_channel(&self, label: &str) {
        lock(&self.channels).insert(label.to_string());
    }

    /// Queues a write to the child's stdin, awaiting queue capacity.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), Error> {
        let tx = lock(&self.stdin_tx).clone().ok_or(Error::InvalidState {
            reason: "stdin not redirected".into(),
        })?;
        tx.send(data).await.map_err(|_| Error::InvalidState {
            reason: "stdin closed".into(),
        })
    }

    /// Queues a write without blocking; [`Error::WouldBlock`] when the
    /// queue is full.
    pub fn try_write(&self, data: Vec<u8>) -> Result<(), Error> {
        let tx = lock(&self.stdin_tx).clone().ok_or(Error::InvalidState {
            reason: "stdin not redirected".into(),
        })?;
        match tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::WouldBlock),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::InvalidState {
                reason: "stdin closed".into(),
            }),
        }
    }

    /// Publishes a chunk on a custom channel label.
    pub fn write_channel(&self, label: &str, data: Vec<u8>) -> Result<(), Error> {
        if !lock(&self.channels).contains(label) {
            return Err(Error::NotFound {
                name: label.to_string(),
            });
        }
        self.emitter.publish(
            stream_topic(self.pid, label),
            Event::now(EventKind::StreamChunk)
                .with_name(&self.qname)
                .with_pid(self.pid)
                .with_label(label)
                .with_data(data),
        );
        Ok(())
    }

    /// Returns the recent-output backlog for a label (opt-in replay).
    pub fn backlog(&self, label: &str) -> Result<Vec<u8>, Error> {
        lock(&self.rings)
            .get(label)
            .map(|ring| lock(ring).snapshot())
            .ok_or(Error::NotFound {
                name: label.to_string(),
            })
    }

    /// Stops reader and writer tasks and closes the stdin queue.
    pub(crate) fn close(&self) {
        self.token.cancel();
        lock(&self.stdin_tx).take();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Pattern, SubscribeOptions};

    fn mux(emitter: &EventEmitter) -> Arc<StreamMux> {
        StreamMux::new(
            7,
            "app.w",
            emitter.clone(),
            32,
            2,
            CancellationToken::new(),
        )
    }

    #[test]
    fn ring_keeps_most_recent_bytes() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"abcd");
        assert_eq!(ring.snapshot(), b"abcd");
        ring.push(b"efgh");
        assert_eq!(ring.snapshot(), b"abcdefgh");
        ring.push(b"XY");
        assert_eq!(ring.snapshot(), b"cdefghXY");
        ring.push(b"0123456789");
        assert_eq!(ring.snapshot(), b"23456789");
    }

    #[tokio::test]
    async fn output_chunks_reach_subscribers_and_backlog() {
        let emitter = EventEmitter::new(16);
        let sub = emitter.subscribe(Pattern::new("stream.7.out"), SubscribeOptions::default());

        let m = mux(&emitter);
        let (mut writer, reader) = tokio::io::duplex(64);
        m.attach_output("out", reader);

        writer.write_all(b"hello\n").await.unwrap();
        writer.flush().await.unwrap();

        let d = sub.recv().await.unwrap();
        assert_eq!(d.topic.as_str(), "stream.7.out");
        assert_eq!(d.event.data.as_deref(), Some(b"hello\n".as_slice()));
        assert_eq!(d.event.label.as_deref(), Some("out"));
        assert_eq!(d.event.pid, Some(7));

        assert_eq!(m.backlog("out").unwrap(), b"hello\n");
        assert!(m.backlog("nope").is_err());
    }

    #[tokio::test]
    async fn stdin_writes_are_serialized_through_the_queue() {
        let emitter = EventEmitter::new(16);
        let m = mux(&emitter);
        let (writer, mut reader) = tokio::io::duplex(64);
        m.attach_stdin(writer);

        m.write(b"one".to_vec()).await.unwrap();
        m.write(b"two".to_vec()).await.unwrap();

        let mut buf = vec![0u8; 6];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"onetwo");
    }

    #[tokio::test]
    async fn try_write_reports_would_block() {
        let emitter = EventEmitter::new(16);
        let m = mux(&emitter);
        // Writer task never drains: attach a pipe nobody reads and fill
        // the queue (capacity 2) plus whatever the writer grabbed.
        let (writer, _reader) = tokio::io::duplex(1);
        m.attach_stdin(writer);

        let mut saw_would_block = false;
        for _ in 0..16 {
            match m.try_write(vec![b'x'; 8]) {
                Ok(()) => {}
                Err(Error::WouldBlock) => {
                    saw_would_block = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_would_block);
    }

    #[tokio::test]
    async fn write_without_redirect_is_invalid_state() {
        let emitter = EventEmitter::new(16);
        let m = mux(&emitter);
        assert!(matches!(
            m.write(b"x".to_vec()).await,
            Err(Error::InvalidState { .. })
        ));
    }
}
