//! Content-addressed downloads.
//!
//! A [`DataTransfer`] is created by the application for a known SHA-256
//! hash, registered on a [`crate::session::PeerSession`] and completed by
//! that session's read loop when the matching data frame arrives:
//!
//! ```text
//! Unknown ──prepare(len)──▶ Accepted ──finish(bytes)──▶ Ok | Error
//! ```
//!
//! `finish` recomputes the hash over whatever bytes were received, so a
//! truncated transfer naturally ends in `Error`.  No retry happens here.

use {
    crate::error::{GeoWebError, Result},
    log::{debug, warn},
    parking_lot::{Condvar, Mutex},
    sha2::{Digest, Sha256},
    std::{
        fmt,
        str::FromStr,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    },
};

/// SHA-256 digest identifying a payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash `data`.
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether `data` hashes to this value.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl FromStr for ContentHash {
    type Err = GeoWebError;

    fn from_str(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| GeoWebError::InvalidHash(format!("{s}: {e}")))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Requested, no data seen yet.
    Unknown,
    /// Data frame started; buffer allocated.
    Accepted,
    /// All bytes received and the hash matched.
    Ok,
    /// Hash mismatch or truncated stream.
    Error,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Error)
    }
}

/// Application callbacks for a transfer.  All methods default to no-ops.
///
/// Callbacks run on the session's read-loop thread; keep them short.
pub trait TransferListener: Send + Sync {
    /// The peer started sending `size` bytes.
    fn on_started(&self, _hash: &ContentHash, _size: usize) {}
    /// The data arrived intact.
    fn on_finished(&self, _hash: &ContentHash, _data: &[u8]) {}
    /// The data did not match its hash (or the stream ended early).
    fn on_error(&self, _hash: &ContentHash) {}
}

struct NoopListener;

impl TransferListener for NoopListener {}

/// One in-flight content-addressed download.
pub struct DataTransfer {
    hash: ContentHash,
    status: Mutex<TransferStatus>,
    status_changed: Condvar,
    /// Bytes the data frame declared.
    size: AtomicUsize,
    /// Bytes copied into the buffer so far.
    received: AtomicUsize,
    data: Mutex<Option<Vec<u8>>>,
    listener: Box<dyn TransferListener>,
}

impl DataTransfer {
    /// A transfer with no application callbacks.  Use [`Self::wait`] and
    /// [`Self::data`] to collect the result.
    pub fn new(hash: ContentHash) -> Self {
        Self::with_listener(hash, NoopListener)
    }

    pub fn with_listener(hash: ContentHash, listener: impl TransferListener + 'static) -> Self {
        Self {
            hash,
            status: Mutex::new(TransferStatus::Unknown),
            status_changed: Condvar::new(),
            size: AtomicUsize::new(0),
            received: AtomicUsize::new(0),
            data: Mutex::new(None),
            listener: Box::new(listener),
        }
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn status(&self) -> TransferStatus {
        *self.status.lock()
    }

    /// Declared size of the incoming data (0 until accepted).
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Bytes received so far.
    pub fn downloaded(&self) -> usize {
        self.received.load(Ordering::Acquire)
    }

    /// The verified payload, once the transfer finished with `Ok`.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.data.lock().clone()
    }

    /// Block until the transfer is terminal or `timeout` elapses, returning
    /// the status at that point.
    pub fn wait(&self, timeout: Duration) -> TransferStatus {
        let deadline = Instant::now().checked_add(timeout);
        let mut status = self.status.lock();
        while !status.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self
                        .status_changed
                        .wait_until(&mut status, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.status_changed.wait(&mut status),
            }
        }
        *status
    }

    /// A data frame of `size` bytes started for this hash.
    pub(crate) fn prepare(&self, size: usize) {
        self.size.store(size, Ordering::Release);
        self.received.store(0, Ordering::Release);
        self.set_status(TransferStatus::Accepted);
        debug!("transfer {} accepted ({} bytes)", self.hash, size);
        self.listener.on_started(&self.hash, size);
    }

    pub(crate) fn record_progress(&self, received: usize) {
        self.received.store(received, Ordering::Release);
    }

    /// Verify the received bytes and move to a terminal state.  Calling it
    /// again after completion has no effect.
    pub(crate) fn finish(&self, data: Vec<u8>) -> TransferStatus {
        if self.status().is_terminal() {
            return self.status();
        }
        self.record_progress(data.len());
        if self.hash.matches(&data) {
            debug!("transfer {} complete ({} bytes)", self.hash, data.len());
            self.listener.on_finished(&self.hash, &data);
            *self.data.lock() = Some(data);
            self.set_status(TransferStatus::Ok);
            TransferStatus::Ok
        } else {
            warn!(
                "transfer {} failed integrity check ({} of {} bytes)",
                self.hash,
                data.len(),
                self.size()
            );
            self.listener.on_error(&self.hash);
            self.set_status(TransferStatus::Error);
            TransferStatus::Error
        }
    }

    fn set_status(&self, status: TransferStatus) {
        *self.status.lock() = status;
        self.status_changed.notify_all();
    }
}

impl fmt::Debug for DataTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataTransfer")
            .field("hash", &self.hash)
            .field("status", &self.status())
            .field("size", &self.size())
            .field("received", &self.downloaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{
            atomic::{AtomicBool, AtomicUsize},
            Arc,
        },
    };

    #[derive(Default)]
    struct Recorder {
        started: AtomicUsize,
        finished: AtomicBool,
        errored: AtomicBool,
    }

    impl TransferListener for Arc<Recorder> {
        fn on_started(&self, _hash: &ContentHash, size: usize) {
            self.started.store(size, Ordering::SeqCst);
        }
        fn on_finished(&self, _hash: &ContentHash, _data: &[u8]) {
            self.finished.store(true, Ordering::SeqCst);
        }
        fn on_error(&self, _hash: &ContentHash) {
            self.errored.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_matching_data_finishes_ok() {
        let payload = b"hello geoweb".to_vec();
        let recorder = Arc::new(Recorder::default());
        let transfer = DataTransfer::with_listener(ContentHash::of(&payload), recorder.clone());
        assert_eq!(transfer.status(), TransferStatus::Unknown);

        transfer.prepare(payload.len());
        assert_eq!(transfer.status(), TransferStatus::Accepted);
        assert_eq!(recorder.started.load(Ordering::SeqCst), payload.len());

        assert_eq!(transfer.finish(payload.clone()), TransferStatus::Ok);
        assert_eq!(transfer.data(), Some(payload));
        assert!(recorder.finished.load(Ordering::SeqCst));
        assert!(!recorder.errored.load(Ordering::SeqCst));
    }

    #[test]
    fn test_mismatch_and_truncation_error() {
        let payload = b"the real bytes".to_vec();
        let recorder = Arc::new(Recorder::default());
        let transfer = DataTransfer::with_listener(ContentHash::of(&payload), recorder.clone());
        transfer.prepare(payload.len());
        assert_eq!(transfer.finish(payload[..4].to_vec()), TransferStatus::Error);
        assert_eq!(transfer.data(), None);
        assert!(recorder.errored.load(Ordering::SeqCst));
        assert!(!recorder.finished.load(Ordering::SeqCst));

        // terminal: a late, correct finish does not flip the outcome
        assert_eq!(transfer.finish(payload), TransferStatus::Error);
    }

    #[test]
    fn test_wait_times_out_then_observes_completion() {
        let payload = vec![7u8; 1024];
        let transfer = Arc::new(DataTransfer::new(ContentHash::of(&payload)));
        assert_eq!(
            transfer.wait(Duration::from_millis(20)),
            TransferStatus::Unknown
        );

        let t = transfer.clone();
        let handle = std::thread::spawn(move || {
            t.prepare(payload.len());
            t.finish(payload);
        });
        assert_eq!(transfer.wait(Duration::from_secs(5)), TransferStatus::Ok);
        handle.join().unwrap();
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let hash = ContentHash::of(b"abc");
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash.to_hex().parse::<ContentHash>().unwrap(), hash);
        assert!("zz".parse::<ContentHash>().is_err());
    }
}
