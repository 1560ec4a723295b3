//! TCP wire layer: one socket, one send path, one blocking read loop.
//!
//! ## Sending
//!
//! Every frame is encoded into a single buffer and written under the
//! connection's write lock, so concurrent callers never interleave partial
//! frames.
//!
//! ## Receiving
//!
//! [`Connection::run_read_loop`] reads strictly one frame at a time:
//!
//! 1. Read the 5-byte `[type][length]` header.
//! 2. Control frame: read the payload and hand it to the
//!    [`FrameHandler`] (which queues it for the worker pool).
//! 3. Data frame: read the 32-byte hash, claim the registered
//!    [`DataTransfer`] (an unrequested hash is a protocol violation that
//!    ends the loop), then stream the data into its buffer.  If the stream
//!    dies half-way the transfer is still finished with the bytes received.

use {
    crate::{
        error::{GeoWebError, Result},
        message::{self, ControlMessage, FrameHeader, HASH_LEN},
        transfer::{ContentHash, DataTransfer},
    },
    log::{debug, trace},
    parking_lot::Mutex,
    std::{
        io::{self, BufReader, ErrorKind, Read, Write},
        net::{Shutdown, SocketAddr, TcpStream},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Receives what the read loop decodes.
pub trait FrameHandler {
    /// A complete control payload (not yet parsed).
    fn on_control(&self, payload: Vec<u8>);

    /// A data frame for `hash` started.  Returns the transfer registered
    /// under that hash, removing it from the registry, or `None` when
    /// nothing was requested.
    fn claim_transfer(&self, hash: &ContentHash) -> Option<Arc<DataTransfer>>;
}

/// One framed TCP connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    peer_addr: SocketAddr,
    max_frame_size: usize,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap a connected stream.
    pub fn new(stream: TcpStream, max_frame_size: usize) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            stream,
            writer: Mutex::new(writer),
            peer_addr,
            max_frame_size,
            closed: AtomicBool::new(false),
        })
    }

    /// The remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send a control frame.
    pub fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let frame = message::encode_control_frame(message, self.max_frame_size)?;
        trace!(
            "sending {} to {}",
            message.command().unwrap_or("<none>"),
            self.peer_addr
        );
        self.write_frame(&frame)
    }

    /// Send a data frame.
    pub fn send_data(&self, hash: &ContentHash, data: &[u8]) -> Result<()> {
        let frame = message::encode_data_frame(hash, data, self.max_frame_size)?;
        debug!("sending {} bytes for {} to {}", data.len(), hash, self.peer_addr);
        self.write_frame(&frame)
    }

    fn write_frame(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(GeoWebError::SessionClosed);
        }
        let mut writer = self.writer.lock();
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Close the socket in both directions, which also unblocks the read
    /// loop.  Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                debug!("shutdown of {} failed: {}", self.peer_addr, e);
            }
        }
    }

    /// Read frames until EOF, an I/O error, or a protocol violation.
    ///
    /// Returns `Ok(())` on a clean end of stream.
    pub fn run_read_loop(&self, handler: &impl FrameHandler) -> Result<()> {
        let mut reader = BufReader::new(&self.stream);
        loop {
            let header = match FrameHeader::read_from(&mut reader, self.max_frame_size) {
                Ok(header) => header,
                Err(GeoWebError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            match header {
                FrameHeader::Control { len } => {
                    let mut payload = vec![0u8; len];
                    reader.read_exact(&mut payload)?;
                    handler.on_control(payload);
                }
                FrameHeader::Data { len } => {
                    let mut hash = [0u8; HASH_LEN];
                    reader.read_exact(&mut hash)?;
                    let hash = ContentHash::new(hash);
                    let Some(transfer) = handler.claim_transfer(&hash) else {
                        return Err(GeoWebError::UnrequestedData(hash.to_hex()));
                    };
                    transfer.prepare(len);
                    let (data, outcome) = read_data(&mut reader, len, &transfer);
                    transfer.finish(data);
                    outcome?;
                }
            }
        }
    }
}

/// Fill a `len`-byte buffer, reporting progress to `transfer`.  On a short
/// read the partial buffer is returned together with the error.
fn read_data(
    reader: &mut impl Read,
    len: usize,
    transfer: &DataTransfer,
) -> (Vec<u8>, io::Result<()>) {
    let mut buf = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                buf.truncate(filled);
                return (buf, Err(ErrorKind::UnexpectedEof.into()));
            }
            Ok(n) => {
                filled = filled.saturating_add(n);
                transfer.record_progress(filled);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                buf.truncate(filled);
                return (buf, Err(e));
            }
        }
    }
    (buf, Ok(()))
}
