use super::wire::{ControlMessage, ControlPacket, Hello, PACKET_SIZE};
use crate::error::{Error, Result};
use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

#[derive(Debug)]
pub enum Event {
    Message(ControlMessage),
    /// A frame arrived but failed validation; the source stays usable.
    Rejected(Error),
    /// Nothing arrived within the timeout.
    Idle,
    /// The controller went away.
    Closed,
}

/// Unblocks a source from any thread. Closing is a single syscall.
#[derive(Debug)]
pub struct Closer(UnixStream);

impl Closer {
    pub fn close(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}

pub trait ControlSource: Send {
    /// Waits up to `timeout` for the next event. An `Err` is a transport
    /// failure and is handled like [`Event::Closed`].
    fn recv(&mut self, timeout: Duration) -> Result<Event>;

    fn closer(&self) -> Option<Closer> {
        None
    }
}

/// Packets from the companion process over the Zygisk companion socket.
#[derive(Debug)]
pub struct StreamSource {
    stream: UnixStream,
    buffer: [u8; PACKET_SIZE],
    filled: usize,
}

impl StreamSource {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buffer: [0; PACKET_SIZE],
            filled: 0,
        }
    }

    /// Introduces this process to the companion.
    pub fn handshake(stream: UnixStream, hello: &Hello, timeout: Duration) -> Result<Self> {
        stream.set_write_timeout(Some(timeout))?;
        hello.write_to(&mut &stream)?;
        stream.set_write_timeout(None)?;

        Ok(Self::new(stream))
    }
}

impl AsRawFd for StreamSource {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl ControlSource for StreamSource {
    fn recv(&mut self, timeout: Duration) -> Result<Event> {
        self.stream.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        loop {
            match self.stream.read(&mut self.buffer[self.filled..]) {
                Ok(0) => return Ok(Event::Closed),
                Ok(read) => self.filled += read,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Event::Idle);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }

            if self.filled == PACKET_SIZE {
                self.filled = 0;
                return Ok(match ControlPacket::decode(&self.buffer) {
                    Ok(message) => Event::Message(message),
                    Err(err) => Event::Rejected(err),
                });
            }
        }
    }

    fn closer(&self) -> Option<Closer> {
        self.stream.try_clone().ok().map(Closer)
    }
}

/// Sending half of a [`LocalSource`], for controllers in this process.
#[derive(Debug, Clone)]
pub struct LocalSender(Sender<ControlMessage>);

impl LocalSender {
    pub fn send(&self, message: ControlMessage) -> Result<()> {
        self.0
            .send(message)
            .map_err(|_| Error::Channel("local channel closed".into()))
    }
}

/// Messages from code running in this process. Dropping every
/// [`LocalSender`] reads as a disconnect.
#[derive(Debug)]
pub struct LocalSource(Receiver<ControlMessage>);

impl LocalSource {
    pub fn new() -> (LocalSender, LocalSource) {
        let (tx, rx) = mpsc::channel();
        (LocalSender(tx), LocalSource(rx))
    }
}

impl ControlSource for LocalSource {
    fn recv(&mut self, timeout: Duration) -> Result<Event> {
        match self.0.recv_timeout(timeout) {
            Ok(message) => Ok(Event::Message(message)),
            Err(RecvTimeoutError::Timeout) => Ok(Event::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Event::Closed),
        }
    }
}
