//! In-memory port used by unit tests.
//!
//! Every written byte is handed to a responder closure which may queue reply
//! bytes. Reading from an empty queue fails with `TimedOut`, like a real
//! serial port whose read timeout elapsed.

use crate::error::Result;
use crate::port::Port;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

type Responder = Box<dyn FnMut(u8, &mut VecDeque<u8>) + Send>;

pub(crate) struct MockPort {
    rx: VecDeque<u8>,
    responder: Responder,
    pub(crate) written: Vec<u8>,
    /// Baud rates passed to `reopen`, in order.
    pub(crate) reopened: Vec<u32>,
    baud_rate: u32,
    timeout: Option<Duration>,
    pub(crate) closed: bool,
}

impl MockPort {
    /// Port that answers every written byte through `responder`.
    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: FnMut(u8, &mut VecDeque<u8>) + Send + 'static,
    {
        Self {
            rx: VecDeque::new(),
            responder: Box::new(responder),
            written: Vec::new(),
            reopened: Vec::new(),
            baud_rate: 9600,
            timeout: Some(Duration::from_millis(100)),
            closed: false,
        }
    }

    /// Port with a fixed reply stream, independent of what is written.
    pub(crate) fn scripted(reply: &[u8]) -> Self {
        let mut port = Self::with_responder(|_, _| {});
        port.rx.extend(reply);
        port
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() || buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.written.push(byte);
            (self.responder)(byte, &mut self.rx);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn reopen(&mut self, baud_rate: u32, timeout: Option<Duration>) -> Result<()> {
        self.rx.clear();
        self.reopened.push(baud_rate);
        self.baud_rate = baud_rate;
        self.timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
