//! Native serial port implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        port::{Port, SerialConfig},
    },
    log::{debug, trace},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Read timeout used when the caller asks for a blocking port.
///
/// `serialport` has no "wait forever" mode, so a blocking read is an hour-long
/// one.
const BLOCKING_TIMEOUT: Duration = Duration::from_secs(3600);

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Option<Duration>,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = Self::open_raw(&config.port_name, config.baud_rate, config.timeout)?;

        Ok(Self {
            port: Some(port),
            name: config.port_name.clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    /// Open a serial port with the default timeout.
    pub fn open_simple(port_name: &str, baud_rate: u32) -> Result<Self> {
        let config = SerialConfig::new(port_name, baud_rate);
        Self::open(&config)
    }

    fn open_raw(
        name: &str,
        baud_rate: u32,
        timeout: Option<Duration>,
    ) -> Result<Box<dyn serialport::SerialPort>> {
        let port = serialport::new(name, baud_rate)
            .timeout(timeout.unwrap_or(BLOCKING_TIMEOUT))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(port)
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout.unwrap_or(BLOCKING_TIMEOUT))?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn reopen(&mut self, baud_rate: u32, timeout: Option<Duration>) -> Result<()> {
        debug!("Reopening {} at {baud_rate} baud", self.name);
        // The old handle has to be gone before the device node can be opened again.
        drop(self.port.take());
        let mut port = Self::open_raw(&self.name, baud_rate, timeout)?;
        port.clear(ClearBuffer::All)?;
        self.port = Some(port);
        self.baud_rate = baud_rate;
        self.timeout = timeout;
        Ok(())
    }

    fn clear_buffers(&mut self) -> Result<()> {
        match self.port {
            Some(ref mut p) => {
                p.clear(ClearBuffer::All)?;
                Ok(())
            },
            None => Err(Self::closed_error()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        trace!("Closing {}", self.name);
        self.port.take();
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}
