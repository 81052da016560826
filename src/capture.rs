use crate::prelude::*;

use std::io::{ErrorKind, Read};

// how long a read may block before the cancellation token is looked at again
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// One byte off the wire with the monotonic time it was read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteEvent {
    pub timestamp: Instant,
    pub byte: u8,
}

impl ByteEvent {
    pub fn new(timestamp: Instant, byte: u8) -> Self {
        Self { timestamp, byte }
    }
}

pub type Sender = mpsc::UnboundedSender<ByteEvent>;
pub type Receiver = mpsc::UnboundedReceiver<ByteEvent>;

/// Reads the RS-485 line and timestamps every byte. Never transmits.
pub struct Capture {
    device: config::Device,
}

impl Capture {
    pub fn new(device: config::Device) -> Self {
        Self { device }
    }

    pub fn open(&self) -> Result<Box<dyn serialport::SerialPort>> {
        let d = &self.device;

        serialport::new(d.path(), d.baud_rate())
            .data_bits(d.data_bits())
            .parity(d.parity())
            .stop_bits(d.stop_bits())
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| file_error_with_source!(err, "failed to open {}", d.path()))
    }

    /// Capture on a dedicated blocking thread until cancelled or the device fails.
    ///
    /// Returns the number of bytes captured. Dropping the sender on return is
    /// what tells the parser there is nothing more to come.
    pub async fn start(self, to_parser: Sender, cancel: CancellationToken) -> Result<u64> {
        tokio::task::spawn_blocking(move || {
            let port = self.open()?;
            info!(
                "capturing on {} at {} baud ({:?}, {:?}, {:?})",
                self.device.path(),
                self.device.baud_rate(),
                self.device.data_bits(),
                self.device.parity(),
                self.device.stop_bits()
            );
            Self::run(port, &to_parser, &cancel)
        })
        .await?
    }

    /// The capture loop proper: read one byte, stamp, hand off. Nothing else
    /// happens here since any added latency would show up as a false frame gap.
    pub fn run<R: Read>(mut reader: R, to_parser: &Sender, cancel: &CancellationToken) -> Result<u64> {
        let mut buf = [0u8; 1];
        let mut total = 0;

        loop {
            if cancel.is_cancelled() {
                info!("capture cancelled after {} bytes", total);
                return Ok(total);
            }

            match reader.read(&mut buf) {
                Ok(0) => return Err(file_error!("serial device closed after {} bytes", total)),
                Ok(n) => {
                    let timestamp = Instant::now();
                    for &byte in &buf[..n] {
                        if to_parser.send(ByteEvent { timestamp, byte }).is_err() {
                            info!("parser gone, capture exiting");
                            return Ok(total);
                        }
                    }
                    total += n as u64;
                }
                Err(err) if matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(err) => return Err(file_error_with_source!(err, "serial read failed")),
            }
        }
    }
}
