//! Transport
//!
//! The capability the exchange layer needs from a USB session, and the libusb backed connection
//! implementing it.
//!

use std::time::Duration;

use log::{debug, trace, warn};
use rusb::{Context, DeviceHandle};

use crate::constants::misc::{BULK_TIMEOUT_DURATION, HEADER_SIZE, MAX_BLOCK_SIZE, TRANSIENT_READ_RETRIES};
use crate::error::Error;
use crate::types::BulkEndpoints;

/// ### Transport
///
/// Raw bulk I/O against one claimed interface.
///
pub trait Transport {
    /// Max packet size reported by the bulk OUT endpoint
    fn max_packet_size(&self) -> usize;

    /// Write one frame to the bulk OUT endpoint.
    fn write_bulk(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Read one frame from the bulk IN endpoint into `buf`, returning the byte count.
    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Clear a stall on the bulk IN endpoint.
    fn clear_in_halt(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Reset the device after a failed transfer.
    fn reset(&mut self) -> Result<(), Error>;

    /// Release the interface and close the session. Must be safe to call more than once.
    fn release(&mut self);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn max_packet_size(&self) -> usize {
        (**self).max_packet_size()
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), Error> {
        (**self).write_bulk(data)
    }

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read_bulk(buf)
    }

    fn clear_in_halt(&mut self) -> Result<(), Error> {
        (**self).clear_in_halt()
    }

    fn reset(&mut self) -> Result<(), Error> {
        (**self).reset()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// Largest frame we put on the wire, whatever the endpoint advertises
pub fn block_size<T: Transport + ?Sized>(transport: &T) -> usize {
    transport.max_packet_size().min(MAX_BLOCK_SIZE)
}

/// ### Bulk Write
///
/// Write one frame, refusing frames larger than the clamped block size.
///
pub fn bulk_write<T: Transport + ?Sized>(transport: &mut T, frame: &[u8]) -> Result<(), Error> {
    let max = block_size(&*transport);
    if frame.len() > max {
        return Err(Error::FrameTooLarge {
            size: frame.len(),
            max,
        });
    }

    trace!("bulk out: {} bytes {:02X?}", frame.len(), &frame[..frame.len().min(HEADER_SIZE)]);
    transport.write_bulk(frame)
}

/// ### Bulk Read
///
/// Read one frame. A busy or stalled pipe is retried a few times, anything else fails at once.
///
pub fn bulk_read<T: Transport + ?Sized>(transport: &mut T) -> Result<Vec<u8>, Error> {
    let mut buffer = vec![0x00; transport.max_packet_size() + HEADER_SIZE];
    let mut retries = 0;

    loop {
        match transport.read_bulk(&mut buffer) {
            Ok(bytes_read) => {
                buffer.truncate(bytes_read);
                trace!("bulk in: {} bytes", bytes_read);
                return Ok(buffer);
            }
            Err(err) if err.is_transient() && retries < TRANSIENT_READ_RETRIES => {
                retries += 1;
                warn!("bulk in transient failure ({err}), retry {retries}/{TRANSIENT_READ_RETRIES}");
                if let Err(err) = transport.clear_in_halt() {
                    debug!("clear halt failed: {err}");
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// ### USB Connection
///
/// A claimed interface on an opened device. Released when dropped.
///
#[derive(Debug)]
pub struct UsbConnection {
    handle: Option<DeviceHandle<Context>>,
    context: Option<Context>,
    endpoints: BulkEndpoints,
    detached_kernel_driver: bool,
    timeout: Duration,
}

impl UsbConnection {
    pub(crate) fn new(
        context: Context,
        handle: DeviceHandle<Context>,
        endpoints: BulkEndpoints,
        detached_kernel_driver: bool,
    ) -> UsbConnection {
        UsbConnection {
            handle: Some(handle),
            context: Some(context),
            endpoints,
            detached_kernel_driver,
            timeout: BULK_TIMEOUT_DURATION,
        }
    }

    pub fn endpoints(&self) -> &BulkEndpoints {
        &self.endpoints
    }

    fn handle(&self) -> Result<&DeviceHandle<Context>, Error> {
        self.handle.as_ref().ok_or(Error::Usb(rusb::Error::NoDevice))
    }
}

impl Transport for UsbConnection {
    fn max_packet_size(&self) -> usize {
        self.endpoints.bulk_out_ep.max_packet_size as usize
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), Error> {
        let written = self
            .handle()?
            .write_bulk(self.endpoints.bulk_out_ep.address, data, self.timeout)
            .map_err(|e| Error::from_transfer("out", self.timeout, e))?;

        if written != data.len() {
            return Err(Error::Transfer {
                direction: "out",
                source: rusb::Error::Io,
            });
        }

        Ok(())
    }

    fn read_bulk(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.handle()?
            .read_bulk(self.endpoints.bulk_in_ep.address, buf, self.timeout)
            .map_err(|e| Error::from_transfer("in", self.timeout, e))
    }

    fn clear_in_halt(&mut self) -> Result<(), Error> {
        self.handle()?.clear_halt(self.endpoints.bulk_in_ep.address)?;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), Error> {
        debug!("resetting device");
        match self.handle.as_mut() {
            Some(handle) => Ok(handle.reset()?),
            None => Ok(()),
        }
    }

    fn release(&mut self) {
        let interface = self.endpoints.interface_number;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.release_interface(interface) {
                warn!("failed to release interface {interface}: {e}");
            }
            if self.detached_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    warn!("failed to reattach kernel driver on interface {interface}: {e}");
                }
            }
            // closes the device
            drop(handle);
            debug!("released interface {interface}");
        }

        self.context.take();
    }
}

impl Drop for UsbConnection {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{reply_frame, Event, MockTransport};
    use super::*;

    fn busy() -> Error {
        Error::Transfer {
            direction: "in",
            source: rusb::Error::Busy,
        }
    }

    #[test]
    fn block_size_is_clamped() {
        assert_eq!(block_size(&MockTransport::new(64)), 64);
        assert_eq!(block_size(&MockTransport::new(512)), 512);
        assert_eq!(block_size(&MockTransport::new(1024)), 512);
    }

    #[test]
    fn oversized_frame_is_refused() {
        let mut transport = MockTransport::new(64);
        let err = bulk_write(&mut transport, &[0; 68]).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge { size: 68, max: 64 }));
        assert!(transport.writes().is_empty());
    }

    #[test]
    fn transient_read_is_retried() {
        let frame = reply_frame(1, b"ok", true);
        let mut transport = MockTransport::new(64)
            .reply_err(busy())
            .reply_err(Error::Transfer {
                direction: "in",
                source: rusb::Error::Pipe,
            })
            .reply(frame.clone());

        assert_eq!(bulk_read(&mut transport).unwrap(), frame);
        assert_eq!(
            transport.events(),
            vec![
                Event::Read,
                Event::ClearHalt,
                Event::Read,
                Event::ClearHalt,
                Event::Read
            ]
        );
    }

    #[test]
    fn transient_read_gives_up_after_three_retries() {
        let mut transport = MockTransport::new(64)
            .reply_err(busy())
            .reply_err(busy())
            .reply_err(busy())
            .reply_err(busy())
            .reply(reply_frame(1, b"late", true));

        let err = bulk_read(&mut transport).unwrap_err();
        assert!(err.is_transient());
        let reads = transport.events().iter().filter(|e| **e == Event::Read).count();
        assert_eq!(reads, 4);
        assert_eq!(transport.replies.len(), 1);
    }

    #[test]
    fn other_failures_are_not_retried() {
        let mut transport = MockTransport::new(64).reply_err(Error::Transfer {
            direction: "in",
            source: rusb::Error::NoDevice,
        });

        let err = bulk_read(&mut transport).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(transport.events(), vec![Event::Read]);
    }

    #[test]
    fn read_buffer_fits_packet_and_header() {
        let payload = vec![b'x'; 64];
        let mut transport = MockTransport::new(64).reply(reply_frame(1, &payload, true));
        assert_eq!(bulk_read(&mut transport).unwrap().len(), 76);
    }
}
