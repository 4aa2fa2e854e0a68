//! ## Initialization
//!
//! A set of functions to find an instrument on the bus and open a connection to it.
//!

use log::{debug, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};

use crate::communication::transport::UsbConnection;
use crate::constants::usb::{FALLBACK_PACKET_SIZE, HUB_CLASS_CODE};
use crate::error::Error;
use crate::registry::{DeviceIdentity, Registry};
use crate::types::{
    BulkEndpoints, DeviceDescription, Endpoint, EndpointDescription, InterfaceDescription,
};

/// ### Describe Interfaces
///
/// Every interface of every configuration, with its endpoints.
///
pub fn describe_interfaces<T: UsbContext>(device: &Device<T>) -> Vec<InterfaceDescription> {
    let Ok(device_desc) = device.device_descriptor() else {
        return Vec::new();
    };

    let mut interfaces = Vec::new();
    for n in 0..device_desc.num_configurations() {
        let Ok(config_desc) = device.config_descriptor(n) else {
            continue;
        };
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                interfaces.push(InterfaceDescription {
                    number: interface_desc.interface_number(),
                    endpoints: interface_desc
                        .endpoint_descriptors()
                        .map(|endpoint| EndpointDescription {
                            address: endpoint.address(),
                            direction: endpoint.direction(),
                            transfer_type: endpoint.transfer_type(),
                            max_packet_size: endpoint.max_packet_size(),
                        })
                        .collect(),
                });
            }
        }
    }

    interfaces
}

/// ### Select Endpoints
///
/// Pick the bulk IN/OUT pair to talk through. Interface and endpoint numbers pinned in the
/// identity win over discovery; the OUT endpoint's max packet size is read from the descriptors
/// either way.
///
pub fn select_endpoints(
    interfaces: &[InterfaceDescription],
    identity: &DeviceIdentity,
) -> Option<BulkEndpoints> {
    let find = |interface: &InterfaceDescription, direction: Direction, pinned: Option<u8>| {
        interface
            .endpoints
            .iter()
            .filter(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == direction)
            .find(|ep| pinned.map_or(true, |address| ep.address == address))
            .map(|ep| Endpoint {
                address: ep.address,
                max_packet_size: ep.max_packet_size,
            })
    };

    let discovered = interfaces
        .iter()
        .filter(|i| identity.interface.map_or(true, |n| i.number == n))
        .find_map(|interface| {
            let bulk_out_ep = find(interface, Direction::Out, identity.endpoint_out)?;
            let bulk_in_ep = find(interface, Direction::In, identity.endpoint_in)?;
            Some(BulkEndpoints {
                interface_number: interface.number,
                bulk_out_ep,
                bulk_in_ep,
            })
        });

    if discovered.is_some() || !interfaces.is_empty() {
        return discovered;
    }

    // fully pinned entries still work when descriptors could not be read
    match (identity.interface, identity.endpoint_out, identity.endpoint_in) {
        (Some(interface_number), Some(out), Some(input)) => Some(BulkEndpoints {
            interface_number,
            bulk_out_ep: Endpoint {
                address: out,
                max_packet_size: FALLBACK_PACKET_SIZE,
            },
            bulk_in_ep: Endpoint {
                address: input,
                max_packet_size: FALLBACK_PACKET_SIZE,
            },
        }),
        _ => None,
    }
}

/// The handle operations needed to claim an interface
pub trait InterfaceClaim {
    fn claim(&mut self, interface: u8) -> rusb::Result<()>;
    fn detach_driver(&mut self, interface: u8) -> rusb::Result<()>;
    fn attach_driver(&mut self, interface: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> InterfaceClaim for DeviceHandle<T> {
    fn claim(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn detach_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::detach_kernel_driver(self, interface)
    }

    fn attach_driver(&mut self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, interface)
    }
}

/// ### Claim Interface
///
/// Claim the interface. When that fails, detach a kernel driver once and retry the claim once.
/// Returns whether a kernel driver was detached.
///
pub fn claim_interface<H: InterfaceClaim + ?Sized>(handle: &mut H, interface: u8) -> Result<bool, Error> {
    let first = match handle.claim(interface) {
        Ok(()) => return Ok(false),
        Err(e) => e,
    };
    debug!("claim of interface {interface} failed ({first}), detaching kernel driver");

    if let Err(e) = handle.detach_driver(interface) {
        debug!("detach kernel driver failed: {e}");
        return Err(Error::Claim {
            interface,
            source: first,
        });
    }

    match handle.claim(interface) {
        Ok(()) => Ok(true),
        Err(source) => {
            if let Err(e) = handle.attach_driver(interface) {
                warn!("failed to reattach kernel driver on interface {interface}: {e}");
            }
            Err(Error::Claim { interface, source })
        }
    }
}

fn open_and_claim(
    context: &Context,
    device: &Device<Context>,
    identity: &DeviceIdentity,
) -> Result<UsbConnection, Error> {
    let interfaces = describe_interfaces(device);
    let endpoints = select_endpoints(&interfaces, identity).ok_or(Error::EndpointsNotFound)?;
    debug!("using {endpoints:?}");

    let mut handle = device.open().map_err(Error::Open)?;
    let detached = claim_interface(&mut handle, endpoints.interface_number)?;

    Ok(UsbConnection::new(context.clone(), handle, endpoints, detached))
}

/// ### Connect
///
/// Open and claim the first attached device matching the identity's vendor and product ids.
/// Nothing stays open or claimed when this fails.
///
pub fn connect(identity: &DeviceIdentity) -> Result<UsbConnection, Error> {
    let context = Context::new()?;
    let mut last_error = None;

    for device in context.devices()?.iter() {
        let Ok(device_desc) = device.device_descriptor() else {
            continue;
        };
        if device_desc.vendor_id() != identity.vendor_id
            || device_desc.product_id() != identity.product_id
        {
            continue;
        }

        debug!(
            "found {} on bus {} address {}",
            identity.name,
            device.bus_number(),
            device.address()
        );
        match open_and_claim(&context, &device, identity) {
            Ok(connection) => return Ok(connection),
            Err(e) => {
                warn!("unable to use {} on bus {}: {e}", identity.name, device.bus_number());
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::DeviceNotFound {
        name: identity.name.clone(),
        vendor_id: identity.vendor_id,
        product_id: identity.product_id,
    }))
}

/// ### List Devices
///
/// Describe every attached non-hub device sharing a vendor id with the registry.
///
pub fn list_devices(registry: &Registry) -> Result<Vec<DeviceDescription>, Error> {
    let context = Context::new()?;

    Ok(context
        .devices()?
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            if device_desc.class_code() == HUB_CLASS_CODE
                || !registry.has_vendor(device_desc.vendor_id())
            {
                return None;
            }

            let (manufacturer, product, serial_number) = match device.open() {
                Ok(handle) => (
                    handle.read_manufacturer_string_ascii(&device_desc).ok(),
                    handle.read_product_string_ascii(&device_desc).ok(),
                    handle.read_serial_number_string_ascii(&device_desc).ok(),
                ),
                Err(e) => {
                    debug!("cannot open {:04X}:{:04X}: {e}", device_desc.vendor_id(), device_desc.product_id());
                    (None, None, None)
                }
            };

            Some(DeviceDescription {
                name: registry
                    .lookup(device_desc.vendor_id(), device_desc.product_id())
                    .map(|d| d.name.clone()),
                vendor_id: device_desc.vendor_id(),
                product_id: device_desc.product_id(),
                bus: device.bus_number(),
                address: device.address(),
                manufacturer,
                product,
                serial_number,
                interfaces: describe_interfaces(&device),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(address: u8, transfer_type: TransferType, max_packet_size: u16) -> EndpointDescription {
        EndpointDescription {
            address,
            direction: if address & 0x80 != 0 { Direction::In } else { Direction::Out },
            transfer_type,
            max_packet_size,
        }
    }

    fn dp832() -> Vec<InterfaceDescription> {
        vec![InterfaceDescription {
            number: 0,
            endpoints: vec![
                ep(0x81, TransferType::Interrupt, 64),
                ep(0x82, TransferType::Bulk, 512),
                ep(0x03, TransferType::Bulk, 512),
            ],
        }]
    }

    #[test]
    fn discovers_bulk_pair() {
        let identity = DeviceIdentity::new("DP832", 0x1AB1, 0x0E11);
        let endpoints = select_endpoints(&dp832(), &identity).unwrap();

        assert_eq!(endpoints.interface_number, 0);
        assert_eq!(endpoints.bulk_out_ep, Endpoint { address: 0x03, max_packet_size: 512 });
        assert_eq!(endpoints.bulk_in_ep, Endpoint { address: 0x82, max_packet_size: 512 });
    }

    #[test]
    fn skips_interfaces_without_pair() {
        let mut interfaces = vec![InterfaceDescription {
            number: 0,
            endpoints: vec![ep(0x81, TransferType::Interrupt, 8), ep(0x02, TransferType::Bulk, 64)],
        }];
        let mut second = dp832();
        second[0].number = 1;
        interfaces.extend(second);

        let identity = DeviceIdentity::new("x", 1, 2);
        assert_eq!(select_endpoints(&interfaces, &identity).unwrap().interface_number, 1);
    }

    #[test]
    fn pinned_endpoints_win() {
        let identity = DeviceIdentity::new("x", 1, 2).with_endpoints(0, 0x03, 0x82);
        let mut interfaces = dp832();
        interfaces[0].endpoints.push(ep(0x04, TransferType::Bulk, 64));
        interfaces[0].endpoints.rotate_right(1);

        let endpoints = select_endpoints(&interfaces, &identity).unwrap();
        assert_eq!(endpoints.bulk_out_ep.address, 0x03);
        assert_eq!(endpoints.bulk_out_ep.max_packet_size, 512);
    }

    #[test]
    fn pinned_without_descriptors_falls_back() {
        let identity = DeviceIdentity::new("x", 1, 2).with_endpoints(0, 0x01, 0x82);
        let endpoints = select_endpoints(&[], &identity).unwrap();
        assert_eq!(endpoints.bulk_out_ep.max_packet_size, 64);
        assert_eq!(endpoints.bulk_in_ep.address, 0x82);
    }

    #[test]
    fn pinned_endpoints_missing_from_descriptors() {
        let identity = DeviceIdentity::new("DP832", 0x1AB1, 0x0E11).with_endpoints(0, 0x01, 0x82);
        assert!(select_endpoints(&dp832(), &identity).is_none());
    }

    #[test]
    fn pinned_endpoints_must_be_bulk() {
        let identity = DeviceIdentity::new("DP832", 0x1AB1, 0x0E11).with_endpoints(0, 0x03, 0x81);
        assert!(select_endpoints(&dp832(), &identity).is_none());
    }

    #[derive(Default)]
    struct FakeHandle {
        claims: Vec<rusb::Result<()>>,
        detach: Option<rusb::Error>,
        calls: Vec<&'static str>,
    }

    impl InterfaceClaim for FakeHandle {
        fn claim(&mut self, _interface: u8) -> rusb::Result<()> {
            self.calls.push("claim");
            self.claims.remove(0)
        }

        fn detach_driver(&mut self, _interface: u8) -> rusb::Result<()> {
            self.calls.push("detach");
            self.detach.map_or(Ok(()), Err)
        }

        fn attach_driver(&mut self, _interface: u8) -> rusb::Result<()> {
            self.calls.push("attach");
            Ok(())
        }
    }

    #[test]
    fn claim_first_time() {
        let mut handle = FakeHandle {
            claims: vec![Ok(())],
            ..Default::default()
        };
        assert!(!claim_interface(&mut handle, 0).unwrap());
        assert_eq!(handle.calls, ["claim"]);
    }

    #[test]
    fn claim_after_detaching_driver() {
        let mut handle = FakeHandle {
            claims: vec![Err(rusb::Error::Busy), Ok(())],
            ..Default::default()
        };
        assert!(claim_interface(&mut handle, 0).unwrap());
        assert_eq!(handle.calls, ["claim", "detach", "claim"]);
    }

    #[test]
    fn failed_retry_reattaches_driver() {
        let mut handle = FakeHandle {
            claims: vec![Err(rusb::Error::Busy), Err(rusb::Error::Access)],
            ..Default::default()
        };
        let err = claim_interface(&mut handle, 2).unwrap_err();

        assert!(matches!(
            err,
            Error::Claim {
                interface: 2,
                source: rusb::Error::Access
            }
        ));
        assert!(err.is_connection());
        assert_eq!(handle.calls, ["claim", "detach", "claim", "attach"]);
    }

    #[test]
    fn failed_detach_keeps_first_error() {
        let mut handle = FakeHandle {
            claims: vec![Err(rusb::Error::Busy)],
            detach: Some(rusb::Error::NotSupported),
            calls: Vec::new(),
        };
        let err = claim_interface(&mut handle, 0).unwrap_err();

        assert!(matches!(
            err,
            Error::Claim {
                source: rusb::Error::Busy,
                ..
            }
        ));
        assert_eq!(handle.calls, ["claim", "detach"]);
    }

    #[test]
    fn no_pair_no_endpoints() {
        let interfaces = vec![InterfaceDescription {
            number: 0,
            endpoints: vec![ep(0x81, TransferType::Interrupt, 8)],
        }];
        assert!(select_endpoints(&interfaces, &DeviceIdentity::new("x", 1, 2)).is_none());
    }

    #[test]
    #[ignore = "needs libusb and access to the bus"]
    fn connect_without_device_fails_cleanly() {
        let identity = DeviceIdentity::new("Nothing", 0xFFFE, 0xFFFE);
        for _ in 0..2 {
            let err = connect(&identity).unwrap_err();
            assert!(err.is_connection());
        }
    }
}
