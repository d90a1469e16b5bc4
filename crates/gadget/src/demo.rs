//! Sample function and an end-to-end run on the loopback controller
//!
//! The sample is a vendor-specific bulk loopback: one interface with a bulk
//! IN and a bulk OUT endpoint at every speed, a WINUSB compatible id, and an
//! English interface string.

use crate::control::ControlChannel;
use crate::error::{FfsError, Result};
use crate::function::{GadgetFunction, SetupOutcome};
use crate::hw::Controller;
use crate::loopback::{LoopbackController, LoopbackOptions, MemoryHost};
use crate::registry::{InstanceOptions, Registry};
use crate::sync::Waiter;
use common::create_work_queue;
use protocol::descriptor::{InterfaceDescriptor, SsEndpointCompanion};
use protocol::strings::{StringTable, UsbString, encode_strings};
use protocol::{
    Descriptor, DescriptorUpload, EndpointDescriptor, EventType, ExtCompat, OsDescGroup,
    OsFeatures, SetupPacket, SpeedVariant, UsbSpeed,
};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

pub const SAMPLE_INSTANCE: &str = "loopback";

const HOST_TIMEOUT: Duration = Duration::from_secs(5);

fn sample_records(speed: SpeedVariant) -> Vec<Descriptor> {
    let max_packet_size = match speed {
        SpeedVariant::Full => 64,
        SpeedVariant::High => 512,
        SpeedVariant::Super => 1024,
    };
    let mut records = vec![Descriptor::Interface(InterfaceDescriptor {
        interface_number: 0,
        alternate_setting: 0,
        num_endpoints: 2,
        class: 0xff,
        subclass: 0,
        protocol: 0,
        string_index: 1,
    })];
    for address in [0x81, 0x02] {
        records.push(Descriptor::Endpoint(EndpointDescriptor {
            address,
            attributes: 0x02,
            max_packet_size,
            interval: 0,
            audio: None,
        }));
        if speed == SpeedVariant::Super {
            records.push(Descriptor::SsEndpointCompanion(SsEndpointCompanion {
                max_burst: 0,
                attributes: 0,
                bytes_per_interval: 0,
            }));
        }
    }
    records
}

/// Descriptor upload of the sample function
pub fn sample_descriptors() -> Vec<u8> {
    SpeedVariant::ALL
        .into_iter()
        .fold(DescriptorUpload::v2(), |upload, speed| {
            upload.speed(speed, sample_records(speed))
        })
        .os_group(OsDescGroup {
            interface: 0,
            features: OsFeatures::ExtCompat(vec![ExtCompat {
                first_interface: 0,
                compatible_id: *b"WINUSB\0\0",
                sub_compatible_id: [0; 8],
            }]),
        })
        .encode()
}

/// String upload of the sample function
pub fn sample_strings() -> Vec<u8> {
    encode_strings(&[StringTable {
        language: 0x0409,
        strings: vec![UsbString {
            id: 0,
            text: "Loopback".to_string(),
        }],
    }])
}

/// What a simulation run observed
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub speed: UsbSpeed,
    pub endpoint_files: Vec<String>,
    pub interface_id: Option<u8>,
    pub endpoint_addresses: Vec<u8>,
    pub events: Vec<String>,
    /// Data the host received for the vendor IN request
    pub control_reply: Vec<u8>,
    /// Bytes the host got back from the bulk echo
    pub echoed: usize,
}

/// Run the sample function against the loopback controller
///
/// Uploads the sample, binds and enables the function, answers one vendor
/// IN request and echoes one bulk transfer from OUT to IN.
pub fn run_simulation(
    options: LoopbackOptions,
    work_queue_capacity: usize,
    wait_tick: Duration,
    payload: &[u8],
) -> Result<SimulationReport> {
    let (work, runner) = create_work_queue(work_queue_capacity);
    let worker = runner
        .spawn("ffs-work")
        .map_err(|_| FfsError::OutOfResources)?;

    let registry = Registry::new(Arc::new(MemoryHost::new()), work.clone(), wait_tick);
    registry.create_instance(SAMPLE_INSTANCE, InstanceOptions::default())?;
    let result = simulate(&registry, options, payload);

    if let Err(e) = registry.remove_instance(SAMPLE_INSTANCE) {
        debug!("Instance already gone: {}", e);
    }
    drop(registry);
    work.close();
    if worker.join().is_err() {
        debug!("Work thread panicked");
    }
    result
}

fn simulate(
    registry: &Registry,
    options: LoopbackOptions,
    payload: &[u8],
) -> Result<SimulationReport> {
    let waiter = Waiter::blocking().with_timeout(HOST_TIMEOUT);
    let mut control = registry.open_control(SAMPLE_INSTANCE, waiter.clone())?;
    control.write(&sample_descriptors())?;
    control.write(&sample_strings())?;
    let session = control.session().clone();
    info!("Endpoint files: {:?}", session.endpoint_files());

    let controller = Arc::new(LoopbackController::new(options));
    let function = GadgetFunction::new(session.clone());
    function.bind(controller.clone())?;
    let interface_id = function.interface_number(0);
    function.set_alt(u16::from(interface_id.unwrap_or(0)), Some(0))?;

    let mut events: Vec<String> = control
        .read_events(4)?
        .iter()
        .map(|event| format!("{:?}", event.kind))
        .collect();

    let control_reply = answer_vendor_request(&mut control, &controller, &function, &mut events)?;

    let ep_in = function.endpoint_address(1).ok_or(FfsError::DeviceGone)?;
    let ep_out = function.endpoint_address(2).ok_or(FfsError::DeviceGone)?;
    let mut reader = session.open_endpoint("ep2", waiter.clone())?;
    let mut writer = session.open_endpoint("ep1", waiter)?;

    let echoed = thread::scope(|scope| -> Result<usize> {
        let host = scope.spawn(|| -> std::result::Result<usize, crate::error::HwError> {
            controller.host_write(ep_out, payload, HOST_TIMEOUT)?;
            Ok(controller.host_read(ep_in, payload.len(), HOST_TIMEOUT)?.len())
        });
        let mut buf = vec![0u8; payload.len().max(1)];
        let n = reader.read(&mut buf)?;
        writer.write(&buf[..n])?;
        match host.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(FfsError::Interrupted),
        }
    })?;
    info!("Bulk echo: {} of {} bytes", echoed, payload.len());

    drop(reader);
    drop(writer);
    function.disable()?;
    function.unbind();

    Ok(SimulationReport {
        speed: controller.speed(),
        endpoint_files: session.endpoint_files(),
        interface_id,
        endpoint_addresses: vec![ep_in, ep_out],
        events,
        control_reply,
        echoed,
    })
}

fn answer_vendor_request(
    control: &mut ControlChannel,
    controller: &Arc<LoopbackController>,
    function: &GadgetFunction,
    events: &mut Vec<String>,
) -> Result<Vec<u8>> {
    let packet = SetupPacket {
        request_type: 0xc1,
        request: 0x01,
        value: 0,
        index: u16::from(function.interface_number(0).unwrap_or(0)),
        length: 64,
    };
    if controller.host_setup(function, packet)? != SetupOutcome::DataStage {
        return Err(FfsError::NoPendingRequest);
    }

    let delivered = control.read_events(1)?;
    let Some(event) = delivered.first().filter(|e| e.kind == EventType::Setup) else {
        return Err(FfsError::NoPendingRequest);
    };
    events.push(format!("{:?}", event.kind));
    debug!(
        "Vendor request for interface {:?}",
        event.setup.map(|setup| setup.index)
    );

    thread::scope(|scope| -> Result<Vec<u8>> {
        let host = scope.spawn(|| controller.host_control_in(64, HOST_TIMEOUT));
        control.write(b"ffs-gadget loopback")?;
        match host.join() {
            Ok(reply) => Ok(reply?),
            Err(_) => Err(FfsError::Interrupted),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{parse_descriptors, parse_strings};

    #[test]
    fn test_sample_uploads_parse() {
        let table = parse_descriptors(&sample_descriptors()).unwrap();
        assert_eq!(table.interfaces_count, 1);
        assert_eq!(table.eps_count, 2);
        assert_eq!(table.strings_count, 1);
        let strings = parse_strings(&sample_strings(), table.strings_count).unwrap();
        assert_eq!(strings[0].strings[0].text, "Loopback");
    }

    #[test]
    fn test_simulation_round_trip() {
        let payload = b"ping over bulk".to_vec();
        let report = run_simulation(
            LoopbackOptions::default(),
            8,
            crate::sync::DEFAULT_WAIT_TICK,
            &payload,
        )
        .unwrap();
        assert_eq!(report.speed, UsbSpeed::High);
        assert_eq!(report.echoed, payload.len());
        assert_eq!(report.control_reply, b"ffs-gadget loopback");
        assert_eq!(report.endpoint_files, vec!["ep1", "ep2"]);
        assert_eq!(report.events, vec!["Enable", "Setup"]);
    }
}
