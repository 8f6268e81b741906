//! In-crate test support: a scriptable mock controller, a virtual clock
//! and a counting test driver.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use core::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use spin::Mutex;

use coral_usb_if::DrMode;
use coral_usb_if::descriptor::DescriptorType;
use coral_usb_if::err::{Result, TransferError, UsbError};
use coral_usb_if::host::{Controller, ControlRequest, DeviceSpeed, PipeConfig, TransferToken};
use coral_usb_if::transfer::{Request, SetupPacket};

use crate::bandwidth::USB1_BANDWIDTH;
use crate::bus::{Bus, ROOT_HUB_ADDRESS};
use crate::driver::{ClassDriver, MatchFilter};
use crate::osal::Kernel;
use crate::stack::UsbHostStack;
use crate::{BusId, DeviceId};

// ---------------------------------------------------------------------
// Virtual clock
// ---------------------------------------------------------------------

/// Clock that advances 1 ms per reading, so timeout loops converge without
/// wall-clock waits. `delay` advances it by the full interval.
pub(crate) struct MockKernel {
    now_ns: AtomicU64,
}

impl MockKernel {
    pub fn new() -> Self {
        Self {
            now_ns: AtomicU64::new(0),
        }
    }
}

impl Kernel for MockKernel {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.fetch_add(1_000_000, Ordering::Relaxed))
    }

    fn delay(&self, duration: Duration) {
        self.now_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }
}

// ---------------------------------------------------------------------
// Mock controller
// ---------------------------------------------------------------------

#[derive(Clone)]
pub(crate) enum MockBehavior {
    /// Leave the transfer in flight forever (timeout path).
    NeverComplete,
    Stall,
    Reply(Vec<u8>),
}

/// The emulated device behind a set of addresses: raw descriptors plus a
/// few fault switches.
#[derive(Clone)]
pub(crate) struct MockDeviceSpec {
    pub vendor_id: u16,
    pub product_id: u16,
    pub device: Vec<u8>,
    pub configs: Vec<Vec<u8>>,
    /// (string index, language id) → raw descriptor; (0, 0) is the table.
    pub strings: BTreeMap<(u8, u16), Vec<u8>>,
    pub bos: Option<Vec<u8>>,
    pub stall_set_interface: bool,
    pub reject_set_configuration: bool,
}

struct MockInner {
    devices: BTreeMap<u8, MockDeviceSpec>,
    canned: BTreeMap<u8, MockBehavior>,
    truncate_device_desc: Option<usize>,
    next_token: TransferToken,
    completions: BTreeMap<TransferToken, (Vec<u8>, core::result::Result<usize, TransferError>)>,
    requests: Vec<(u8, SetupPacket)>,
    opened: Vec<PipeConfig>,
    closed: Vec<(u8, u8)>,
    modified: Vec<PipeConfig>,
    cancelled: Vec<(u8, u8)>,
    open_set: BTreeSet<(u8, u8)>,
    set_addresses: Vec<u8>,
    mps_updates: Vec<(u8, u16)>,
    power_down: bool,
    events: Vec<String>,
}

pub(crate) struct MockShared {
    inner: Mutex<MockInner>,
}

impl MockShared {
    pub fn attach(&self, spec: MockDeviceSpec) {
        self.attach_at(0, spec);
    }

    pub fn attach_at(&self, address: u8, spec: MockDeviceSpec) {
        self.inner.lock().devices.insert(address, spec);
    }

    pub fn respond(&self, request: Request, data: Vec<u8>) {
        self.behave(request, MockBehavior::Reply(data));
    }

    pub fn behave(&self, request: Request, behavior: MockBehavior) {
        self.inner.lock().canned.insert(request.into(), behavior);
    }

    pub fn truncate_descriptor_replies(&self, length: usize) {
        self.inner.lock().truncate_device_desc = Some(length);
    }

    pub fn device_spec(&self) -> MockDeviceSpec {
        let inner = self.inner.lock();
        inner
            .devices
            .values()
            .next()
            .cloned()
            .expect("no device attached")
    }

    pub fn requests_of(&self, request: Request) -> Vec<(u8, SetupPacket)> {
        let code = u8::from(request);
        self.inner
            .lock()
            .requests
            .iter()
            .filter(|(_, setup)| setup.request == code)
            .cloned()
            .collect()
    }

    pub fn opened_pipes(&self) -> Vec<PipeConfig> {
        self.inner.lock().opened.clone()
    }

    pub fn closed_pipes(&self) -> Vec<(u8, u8)> {
        self.inner.lock().closed.clone()
    }

    pub fn modified_pipes(&self) -> Vec<PipeConfig> {
        self.inner.lock().modified.clone()
    }

    pub fn cancelled_pipes(&self) -> Vec<(u8, u8)> {
        self.inner.lock().cancelled.clone()
    }

    pub fn open_pipe_set(&self) -> BTreeSet<(u8, u8)> {
        self.inner.lock().open_set.clone()
    }

    pub fn set_addresses(&self) -> Vec<u8> {
        self.inner.lock().set_addresses.clone()
    }

    pub fn mps_updates(&self) -> Vec<(u8, u16)> {
        self.inner.lock().mps_updates.clone()
    }

    pub fn power_down_requested(&self) -> bool {
        self.inner.lock().power_down
    }

    pub fn events(&self) -> Vec<String> {
        self.inner.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.inner.lock().events.clear();
    }

    pub fn log_event(&self, event: String) {
        self.inner.lock().events.push(event);
    }
}

impl MockInner {
    fn handle_standard(&mut self, address: u8, setup: &SetupPacket) -> MockBehavior {
        match Request::try_from(setup.request) {
            Ok(Request::GetDescriptor) => {
                let Some(spec) = self.devices.get(&address) else {
                    return MockBehavior::Stall;
                };
                let ty = (setup.value >> 8) as u8;
                let index = (setup.value & 0xff) as u8;
                match DescriptorType::try_from(ty) {
                    Ok(DescriptorType::Device) => {
                        let mut data = spec.device.clone();
                        if let Some(limit) = self.truncate_device_desc {
                            data.truncate(limit);
                        }
                        MockBehavior::Reply(data)
                    }
                    Ok(DescriptorType::Configuration) => spec
                        .configs
                        .get(index as usize)
                        .cloned()
                        .map(MockBehavior::Reply)
                        .unwrap_or(MockBehavior::Stall),
                    Ok(DescriptorType::String) => spec
                        .strings
                        .get(&(index, setup.index))
                        .cloned()
                        .map(MockBehavior::Reply)
                        .unwrap_or(MockBehavior::Stall),
                    Ok(DescriptorType::Bos) => spec
                        .bos
                        .clone()
                        .map(MockBehavior::Reply)
                        .unwrap_or(MockBehavior::Stall),
                    _ => MockBehavior::Stall,
                }
            }
            Ok(Request::SetAddress) => {
                let new_address = (setup.value & 0x7f) as u8;
                self.set_addresses.push(new_address);
                if let Some(spec) = self.devices.remove(&address) {
                    self.devices.insert(new_address, spec);
                }
                MockBehavior::Reply(Vec::new())
            }
            Ok(Request::SetConfiguration) => {
                match self.devices.get(&address) {
                    Some(spec) if spec.reject_set_configuration => MockBehavior::Stall,
                    Some(_) => MockBehavior::Reply(Vec::new()),
                    None => MockBehavior::Stall,
                }
            }
            Ok(Request::SetInterface) => match self.devices.get(&address) {
                Some(spec) if spec.stall_set_interface => MockBehavior::Stall,
                Some(_) => MockBehavior::Reply(Vec::new()),
                None => MockBehavior::Stall,
            },
            Ok(Request::GetStatus) => MockBehavior::Reply(alloc::vec![0, 0]),
            Ok(Request::GetConfiguration) => MockBehavior::Reply(alloc::vec![1]),
            Ok(Request::GetInterface) => MockBehavior::Reply(alloc::vec![0]),
            Ok(_) => MockBehavior::Reply(Vec::new()),
            Err(_) => MockBehavior::Stall,
        }
    }
}

pub(crate) struct MockController {
    shared: Arc<MockShared>,
    speed: DeviceSpeed,
}

pub(crate) fn mock_controller(speed: DeviceSpeed) -> (MockController, Arc<MockShared>) {
    let shared = Arc::new(MockShared {
        inner: Mutex::new(MockInner {
            devices: BTreeMap::new(),
            canned: BTreeMap::new(),
            truncate_device_desc: None,
            next_token: 1,
            completions: BTreeMap::new(),
            requests: Vec::new(),
            opened: Vec::new(),
            closed: Vec::new(),
            modified: Vec::new(),
            cancelled: Vec::new(),
            open_set: BTreeSet::new(),
            set_addresses: Vec::new(),
            mps_updates: Vec::new(),
            power_down: false,
            events: Vec::new(),
        }),
    });
    (
        MockController {
            shared: shared.clone(),
            speed,
        },
        shared,
    )
}

impl Controller for MockController {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    fn open_pipe(&mut self, pipe: &PipeConfig) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner
            .open_set
            .insert((pipe.device_address, pipe.endpoint_address));
        inner.opened.push(pipe.clone());
        Ok(())
    }

    fn modify_pipe(&mut self, pipe: &PipeConfig) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        if !inner
            .open_set
            .contains(&(pipe.device_address, pipe.endpoint_address))
        {
            return Err(UsbError::InvalidArgument);
        }
        inner.modified.push(pipe.clone());
        Ok(())
    }

    fn close_pipe(&mut self, device_address: u8, endpoint_address: u8) -> Result<()> {
        let mut inner = self.shared.inner.lock();
        inner.open_set.remove(&(device_address, endpoint_address));
        inner.closed.push((device_address, endpoint_address));
        inner
            .events
            .push(alloc::format!("close_pipe {device_address}:{endpoint_address:02x}"));
        Ok(())
    }

    fn submit_control(
        &mut self,
        device_address: u8,
        request: ControlRequest,
    ) -> Result<TransferToken> {
        let mut inner = self.shared.inner.lock();
        let setup = request.setup;
        inner.requests.push((device_address, setup));

        let canned = inner.canned.get(&setup.request).cloned();
        let behavior = match canned {
            Some(behavior) => behavior,
            None => inner.handle_standard(device_address, &setup),
        };

        let token = inner.next_token;
        inner.next_token += 1;

        match behavior {
            MockBehavior::NeverComplete => {}
            MockBehavior::Stall => {
                inner
                    .completions
                    .insert(token, (request.buffer, Err(TransferError::Stall)));
            }
            MockBehavior::Reply(data) => {
                let mut buffer = request.buffer;
                let length = data.len().min(buffer.len());
                buffer[..length].copy_from_slice(&data[..length]);
                inner.completions.insert(token, (buffer, Ok(length)));
            }
        }
        Ok(token)
    }

    fn poll_transfer(
        &mut self,
        token: TransferToken,
    ) -> Option<(Vec<u8>, core::result::Result<usize, TransferError>)> {
        self.shared.inner.lock().completions.remove(&token)
    }

    fn cancel(&mut self, device_address: u8, endpoint_address: u8) -> Result<()> {
        self.shared
            .inner
            .lock()
            .cancelled
            .push((device_address, endpoint_address));
        Ok(())
    }

    fn update_max_packet_size(&mut self, device_address: u8, size: u16) -> Result<()> {
        self.shared
            .inner
            .lock()
            .mps_updates
            .push((device_address, size));
        Ok(())
    }

    fn request_power_down(&mut self) {
        self.shared.inner.lock().power_down = true;
    }

    fn get_role(&mut self, _port: u8) -> Result<DrMode> {
        Ok(DrMode::Host)
    }
}

// ---------------------------------------------------------------------
// Raw descriptor builders
// ---------------------------------------------------------------------

pub(crate) fn device_desc_bytes(
    vendor_id: u16,
    product_id: u16,
    mps0: u8,
    class: u8,
    i_manufacturer: u8,
    i_product: u8,
    num_configurations: u8,
) -> Vec<u8> {
    let vid = vendor_id.to_le_bytes();
    let pid = product_id.to_le_bytes();
    alloc::vec![
        18, 0x01, 0x00, 0x02, class, 0, 0, mps0, vid[0], vid[1], pid[0], pid[1], 0x00, 0x01,
        i_manufacturer, i_product, 0, num_configurations,
    ]
}

pub(crate) fn interface_desc_bytes(
    number: u8,
    alternate: u8,
    num_endpoints: u8,
    class: u8,
    subclass: u8,
    protocol: u8,
) -> Vec<u8> {
    alloc::vec![9, 0x04, number, alternate, num_endpoints, class, subclass, protocol, 0]
}

pub(crate) fn endpoint_desc_bytes(address: u8, attributes: u8, mps: u16, interval: u8) -> Vec<u8> {
    let mps = mps.to_le_bytes();
    alloc::vec![7, 0x05, address, attributes, mps[0], mps[1], interval]
}

pub(crate) fn config_desc_bytes(
    value: u8,
    num_interfaces: u8,
    descriptors: &[Vec<u8>],
) -> Vec<u8> {
    let mut raw = alloc::vec![9, 0x02, 0, 0, num_interfaces, value, 0, 0x80, 50];
    for descriptor in descriptors {
        raw.extend_from_slice(descriptor);
    }
    let total = (raw.len() as u16).to_le_bytes();
    raw[2] = total[0];
    raw[3] = total[1];
    raw
}

pub(crate) fn string_desc_bytes(text: &str) -> Vec<u8> {
    let mut raw = alloc::vec![0, 0x03];
    for unit in text.encode_utf16() {
        raw.extend_from_slice(&unit.to_le_bytes());
    }
    raw[0] = raw.len() as u8;
    raw
}

pub(crate) fn lang_table_bytes() -> Vec<u8> {
    alloc::vec![4, 0x03, 0x09, 0x04]
}

/// A full-speed mass-storage-shaped device: one configuration, one
/// interface (class 08/06/50) with a single bulk IN endpoint of 64 bytes.
pub(crate) fn fs_device_spec() -> MockDeviceSpec {
    let config = config_desc_bytes(
        1,
        1,
        &[
            interface_desc_bytes(0, 0, 1, 0x08, 0x06, 0x50),
            endpoint_desc_bytes(0x81, 0x02, 64, 0),
        ],
    );
    let mut strings = BTreeMap::new();
    strings.insert((0, 0), lang_table_bytes());
    strings.insert((1, 0x0409), string_desc_bytes("Coral"));
    strings.insert((2, 0x0409), string_desc_bytes("Widget"));

    MockDeviceSpec {
        vendor_id: 0x1234,
        product_id: 0x5678,
        device: device_desc_bytes(0x1234, 0x5678, 64, 0x00, 1, 2, 1),
        configs: alloc::vec![config],
        strings,
        bos: None,
        stall_set_interface: false,
        reject_set_configuration: false,
    }
}

/// A device whose single interface has three alternate settings exercising
/// every branch of the endpoint diff: 0x81 is shared (unchanged between
/// alt 0 and 1, re-parameterized in alt 2), 0x02 exists only in alt 0,
/// 0x03 only in alt 1.
pub(crate) fn alt_device_spec() -> MockDeviceSpec {
    let config = config_desc_bytes(
        1,
        1,
        &[
            interface_desc_bytes(0, 0, 2, 0xff, 0, 0),
            endpoint_desc_bytes(0x81, 0x03, 8, 10),
            endpoint_desc_bytes(0x02, 0x02, 64, 0),
            interface_desc_bytes(0, 1, 2, 0xff, 0, 0),
            endpoint_desc_bytes(0x81, 0x03, 8, 10),
            endpoint_desc_bytes(0x03, 0x02, 64, 0),
            interface_desc_bytes(0, 2, 1, 0xff, 0, 0),
            endpoint_desc_bytes(0x81, 0x03, 16, 10),
        ],
    );
    MockDeviceSpec {
        vendor_id: 0xcafe,
        product_id: 0x0001,
        device: device_desc_bytes(0xcafe, 0x0001, 64, 0x00, 0, 0, 1),
        configs: alloc::vec![config],
        strings: BTreeMap::new(),
        bos: None,
        stall_set_interface: false,
        reject_set_configuration: false,
    }
}

/// The hub-class device the controller emulates behind the root port.
pub(crate) fn root_hub_spec() -> MockDeviceSpec {
    let config = config_desc_bytes(
        1,
        1,
        &[
            interface_desc_bytes(0, 0, 1, 0x09, 0, 0),
            endpoint_desc_bytes(0x81, 0x03, 2, 12),
        ],
    );
    MockDeviceSpec {
        vendor_id: 0,
        product_id: 0,
        device: device_desc_bytes(0, 0, 64, 0x09, 0, 0, 1),
        configs: alloc::vec![config],
        strings: BTreeMap::new(),
        bos: None,
        stall_set_interface: false,
        reject_set_configuration: false,
    }
}

// ---------------------------------------------------------------------
// Bus / stack harness
// ---------------------------------------------------------------------

pub(crate) fn mock_bus() -> (Bus, Arc<MockShared>) {
    let (controller, shared) = mock_controller(DeviceSpeed::Full);
    (
        Bus::new(
            BusId::from(0),
            alloc::boxed::Box::new(controller),
            USB1_BANDWIDTH,
        ),
        shared,
    )
}

pub(crate) fn fs_device_bus() -> (Bus, Arc<MockShared>) {
    let (bus, shared) = mock_bus();
    shared.attach(fs_device_spec());
    (bus, shared)
}

/// A stack with one full-speed controller added and its root hub
/// enumerated.
pub(crate) fn stack_with_root() -> (UsbHostStack, BusId, Arc<MockShared>) {
    let (controller, shared) = mock_controller(DeviceSpeed::Full);
    shared.attach_at(ROOT_HUB_ADDRESS, root_hub_spec());
    let stack = UsbHostStack::new(Arc::new(MockKernel::new()));
    let bus_id =
        spin_on::spin_on(stack.add_controller(alloc::boxed::Box::new(controller))).unwrap();
    (stack, bus_id, shared)
}

// ---------------------------------------------------------------------
// Test driver
// ---------------------------------------------------------------------

pub(crate) struct TestDriver {
    name: &'static str,
    filter: MatchFilter,
    decline_interfaces: bool,
    device_inits: AtomicUsize,
    interface_inits: AtomicUsize,
    disconnects: AtomicUsize,
    events: Option<Arc<MockShared>>,
}

impl TestDriver {
    fn new(name: &'static str, filter: MatchFilter) -> Arc<Self> {
        Arc::new(Self {
            name,
            filter,
            decline_interfaces: false,
            device_inits: AtomicUsize::new(0),
            interface_inits: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            events: None,
        })
    }

    pub fn for_class(class: u8) -> Arc<Self> {
        Self::new("test-class", MatchFilter::for_class(class, None, None))
    }

    pub fn for_vendor(vendor_id: u16) -> Arc<Self> {
        Self::new("test-vendor", MatchFilter::for_vendor(vendor_id, None))
    }

    /// Matches but refuses every interface it is offered.
    pub fn declining(class: u8) -> Arc<Self> {
        Arc::new(Self {
            name: "test-declining",
            filter: MatchFilter::for_class(class, None, None),
            decline_interfaces: true,
            device_inits: AtomicUsize::new(0),
            interface_inits: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            events: None,
        })
    }

    /// Logs lifecycle callbacks into the mock's event stream.
    pub fn for_class_logged(class: u8, events: Arc<MockShared>) -> Arc<Self> {
        Arc::new(Self {
            name: "test-logged",
            filter: MatchFilter::for_class(class, None, None),
            decline_interfaces: false,
            device_inits: AtomicUsize::new(0),
            interface_inits: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            events: Some(events),
        })
    }

    pub fn device_inits(&self) -> usize {
        self.device_inits.load(Ordering::Relaxed)
    }

    pub fn interface_inits(&self) -> usize {
        self.interface_inits.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::Relaxed)
    }
}

impl ClassDriver for TestDriver {
    fn name(&self) -> &str {
        self.name
    }

    fn filter(&self) -> MatchFilter {
        self.filter
    }

    fn initialize_device<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
    ) -> BoxFuture<'a, Result<()>> {
        self.device_inits.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Ok(())).boxed()
    }

    fn initialize_interface<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
        _interface_number: u8,
    ) -> BoxFuture<'a, Result<()>> {
        if self.decline_interfaces {
            return futures::future::ready(Err(UsbError::Unavailable)).boxed();
        }
        self.interface_inits.fetch_add(1, Ordering::Relaxed);
        futures::future::ready(Ok(())).boxed()
    }

    fn disconnect<'a>(
        &'a self,
        _stack: &'a UsbHostStack,
        _device: DeviceId,
    ) -> BoxFuture<'a, Result<()>> {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        if let Some(events) = &self.events {
            events.log_event(String::from("disconnect"));
        }
        futures::future::ready(Ok(())).boxed()
    }
}
