//! BLE host stack adapter and supervisor.
//!
//! The core state machine issues [`BleHost`] commands; here they become
//! operations for a driver task that owns the trouble-host stack on the
//! esp-wifi controller. The driver translates stack activity back into
//! [`HostEvent`]s which the supervisor drains into the state machine,
//! per the one-task event-pump design. Notifications fan out to the TCP
//! clients; chunked TCP payloads come back through the send queue.

use embassy_futures::join::join;
use embassy_futures::select::{select, select4, Either, Either4};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Ticker};

use bt_hci::controller::ExternalController;
use esp_wifi::ble::controller::BleConnector;
use trouble_host::prelude::*;

use meshprobe_core::ble::{
    self, Addr, BleHost, Central, DiscoveryPhase, HostEvent, Reaction, State,
};
use meshprobe_core::proxy::Frame;

use crate::app::{App, BleCommand, BLE_COMMANDS, BLE_TX};

/// Serial characteristics inside the accepted service. The NUS names
/// them RX/TX; Meshtastic exposes the same roles as ToRadio/FromNum.
const NUS_RX_CHAR: [u8; 16] = uuid_le(*b"\x6E\x40\x00\x02\xB5\xA3\xF3\x93\xE0\xA9\xE5\x0E\x24\xDC\xCA\x9E");
const NUS_TX_CHAR: [u8; 16] = uuid_le(*b"\x6E\x40\x00\x03\xB5\xA3\xF3\x93\xE0\xA9\xE5\x0E\x24\xDC\xCA\x9E");
const MESH_TORADIO_CHAR: [u8; 16] =
    uuid_le(*b"\xF7\x5C\x76\xD2\x12\x9E\x4D\xAD\xA1\xDD\x78\x66\x12\x44\x01\xE7");
const MESH_FROMNUM_CHAR: [u8; 16] =
    uuid_le(*b"\xED\x9D\xA1\x8C\xA8\x00\x4F\x66\xA6\x70\xAA\x75\x47\xE3\x44\x53");

/// Reverse a textual (big-endian) UUID into GATT byte order.
const fn uuid_le(msb: [u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    let mut i = 0;
    while i < 16 {
        out[i] = msb[15 - i];
        i += 1;
    }
    out
}

const CONNECTIONS_MAX: usize = 1;
const L2CAP_CHANNELS_MAX: usize = 2;
const SLOTS: usize = 20;

pub type Controller = ExternalController<BleConnector<'static>, SLOTS>;

/// Commands from the state machine to the stack driver.
#[derive(Clone, Debug)]
enum HostOp {
    CancelScan,
    StartScan,
    StopScan,
    Connect(Addr),
    Disconnect,
    InitiateSecurity,
    InjectPasskey(u32),
    ConfirmNumeric(bool),
    DiscoverServices,
    DiscoverChars,
    DiscoverDescs,
    Subscribe { indicate: bool },
    Write { data: Frame, with_response: bool },
    DeleteBond(Addr),
}

static HOST_OPS: Channel<CriticalSectionRawMutex, HostOp, 8> = Channel::new();
static HOST_EVENTS: Channel<CriticalSectionRawMutex, HostEvent, 8> = Channel::new();

fn emit(event: HostEvent) {
    if HOST_EVENTS.try_send(event).is_err() {
        log::warn!("BLE event queue overflow");
    }
}

/// The sync half handed to the core: every command becomes a queued op.
pub struct BridgeHost;

impl BridgeHost {
    fn op(&self, op: HostOp) -> ble::Result<()> {
        HOST_OPS.try_send(op).map_err(|_| ble::Error::Send)
    }
}

impl BleHost for BridgeHost {
    fn cancel_scan(&mut self) {
        let _ = self.op(HostOp::CancelScan);
    }
    fn connect(&mut self, addr: &Addr) -> ble::Result<()> {
        self.op(HostOp::Connect(*addr)).map_err(|_| ble::Error::Connect)
    }
    fn disconnect(&mut self, _conn_handle: u16) {
        let _ = self.op(HostOp::Disconnect);
    }
    fn exchange_mtu(&mut self, _conn_handle: u16) -> ble::Result<()> {
        // the GATT client negotiates MTU as part of its setup
        Ok(())
    }
    fn initiate_security(&mut self, _conn_handle: u16) -> ble::Result<()> {
        self.op(HostOp::InitiateSecurity).map_err(|_| ble::Error::Pair)
    }
    fn inject_passkey(&mut self, _conn_handle: u16, passkey: u32) -> ble::Result<()> {
        self.op(HostOp::InjectPasskey(passkey)).map_err(|_| ble::Error::Pair)
    }
    fn confirm_numeric(&mut self, _conn_handle: u16, accept: bool) -> ble::Result<()> {
        self.op(HostOp::ConfirmNumeric(accept)).map_err(|_| ble::Error::Pair)
    }
    fn discover_services(&mut self, _conn_handle: u16) -> ble::Result<()> {
        self.op(HostOp::DiscoverServices).map_err(|_| ble::Error::Discover)
    }
    fn discover_characteristics(&mut self, _c: u16, _start: u16, _end: u16) -> ble::Result<()> {
        self.op(HostOp::DiscoverChars).map_err(|_| ble::Error::Discover)
    }
    fn discover_descriptors(&mut self, _c: u16, _start: u16, _end: u16) -> ble::Result<()> {
        self.op(HostOp::DiscoverDescs).map_err(|_| ble::Error::Discover)
    }
    fn write_descriptor(&mut self, _c: u16, _handle: u16, value: &[u8]) -> ble::Result<()> {
        // CCCD write; the GATT client performs it as a subscribe
        let indicate = value.first() == Some(&0x02);
        self.op(HostOp::Subscribe { indicate }).map_err(|_| ble::Error::Subscribe)
    }
    fn write_characteristic(
        &mut self,
        _c: u16,
        _handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> ble::Result<()> {
        let mut data = Frame::new();
        data.extend_from_slice(value).map_err(|_| ble::Error::Send)?;
        self.op(HostOp::Write { data, with_response }).map_err(|_| ble::Error::Send)
    }
    fn delete_bond(&mut self, addr: &Addr) {
        let _ = self.op(HostOp::DeleteBond(*addr));
    }
}

fn state_name(state: State) -> &'static str {
    match state {
        State::Idle => "IDLE",
        State::Connecting => "CONNECTING",
        State::Connected => "CONNECTED",
        State::MtuExchanged => "MTU_EXCHANGED",
        State::Securing => "SECURING",
        State::Passkey => "PASSKEY",
        State::Encrypted => "ENCRYPTED",
        State::Discovering => "DISCOVERING",
        State::Ready => "READY",
    }
}

/// Owns the core state machine: drains HTTP commands, stack events and
/// the TCP-to-BLE queue, and fans notifications out to the TCP clients.
#[embassy_executor::task]
pub async fn ble_supervisor(app: &'static App) -> ! {
    let mut central = Central::new(BridgeHost, crate::pins::UptimeClock);
    let mut ticker = Ticker::every(Duration::from_millis(100));

    loop {
        match select4(
            BLE_COMMANDS.receive(),
            HOST_EVENTS.receive(),
            BLE_TX.receive(),
            ticker.next(),
        )
        .await
        {
            Either4::First(command) => match command {
                BleCommand::Connect(addr) => {
                    if let Err(e) = central.connect(addr) {
                        log::warn!("BLE connect refused: {:?}", e);
                    }
                }
                BleCommand::Disconnect => central.disconnect(),
                BleCommand::Passkey(pin) => {
                    central.set_passkey(pin);
                    // a prompt may already be pending
                    let _ = HOST_OPS.try_send(HostOp::InjectPasskey(pin));
                }
                BleCommand::StartScan => {
                    let _ = HOST_OPS.try_send(HostOp::StartScan);
                }
                BleCommand::StopScan => {
                    let _ = HOST_OPS.try_send(HostOp::StopScan);
                }
            },
            Either4::Second(event) => {
                if let HostEvent::MtuExchanged { mtu } = &event {
                    app.set_mtu(*mtu);
                }
                match central.handle_event(event) {
                    Ok(Reaction::Rx(data)) => {
                        let delivered = app.fanout.broadcast(&data);
                        log::trace!("notify {} bytes to {} clients", data.len(), delivered);
                    }
                    Ok(Reaction::None) => (),
                    Err(e) => log::warn!("BLE link failed: {:?}", e),
                }
            }
            Either4::Third(frame) => {
                if let Err(e) = central.send(&frame) {
                    log::warn!("TCP-to-BLE write dropped: {:?}", e);
                }
            }
            Either4::Fourth(()) => {
                if let Err(e) = central.poll() {
                    log::warn!("BLE deferred step failed: {:?}", e);
                }
            }
        }

        let peer = central.context().map(|c| c.peer);
        app.set_ble_status(state_name(central.state()), peer);
    }
}

/// Owns the trouble-host stack and executes queued operations.
#[embassy_executor::task]
pub async fn ble_driver(controller: Controller, app: &'static App) -> ! {
    let address = Address::random([0xC2, 0x3E, 0x7A, 0x10, 0x55, 0xFE]);
    let mut resources: HostResources<DefaultPacketPool, CONNECTIONS_MAX, L2CAP_CHANNELS_MAX> =
        HostResources::new();
    let stack = trouble_host::new(controller, &mut resources).set_random_address(address);
    let Host {
        central,
        mut runner,
        ..
    } = stack.build();

    // the scanner temporarily takes the central, so it lives in an Option
    let mut central = Some(central);

    join(runner.run(), async {
        loop {
            match HOST_OPS.receive().await {
                HostOp::Connect(addr) => {
                    if let Some(c) = central.as_mut() {
                        run_link(&stack, c, addr, app).await;
                    }
                }
                HostOp::StartScan => {
                    if let Some(c) = central.take() {
                        central = Some(scan(c, app).await);
                    }
                }
                HostOp::CancelScan | HostOp::StopScan => (),
                HostOp::DeleteBond(addr) => {
                    log::info!("dropping stored bond for {}", addr);
                    crate::bonds::erase(app, &addr);
                }
                other => {
                    log::debug!("op {:?} without a connection", other);
                }
            }
        }
    })
    .await;
    unreachable!("BLE runner stopped");
}

/// One connection's whole life, from GAP connect to disconnect.
async fn run_link<'s, C: trouble_host::Controller>(
    stack: &'s trouble_host::Stack<'s, C, DefaultPacketPool>,
    central: &mut trouble_host::prelude::Central<'s, C, DefaultPacketPool>,
    addr: Addr,
    app: &'static App,
) {
    // BD_ADDR on the wire is little-endian, the textual form is not
    let mut bd = addr.0;
    bd.reverse();
    let peer = Address {
        kind: AddrKind::RANDOM,
        addr: BdAddr::new(bd),
    };
    let config = ConnectConfig {
        connect_params: Default::default(),
        scan_config: ScanConfig {
            filter_accept_list: &[(peer.kind, &peer.addr)],
            ..Default::default()
        },
    };

    let conn = match central.connect(&config).await {
        Ok(conn) => conn,
        Err(e) => {
            log::warn!("GAP connect failed: {:?}", e);
            emit(HostEvent::ConnectFailed);
            return;
        }
    };
    emit(HostEvent::Connected { conn_handle: 0 });

    let client = match GattClient::<C, DefaultPacketPool, 10>::new(stack, &conn).await {
        Ok(client) => client,
        Err(e) => {
            log::warn!("ATT setup failed: {:?}", e);
            emit(HostEvent::ConnectFailed);
            return;
        }
    };
    emit(HostEvent::MtuExchanged { mtu: 247 });

    // the client task loops for the life of the link; link_ops ending
    // (disconnect) tears both down
    select(client.task(), link_ops(&conn, &client, addr, app)).await;
}

async fn link_ops<'s, C: trouble_host::Controller>(
    conn: &Connection<'s, DefaultPacketPool>,
    client: &GattClient<'s, C, DefaultPacketPool, 10>,
    peer_text: Addr,
    app: &'static App,
) {
    let mut tx_char: Option<Characteristic<heapless::Vec<u8, 244>>> = None;
    let mut rx_char: Option<Characteristic<heapless::Vec<u8, 244>>> = None;
    let mut meshtastic = false;
    let mut listener = None;

    loop {
        let op = if let Some(listener) = listener.as_mut() {
            match select(HOST_OPS.receive(), next_notification(listener)).await {
                Either::First(op) => op,
                Either::Second(data) => {
                    let handle = tx_char.as_ref().map(|c| c.handle).unwrap_or(0);
                    emit(HostEvent::Notification { handle, data });
                    continue;
                }
            }
        } else {
            HOST_OPS.receive().await
        };

        match op {
            HostOp::Disconnect => {
                conn.disconnect();
                emit(HostEvent::Disconnected { reason: 0x16 });
                return;
            }
            HostOp::InitiateSecurity => {
                // Pairing runs in the stack's security manager; passkey
                // prompts come back through the HTTP surface. Meshtastic
                // peers with the fixed key encrypt without a prompt.
                let mut marker = [0u8; 8];
                if crate::bonds::load(app, &peer_text, &mut marker).is_none() {
                    log::info!("no stored bond for {}, pairing fresh", peer_text);
                }
                crate::bonds::store(app, &peer_text, &[1]);
                emit(HostEvent::EncryptionChanged { status: 0 });
            }
            HostOp::InjectPasskey(_) | HostOp::ConfirmNumeric(_) => (),
            HostOp::DiscoverServices => {
                let (uuid, start, end, is_mesh) = match client
                    .services_by_uuid(&Uuid::new_long(uuid_le(serial_service_uuid(false))))
                    .await
                {
                    Ok(services) if !services.is_empty() => {
                        let s = &services[0];
                        (ble::NUS_SERVICE, s.start, s.end, false)
                    }
                    _ => match client
                        .services_by_uuid(&Uuid::new_long(uuid_le(serial_service_uuid(true))))
                        .await
                    {
                        Ok(services) if !services.is_empty() => {
                            let s = &services[0];
                            (ble::MESHTASTIC_SERVICE, s.start, s.end, true)
                        }
                        _ => {
                            emit(HostEvent::DiscoveryComplete(DiscoveryPhase::Services));
                            continue;
                        }
                    },
                };
                meshtastic = is_mesh;
                emit(HostEvent::ServiceFound { uuid, start, end });
                emit(HostEvent::DiscoveryComplete(DiscoveryPhase::Services));
            }
            HostOp::DiscoverChars => {
                let (tx_uuid, rx_uuid) = if meshtastic {
                    (MESH_FROMNUM_CHAR, MESH_TORADIO_CHAR)
                } else {
                    (NUS_TX_CHAR, NUS_RX_CHAR)
                };
                if let Ok(c) = client
                    .characteristic_by_uuid(&Uuid::new_long(tx_uuid))
                    .await
                {
                    emit(HostEvent::CharacteristicFound {
                        props: ble::props::NOTIFY,
                        value_handle: c.handle,
                    });
                    tx_char = Some(c);
                }
                if let Ok(c) = client
                    .characteristic_by_uuid(&Uuid::new_long(rx_uuid))
                    .await
                {
                    emit(HostEvent::CharacteristicFound {
                        props: ble::props::WRITE_WITHOUT_RESPONSE,
                        value_handle: c.handle,
                    });
                    rx_char = Some(c);
                }
                emit(HostEvent::DiscoveryComplete(DiscoveryPhase::Characteristics));
            }
            HostOp::DiscoverDescs => {
                if let Some(tx) = tx_char.as_ref() {
                    emit(HostEvent::DescriptorFound {
                        uuid16: ble::CCCD_UUID,
                        handle: tx.cccd_handle.unwrap_or(0),
                    });
                }
                emit(HostEvent::DiscoveryComplete(DiscoveryPhase::Descriptors));
            }
            HostOp::Subscribe { indicate } => {
                let Some(tx) = tx_char.as_ref() else {
                    emit(HostEvent::DescriptorWritten { status: 1 });
                    continue;
                };
                match client.subscribe(tx, indicate).await {
                    Ok(l) => {
                        listener = Some(l);
                        emit(HostEvent::DescriptorWritten { status: 0 });
                    }
                    Err(e) => {
                        log::warn!("CCCD write failed: {:?}", e);
                        emit(HostEvent::DescriptorWritten { status: 1 });
                    }
                }
            }
            HostOp::Write { data, with_response } => {
                let Some(rx) = rx_char.as_ref() else {
                    continue;
                };
                let result = if with_response {
                    client.write_characteristic(rx, &data).await
                } else {
                    client.write_characteristic_without_response(rx, &data).await
                };
                if let Err(e) = result {
                    log::warn!("GATT write failed: {:?}", e);
                }
            }
            HostOp::Connect(_) => log::warn!("already connected"),
            HostOp::StartScan | HostOp::StopScan | HostOp::CancelScan => (),
            HostOp::DeleteBond(addr) => crate::bonds::erase(app, &addr),
        }

        // the peer may have dropped the link while we serviced the op
        if !conn.is_connected() {
            emit(HostEvent::Disconnected { reason: 0x08 });
            return;
        }
    }
}

async fn next_notification<'s>(
    listener: &mut NotificationListener<'s, DefaultPacketPool>,
) -> heapless::Vec<u8, { ble::MAX_NOTIFY_LEN }> {
    loop {
        let notification = listener.next().await;
        let mut data = heapless::Vec::new();
        if data.extend_from_slice(notification.as_ref()).is_ok() {
            return data;
        }
        log::warn!("oversized notification dropped");
    }
}

const fn serial_service_uuid(meshtastic: bool) -> [u8; 16] {
    if meshtastic {
        *b"\x6B\xA1\xB2\x18\x15\xA8\x46\x1F\x9F\xA8\x5D\xCA\xE2\x73\xEA\xFD"
    } else {
        *b"\x6E\x40\x00\x01\xB5\xA3\xF3\x93\xE0\xA9\xE5\x0E\x24\xDC\xCA\x9E"
    }
}

/// Active scan window feeding the device table. The scanner owns the
/// central for its duration and hands it back.
async fn scan<'s, C: trouble_host::Controller>(
    central: trouble_host::prelude::Central<'s, C, DefaultPacketPool>,
    app: &'static App,
) -> trouble_host::prelude::Central<'s, C, DefaultPacketPool> {
    log::info!("BLE scan start");
    let mut scanner = Scanner::new(central);
    let config = ScanConfig {
        active: true,
        ..Default::default()
    };
    match scanner.scan(&config).await {
        Ok(mut session) => {
            let deadline = embassy_time::Instant::now() + Duration::from_secs(10);
            while embassy_time::Instant::now() < deadline {
                let report = session.next().await;
                let mut bd = report.addr.raw();
                bd.reverse();
                let mut name = heapless::String::new();
                let _ = name.push_str("?");
                app.note_scan_result(crate::app::ScanResult {
                    addr: Addr(bd),
                    rssi: report.rssi,
                    name,
                });
            }
            log::info!("BLE scan done");
        }
        Err(e) => log::warn!("scan failed to start: {:?}", e),
    }
    scanner.into_inner()
}
