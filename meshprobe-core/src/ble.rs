// Copyright 2025 meshprobe contributors
// Dual licensed under the Apache 2.0 and MIT licenses.

//! BLE central state machine.
//!
//! The host stack is an external collaborator behind [`BleHost`]; its
//! callbacks are translated into [`HostEvent`] values and drained by a
//! single task, which feeds them here. The machine walks
//! connect, MTU exchange, pairing, discovery and subscribe, then shuttles
//! serial bytes between the peer and the TCP proxy.

use crate::hal::Clock;
use heapless::Vec;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Connect,
    Pair,
    Encrypt,
    Discover,
    Subscribe,
    Send,
    /// Operation not legal in the current state.
    InvalidState,
}

pub type Result<T> = core::result::Result<T, Error>;

/// 48-bit public or random device address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct Addr(pub [u8; 6]);

impl Addr {
    /// Parses `"XX:XX:XX:XX:XX:XX"`.
    pub fn parse(s: &str) -> Option<Addr> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts.next()?;
            if part.len() != 2 {
                return None;
            }
            *byte = u8::from_str_radix(part, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Addr(out))
    }
}

impl core::fmt::Display for Addr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let a = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

/// 128-bit service UUIDs we accept, big-endian as written on paper.
pub const NUS_SERVICE: [u8; 16] = [
    0x6E, 0x40, 0x00, 0x01, 0xB5, 0xA3, 0xF3, 0x93, 0xE0, 0xA9, 0xE5, 0x0E, 0x24, 0xDC, 0xCA,
    0x9E,
];
pub const MESHTASTIC_SERVICE: [u8; 16] = [
    0x6B, 0xA1, 0xB2, 0x18, 0x15, 0xA8, 0x46, 0x1F, 0x9F, 0xA8, 0x5D, 0xCA, 0xE2, 0x73, 0xEA,
    0xFD,
];

pub const CCCD_UUID: u16 = 0x2902;

/// ATT characteristic property bits.
pub mod props {
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

/// Pairing passkey used when the peer asks us to type one. Meshtastic
/// radios default to this.
pub const DEFAULT_PASSKEY: u32 = 123_456;

pub const MAX_NOTIFY_LEN: usize = 244;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    MtuExchanged,
    Securing,
    Passkey,
    Encrypted,
    Discovering,
    Ready,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PasskeyAction {
    Input,
    NumericComparison(u32),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryPhase {
    Services,
    Characteristics,
    Descriptors,
}

/// Events translated from the host stack's callbacks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostEvent {
    Connected { conn_handle: u16 },
    ConnectFailed,
    MtuExchanged { mtu: u16 },
    PasskeyRequest(PasskeyAction),
    EncryptionChanged { status: u8 },
    RepeatPairing,
    ServiceFound { uuid: [u8; 16], start: u16, end: u16 },
    CharacteristicFound { props: u8, value_handle: u16 },
    DescriptorFound { uuid16: u16, handle: u16 },
    DiscoveryComplete(DiscoveryPhase),
    DescriptorWritten { status: u8 },
    Notification { handle: u16, data: Vec<u8, MAX_NOTIFY_LEN> },
    Disconnected { reason: u8 },
}

/// Commands the machine issues to the host stack. Implemented by the
/// firmware's stack adapter and by scripted test hosts.
pub trait BleHost {
    fn cancel_scan(&mut self);
    fn connect(&mut self, addr: &Addr) -> Result<()>;
    fn disconnect(&mut self, conn_handle: u16);
    fn exchange_mtu(&mut self, conn_handle: u16) -> Result<()>;
    fn initiate_security(&mut self, conn_handle: u16) -> Result<()>;
    fn inject_passkey(&mut self, conn_handle: u16, passkey: u32) -> Result<()>;
    fn confirm_numeric(&mut self, conn_handle: u16, accept: bool) -> Result<()>;
    fn discover_services(&mut self, conn_handle: u16) -> Result<()>;
    fn discover_characteristics(&mut self, conn_handle: u16, start: u16, end: u16) -> Result<()>;
    fn discover_descriptors(&mut self, conn_handle: u16, start: u16, end: u16) -> Result<()>;
    fn write_descriptor(&mut self, conn_handle: u16, handle: u16, value: &[u8]) -> Result<()>;
    /// Write to a characteristic value handle; `with_response` selects
    /// ATT write vs write-command.
    fn write_characteristic(
        &mut self,
        conn_handle: u16,
        handle: u16,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;
    fn delete_bond(&mut self, addr: &Addr);
}

/// Live connection bookkeeping; exists from CONNECT to DISCONNECT.
#[derive(Clone, Debug, Default)]
pub struct ConnContext {
    pub conn_handle: u16,
    pub peer: Addr,
    pub mtu: u16,
    pub encrypted: bool,
    pub svc_start: u16,
    pub svc_end: u16,
    pub tx_props: u8,
    pub tx_val_handle: u16,
    pub rx_val_handle: u16,
    pub rx_props: u8,
    pub tx_cccd_handle: u16,
    pub chars_done: bool,
    pub dsc_done: bool,
    pub notify_enabled: bool,
}

/// What the caller should do with a handled event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reaction {
    None,
    /// Serial bytes from the peer; fan out to the TCP clients.
    Rx(Vec<u8, MAX_NOTIFY_LEN>),
}

// Settle holds around stack-sensitive steps.
const POST_MTU_HOLD_MS: u64 = 1000;
const POST_ENCRYPT_HOLD_MS: u64 = 500;
const PRE_CONNECT_HOLD_MS: u64 = 100;

/// Deferred step armed by a state transition and fired by `poll`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Deferred {
    Connect(Addr),
    StartSecurity,
    StartDiscovery,
}

pub struct Central<H: BleHost, C: Clock> {
    host: H,
    clock: C,
    state: State,
    ctx: Option<ConnContext>,
    passkey: u32,
    deferred: Option<(u64, Deferred)>,
}

impl<H: BleHost, C: Clock> Central<H, C> {
    pub fn new(host: H, clock: C) -> Self {
        Central {
            host,
            clock,
            state: State::Idle,
            ctx: None,
            passkey: DEFAULT_PASSKEY,
            deferred: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn context(&self) -> Option<&ConnContext> {
        self.ctx.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Set the passkey injected on the next INPUT pairing request.
    pub fn set_passkey(&mut self, passkey: u32) {
        self.passkey = passkey;
    }

    pub fn mtu(&self) -> u16 {
        self.ctx.as_ref().map(|c| c.mtu).unwrap_or(23)
    }

    /// Begin connecting. Cancels any running scan, holds ≥100 ms, then
    /// issues the GAP connect from `poll`. Refused outside IDLE.
    pub fn connect(&mut self, addr: Addr) -> Result<()> {
        if self.state != State::Idle {
            return Err(Error::InvalidState);
        }
        self.host.cancel_scan();
        self.arm(PRE_CONNECT_HOLD_MS, Deferred::Connect(addr));
        Ok(())
    }

    /// Safe from any state; the machine goes back to IDLE only when the
    /// DISCONNECT event arrives.
    pub fn disconnect(&mut self) {
        self.deferred = None;
        if let Some(ctx) = self.ctx.as_ref() {
            self.host.disconnect(ctx.conn_handle);
        } else {
            self.state = State::Idle;
        }
    }

    /// Send one already-chunked frame to the peer's RX characteristic.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let ctx = self.ctx.as_ref().ok_or(Error::Send)?;
        if self.state != State::Ready {
            return Err(Error::Send);
        }
        let with_response = ctx.rx_props & props::WRITE_WITHOUT_RESPONSE == 0;
        self.host
            .write_characteristic(ctx.conn_handle, ctx.rx_val_handle, data, with_response)
            .map_err(|_| Error::Send)
    }

    /// Fire any due deferred step. Call periodically (and after every
    /// handled event) with the current time.
    pub fn poll(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        let Some((due, step)) = self.deferred else {
            return Ok(());
        };
        if now < due {
            return Ok(());
        }
        self.deferred = None;
        match step {
            Deferred::Connect(addr) => {
                self.state = State::Connecting;
                self.ctx = Some(ConnContext {
                    peer: addr,
                    ..ConnContext::default()
                });
                if self.host.connect(&addr).is_err() {
                    self.reset_to_idle();
                    return Err(Error::Connect);
                }
            }
            Deferred::StartSecurity => {
                self.state = State::Securing;
                let handle = self.handle()?;
                if self.host.initiate_security(handle).is_err() {
                    return Err(self.fail(Error::Pair));
                }
            }
            Deferred::StartDiscovery => {
                self.state = State::Discovering;
                let handle = self.handle()?;
                if self.host.discover_services(handle).is_err() {
                    return Err(self.fail(Error::Discover));
                }
            }
        }
        Ok(())
    }

    /// Advance the machine with one host event.
    pub fn handle_event(&mut self, event: HostEvent) -> Result<Reaction> {
        match event {
            HostEvent::Connected { conn_handle } => {
                if self.state != State::Connecting {
                    return Ok(Reaction::None);
                }
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.conn_handle = conn_handle;
                }
                self.state = State::Connected;
                if self.host.exchange_mtu(conn_handle).is_err() {
                    return Err(self.fail(Error::Connect));
                }
                Ok(Reaction::None)
            }
            HostEvent::ConnectFailed => {
                self.reset_to_idle();
                Err(Error::Connect)
            }
            HostEvent::MtuExchanged { mtu } => {
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.mtu = mtu;
                }
                if self.state == State::Connected {
                    self.state = State::MtuExchanged;
                    // hold while the peer's stack finishes its own setup
                    self.arm(POST_MTU_HOLD_MS, Deferred::StartSecurity);
                }
                Ok(Reaction::None)
            }
            HostEvent::PasskeyRequest(action) => match action {
                PasskeyAction::Input => {
                    self.state = State::Passkey;
                    let handle = self.handle()?;
                    let passkey = self.passkey;
                    log::info!("injecting passkey for pairing");
                    if self.host.inject_passkey(handle, passkey).is_err() {
                        return Err(self.fail(Error::Pair));
                    }
                    self.state = State::Securing;
                    Ok(Reaction::None)
                }
                PasskeyAction::NumericComparison(value) => {
                    log::info!("auto-accepting numeric comparison {}", value);
                    let handle = self.handle()?;
                    if self.host.confirm_numeric(handle, true).is_err() {
                        return Err(self.fail(Error::Pair));
                    }
                    Ok(Reaction::None)
                }
            },
            HostEvent::RepeatPairing => {
                // stale bond on our side; drop it and pair again
                let peer = self.ctx.as_ref().map(|c| c.peer).ok_or(Error::Pair)?;
                log::warn!("peer lost our bond, deleting ours for {}", peer);
                self.host.delete_bond(&peer);
                let handle = self.handle()?;
                if self.host.initiate_security(handle).is_err() {
                    return Err(self.fail(Error::Pair));
                }
                Ok(Reaction::None)
            }
            HostEvent::EncryptionChanged { status } => {
                if status != 0 {
                    return Err(self.fail(Error::Encrypt));
                }
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.encrypted = true;
                }
                self.state = State::Encrypted;
                self.arm(POST_ENCRYPT_HOLD_MS, Deferred::StartDiscovery);
                Ok(Reaction::None)
            }
            HostEvent::ServiceFound { uuid, start, end } => {
                if uuid == NUS_SERVICE || uuid == MESHTASTIC_SERVICE {
                    if let Some(ctx) = self.ctx.as_mut() {
                        ctx.svc_start = start;
                        ctx.svc_end = end;
                    }
                }
                Ok(Reaction::None)
            }
            HostEvent::DiscoveryComplete(DiscoveryPhase::Services) => {
                let handle = self.handle()?;
                let (start, end) = {
                    let ctx = self.ctx.as_ref().ok_or(Error::Discover)?;
                    (ctx.svc_start, ctx.svc_end)
                };
                if start == 0 {
                    log::warn!("no serial service on peer");
                    return Err(self.fail(Error::Discover));
                }
                if self.host.discover_characteristics(handle, start, end).is_err() {
                    return Err(self.fail(Error::Discover));
                }
                Ok(Reaction::None)
            }
            HostEvent::CharacteristicFound { props: p, value_handle } => {
                if let Some(ctx) = self.ctx.as_mut() {
                    if p & (props::NOTIFY | props::INDICATE) != 0 {
                        ctx.tx_props = p;
                        ctx.tx_val_handle = value_handle;
                    } else if p & (props::WRITE | props::WRITE_WITHOUT_RESPONSE) != 0 {
                        ctx.rx_props = p;
                        ctx.rx_val_handle = value_handle;
                    }
                }
                Ok(Reaction::None)
            }
            HostEvent::DiscoveryComplete(DiscoveryPhase::Characteristics) => {
                let handle = self.handle()?;
                let (tx, rx, end) = {
                    let ctx = self.ctx.as_mut().ok_or(Error::Discover)?;
                    ctx.chars_done = true;
                    (ctx.tx_val_handle, ctx.rx_val_handle, ctx.svc_end)
                };
                // READY needs both directions of the serial link
                if tx == 0 || rx == 0 {
                    return Err(self.fail(Error::Discover));
                }
                if self.host.discover_descriptors(handle, tx, end).is_err() {
                    return Err(self.fail(Error::Discover));
                }
                Ok(Reaction::None)
            }
            HostEvent::DescriptorFound { uuid16, handle } => {
                if uuid16 == CCCD_UUID {
                    if let Some(ctx) = self.ctx.as_mut() {
                        ctx.tx_cccd_handle = handle;
                    }
                }
                Ok(Reaction::None)
            }
            HostEvent::DiscoveryComplete(DiscoveryPhase::Descriptors) => {
                let handle = self.handle()?;
                let (cccd, value) = {
                    let ctx = self.ctx.as_mut().ok_or(Error::Discover)?;
                    ctx.dsc_done = true;
                    // subscribe for notify when offered, else indicate
                    let value: [u8; 2] = if ctx.tx_props & props::NOTIFY != 0 {
                        [0x01, 0x00]
                    } else {
                        [0x02, 0x00]
                    };
                    (ctx.tx_cccd_handle, value)
                };
                if cccd == 0 {
                    return Err(self.fail(Error::Subscribe));
                }
                if self.host.write_descriptor(handle, cccd, &value).is_err() {
                    return Err(self.fail(Error::Subscribe));
                }
                Ok(Reaction::None)
            }
            HostEvent::DescriptorWritten { status } => {
                if status != 0 {
                    return Err(self.fail(Error::Subscribe));
                }
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.notify_enabled = true;
                }
                self.state = State::Ready;
                log::info!("BLE link ready");
                Ok(Reaction::None)
            }
            HostEvent::Notification { handle, data } => {
                let tx = self.ctx.as_ref().map(|c| c.tx_val_handle).unwrap_or(0);
                if handle == tx && tx != 0 {
                    Ok(Reaction::Rx(data))
                } else {
                    Ok(Reaction::None)
                }
            }
            HostEvent::Disconnected { reason } => {
                log::info!("BLE disconnected, reason {:#04x}", reason);
                self.reset_to_idle();
                Ok(Reaction::None)
            }
        }
    }

    fn arm(&mut self, after_ms: u64, step: Deferred) {
        self.deferred = Some((self.clock.now_ms() + after_ms, step));
    }

    fn handle(&self) -> Result<u16> {
        self.ctx
            .as_ref()
            .map(|c| c.conn_handle)
            .ok_or(Error::InvalidState)
    }

    /// Tear the link down after a phase failure and hand the cause back
    /// for propagation; IDLE follows the DISCONNECT event.
    fn fail(&mut self, cause: Error) -> Error {
        self.deferred = None;
        if let Some(ctx) = self.ctx.as_ref() {
            self.host.disconnect(ctx.conn_handle);
        } else {
            self.reset_to_idle();
        }
        cause
    }

    fn reset_to_idle(&mut self) {
        self.state = State::Idle;
        self.ctx = None;
        self.deferred = None;
    }
}
