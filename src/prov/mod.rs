//! The Provisioning layer
//!
//! Provisioning admits an unprovisioned device into a mesh network over an open link of the
//! generic provisioning bearer. The protocol is a fixed sequence of four phases, each one or
//! two blocking round trips:
//!
//! 1. *Invitation*: invite the device and collect its capabilities.
//! 2. *Public key exchange*: fix the No-OOB method and trade P-256 public keys.
//! 3. *Authentication*: confirmation and random exchange over the ECDH secret.
//! 4. *Data distribution*: deliver the sealed network credentials and the device's new
//!    unicast address.
//!
//! The per-phase state and the PDU building live in [`session`]; this module drives the
//! session over the generic provisioning layer, scans for unprovisioned device beacons, and
//! translates every outcome into the link close reason the bearer requires: `SUCCESS` after
//! the device confirms, `TIMEOUT` when the transport went quiet, and `FAIL` for every protocol
//! error, including an explicit failure from the device.

pub mod session;

use core::fmt;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{Buffer, BufferError};
use crate::crypto::CryptoError;
use crate::driver::{Channel, DongleDriver};
use crate::gprov::{AckTiming, CloseReason, GProvError, GProvLayer, Link};
use crate::store::{NetworkStore, StoreError};

pub const PROVISIONING_INVITE: u8 = 0x00;
pub const PROVISIONING_CAPABILITIES: u8 = 0x01;
pub const PROVISIONING_START: u8 = 0x02;
pub const PROVISIONING_PUBLIC_KEY: u8 = 0x03;
pub const PROVISIONING_INPUT_COMPLETE: u8 = 0x04;
pub const PROVISIONING_CONFIRMATION: u8 = 0x05;
pub const PROVISIONING_RANDOM: u8 = 0x06;
pub const PROVISIONING_DATA: u8 = 0x07;
pub const PROVISIONING_COMPLETE: u8 = 0x08;
pub const PROVISIONING_FAILED: u8 = 0x09;

/// Attention timer value sent in the invitation, in seconds
pub const DEFAULT_ATTENTION_DURATION: u8 = 5;

/// Bearer poll interval while scanning for beacons
const SCAN_POLL: Duration = Duration::from_millis(500);

/// What made a provisioning session fail
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum FailReason {
    /// The device answered a phase with the wrong opcode
    UnexpectedOpcode { expected: u8, got: u8 },
    /// A response body did not parse
    Malformed,
    /// The device's random did not reproduce its earlier confirmation
    ConfirmationMismatch,
    /// The device reported `PROVISIONING_FAILED`
    DeviceFailed,
    /// The device closed the link mid-session
    LinkClosed(CloseReason),
    /// A key generation or agreement failure
    Crypto(CryptoError),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FailReason::UnexpectedOpcode { expected, got } => {
                write!(f, "expected opcode {:#x}, device sent {:#x}", expected, got)
            }
            FailReason::Malformed => write!(f, "malformed provisioning pdu"),
            FailReason::ConfirmationMismatch => write!(f, "device confirmation mismatch"),
            FailReason::DeviceFailed => write!(f, "device reported provisioning failed"),
            FailReason::LinkClosed(reason) => write!(f, "device closed the link ({:?})", reason),
            FailReason::Crypto(err) => write!(f, "{}", err),
        }
    }
}

impl From<BufferError> for FailReason {
    fn from(_: BufferError) -> FailReason {
        FailReason::Malformed
    }
}

/// Errors of a provisioning session
#[derive(Debug)]
pub enum ProvisioningError<E> {
    /// A fatal protocol failure; the link is closed with `FAIL`
    Fail(FailReason),
    /// The transport went quiet; the link is closed with `TIMEOUT`
    Timeout,
    Store(StoreError),
    Driver(E),
}

impl<E> fmt::Display for ProvisioningError<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisioningError::Fail(reason) => write!(f, "provisioning failed: {}", reason),
            ProvisioningError::Timeout => write!(f, "provisioning timed out"),
            ProvisioningError::Store(err) => write!(f, "{}", err),
            ProvisioningError::Driver(err) => write!(f, "dongle driver failure: {:?}", err),
        }
    }
}

impl<E> From<FailReason> for ProvisioningError<E> {
    fn from(reason: FailReason) -> Self {
        ProvisioningError::Fail(reason)
    }
}

impl<E> From<StoreError> for ProvisioningError<E> {
    fn from(err: StoreError) -> Self {
        ProvisioningError::Store(err)
    }
}

impl<E> From<GProvError<E>> for ProvisioningError<E> {
    fn from(err: GProvError<E>) -> Self {
        match err {
            GProvError::AckTimeout | GProvError::RecvTimeout => ProvisioningError::Timeout,
            GProvError::Decode(_) | GProvError::PayloadTooLarge(_) => {
                ProvisioningError::Fail(FailReason::Malformed)
            }
            GProvError::RemoteClose(reason) => {
                ProvisioningError::Fail(FailReason::LinkClosed(reason))
            }
            GProvError::Driver(err) => ProvisioningError::Driver(err),
        }
    }
}

/// The capabilities a device reports in response to an invitation
///
/// Informational for this provisioner: with the method fixed to No-OOB none of the OOB fields
/// change how the session proceeds, but the raw body still enters the confirmation transcript.
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub struct Capabilities {
    pub number_of_elements: u8,
    pub algorithms: u16,
    pub public_key_type: u8,
    pub static_oob_type: u8,
    pub output_oob_size: u8,
    pub output_oob_action: u16,
    pub input_oob_size: u8,
    pub input_oob_action: u16,
}

impl Capabilities {
    /// Parse the eleven byte capabilities body
    pub fn parse(body: &[u8]) -> Result<Self, FailReason> {
        let mut buffer = Buffer::from_bytes(body);

        let capabilities = Capabilities {
            number_of_elements: buffer.pull_u8()?,
            algorithms: buffer.pull_be16()?,
            public_key_type: buffer.pull_u8()?,
            static_oob_type: buffer.pull_u8()?,
            output_oob_size: buffer.pull_u8()?,
            output_oob_action: buffer.pull_be16()?,
            input_oob_size: buffer.pull_u8()?,
            input_oob_action: buffer.pull_be16()?,
        };

        if !buffer.is_empty() {
            return Err( FailReason::Malformed );
        }

        Ok(capabilities)
    }
}

/// An unprovisioned device seen on the beacon channel
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub struct UnprovisionedDevice {
    pub uuid: [u8; 16],
}

/// Pull the device UUID out of a beacon frame
///
/// Beacon frames are whitespace separated; the second token is the sixteen byte device UUID.
fn device_from_beacon(frame: &[u8]) -> Option<UnprovisionedDevice> {
    let token = frame
        .split(|byte| byte.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .nth(1)?;

    if token.len() != 16 {
        return None;
    }

    let mut uuid = [0u8; 16];

    uuid.copy_from_slice(token);

    Some( UnprovisionedDevice { uuid } )
}

/// The provisioning layer over a dongle driver and the network record store
pub struct ProvisioningLayer<D>
where
    D: DongleDriver,
{
    driver: Arc<D>,
    gprov: GProvLayer<D>,
    store: NetworkStore,
    pub attention_duration: u8,
}

impl<D> ProvisioningLayer<D>
where
    D: DongleDriver,
{
    pub fn new(driver: Arc<D>, store: NetworkStore) -> Self {
        ProvisioningLayer {
            gprov: GProvLayer::new(driver.clone()),
            driver,
            store,
            attention_duration: DEFAULT_ATTENTION_DURATION,
        }
    }

    pub fn with_timing(driver: Arc<D>, store: NetworkStore, timing: AckTiming) -> Self {
        ProvisioningLayer {
            gprov: GProvLayer::with_timing(driver.clone(), timing),
            driver,
            store,
            attention_duration: DEFAULT_ATTENTION_DURATION,
        }
    }

    /// Scan for an unprovisioned device beacon
    ///
    /// With a timeout the beacon channel is polled until the window elapses and `Ok(None)`
    /// reports that no device appeared; without one the call blocks until a beacon arrives.
    /// Beacons that do not parse are logged and skipped.
    pub fn scan(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<UnprovisionedDevice>, ProvisioningError<D::Error>> {
        match timeout {
            Some(window) => {
                let deadline = Instant::now() + window;

                while Instant::now() < deadline {
                    let frame = match self
                        .driver
                        .recv_timeout(Channel::Beacon, 1, SCAN_POLL)
                        .map_err(ProvisioningError::Driver)?
                    {
                        Some(frame) => frame,
                        None => continue,
                    };

                    match device_from_beacon(&frame) {
                        Some(device) => return Ok( Some(device) ),
                        None => log::warn!("skipping malformed beacon frame"),
                    }
                }

                Ok(None)
            }
            None => loop {
                let frame = self
                    .driver
                    .recv(Channel::Beacon)
                    .map_err(ProvisioningError::Driver)?;

                match device_from_beacon(&frame) {
                    Some(device) => return Ok( Some(device) ),
                    None => log::warn!("skipping malformed beacon frame"),
                }
            },
        }
    }

    /// Provision the device with the given UUID into the named network
    ///
    /// Runs the four protocol phases over an opened link and closes the link with the reason
    /// matching the outcome, error paths included. On success the unicast address assigned to
    /// the device is returned; the address allocation was persisted in the network record.
    pub fn provision_device(
        &mut self,
        device_uuid: [u8; 16],
        net_name: &str,
    ) -> Result<u16, ProvisioningError<D::Error>> {
        let mut link = self.gprov.open(device_uuid)?;

        let outcome = self.run_phases(&mut link, net_name);

        let reason = match &outcome {
            Ok(_) => CloseReason::Success,
            Err(ProvisioningError::Timeout) => CloseReason::Timeout,
            Err(_) => CloseReason::Fail,
        };

        if let Err(err) = self.gprov.close(&mut link, reason) {
            log::warn!("failed to close the provisioning link: {}", err);
        }

        outcome
    }

    fn run_phases(
        &mut self,
        link: &mut Link,
        net_name: &str,
    ) -> Result<u16, ProvisioningError<D::Error>> {
        // Invitation
        let invitation = session::Invitation::new(self.attention_duration);

        self.gprov.send(link, &invitation.invite_pdu())?;

        let frame = self.gprov.recv(link)?;

        let key_exchange = invitation.capabilities(&frame)?;

        log::info!(
            "device {:02x?} reports {} element(s)",
            link.device_uuid,
            key_exchange.capabilities.number_of_elements
        );

        // Public key exchange
        self.gprov.send(link, &key_exchange.start_pdu())?;
        self.gprov.send(link, &key_exchange.public_key_pdu())?;

        let frame = self.gprov.recv(link)?;

        let authentication = key_exchange.device_public_key(&frame)?;

        // Authentication
        self.gprov.send(link, &authentication.confirmation_pdu())?;

        let frame = self.gprov.recv(link)?;

        let random_exchange = authentication.device_confirmation(&frame)?;

        self.gprov.send(link, &random_exchange.random_pdu())?;

        let frame = self.gprov.recv(link)?;

        let distribution = random_exchange.device_random(&frame)?;

        // Data distribution
        let unicast_addr = self.store.allocate_unicast(net_name)?;

        let record = self.store.load(net_name)?;

        self.gprov.send(link, &distribution.data_pdu(&record, unicast_addr))?;

        let frame = self.gprov.recv(link)?;

        distribution.complete(&frame)?;

        Ok(unicast_addr)
    }
}
