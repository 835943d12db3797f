//! The Generic Provisioning layer
//!
//! Provisioning PDUs are longer than a single advertising bearer frame, so this layer chops a
//! *transaction* into a start segment followed by continuation segments, and reassembles the
//! segments of the device's transactions on the way back in. Each transaction is covered by an
//! 8 bit frame check sequence and confirmed by a single acknowledgement frame.
//!
//! The layer also owns the link control frames of the PB-ADV bearer: a link is opened towards
//! a device UUID before the first transaction and closed with a reason code when provisioning
//! ends, whichever way it ends.
//!
//! A transaction that is not acknowledged within thirty seconds has failed; the sender gives
//! the acknowledgement watcher a five second reporting margin on top before giving up. Neither
//! side retransmits, the provisioning layer above treats the failure as fatal to the session.

use core::fmt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::{Buffer, BufferError};
use crate::crypto;
use crate::driver::{Channel, DongleDriver};

/// Largest frame the advertising bearer will carry for this layer
pub const MTU: usize = 24;

/// Content bytes carried by a transaction start frame
///
/// The start header spends four bytes of the MTU: one for the segmentation header, two for the
/// total length, and one for the frame check sequence.
pub const START_PAYLOAD: usize = MTU - 4;

/// Content bytes carried by a continuation frame
pub const CONTINUATION_PAYLOAD: usize = MTU - 1;

/// Largest payload a single transaction can carry (the segment index is six bits)
pub const MAX_TRANSACTION_LEN: usize = START_PAYLOAD + 63 * CONTINUATION_PAYLOAD;

const BEARER_OP_LINK_OPEN: u8 = 0x00;
const BEARER_OP_LINK_ACK: u8 = 0x01;
const BEARER_OP_LINK_CLOSE: u8 = 0x02;

/// Why a provisioning link was closed
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum CloseReason {
    Success,
    Timeout,
    Fail,
}

impl CloseReason {
    pub fn val(self) -> u8 {
        match self {
            CloseReason::Success => 0x00,
            CloseReason::Timeout => 0x01,
            CloseReason::Fail => 0x02,
        }
    }

    pub fn from_raw(raw: u8) -> Result<Self, DecodeError> {
        match raw {
            0x00 => Ok( CloseReason::Success ),
            0x01 => Ok( CloseReason::Timeout ),
            0x02 => Ok( CloseReason::Fail ),
            _ => Err( DecodeError::UnknownCloseReason(raw) ),
        }
    }
}

/// A provisioning session link
///
/// The link id is chosen by the provisioner when the link is opened and the transaction number
/// advances after every transaction this side completes. Both are applied to the wire by the
/// dongle driver's PB-ADV framing.
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct Link {
    pub device_uuid: [u8; 16],
    pub link_id: u32,
    pub close_reason: Option<CloseReason>,
    pub transaction_number: u8,
}

impl Link {
    pub fn new(device_uuid: [u8; 16], link_id: u32) -> Self {
        Link {
            device_uuid,
            link_id,
            close_reason: None,
            transaction_number: 0,
        }
    }
}

/// Errors from parsing a generic provisioning frame
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum DecodeError {
    /// The frame ended before its fields did
    Truncated,
    /// A generic provisioning control field value that is not in the message grammar
    UnknownMessageType(u8),
    /// The upper six bits of an acknowledgement frame must be zero
    NonZeroAckPadding,
    /// A bearer control op code outside of link open/ack/close
    UnknownBearerOpCode(u8),
    UnknownCloseReason(u8),
    /// A link open frame whose body is not exactly the 16 byte device UUID
    BadLinkOpen,
    /// A continuation segment index outside of the transaction being reassembled
    SegmentOutOfRange(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DecodeError::Truncated => write!(f, "frame too short for its message type"),
            DecodeError::UnknownMessageType(raw) => {
                write!(f, "unknown generic provisioning message type {:#x}", raw)
            }
            DecodeError::NonZeroAckPadding => write!(f, "acknowledgement padding is not zero"),
            DecodeError::UnknownBearerOpCode(op) => write!(f, "unknown bearer op code {:#x}", op),
            DecodeError::UnknownCloseReason(raw) => write!(f, "unknown close reason {:#x}", raw),
            DecodeError::BadLinkOpen => write!(f, "link open body is not a device uuid"),
            DecodeError::SegmentOutOfRange(index) => {
                write!(f, "segment index {} outside the transaction", index)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<BufferError> for DecodeError {
    fn from(_: BufferError) -> DecodeError {
        DecodeError::Truncated
    }
}

/// Bearer control messages of the PB-ADV link
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum BearerControl {
    LinkOpen([u8; 16]),
    LinkAck,
    LinkClose(CloseReason),
}

/// The generic provisioning message grammar
///
/// Every frame starts with one byte whose low two bits select the message type and whose upper
/// six bits are type specific: the last segment number on a start, the segment index on a
/// continuation, zero padding on an acknowledgement, and the op code on bearer control.
#[derive(Clone,Debug,PartialEq,Eq)]
pub enum GenericProvisioningPdu {
    TransactionStart {
        /// Index of the last segment of the transaction (0 when unsegmented)
        seg_n: u8,
        /// Length of the complete transaction payload
        total_length: u16,
        /// Frame check sequence over the complete payload
        fcs: u8,
        data: Vec<u8>,
    },
    TransactionAck,
    TransactionContinuation {
        /// 1-based index of this segment
        seg_index: u8,
        data: Vec<u8>,
    },
    BearerControl(BearerControl),
}

impl GenericProvisioningPdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Buffer::new();

        match self {
            GenericProvisioningPdu::TransactionStart { seg_n, total_length, fcs, data } => {
                buffer.push_u8((seg_n & 0x3F) << 2);
                buffer.push_be16(*total_length);
                buffer.push_u8(*fcs);
                buffer.push_bytes(data);
            }
            GenericProvisioningPdu::TransactionAck => {
                buffer.push_u8(0b01);
            }
            GenericProvisioningPdu::TransactionContinuation { seg_index, data } => {
                buffer.push_u8((seg_index & 0x3F) << 2 | 0b10);
                buffer.push_bytes(data);
            }
            GenericProvisioningPdu::BearerControl(control) => match control {
                BearerControl::LinkOpen(uuid) => {
                    buffer.push_u8(BEARER_OP_LINK_OPEN << 2 | 0b11);
                    buffer.push_bytes(uuid);
                }
                BearerControl::LinkAck => {
                    buffer.push_u8(BEARER_OP_LINK_ACK << 2 | 0b11);
                }
                BearerControl::LinkClose(reason) => {
                    buffer.push_u8(BEARER_OP_LINK_CLOSE << 2 | 0b11);
                    buffer.push_u8(reason.val());
                }
            },
        }

        buffer.into_bytes()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buffer = Buffer::from_bytes(frame);

        let first = buffer.pull_u8()?;

        let upper = (first & 0b1111_1100) >> 2;

        match first & 0b0000_0011 {
            0b00 => Ok( GenericProvisioningPdu::TransactionStart {
                seg_n: upper,
                total_length: buffer.pull_be16()?,
                fcs: buffer.pull_u8()?,
                data: buffer.pull_remaining(),
            }),
            0b01 => {
                if upper != 0 {
                    return Err( DecodeError::NonZeroAckPadding );
                }

                Ok( GenericProvisioningPdu::TransactionAck )
            }
            0b10 => Ok( GenericProvisioningPdu::TransactionContinuation {
                seg_index: upper,
                data: buffer.pull_remaining(),
            }),
            0b11 => match upper {
                BEARER_OP_LINK_OPEN => {
                    let uuid_bytes = buffer.pull_remaining();

                    if uuid_bytes.len() != 16 {
                        return Err( DecodeError::BadLinkOpen );
                    }

                    let mut uuid = [0u8; 16];
                    uuid.copy_from_slice(&uuid_bytes);

                    Ok( GenericProvisioningPdu::BearerControl(BearerControl::LinkOpen(uuid)) )
                }
                BEARER_OP_LINK_ACK => {
                    Ok( GenericProvisioningPdu::BearerControl(BearerControl::LinkAck) )
                }
                BEARER_OP_LINK_CLOSE => {
                    let reason = CloseReason::from_raw(buffer.pull_u8()?)?;

                    Ok( GenericProvisioningPdu::BearerControl(BearerControl::LinkClose(reason)) )
                }
                op => Err( DecodeError::UnknownBearerOpCode(op) ),
            },
            raw => Err( DecodeError::UnknownMessageType(raw) ),
        }
    }
}

/// The frame check sequence of a transaction
///
/// CRC-8 with the polynomial x⁸+x²+x+1 run least-significant-bit first from an initial value
/// of 0xFF, with the ones complement of the remainder as the check value (the FCS of 3GPP
/// TS 27.010, which PB-ADV adopts).
pub fn fcs(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;

    for &byte in data {
        crc ^= byte;

        for _ in 0..8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xE0 } else { crc >> 1 };
        }
    }

    !crc
}

/// Split a transaction payload into its start and continuation frames
///
/// The start frame carries up to [`START_PAYLOAD`] bytes and each continuation up to
/// [`CONTINUATION_PAYLOAD`]; continuations are numbered from one in sending order.
pub fn segment(payload: &[u8]) -> Vec<GenericProvisioningPdu> {
    debug_assert!(payload.len() <= MAX_TRANSACTION_LEN);

    let start_len = payload.len().min(START_PAYLOAD);

    let continuations = payload[start_len..].chunks(CONTINUATION_PAYLOAD);

    let mut frames = Vec::with_capacity(1 + continuations.len());

    frames.push(GenericProvisioningPdu::TransactionStart {
        seg_n: continuations.len() as u8,
        total_length: payload.len() as u16,
        fcs: fcs(payload),
        data: payload[..start_len].to_vec(),
    });

    for (index, chunk) in continuations.enumerate() {
        frames.push(GenericProvisioningPdu::TransactionContinuation {
            seg_index: index as u8 + 1,
            data: chunk.to_vec(),
        });
    }

    frames
}

/// Reason a fully reassembled transaction was thrown away
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum ReassembleError {
    /// The segments do not add up to the advertised total length
    LengthMismatch,
    /// The frame check sequence over the payload does not match the start frame
    FcsMismatch,
}

impl fmt::Display for ReassembleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReassembleError::LengthMismatch => write!(f, "segments do not match the total length"),
            ReassembleError::FcsMismatch => write!(f, "frame check sequence mismatch"),
        }
    }
}

/// Reassembly state of one inbound transaction
///
/// Segments may arrive more than once; a duplicate simply overwrites its slot.
#[derive(Debug)]
pub struct Reassembler {
    total_length: usize,
    fcs: u8,
    segments: Vec<Option<Vec<u8>>>,
}

impl Reassembler {
    pub fn new(seg_n: u8, total_length: u16, fcs: u8, start_data: Vec<u8>) -> Self {
        let mut segments = vec![None; usize::from(seg_n) + 1];

        segments[0] = Some(start_data);

        Reassembler {
            total_length: total_length.into(),
            fcs,
            segments,
        }
    }

    pub fn insert(&mut self, seg_index: u8, data: Vec<u8>) -> Result<(), DecodeError> {
        let index = usize::from(seg_index);

        if index == 0 || index >= self.segments.len() {
            return Err( DecodeError::SegmentOutOfRange(seg_index) );
        }

        self.segments[index] = Some(data);

        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(Option::is_some)
    }

    /// Concatenate the segments and validate the length and frame check sequence
    pub fn assemble(self) -> Result<Vec<u8>, ReassembleError> {
        let Reassembler { total_length, fcs: expected_fcs, segments } = self;

        let payload = segments.into_iter().flatten().flatten().collect::<Vec<u8>>();

        if payload.len() != total_length {
            return Err( ReassembleError::LengthMismatch );
        }

        if fcs(&payload) != expected_fcs {
            return Err( ReassembleError::FcsMismatch );
        }

        Ok(payload)
    }
}

/// Errors of the generic provisioning layer
#[derive(Debug)]
pub enum GProvError<E> {
    Decode(DecodeError),
    /// The transaction was not acknowledged within the acknowledgement window
    AckTimeout,
    /// No complete transaction arrived within the receive window
    RecvTimeout,
    /// The payload does not fit in the 64 segments a transaction can have
    PayloadTooLarge(usize),
    /// The device closed the link on its own
    RemoteClose(CloseReason),
    Driver(E),
}

impl<E> fmt::Display for GProvError<E>
where
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GProvError::Decode(err) => write!(f, "{}", err),
            GProvError::AckTimeout => write!(f, "no acknowledgement within the ack window"),
            GProvError::RecvTimeout => write!(f, "no transaction within the receive window"),
            GProvError::PayloadTooLarge(len) => {
                write!(f, "{} byte payload cannot be segmented", len)
            }
            GProvError::RemoteClose(reason) => {
                write!(f, "device closed the link ({:?})", reason)
            }
            GProvError::Driver(err) => write!(f, "dongle driver failure: {:?}", err),
        }
    }
}

impl<E> From<DecodeError> for GProvError<E> {
    fn from(err: DecodeError) -> Self {
        GProvError::Decode(err)
    }
}

/// Timing knobs of the acknowledgement machinery
///
/// The defaults are the values of the provisioning bearer: a thirty second acknowledgement
/// window, a thirty-five second wait on the sending side so the watcher has margin to report,
/// and a half second bearer poll.
#[derive(Clone,Copy,Debug)]
pub struct AckTiming {
    pub ack_timeout: Duration,
    pub send_wait: Duration,
    pub poll: Duration,
}

impl Default for AckTiming {
    fn default() -> Self {
        AckTiming {
            ack_timeout: Duration::from_secs(30),
            send_wait: Duration::from_secs(35),
            poll: Duration::from_millis(500),
        }
    }
}

/// The generic provisioning layer over a dongle driver
pub struct GProvLayer<D>
where
    D: DongleDriver,
{
    driver: Arc<D>,
    timing: AckTiming,
}

impl<D> GProvLayer<D>
where
    D: DongleDriver,
{
    pub fn new(driver: Arc<D>) -> Self {
        GProvLayer {
            driver,
            timing: AckTiming::default(),
        }
    }

    pub fn with_timing(driver: Arc<D>, timing: AckTiming) -> Self {
        GProvLayer { driver, timing }
    }

    /// Open a link to the device with the given UUID
    ///
    /// Sends a link open bearer control frame and waits for the device's link acknowledgement.
    /// There is no retry; a device that never answers is reported as [`GProvError::AckTimeout`].
    pub fn open(&mut self, device_uuid: [u8; 16]) -> Result<Link, GProvError<D::Error>> {
        let mut link_id = [0u8; 4];

        crypto::fill_random(&mut link_id);

        let link = Link::new(device_uuid, <u32>::from_be_bytes(link_id));

        let open = GenericProvisioningPdu::BearerControl(BearerControl::LinkOpen(device_uuid));

        self.driver
            .send(Some(&link), &open.encode())
            .map_err(GProvError::Driver)?;

        let deadline = Instant::now() + self.timing.ack_timeout;

        while Instant::now() < deadline {
            let frame = match self
                .driver
                .recv_timeout(Channel::Prov, 1, self.timing.poll)
                .map_err(GProvError::Driver)?
            {
                Some(frame) => frame,
                None => continue,
            };

            match GenericProvisioningPdu::decode(&frame) {
                Ok(GenericProvisioningPdu::BearerControl(BearerControl::LinkAck)) => {
                    return Ok(link);
                }
                Ok(_) => log::debug!("ignoring frame while waiting for the link ack"),
                Err(err) => log::debug!("dropping undecodable provisioning frame: {}", err),
            }
        }

        Err( GProvError::AckTimeout )
    }

    /// Close the link with the given reason
    ///
    /// Best effort; the device will drop the link by timeout if the frame is lost.
    pub fn close(&mut self, link: &mut Link, reason: CloseReason) -> Result<(), GProvError<D::Error>> {
        link.close_reason = Some(reason);

        let close = GenericProvisioningPdu::BearerControl(BearerControl::LinkClose(reason));

        self.driver
            .send(Some(link), &close.encode())
            .map_err(GProvError::Driver)
    }

    /// Send one transaction and wait for its acknowledgement
    ///
    /// The start segment goes out first, then an acknowledgement watcher starts polling the
    /// bearer while the continuation segments follow in index order. The watcher reports
    /// success as soon as the acknowledgement arrives or gives up when the acknowledgement
    /// window elapses, and an early acknowledgement cancels it without leaking the thread.
    pub fn send(&mut self, link: &mut Link, payload: &[u8]) -> Result<(), GProvError<D::Error>> {
        if payload.len() > MAX_TRANSACTION_LEN {
            return Err( GProvError::PayloadTooLarge(payload.len()) );
        }

        let frames = segment(payload);

        self.driver
            .send(Some(link), &frames[0].encode())
            .map_err(GProvError::Driver)?;

        let timing = self.timing;

        let watcher_driver = self.driver.clone();

        let cancelled = AtomicBool::new(false);
        let cancelled_ref = &cancelled;

        let link_ref: &Link = link;

        let outcome = thread::scope(|scope| {
            let (report, verdict) = mpsc::channel::<Result<(), GProvError<D::Error>>>();

            scope.spawn(move || {
                let started = Instant::now();

                loop {
                    if cancelled_ref.load(Ordering::Relaxed) {
                        return;
                    }

                    if started.elapsed() >= timing.ack_timeout {
                        let _ = report.send(Err(GProvError::AckTimeout));
                        return;
                    }

                    match watcher_driver.recv_timeout(Channel::Prov, 1, timing.poll) {
                        Ok(Some(frame)) => match GenericProvisioningPdu::decode(&frame) {
                            Ok(GenericProvisioningPdu::TransactionAck) => {
                                let _ = report.send(Ok(()));
                                return;
                            }
                            Ok(_) => log::debug!("ignoring frame while waiting for the ack"),
                            Err(err) => {
                                log::debug!("dropping undecodable provisioning frame: {}", err)
                            }
                        },
                        Ok(None) => (),
                        Err(err) => {
                            let _ = report.send(Err(GProvError::Driver(err)));
                            return;
                        }
                    }
                }
            });

            let sent = frames[1..].iter().try_for_each(|frame| {
                self.driver
                    .send(Some(link_ref), &frame.encode())
                    .map_err(GProvError::Driver)
            });

            let outcome = match sent {
                Ok(()) => match verdict.recv_timeout(timing.send_wait) {
                    Ok(watcher_outcome) => watcher_outcome,
                    Err(_) => Err( GProvError::AckTimeout ),
                },
                Err(err) => Err(err),
            };

            cancelled.store(true, Ordering::Relaxed);

            outcome
        });

        if outcome.is_ok() {
            link.transaction_number = link.transaction_number.wrapping_add(1);
        }

        outcome
    }

    /// Receive one complete transaction
    ///
    /// Pulls provisioning frames from the bearer, reassembles them, and acknowledges the
    /// transaction once its frame check sequence validates. A transaction that fails its check
    /// is silently thrown away so the sending side times out. A link close from the device
    /// ends the wait immediately.
    pub fn recv(&mut self, link: &Link) -> Result<Vec<u8>, GProvError<D::Error>> {
        let deadline = Instant::now() + self.timing.ack_timeout;

        let mut reassembler: Option<Reassembler> = None;

        while Instant::now() < deadline {
            let frame = match self
                .driver
                .recv_timeout(Channel::Prov, 1, self.timing.poll)
                .map_err(GProvError::Driver)?
            {
                Some(frame) => frame,
                None => continue,
            };

            match GenericProvisioningPdu::decode(&frame) {
                Ok(GenericProvisioningPdu::TransactionStart { seg_n, total_length, fcs, data }) => {
                    reassembler = Some(Reassembler::new(seg_n, total_length, fcs, data));
                }
                Ok(GenericProvisioningPdu::TransactionContinuation { seg_index, data }) => {
                    match reassembler.as_mut() {
                        Some(pending) => {
                            if let Err(err) = pending.insert(seg_index, data) {
                                log::debug!("dropping continuation: {}", err);
                            }
                        }
                        None => log::debug!("continuation without a transaction start"),
                    }
                }
                Ok(GenericProvisioningPdu::TransactionAck) => (),
                Ok(GenericProvisioningPdu::BearerControl(BearerControl::LinkClose(reason))) => {
                    return Err( GProvError::RemoteClose(reason) );
                }
                Ok(GenericProvisioningPdu::BearerControl(_)) => (),
                Err(err) => log::debug!("dropping undecodable provisioning frame: {}", err),
            }

            if reassembler.as_ref().map(Reassembler::is_complete) == Some(true) {
                if let Some(complete) = reassembler.take() {
                    match complete.assemble() {
                        Ok(payload) => {
                            self.driver
                                .send(Some(link), &GenericProvisioningPdu::TransactionAck.encode())
                                .map_err(GProvError::Driver)?;

                            return Ok(payload);
                        }
                        // the sender never sees an ack and times the transaction out
                        Err(err) => log::debug!("dropping reassembled transaction: {}", err),
                    }
                }
            }
        }

        Err( GProvError::RecvTimeout )
    }
}
