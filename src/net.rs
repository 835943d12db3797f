//! The Network layer
//!
//! Operational mesh traffic rides in network PDUs: a one byte `ivi|nid` label, an obfuscated
//! six byte header (`ctl|ttl`, the 24 bit sequence number, and the source address), and an
//! AES-CCM sealed body holding the destination address and the transport PDU. The MIC of the
//! body is 4 bytes for access messages and 8 bytes for control messages.
//!
//! Outbound, the layer draws a sequence number from the network record store (the allocation
//! is persisted before the PDU is built, so no nonce is ever reused), seals and obfuscates the
//! PDU, and places it on the shared outbound queue tagged [`MESSAGE_SEND_TAG`]. Inbound, the
//! `nid` of the first byte selects the candidate networks, the header is deobfuscated with the
//! network's privacy key, and the body is opened with its encryption key. Frames that match no
//! network or fail their integrity check are logged and dropped; the receive loop never stops
//! for a bad frame.
//!
//! Replay protection is out of scope here: the recovered sequence number is surfaced through
//! the receive [`HardContext`] for an upper layer to window.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::buffer::Buffer;
use crate::crypto::{self, CryptoError, MicSize};
use crate::driver::{TaggedFrame, MESSAGE_SEND_TAG, MESSAGE_TAG};
use crate::store::{NetworkRecord, NetworkStore, StoreError};

/// Per-PDU context that is independent of addressing
#[derive(Clone,Copy,Debug,Default,PartialEq,Eq)]
pub struct HardContext {
    /// Control messages carry the 8 byte MIC, access messages the 4 byte MIC
    pub is_ctrl_msg: bool,
    /// Time to live, 7 bits
    pub ttl: u8,
    /// 24 bit sequence number; assigned on send, recovered on receive
    pub seq: u32,
}

/// Per-message addressing context
#[derive(Clone,Debug,PartialEq,Eq)]
pub struct SoftContext {
    pub src_addr: u16,
    pub dst_addr: u16,
    pub network_name: String,
}

#[derive(Debug)]
pub enum NetError {
    /// A PDU or transport payload shorter than the format allows
    TooShort,
    /// No installed network derives this nid
    NidUnknown(u8),
    /// The network MIC did not validate
    MicMismatch,
    Store(StoreError),
    /// The outbound queue has no receiver any more
    QueueClosed,
}

impl core::fmt::Display for NetError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            NetError::TooShort => write!(f, "network pdu too short"),
            NetError::NidUnknown(nid) => write!(f, "no network with nid {:#x}", nid),
            NetError::MicMismatch => write!(f, "network mic mismatch"),
            NetError::Store(err) => write!(f, "{}", err),
            NetError::QueueClosed => write!(f, "outbound queue is closed"),
        }
    }
}

impl std::error::Error for NetError {}

impl From<StoreError> for NetError {
    fn from(err: StoreError) -> NetError {
        NetError::Store(err)
    }
}

/// The per-network material derived from the network key by `k2`
struct SecurityMaterial {
    nid: u8,
    encryption_key: [u8; crypto::KEY_LEN],
    privacy_key: [u8; crypto::KEY_LEN],
}

/// Master security credentials of a network (`k2` with p = 0x00)
fn security_material(record: &NetworkRecord) -> SecurityMaterial {
    let (nid, encryption_key, privacy_key) = crypto::k2(&record.net_key, &[0x00]);

    SecurityMaterial { nid, encryption_key, privacy_key }
}

/// The 13 byte network nonce
fn network_nonce(ctl_ttl: u8, seq: u32, src_addr: u16, iv_index: &[u8; 4]) -> [u8; crypto::NONCE_LEN] {
    let mut nonce = [0u8; crypto::NONCE_LEN];

    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src_addr.to_be_bytes());
    nonce[9..13].copy_from_slice(iv_index);

    nonce
}

/// The privacy ECB used to (de)obfuscate the network header
fn privacy_ecb(
    privacy_key: &[u8; crypto::KEY_LEN],
    iv_index: &[u8; 4],
    privacy_random: &[u8],
) -> [u8; 16] {
    let mut plaintext = [0u8; 16];

    plaintext[5..9].copy_from_slice(iv_index);
    plaintext[9..16].copy_from_slice(&privacy_random[..7]);

    crypto::e(privacy_key, plaintext)
}

/// Build a sealed and obfuscated network PDU
pub fn encode_network_pdu(
    record: &NetworkRecord,
    hard: &HardContext,
    soft: &SoftContext,
    transport_pdu: &[u8],
) -> Result<Vec<u8>, NetError> {
    // the privacy random needs 7 bytes of sealed body, which an empty transport cannot give
    if transport_pdu.is_empty() {
        return Err( NetError::TooShort );
    }

    let material = security_material(record);

    let iv_index = record.iv_index_bytes();

    let ivi = (iv_index[3] & 0x01) << 7;

    let ctl = if hard.is_ctrl_msg { 0x80 } else { 0x00 };
    let ctl_ttl = ctl | (hard.ttl & 0x7F);

    let mic_size = if hard.is_ctrl_msg { MicSize::Big } else { MicSize::Small };

    let nonce = network_nonce(ctl_ttl, hard.seq, soft.src_addr, &iv_index);

    let mut body = Buffer::new();

    body.push_be16(soft.dst_addr);
    body.push_bytes(transport_pdu);

    let sealed = crypto::aes_ccm_encrypt(
        &material.encryption_key,
        &nonce,
        &body.into_bytes(),
        &[],
        mic_size,
    );

    let pecb = privacy_ecb(&material.privacy_key, &iv_index, &sealed[..7]);

    let mut header = [0u8; 6];

    header[0] = ctl_ttl;
    header[1..4].copy_from_slice(&hard.seq.to_be_bytes()[1..]);
    header[4..6].copy_from_slice(&soft.src_addr.to_be_bytes());

    for (header_byte, pecb_byte) in header.iter_mut().zip(pecb.iter()) {
        *header_byte ^= pecb_byte;
    }

    let mut pdu = Buffer::new();

    pdu.push_u8(ivi | material.nid);
    pdu.push_bytes(&header);
    pdu.push_bytes(&sealed);

    Ok( pdu.into_bytes() )
}

/// Deobfuscate and open a network PDU against one network record
///
/// Returns the transport PDU together with the addressing and receive contexts recovered from
/// the header. The caller picks candidate records by nid; a wrong candidate shows up as
/// [`NetError::MicMismatch`].
pub fn decode_network_pdu(
    record: &NetworkRecord,
    pdu: &[u8],
) -> Result<(Vec<u8>, SoftContext, HardContext), NetError> {
    // label + header + at least 7 bytes of sealed body for the privacy random
    if pdu.len() < 14 {
        return Err( NetError::TooShort );
    }

    let material = security_material(record);

    if pdu[0] & 0x7F != material.nid {
        return Err( NetError::NidUnknown(pdu[0] & 0x7F) );
    }

    let iv_index = record.iv_index_bytes();

    let pecb = privacy_ecb(&material.privacy_key, &iv_index, &pdu[7..14]);

    let mut header = [0u8; 6];

    for (index, header_byte) in header.iter_mut().enumerate() {
        *header_byte = pdu[1 + index] ^ pecb[index];
    }

    let is_ctrl_msg = header[0] >> 7 == 1;
    let ttl = header[0] & 0x7F;
    let seq = <u32>::from_be_bytes([0, header[1], header[2], header[3]]);
    let src_addr = <u16>::from_be_bytes([header[4], header[5]]);

    let mic_size = if is_ctrl_msg { MicSize::Big } else { MicSize::Small };

    if pdu.len() < 7 + 2 + mic_size.byte_size() {
        return Err( NetError::TooShort );
    }

    let nonce = network_nonce(header[0], seq, src_addr, &iv_index);

    let body = crypto::aes_ccm_decrypt(&material.encryption_key, &nonce, &pdu[7..], &[], mic_size)
        .map_err(|err| match err {
            CryptoError::MicMismatch => NetError::MicMismatch,
            _ => NetError::TooShort,
        })?;

    let dst_addr = <u16>::from_be_bytes([body[0], body[1]]);

    let soft = SoftContext {
        src_addr,
        dst_addr,
        network_name: record.name.clone(),
    };

    let hard = HardContext { is_ctrl_msg, ttl, seq };

    Ok( (body[2..].to_vec(), soft, hard) )
}

/// The network layer over the shared dongle queues
///
/// Inbound frames come from a tagged receive queue and decoded transport PDUs are published
/// on the transport queue handed back by [`new`](NetworkLayer::new). The nid index is built
/// from the record store and must be rebuilt when networks are added or removed.
pub struct NetworkLayer {
    store: NetworkStore,
    index: HashMap<u8, Vec<NetworkRecord>>,
    hard_ctx: HardContext,
    send_queue: Sender<TaggedFrame>,
    transport_tx: Sender<(Vec<u8>, SoftContext)>,
}

impl NetworkLayer {
    pub fn new(
        store: NetworkStore,
        send_queue: Sender<TaggedFrame>,
    ) -> (Self, Receiver<(Vec<u8>, SoftContext)>) {
        let (transport_tx, transport_rx) = channel();

        let layer = NetworkLayer {
            store,
            index: HashMap::new(),
            hard_ctx: HardContext::default(),
            send_queue,
            transport_tx,
        };

        (layer, transport_rx)
    }

    /// The receive context of the last accepted inbound PDU
    pub fn hard_context(&self) -> &HardContext {
        &self.hard_ctx
    }

    /// Rebuild the nid dispatch index from the record store
    pub fn rebuild_index(&mut self) -> Result<(), NetError> {
        let mut index: HashMap<u8, Vec<NetworkRecord>> = HashMap::new();

        for record in self.store.list()? {
            let nid = security_material(&record).nid;

            index.entry(nid).or_insert_with(Vec::new).push(record);
        }

        self.index = index;

        Ok(())
    }

    /// Seal a transport PDU and queue it on the bearer
    ///
    /// The sequence number is allocated (and persisted) from the record named by the soft
    /// context and written back into `hard` for the caller.
    pub fn send_pdu(
        &mut self,
        transport_pdu: &[u8],
        soft: &SoftContext,
        hard: &mut HardContext,
    ) -> Result<(), NetError> {
        hard.seq = self.store.allocate_seq(&soft.network_name)?;

        let record = self.store.load(&soft.network_name)?;

        let pdu = encode_network_pdu(&record, hard, soft, transport_pdu)?;

        self.send_queue
            .send((MESSAGE_SEND_TAG.to_vec(), pdu))
            .map_err(|_| NetError::QueueClosed)
    }

    /// Process one tagged inbound frame
    ///
    /// Returns the decoded transport PDU and its addressing, or `None` for anything dropped:
    /// foreign tags, unknown nids, and integrity failures.
    pub fn process_frame(&mut self, tag: &[u8], pdu: &[u8]) -> Option<(Vec<u8>, SoftContext)> {
        if tag != MESSAGE_TAG {
            log::error!(
                "got a frame from the \"{}\" channel",
                String::from_utf8_lossy(tag)
            );
            return None;
        }

        if pdu.is_empty() {
            return None;
        }

        let nid = pdu[0] & 0x7F;

        let records = match self.index.get(&nid) {
            Some(records) => records,
            None => {
                log::debug!("dropping pdu with unknown nid {:#x}", nid);
                return None;
            }
        };

        let decoded = records.iter().find_map(|record| {
            match decode_network_pdu(record, pdu) {
                Ok(delivery) => Some(delivery),
                Err(NetError::MicMismatch) => {
                    log::debug!("net mic mismatch against network \"{}\"", record.name);
                    None
                }
                Err(err) => {
                    log::debug!("dropping pdu against network \"{}\": {}", record.name, err);
                    None
                }
            }
        });

        let (transport_pdu, soft, hard) = decoded?;

        self.hard_ctx = hard;

        Some( (transport_pdu, soft) )
    }

    /// The receive loop
    ///
    /// Pulls tagged frames until the queue closes, publishing every accepted transport PDU.
    /// Bad frames only ever cost a log line.
    pub fn run(&mut self, recv_queue: Receiver<TaggedFrame>) {
        while let Ok((tag, pdu)) = recv_queue.recv() {
            if let Some(delivery) = self.process_frame(&tag, &pdu) {
                if self.transport_tx.send(delivery).is_err() {
                    // nobody is listening for transport pdus any more
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::store::tests::TempStore;

    fn test_record(name: &str, key_fill: u8) -> NetworkRecord {
        NetworkRecord {
            name: name.to_string(),
            net_key: [key_fill; crypto::KEY_LEN],
            net_key_index: 0,
            iv_index: 0x1234_5678,
            seq: 0x07,
            apps: Vec::new(),
            next_unicast: 0x0002,
        }
    }

    fn access_contexts() -> (HardContext, SoftContext) {
        (
            HardContext { is_ctrl_msg: false, ttl: 3, seq: 0x07 },
            SoftContext {
                src_addr: 0x0001,
                dst_addr: 0x0002,
                network_name: "net".to_string(),
            },
        )
    }

    #[test]
    fn access_pdu_round_trip() {
        let record = test_record("net", 0x7d);

        let (hard, soft) = access_contexts();

        let pdu = encode_network_pdu(&record, &hard, &soft, b"\xAA\xBB").unwrap();

        // label(1) + header(6) + dst(2) + transport(2) + mic(4)
        assert_eq!( 15, pdu.len() );

        let (transport_pdu, recovered_soft, recovered_hard) =
            decode_network_pdu(&record, &pdu).unwrap();

        assert_eq!( b"\xAA\xBB".to_vec(), transport_pdu );
        assert_eq!( soft, recovered_soft );
        assert_eq!( hard, recovered_hard );
    }

    #[test]
    fn control_pdu_has_the_long_mic() {
        let record = test_record("net", 0x7d);

        let (mut hard, soft) = access_contexts();

        hard.is_ctrl_msg = true;

        let pdu = encode_network_pdu(&record, &hard, &soft, b"\xAA\xBB").unwrap();

        assert_eq!( 19, pdu.len() );

        let (transport_pdu, _, recovered_hard) = decode_network_pdu(&record, &pdu).unwrap();

        assert_eq!( b"\xAA\xBB".to_vec(), transport_pdu );
        assert!( recovered_hard.is_ctrl_msg );
    }

    #[test]
    fn any_flipped_bit_is_rejected() {
        let record = test_record("net", 0x7d);

        let (hard, soft) = access_contexts();

        let pdu = encode_network_pdu(&record, &hard, &soft, b"\xAA\xBB").unwrap();

        // every bit outside the ivi/nid label byte
        for byte_index in 1..pdu.len() {
            for bit in 0..8 {
                let mut tampered = pdu.clone();

                tampered[byte_index] ^= 1 << bit;

                assert!(
                    decode_network_pdu(&record, &tampered).is_err(),
                    "flip of byte {} bit {} was accepted",
                    byte_index,
                    bit
                );
            }
        }
    }

    #[test]
    fn empty_transport_is_refused() {
        let record = test_record("net", 0x7d);

        let (hard, soft) = access_contexts();

        assert!( encode_network_pdu(&record, &hard, &soft, b"").is_err() );
    }

    #[test]
    fn nid_dispatch_selects_the_right_network() {
        let temp = TempStore::new("net-dispatch");

        let record_a = test_record("net_a", 0x11);
        let record_b = test_record("net_b", 0x22);

        temp.store.save(&record_a).unwrap();
        temp.store.save(&record_b).unwrap();

        let (send_tx, _send_rx) = channel();

        let (mut layer, _transport_rx) = NetworkLayer::new(temp.store.clone(), send_tx);

        layer.rebuild_index().unwrap();

        let hard = HardContext { is_ctrl_msg: false, ttl: 1, seq: 1 };

        let soft = SoftContext {
            src_addr: 0x000A,
            dst_addr: 0x000B,
            network_name: "net_b".to_string(),
        };

        let pdu = encode_network_pdu(&record_b, &hard, &soft, b"\x01\x02\x03").unwrap();

        let (transport_pdu, delivered) = layer.process_frame(MESSAGE_TAG, &pdu).unwrap();

        assert_eq!( b"\x01\x02\x03".to_vec(), transport_pdu );
        assert_eq!( "net_b", delivered.network_name );
        assert_eq!( hard, *layer.hard_context() );

        // a nid neither network derives is dropped
        let nid_a = security_material(&record_a).nid;
        let nid_b = security_material(&record_b).nid;

        let mut foreign = pdu.clone();
        foreign[0] = (0..0x80).find(|nid| *nid != nid_a && *nid != nid_b).unwrap();

        assert!( layer.process_frame(MESSAGE_TAG, &foreign).is_none() );
    }

    #[test]
    fn foreign_tags_are_dropped() {
        let temp = TempStore::new("net-tags");

        let (send_tx, _send_rx) = channel();

        let (mut layer, _transport_rx) = NetworkLayer::new(temp.store.clone(), send_tx);

        assert!( layer.process_frame(b"beacon", b"\x00\x01\x02").is_none() );
    }

    #[test]
    fn successive_sends_count_the_sequence_up() {
        let temp = TempStore::new("net-seq");

        let record = test_record("net", 0x7d);

        temp.store.save(&record).unwrap();

        let (send_tx, send_rx) = channel();

        let (mut layer, _transport_rx) = NetworkLayer::new(temp.store.clone(), send_tx);

        let soft = SoftContext {
            src_addr: 0x0001,
            dst_addr: 0x0002,
            network_name: "net".to_string(),
        };

        let mut hard = HardContext { is_ctrl_msg: false, ttl: 5, seq: 0 };

        layer.send_pdu(b"\xAA", &soft, &mut hard).unwrap();
        let first_seq = hard.seq;

        layer.send_pdu(b"\xAA", &soft, &mut hard).unwrap();
        let second_seq = hard.seq;

        assert_eq!( first_seq + 1, second_seq );

        let (first_tag, first_pdu) = send_rx.try_recv().unwrap();
        let (_, second_pdu) = send_rx.try_recv().unwrap();

        assert_eq!( MESSAGE_SEND_TAG, first_tag.as_slice() );

        // deobfuscated sequence numbers of the emitted pdus differ by exactly one
        let (_, _, first_hard) = decode_network_pdu(&record, &first_pdu).unwrap();
        let (_, _, second_hard) = decode_network_pdu(&record, &second_pdu).unwrap();

        assert_eq!( first_hard.seq + 1, second_hard.seq );
    }

    #[test]
    fn run_publishes_accepted_pdus() {
        let temp = TempStore::new("net-run");

        let record = test_record("net", 0x33);

        temp.store.save(&record).unwrap();

        let (send_tx, _send_rx) = channel();

        let (mut layer, transport_rx) = NetworkLayer::new(temp.store.clone(), send_tx);

        layer.rebuild_index().unwrap();

        let hard = HardContext { is_ctrl_msg: false, ttl: 2, seq: 9 };

        let soft = SoftContext {
            src_addr: 0x0004,
            dst_addr: 0x0005,
            network_name: "net".to_string(),
        };

        let pdu = encode_network_pdu(&record, &hard, &soft, b"\x42").unwrap();

        let (recv_tx, recv_rx) = channel();

        recv_tx.send((MESSAGE_TAG.to_vec(), pdu)).unwrap();
        recv_tx.send((b"bogus".to_vec(), vec![1, 2, 3])).unwrap();

        drop(recv_tx);

        layer.run(recv_rx);

        let (transport_pdu, delivered) = transport_rx.try_recv().unwrap();

        assert_eq!( b"\x42".to_vec(), transport_pdu );
        assert_eq!( 0x0004, delivered.src_addr );

        // the bogus frame was dropped, not published
        assert!( transport_rx.try_recv().is_err() );
    }
}
