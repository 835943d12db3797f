//! Provisioning session state
//!
//! The four phases of the provisioning protocol are modelled as one type per phase. A phase
//! value holds exactly the material that phase needs, builds the PDUs this side sends, and is
//! consumed by the device's response frame to produce the next phase. The transitions are
//! pure; all bearer traffic stays in the layer driving the session. A session that fails in
//! any phase simply drops the current phase value, so no half-initialised state can leak into
//! a later phase.
//!
//! The authentication method is fixed to No-OOB: all four start parameters are zero and the
//! authentication value is sixteen zero bytes.

use crate::buffer::Buffer;
use crate::crypto::{self, MicSize};
use crate::store::NetworkRecord;

use super::{
    Capabilities, FailReason, PROVISIONING_CAPABILITIES, PROVISIONING_COMPLETE,
    PROVISIONING_CONFIRMATION, PROVISIONING_DATA, PROVISIONING_FAILED, PROVISIONING_INVITE,
    PROVISIONING_PUBLIC_KEY, PROVISIONING_RANDOM, PROVISIONING_START,
};

/// The No-OOB authentication value
pub const AUTH_VALUE: [u8; 16] = crypto::ZERO_KEY;

/// Strip the opcode off a response frame, expecting `expected`
///
/// A `PROVISIONING_FAILED` from the device always wins over an opcode mismatch.
fn expect_opcode(frame: &[u8], expected: u8) -> Result<&[u8], FailReason> {
    let (&opcode, body) = frame.split_first().ok_or(FailReason::Malformed)?;

    if opcode == PROVISIONING_FAILED {
        return Err( FailReason::DeviceFailed );
    }

    if opcode != expected {
        return Err( FailReason::UnexpectedOpcode { expected, got: opcode } );
    }

    Ok(body)
}

/// Phase one: the invitation
pub struct Invitation {
    attention_duration: u8,
}

impl Invitation {
    pub fn new(attention_duration: u8) -> Self {
        Invitation { attention_duration }
    }

    pub fn invite_pdu(&self) -> Vec<u8> {
        vec![PROVISIONING_INVITE, self.attention_duration]
    }

    /// Consume the device's capabilities frame and move to the key exchange
    ///
    /// The capabilities body is retained verbatim; it is part of the confirmation transcript
    /// exactly as the device sent it.
    pub fn capabilities(self, frame: &[u8]) -> Result<KeyExchange, FailReason> {
        let body = expect_opcode(frame, PROVISIONING_CAPABILITIES)?;

        let capabilities = Capabilities::parse(body)?;

        let (private_key, public_key) = crypto::ecdh_keypair().map_err(FailReason::Crypto)?;

        let (public_x, public_y) = crypto::public_key_coordinates(&public_key);

        Ok( KeyExchange {
            invite_params: [self.attention_duration],
            capabilities_params: body.to_vec(),
            capabilities,
            private_key,
            public_x,
            public_y,
        })
    }
}

/// Phase two: exchanging public keys
pub struct KeyExchange {
    invite_params: [u8; 1],
    capabilities_params: Vec<u8>,
    pub capabilities: Capabilities,
    private_key: crypto::PrivateKey,
    public_x: [u8; 32],
    public_y: [u8; 32],
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("capabilities", &self.capabilities)
            .field("public_x", &self.public_x)
            .field("public_y", &self.public_y)
            .finish()
    }
}

impl KeyExchange {
    /// The start PDU: No-OOB, so every parameter after the algorithm is zero
    pub fn start_pdu(&self) -> Vec<u8> {
        vec![PROVISIONING_START, 0x00, 0x00, 0x00, 0x00, 0x00]
    }

    pub fn public_key_pdu(&self) -> Vec<u8> {
        let mut pdu = Buffer::new();

        pdu.push_u8(PROVISIONING_PUBLIC_KEY);
        pdu.push_bytes(&self.public_x);
        pdu.push_bytes(&self.public_y);

        pdu.into_bytes()
    }

    /// Consume the device's public key, agree on the shared secret, and derive the
    /// confirmation material
    pub fn device_public_key(self, frame: &[u8]) -> Result<Authentication, FailReason> {
        let body = expect_opcode(frame, PROVISIONING_PUBLIC_KEY)?;

        if body.len() != 64 {
            return Err( FailReason::Malformed );
        }

        let mut device_x = [0u8; 32];
        let mut device_y = [0u8; 32];

        device_x.copy_from_slice(&body[..32]);
        device_y.copy_from_slice(&body[32..]);

        let start_pdu = self.start_pdu();

        let ecdh_x = crypto::ecdh_p256(
            self.private_key,
            &crypto::peer_public_key(&device_x, &device_y),
        )
        .map_err(FailReason::Crypto)?;

        // ConfirmationInputs = invite || capabilities || start || PK_provisioner || PK_device
        let mut inputs = Buffer::new();

        inputs.push_bytes(&self.invite_params);
        inputs.push_bytes(&self.capabilities_params);
        inputs.push_bytes(&start_pdu[1..]);
        inputs.push_bytes(&self.public_x);
        inputs.push_bytes(&self.public_y);
        inputs.push_bytes(&device_x);
        inputs.push_bytes(&device_y);

        let confirmation_salt = crypto::s1(inputs.remaining());

        let confirmation_key = crypto::k1(&ecdh_x, &confirmation_salt, b"prck");

        let mut random_provisioner = [0u8; 16];

        crypto::fill_random(&mut random_provisioner);

        Ok( Authentication {
            ecdh_x,
            confirmation_salt,
            confirmation_key,
            random_provisioner,
        })
    }
}

/// Phase three, first half: the confirmation exchange
pub struct Authentication {
    ecdh_x: [u8; 32],
    confirmation_salt: [u8; 16],
    confirmation_key: [u8; 16],
    random_provisioner: [u8; 16],
}

impl Authentication {
    pub fn confirmation_pdu(&self) -> Vec<u8> {
        let confirmation = crypto::aes_cmac(
            &self.confirmation_key,
            &[&self.random_provisioner[..], &AUTH_VALUE[..]].concat(),
        );

        let mut pdu = Buffer::new();

        pdu.push_u8(PROVISIONING_CONFIRMATION);
        pdu.push_bytes(&confirmation);

        pdu.into_bytes()
    }

    /// Retain the device's confirmation; it is checked once the device's random arrives
    pub fn device_confirmation(self, frame: &[u8]) -> Result<RandomExchange, FailReason> {
        let body = expect_opcode(frame, PROVISIONING_CONFIRMATION)?;

        if body.len() != 16 {
            return Err( FailReason::Malformed );
        }

        let mut confirmation_device = [0u8; 16];

        confirmation_device.copy_from_slice(body);

        Ok( RandomExchange {
            ecdh_x: self.ecdh_x,
            confirmation_salt: self.confirmation_salt,
            confirmation_key: self.confirmation_key,
            random_provisioner: self.random_provisioner,
            confirmation_device,
        })
    }
}

/// Phase three, second half: the random exchange and the confirmation check
pub struct RandomExchange {
    ecdh_x: [u8; 32],
    confirmation_salt: [u8; 16],
    confirmation_key: [u8; 16],
    random_provisioner: [u8; 16],
    confirmation_device: [u8; 16],
}

impl RandomExchange {
    pub fn random_pdu(&self) -> Vec<u8> {
        let mut pdu = Buffer::new();

        pdu.push_u8(PROVISIONING_RANDOM);
        pdu.push_bytes(&self.random_provisioner);

        pdu.into_bytes()
    }

    /// Check the device's random against its earlier confirmation and derive the session key
    /// material for the data distribution
    pub fn device_random(self, frame: &[u8]) -> Result<DataDistribution, FailReason> {
        let body = expect_opcode(frame, PROVISIONING_RANDOM)?;

        if body.len() != 16 {
            return Err( FailReason::Malformed );
        }

        let calculated = crypto::aes_cmac(
            &self.confirmation_key,
            &[body, &AUTH_VALUE[..]].concat(),
        );

        if calculated != self.confirmation_device {
            return Err( FailReason::ConfirmationMismatch );
        }

        let provisioning_salt = crypto::s1(
            &[&self.confirmation_salt[..], &self.random_provisioner[..], body].concat(),
        );

        let session_key = crypto::k1(&self.ecdh_x, &provisioning_salt, b"prsk");

        // k1 yields 16 bytes; the CCM nonce is its low 13
        let nonce_material = crypto::k1(&self.ecdh_x, &provisioning_salt, b"prsn");

        let mut session_nonce = [0u8; crypto::NONCE_LEN];

        session_nonce.copy_from_slice(&nonce_material[3..]);

        Ok( DataDistribution { session_key, session_nonce } )
    }
}

/// Phase four: distributing the network credentials
pub struct DataDistribution {
    session_key: [u8; 16],
    session_nonce: [u8; crypto::NONCE_LEN],
}

impl DataDistribution {
    /// Seal the provisioning data for the network and the assigned unicast address
    ///
    /// The plaintext is `net_key(16) || key_index(2) || flags(1) || iv_index(4) || unicast(2)`
    /// with the flags zero, sealed under the session key with the 8 byte MIC.
    pub fn data_pdu(&self, record: &NetworkRecord, unicast_addr: u16) -> Vec<u8> {
        let mut data = Buffer::new();

        data.push_bytes(&record.net_key);
        data.push_be16(record.net_key_index);
        data.push_u8(0x00);
        data.push_bytes(&record.iv_index_bytes());
        data.push_be16(unicast_addr);

        let sealed = crypto::aes_ccm_encrypt(
            &self.session_key,
            &self.session_nonce,
            &data.into_bytes(),
            &[],
            MicSize::Big,
        );

        let mut pdu = Buffer::new();

        pdu.push_u8(PROVISIONING_DATA);
        pdu.push_bytes(&sealed);

        pdu.into_bytes()
    }

    /// The device's verdict on the data distribution
    pub fn complete(self, frame: &[u8]) -> Result<(), FailReason> {
        let (&opcode, _) = frame.split_first().ok_or(FailReason::Malformed)?;

        match opcode {
            PROVISIONING_COMPLETE => Ok(()),
            PROVISIONING_FAILED => Err( FailReason::DeviceFailed ),
            got => Err( FailReason::UnexpectedOpcode { expected: PROVISIONING_COMPLETE, got } ),
        }
    }
}
