//! The dongle driver contract
//!
//! The stack never talks to the radio itself; a dongle driver owns the physical bearer and
//! exposes labelled frames. Frames move on three channels: `beacon` carries unprovisioned
//! device beacons, `prov` carries the PB-ADV provisioning bearer, and `message` carries
//! operational network PDUs. The driver is also responsible for the PB-ADV framing of
//! provisioning frames, which is why [`send`](DongleDriver::send) takes the link handle.
//!
//! Network-layer traffic additionally moves over in-process queues between the driver glue
//! and the network layer; those frames are tagged with [`MESSAGE_TAG`] inbound and
//! [`MESSAGE_SEND_TAG`] outbound.

use std::time::Duration;

use crate::gprov::Link;

/// The frame channels of the dongle
#[derive(Clone,Copy,Debug,PartialEq,Eq)]
pub enum Channel {
    Beacon,
    Prov,
    Message,
}

impl Channel {
    pub fn tag(self) -> &'static [u8] {
        match self {
            Channel::Beacon => b"beacon",
            Channel::Prov => b"prov",
            Channel::Message => b"message",
        }
    }
}

/// Tag on inbound network-layer frames of the shared receive queue
pub const MESSAGE_TAG: &[u8] = b"message";

/// Tag the network layer puts on its outbound frames
pub const MESSAGE_SEND_TAG: &[u8] = b"message_s";

/// A `(tag, frame)` pair moving over the in-process queues
pub type TaggedFrame = (Vec<u8>, Vec<u8>);

/// Contract of a physical dongle driver
///
/// Implementations must be shareable across threads: while a generic provisioning transaction
/// is in flight one thread pushes continuation segments while the acknowledgement watcher
/// polls the receive side.
pub trait DongleDriver: Send + Sync {
    type Error: core::fmt::Debug + Send;

    /// Enqueue a frame on the bearer
    ///
    /// `link` is given for provisioning frames so the driver can apply the PB-ADV framing
    /// (link id and transaction number); operational frames pass `None`.
    fn send(&self, link: Option<&Link>, frame: &[u8]) -> Result<(), Self::Error>;

    /// Block until a frame arrives on `channel`
    fn recv(&self, channel: Channel) -> Result<Vec<u8>, Self::Error>;

    /// Poll for a frame with up to `tries` attempts of `per_try` each
    ///
    /// `Ok(None)` means nothing arrived within the allotted polls.
    fn recv_timeout(
        &self,
        channel: Channel,
        tries: u32,
        per_try: Duration,
    ) -> Result<Option<Vec<u8>>, Self::Error>;
}


#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn channel_tags() {
        assert_eq!( b"beacon", Channel::Beacon.tag() );
        assert_eq!( b"prov", Channel::Prov.tag() );
        assert_eq!( b"message", Channel::Message.tag() );

        // the inbound tag matches the message channel label, the outbound tag does not
        assert_eq!( MESSAGE_TAG, Channel::Message.tag() );
        assert_ne!( MESSAGE_SEND_TAG, Channel::Message.tag() );
    }
}
