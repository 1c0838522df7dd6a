use bt_hci::param::BdAddr;

/// An LE device address used as the stable identity of a peer
///
/// Records are keyed by address rather than by connection handle, so a peer
/// that reconnects under a new handle finds its existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress(pub [u8; 6]);

impl PeerAddress {
    /// Peer address from raw bytes
    #[must_use]
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Address bytes, least significant first as on the air
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for PeerAddress {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

/// Peer address of an HCI LE connection event
impl From<&BdAddr> for PeerAddress {
    fn from(addr: &BdAddr) -> Self {
        let mut bytes = [0u8; 6];
        bytes
            .iter_mut()
            .zip(addr.raw())
            .for_each(|(dst, src)| *dst = *src);
        Self(bytes)
    }
}
