//! DHCP lease persistence, injected by the host (typically EEPROM or a
//! flash page).

use crate::ipv4::Ipv4Addr;

/// Serialized size of a [`LeaseRecord`].
pub const LEASE_RECORD_LEN: usize = 8;

/// The persisted slice of a DHCP lease: enough to attempt an
/// init-reboot after power loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Address the server assigned us.
    pub assigned: Ipv4Addr,
    /// The assigning server, for unicast renewal.
    pub server: Ipv4Addr,
}

impl LeaseRecord {
    pub fn to_bytes(&self) -> [u8; LEASE_RECORD_LEN] {
        let mut out = [0u8; LEASE_RECORD_LEN];
        out[0..4].copy_from_slice(&self.assigned.0);
        out[4..8].copy_from_slice(&self.server.0);
        out
    }

    /// Decode a stored record. All-0xFF (erased EEPROM) and all-zero
    /// blocks decode as absent.
    pub fn from_bytes(bytes: &[u8; LEASE_RECORD_LEN]) -> Option<Self> {
        if bytes == &[0xFF; LEASE_RECORD_LEN] || bytes == &[0x00; LEASE_RECORD_LEN] {
            return None;
        }
        Some(LeaseRecord {
            assigned: Ipv4Addr([bytes[0], bytes[1], bytes[2], bytes[3]]),
            server: Ipv4Addr([bytes[4], bytes[5], bytes[6], bytes[7]]),
        })
    }
}

/// Host-provided persistent store for the lease record.
pub trait LeaseStore {
    /// Load the stored lease, if any valid one exists.
    fn load(&mut self) -> Option<LeaseRecord>;

    /// Persist `record`, replacing any previous one.
    fn store(&mut self, record: &LeaseRecord);
}
