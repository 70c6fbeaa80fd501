//! Identity codec
//!
//! Canonical keys for the registry indices, built from the variable-width
//! strings and identifiers the host switch fabric hands us:
//!
//! - [`HvIdentity`]: the fabric's `(port id, NIC index)` pair
//! - [`VportName`]: the bounded, NUL-terminated datapath name
//! - [`CountedString`]: a host UTF-16 counted string, copied verbatim
//! - [`MacAddress`]: a fixed 6-byte hardware address

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::ConversionError;

/// Size of the datapath name buffer, including the terminator.
pub const MAX_PORT_NAME_LEN: usize = 32;

/// Size of the VM UUID presentation buffer, including the terminator.
pub const MAX_VM_UUID_LEN: usize = 128;

/// Size of the VIF UUID presentation buffer, including the terminator.
pub const MAX_VIF_UUID_LEN: usize = 128;

/// Maximum number of UTF-16 code units in a host counted string.
pub const IF_MAX_STRING_SIZE: usize = 256;

/// MAC address representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-zero address, used until the fabric supplies one
    pub const ZERO: Self = Self([0; 6]);

    /// Check if this is a zero MAC
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Parse MAC from colon-separated string (e.g., "00:15:5d:01:02:03")
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return None;
            }
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl std::str::FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("Invalid MAC address: {}", s))
    }
}

/// Hypervisor identity of a vport: the fabric's port id plus NIC index.
///
/// NIC index 0 denotes the port-level entry; physical NICs teamed behind
/// the external port use non-zero indices under the same port id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HvIdentity {
    pub port_id: u32,
    pub nic_index: u32,
}

impl HvIdentity {
    pub const fn new(port_id: u32, nic_index: u32) -> Self {
        Self { port_id, nic_index }
    }

    /// Identity of the port-level entry for `port_id`.
    pub const fn port(port_id: u32) -> Self {
        Self::new(port_id, 0)
    }

    #[inline]
    pub fn is_port_level(&self) -> bool {
        self.nic_index == 0
    }
}

impl fmt::Display for HvIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {:#x} nic {}", self.port_id, self.nic_index)
    }
}

/// Datapath-visible vport name.
///
/// Stored in a fixed buffer with the length tracked separately. Input is cut
/// at the first NUL, and what remains must leave room for the terminator.
#[derive(Clone, Copy)]
pub struct VportName {
    buf: [u8; MAX_PORT_NAME_LEN],
    len: usize,
}

impl VportName {
    /// Build a name from raw bytes with C string semantics.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, ConversionError> {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let bytes = &raw[..end];
        if bytes.len() + 1 > MAX_PORT_NAME_LEN {
            return Err(ConversionError::BufferOverflow {
                needed: bytes.len() + 1,
                max: MAX_PORT_NAME_LEN,
            });
        }
        let mut buf = [0u8; MAX_PORT_NAME_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            buf,
            len: bytes.len(),
        })
    }

    pub fn new(name: &str) -> Result<Self, ConversionError> {
        Self::from_bytes(name.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Name bytes including the trailing NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.buf[..=self.len]
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.as_bytes()).into_owned()
    }
}

impl PartialEq for VportName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for VportName {}

impl std::hash::Hash for VportName {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for VportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VportName({:?})", self.to_string_lossy())
    }
}

impl fmt::Display for VportName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

/// Host counted string (UTF-16, length in code units, no terminator).
///
/// Copied verbatim from fabric parameter blocks and only reinterpreted when
/// projected into a query record. Clones share the buffer, so snapshots taken
/// under the registry lock do not allocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CountedString {
    units: Arc<[u16]>,
}

impl Default for CountedString {
    fn default() -> Self {
        Self {
            units: Arc::from(&[][..]),
        }
    }
}

impl CountedString {
    pub fn from_units(units: &[u16]) -> Result<Self, ConversionError> {
        if units.len() > IF_MAX_STRING_SIZE {
            return Err(ConversionError::BufferOverflow {
                needed: units.len(),
                max: IF_MAX_STRING_SIZE,
            });
        }
        Ok(Self {
            units: Arc::from(units),
        })
    }

    pub fn units(&self) -> &[u16] {
        &self.units
    }

    /// Length in bytes, as the host reports it.
    pub fn byte_len(&self) -> usize {
        self.units.len() * 2
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Compare against a narrow name widened one byte per code unit.
    pub fn matches_narrow(&self, name: &[u8]) -> bool {
        self.units.len() == name.len()
            && self
                .units
                .iter()
                .zip(name)
                .all(|(&unit, &byte)| unit == u16::from(byte))
    }

    /// Convert to bounded presentation text.
    ///
    /// `max` is the destination size including the terminator; the result
    /// never exceeds `max - 1` bytes.
    pub fn to_bounded(&self, max: usize) -> Result<String, ConversionError> {
        let mut out = String::with_capacity(self.units.len());
        for decoded in char::decode_utf16(self.units.iter().copied()) {
            match decoded {
                Ok(c) => out.push(c),
                Err(e) => return Err(ConversionError::Unmappable(e.unpaired_surrogate())),
            }
        }
        let needed = out.len() + 1;
        if needed > max {
            return Err(ConversionError::BufferOverflow { needed, max });
        }
        Ok(out)
    }
}

impl TryFrom<&str> for CountedString {
    type Error = ConversionError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let units: Vec<u16> = s.encode_utf16().collect();
        Self::from_units(&units)
    }
}

impl TryFrom<String> for CountedString {
    type Error = ConversionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::try_from(s.as_str())
    }
}

impl From<CountedString> for String {
    fn from(s: CountedString) -> Self {
        String::from_utf16_lossy(&s.units)
    }
}

impl fmt::Display for CountedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf16_lossy(&self.units))
    }
}
