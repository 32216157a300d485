//! Core types for the optex engine
//!
//! This module defines the foundational types:
//! - Address: 20-byte account identifier
//! - Word: 32-byte storage word (slot half of a key, and the value type)
//! - StorageKey: Composite key (address + slot)
//! - TxId: Transaction identifier, 0 reserved for the genesis version

use std::fmt;

/// Transaction identifier.
///
/// Assigned from a monotonically increasing counter starting at 1.
/// Id 0 is reserved for the genesis version of every storage slot, so a
/// reader that observes version 0 has read the default (all-zeros) value.
pub type TxId = u64;

/// The id of the genesis version every key implicitly carries.
pub const GENESIS: TxId = 0;

/// 20-byte account identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Address with only the low byte set, handy for fixtures
    pub const fn from_low_byte(b: u8) -> Self {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        Address(bytes)
    }

    /// Raw bytes of this address
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 32-byte storage word
///
/// Used both as the slot half of a [`StorageKey`] and as the stored value.
/// The default word is all zeros, which is also the value of every key
/// before any transaction writes to it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Word(pub [u8; 32]);

impl Word {
    /// The all-zeros word
    pub const ZERO: Word = Word([0u8; 32]);

    /// Encode a u64 into the trailing 8 bytes, big-endian.
    ///
    /// This is the convention the scripted interpreter uses for its
    /// arithmetic; the engine itself never inspects word contents.
    pub fn from_u64(v: u64) -> Self {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&v.to_be_bytes());
        Word(bytes)
    }

    /// Decode the trailing 8 bytes as a big-endian u64
    pub fn to_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[24..]);
        u64::from_be_bytes(buf)
    }

    /// Whether every byte is zero
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Debug for Word {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Composite storage key: account address plus 32-byte slot
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StorageKey {
    /// Account the slot belongs to
    pub address: Address,
    /// Slot within the account's storage
    pub slot: Word,
}

impl StorageKey {
    /// Create a new storage key
    pub fn new(address: Address, slot: Word) -> Self {
        StorageKey { address, slot }
    }

    /// Shorthand for fixtures: address and slot from low bytes
    pub fn from_low_bytes(address: u8, slot: u8) -> Self {
        let mut slot_bytes = [0u8; 32];
        slot_bytes[31] = slot;
        StorageKey {
            address: Address::from_low_byte(address),
            slot: Word(slot_bytes),
        }
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[{:?}]", self.address, self.slot)
    }
}
