//! Key search for locked parts.
//!
//! Locked devices refuse erase and program commands until the right 56-bit
//! key has been presented for the right key slot. Factory-fresh and
//! fully-erased parts hold one of the two boundary values, so the search only
//! tries all-zeros and all-ones on each of the six reserved slots:
//!
//! ```text
//! Locked --status says unlocked--> Unlocked
//!   |
//!   v
//! Probing --key accepted--> Unlocked
//!   |
//!   +--candidates exhausted--> Exhausted (fatal)
//! ```

use crate::error::{Error, Result};
use log::{debug, info, warn};
use std::fmt;

/// Reserved key-slot addresses, probed in this order.
pub const KEY_SLOTS: [u32; 6] = [
    0xFFFF_FFE8,
    0xFFFF_FFE9,
    0xFFFF_FFEA,
    0xFFFF_FFEB,
    0xFFFF_FFEC,
    0xFFFF_FFED,
];

/// Mask of the significant key bits.
pub const KEY_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Number of key bytes on the wire.
pub const KEY_LEN: usize = 7;

/// Key check result reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// No key has been presented.
    NoKey,
    /// The last key was rejected.
    WrongKey,
    /// The device is unlocked.
    CorrectKey,
}

impl KeyState {
    /// Decode the two key-indicator bits. `(false, true)` is not a valid state.
    pub fn from_bits(key1: bool, key2: bool) -> Option<Self> {
        match (key1, key2) {
            (false, false) => Some(Self::NoKey),
            (true, false) => Some(Self::WrongKey),
            (true, true) => Some(Self::CorrectKey),
            (false, true) => None,
        }
    }
}

/// A key and the slot it unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UnlockKey {
    /// Key-slot address.
    pub address: u32,
    /// Key value; only the low 56 bits are significant.
    pub value: u64,
}

impl UnlockKey {
    /// Create a key, discarding bits above the 56th.
    pub fn new(address: u32, value: u64) -> Self {
        Self {
            address,
            value: value & KEY_MASK,
        }
    }

    /// Key bytes in transmission order (little-endian).
    #[allow(clippy::missing_panics_doc)]
    pub fn bytes(&self) -> [u8; KEY_LEN] {
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&self.value.to_le_bytes()[..KEY_LEN]);
        out
    }
}

impl fmt::Display for UnlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:014X}@{:08X}", self.value, self.address)
    }
}

/// Device operations the key search needs.
pub trait KeyProbe {
    /// Clear the status registers.
    fn clear_status(&mut self) -> Result<()>;

    /// Read the current key state.
    fn key_state(&mut self) -> Result<KeyState>;

    /// Present `key` to the device.
    fn send_key(&mut self, key: &UnlockKey) -> Result<()>;
}

/// State of a [`KeyUnlocker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockState {
    /// Not started.
    Locked,
    /// Trying keys.
    Probing,
    /// The device accepted a key (or needed none).
    Unlocked,
    /// Every candidate was rejected.
    Exhausted,
}

/// Result of a successful unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOutcome {
    /// Key that was accepted; `None` if the device was already unlocked.
    pub key: Option<UnlockKey>,
    /// Number of keys sent.
    pub attempts: usize,
}

/// Drives the key search.
#[derive(Debug)]
pub struct KeyUnlocker {
    slots: Vec<u32>,
    cached: Option<UnlockKey>,
    supplied: Option<UnlockKey>,
    state: UnlockState,
    attempts: usize,
}

impl Default for KeyUnlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyUnlocker {
    /// Search the standard key slots.
    pub fn new() -> Self {
        Self {
            slots: KEY_SLOTS.to_vec(),
            cached: None,
            supplied: None,
            state: UnlockState::Locked,
            attempts: 0,
        }
    }

    /// Try `key` first; it worked earlier in this session.
    #[must_use]
    pub fn with_cached(mut self, key: Option<UnlockKey>) -> Self {
        self.cached = key;
        self
    }

    /// Try a user-provided `key` before the brute-force sweep.
    #[must_use]
    pub fn with_supplied(mut self, key: Option<UnlockKey>) -> Self {
        self.supplied = key;
        self
    }

    /// Current state.
    pub fn state(&self) -> UnlockState {
        self.state
    }

    /// Keys sent so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Run the search to completion.
    ///
    /// Fails with [`Error::UnlockExhausted`] when no candidate is accepted.
    /// An invalid status pattern reported by the probe aborts immediately.
    pub fn run<K: KeyProbe + ?Sized>(&mut self, probe: &mut K) -> Result<UnlockOutcome> {
        probe.clear_status()?;
        if probe.key_state()? == KeyState::CorrectKey {
            info!("Device is not locked");
            return Ok(self.unlocked(None));
        }

        self.state = UnlockState::Probing;

        if let Some(key) = self.cached {
            if self.try_key(probe, key)? {
                return Ok(self.unlocked(Some(key)));
            }
            warn!("Key {key} unlocked this device earlier but is rejected now");
        }

        if let Some(key) = self.supplied {
            if self.try_key(probe, key)? {
                return Ok(self.unlocked(Some(key)));
            }
            warn!("Supplied key {key} was rejected, falling back to key search");
        }

        let slots = self.slots.clone();
        for address in slots {
            for value in [0, KEY_MASK] {
                let key = UnlockKey::new(address, value);
                if self.try_key(probe, key)? {
                    return Ok(self.unlocked(Some(key)));
                }
            }
        }

        self.state = UnlockState::Exhausted;
        Err(Error::UnlockExhausted {
            attempts: self.attempts,
        })
    }

    fn try_key<K: KeyProbe + ?Sized>(&mut self, probe: &mut K, key: UnlockKey) -> Result<bool> {
        debug!("Sending key {key}");
        probe.send_key(&key)?;
        self.attempts += 1;
        if probe.key_state()? == KeyState::CorrectKey {
            return Ok(true);
        }
        probe.clear_status()?;
        Ok(false)
    }

    fn unlocked(&mut self, key: Option<UnlockKey>) -> UnlockOutcome {
        self.state = UnlockState::Unlocked;
        if let Some(key) = key {
            info!("Device unlocked with key {key} after {} attempts", self.attempts);
        }
        UnlockOutcome {
            key,
            attempts: self.attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Device that accepts a single key, or none at all.
    struct SimDevice {
        accepts: Option<UnlockKey>,
        state: KeyState,
        sent: Vec<UnlockKey>,
        clears: usize,
        corrupt_after: Option<usize>,
    }

    impl SimDevice {
        fn new(accepts: Option<UnlockKey>) -> Self {
            Self {
                accepts,
                state: KeyState::NoKey,
                sent: Vec::new(),
                clears: 0,
                corrupt_after: None,
            }
        }
    }

    impl KeyProbe for SimDevice {
        fn clear_status(&mut self) -> Result<()> {
            self.clears += 1;
            if self.state != KeyState::CorrectKey {
                self.state = KeyState::NoKey;
            }
            Ok(())
        }

        fn key_state(&mut self) -> Result<KeyState> {
            if self.corrupt_after.is_some_and(|n| self.sent.len() >= n) {
                return Err(Error::InvalidStatus {
                    srd1: 0x80,
                    srd2: 0x08,
                });
            }
            Ok(self.state)
        }

        fn send_key(&mut self, key: &UnlockKey) -> Result<()> {
            self.sent.push(*key);
            self.state = if Some(*key) == self.accepts {
                KeyState::CorrectKey
            } else {
                KeyState::WrongKey
            };
            Ok(())
        }
    }

    #[test]
    fn test_unlocks_on_third_slot_with_ones() {
        let target = UnlockKey::new(0xFFFF_FFEA, KEY_MASK);
        let mut device = SimDevice::new(Some(target));
        let mut unlocker = KeyUnlocker::new();

        let outcome = unlocker.run(&mut device).unwrap();
        assert_eq!(outcome.key, Some(target));
        assert_eq!(outcome.attempts, 6);
        assert_eq!(unlocker.state(), UnlockState::Unlocked);

        let expected: Vec<UnlockKey> = [0xFFFF_FFE8, 0xFFFF_FFE9, 0xFFFF_FFEA]
            .into_iter()
            .flat_map(|a| [UnlockKey::new(a, 0), UnlockKey::new(a, KEY_MASK)])
            .collect();
        assert_eq!(device.sent, expected);
    }

    #[test]
    fn test_exhausts_after_twelve_attempts() {
        let mut device = SimDevice::new(None);
        let mut unlocker = KeyUnlocker::new();

        let err = unlocker.run(&mut device).unwrap_err();
        assert!(matches!(err, Error::UnlockExhausted { attempts: 12 }));
        assert_eq!(device.sent.len(), 12);
        assert_eq!(unlocker.state(), UnlockState::Exhausted);
        // initial clear plus one after every rejected key
        assert_eq!(device.clears, 13);
    }

    #[test]
    fn test_already_unlocked_sends_no_key() {
        let mut device = SimDevice::new(None);
        device.state = KeyState::CorrectKey;
        let outcome = KeyUnlocker::new().run(&mut device).unwrap();
        assert_eq!(outcome.key, None);
        assert_eq!(outcome.attempts, 0);
        assert!(device.sent.is_empty());
    }

    #[test]
    fn test_cached_key_is_tried_first() {
        let target = UnlockKey::new(0xFFFF_FFED, 0);
        let mut device = SimDevice::new(Some(target));
        let outcome = KeyUnlocker::new()
            .with_cached(Some(target))
            .run(&mut device)
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(device.sent, [target]);
    }

    #[test]
    fn test_stale_cached_key_falls_back_to_search() {
        let stale = UnlockKey::new(0xFFFF_FFED, KEY_MASK);
        let target = UnlockKey::new(0xFFFF_FFE8, 0);
        let mut device = SimDevice::new(Some(target));
        let outcome = KeyUnlocker::new()
            .with_cached(Some(stale))
            .run(&mut device)
            .unwrap();
        assert_eq!(outcome.key, Some(target));
        assert_eq!(device.sent, [stale, target]);
    }

    #[test]
    fn test_supplied_key_outside_boundary_values() {
        let target = UnlockKey::new(0xFFFF_FFE8, 0x0011_2233_4455_66);
        let mut device = SimDevice::new(Some(target));
        let outcome = KeyUnlocker::new()
            .with_supplied(Some(target))
            .run(&mut device)
            .unwrap();
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn test_invalid_status_aborts() {
        let mut device = SimDevice::new(None);
        device.corrupt_after = Some(3);
        let mut unlocker = KeyUnlocker::new();
        let err = unlocker.run(&mut device).unwrap_err();
        assert!(matches!(err, Error::InvalidStatus { .. }));
        assert_eq!(device.sent.len(), 3);
    }

    #[test]
    fn test_key_bits() {
        assert_eq!(KeyState::from_bits(false, false), Some(KeyState::NoKey));
        assert_eq!(KeyState::from_bits(true, false), Some(KeyState::WrongKey));
        assert_eq!(KeyState::from_bits(true, true), Some(KeyState::CorrectKey));
        assert_eq!(KeyState::from_bits(false, true), None);
    }

    #[test]
    fn test_key_bytes_little_endian() {
        let key = UnlockKey::new(0, 0xFF11_2233_4455_6677);
        assert_eq!(key.value, 0x0011_2233_4455_6677);
        assert_eq!(key.bytes(), [0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(UnlockKey::new(0, KEY_MASK).bytes(), [0xFF; 7]);
    }
}
