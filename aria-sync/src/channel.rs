//! Channel: one signal word shared by up to 32 queues, signals and timers.
//!
//! The channel owns bit allocation. Each source claims exactly one bit;
//! waiting on the channel with an enable mask returns the subset of
//! claimed bits that fired.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::signal::Signal;

/// Every bit position a channel can hand out.
pub const CHANNEL_ALL_BITS: u32 = u32::MAX;

/// A wait point multiplexing up to 32 bit-sources.
pub struct Channel {
    sig: Signal,
    bits_used: Mutex<u32>,
}

impl Channel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sig: Signal::new(),
            bits_used: Mutex::new(0),
        })
    }

    /// Block until any enabled bit fires; returns the fired subset.
    pub fn wait(&self, enable_mask: u32) -> u32 {
        self.sig.wait(enable_mask)
    }

    /// Non-blocking check of the enabled bits.
    pub fn poll(&self, enable_mask: u32) -> u32 {
        self.sig.poll(enable_mask)
    }

    /// Bits currently claimed by live owners.
    pub fn bits_used(&self) -> u32 {
        *self.bits_used.lock()
    }

    /// Bind a fresh signal source to this channel.
    ///
    /// `requested_bit` of 0 means "pick for me": the highest unused bit is
    /// claimed. A non-zero request must be a single free bit.
    pub fn add_signal(self: &Arc<Self>, requested_bit: u32) -> Result<ChannelSignal> {
        let bit = self.claim_bit(requested_bit)?;
        Ok(ChannelSignal {
            channel: Arc::clone(self),
            bit,
        })
    }

    /// Claim a bit position, enforcing the allocation policy.
    pub(crate) fn claim_bit(&self, requested_bit: u32) -> Result<u32> {
        let mut used = self.bits_used.lock();
        if *used == CHANNEL_ALL_BITS {
            return Err(Error::NeedMore);
        }
        let bit = if requested_bit == 0 {
            // First zero scanning from the MSB.
            1u32 << (31 - used.leading_ones())
        } else {
            if !requested_bit.is_power_of_two() || (requested_bit & *used) != 0 {
                tracing::error!(requested_bit, used = *used, "bad channel bit request");
                return Err(Error::BadParam);
            }
            requested_bit
        };
        *used |= bit;
        // A recycled bit must not carry a stale signal.
        self.sig.clear(bit);
        Ok(bit)
    }

    pub(crate) fn release_bit(&self, bit: u32) {
        let mut used = self.bits_used.lock();
        debug_assert_ne!(*used & bit, 0, "releasing an unclaimed channel bit");
        *used &= !bit;
        self.sig.clear(bit);
    }

    pub(crate) fn signal(&self) -> &Signal {
        &self.sig
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("bits_used", &format_args!("{:#010x}", self.bits_used()))
            .field("signalled", &format_args!("{:#010x}", self.sig.get()))
            .finish()
    }
}

/// A signal source bound to one channel bit.
///
/// Setting it raises the bit on the owning channel; the bit is released
/// when the source is dropped.
pub struct ChannelSignal {
    channel: Arc<Channel>,
    bit: u32,
}

impl ChannelSignal {
    pub fn bit(&self) -> u32 {
        self.bit
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn set(&self) {
        self.channel.sig.set(self.bit);
    }

    pub fn clear(&self) {
        self.channel.sig.clear(self.bit);
    }

    pub fn is_set(&self) -> bool {
        self.channel.sig.poll(self.bit) != 0
    }

    /// Move this source to another channel (or another bit of the same
    /// channel), carrying the current set-state across.
    pub fn rebind(&mut self, channel: &Arc<Channel>, requested_bit: u32) -> Result<()> {
        let new_bit = channel.claim_bit(requested_bit)?;
        let was_set = self.is_set();
        self.channel.release_bit(self.bit);
        self.channel = Arc::clone(channel);
        self.bit = new_bit;
        if was_set {
            self.channel.sig.set(new_bit);
        }
        Ok(())
    }
}

impl Drop for ChannelSignal {
    fn drop(&mut self) {
        self.channel.release_bit(self.bit);
    }
}

impl fmt::Debug for ChannelSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSignal")
            .field("bit", &format_args!("{:#010x}", self.bit))
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_allocation_picks_highest_unused() {
        let ch = Channel::new();
        let a = ch.add_signal(0).unwrap();
        let b = ch.add_signal(0).unwrap();
        assert_eq!(a.bit(), 1 << 31);
        assert_eq!(b.bit(), 1 << 30);
    }

    #[test]
    fn explicit_bit_collision_is_bad_param() {
        let ch = Channel::new();
        let _a = ch.add_signal(0b100).unwrap();
        assert_eq!(ch.add_signal(0b100).unwrap_err(), Error::BadParam);
        assert_eq!(ch.add_signal(0b110).unwrap_err(), Error::BadParam);
    }

    #[test]
    fn exhaustion_is_need_more() {
        let ch = Channel::new();
        let sigs: Vec<_> = (0..32).map(|_| ch.add_signal(0).unwrap()).collect();
        assert_eq!(ch.bits_used(), CHANNEL_ALL_BITS);
        assert_eq!(ch.add_signal(0).unwrap_err(), Error::NeedMore);
        drop(sigs);
        assert_eq!(ch.bits_used(), 0);
    }

    #[test]
    fn wait_returns_only_enabled_subset() {
        let ch = Channel::new();
        let a = ch.add_signal(0).unwrap();
        let b = ch.add_signal(0).unwrap();
        a.set();
        b.set();
        assert_eq!(ch.wait(a.bit()), a.bit());
        assert_eq!(ch.poll(a.bit() | b.bit()), a.bit() | b.bit());
    }

    #[test]
    fn rebind_carries_set_state() {
        let ch1 = Channel::new();
        let ch2 = Channel::new();
        let mut s = ch1.add_signal(0).unwrap();
        s.set();
        let old_bit = s.bit();
        s.rebind(&ch2, 0b1).unwrap();
        assert_eq!(s.bit(), 0b1);
        assert!(s.is_set());
        assert_eq!(ch1.poll(old_bit), 0);
        assert_eq!(ch1.bits_used(), 0);
    }

    #[test]
    fn drop_releases_and_clears() {
        let ch = Channel::new();
        let s = ch.add_signal(0).unwrap();
        let bit = s.bit();
        s.set();
        drop(s);
        assert_eq!(ch.bits_used(), 0);
        assert_eq!(ch.poll(bit), 0);
    }
}
