//! Metadata objects and list handling.
//!
//! Metadata rides alongside data through the topology, anchored to byte
//! offsets that the engine adjusts as bytes move. Every object is
//! eventually *destroyed* exactly once, and destruction must decide
//! rendered-vs-dropped so the tracking policy can fire the right event.

use aria_wire::mdwire::{
    self, MD_FLAG_CLIENT, MD_FLAG_NEEDS_CLIENT_PROPAGATION, MD_FLAG_SAMPLE_ASSOCIATED,
    TRACK_MODE_ALWAYS, TRACK_MODE_DROP_ONLY, TRACK_POLICY_EACH, WireMetadata, WireTracking,
};
use aria_wire::packet::{EOS_FLAG_FLUSHING, EOS_POLICY_EACH, WrEpEos};

use aria_sync::{Error, Result};

use crate::media_format::MediaFormat;

/// How many tracking events an EOS spawns when the stream splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EosPolicy {
    /// One event when the last path renders or drops.
    #[default]
    Last,
    /// One event per path.
    Each,
}

/// When a tracking event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingMode {
    /// Only when the object is dropped.
    DropOnly,
    /// On every destruction, rendered or dropped.
    Always,
}

/// Tracking contract attached to a metadata object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracking {
    pub src_domain: u32,
    pub dst_domain: u32,
    pub src_port: u32,
    pub dst_port: u32,
    pub token: u64,
    pub mode: TrackingMode,
    pub policy: EosPolicy,
}

/// Event emitted when a tracked object is destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingEvent {
    pub tracking: Tracking,
    pub is_dropped: bool,
    /// Port the object was rendered on; 0 when dropped.
    pub rendered_port_id: u32,
}

/// Typed payloads the framework understands; everything else passes
/// through opaque.
#[derive(Debug, PartialEq, Eq)]
pub enum MdValue {
    Eos { flushing: bool, policy: EosPolicy },
    DataFlowGap,
    BufferEnd,
    MediaFormat(MediaFormat),
    EncoderFrameInfo(mdwire::EncoderFrameInfo),
    Opaque(Vec<u8>),
}

/// One metadata object owned by a port's list.
///
/// Not `Clone`: the tracking obligation belongs to exactly one owner.
/// Destroy through [`Metadata::destroy`]; a drop with the obligation
/// still pending is a bug and is logged.
#[derive(Debug)]
pub struct Metadata {
    pub id: u32,
    /// Byte offset into the owning buffer; kept valid as bytes move.
    pub offset: usize,
    pub sample_associated: bool,
    pub from_client: bool,
    pub needs_client_propagation: bool,
    pub value: MdValue,
    tracking: Option<Tracking>,
}

impl Metadata {
    pub fn new(id: u32, offset: usize, value: MdValue) -> Self {
        Self {
            id,
            offset,
            sample_associated: false,
            from_client: false,
            needs_client_propagation: false,
            value,
            tracking: None,
        }
    }

    pub fn eos(offset: usize, flushing: bool, policy: EosPolicy) -> Self {
        let mut md = Self::new(mdwire::MD_ID_EOS, offset, MdValue::Eos { flushing, policy });
        md.sample_associated = true;
        md
    }

    pub fn dfg(offset: usize) -> Self {
        Self::new(mdwire::MD_ID_DFG, offset, MdValue::DataFlowGap)
    }

    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = Some(tracking);
        self
    }

    pub fn tracking(&self) -> Option<&Tracking> {
        self.tracking.as_ref()
    }

    pub fn is_eos(&self) -> bool {
        matches!(self.value, MdValue::Eos { .. })
    }

    pub fn is_flushing_eos(&self) -> bool {
        matches!(self.value, MdValue::Eos { flushing: true, .. })
    }

    pub fn is_dfg(&self) -> bool {
        matches!(self.value, MdValue::DataFlowGap)
    }

    /// Demote a flushing EOS once new data follows it.
    pub fn clear_flushing(&mut self) {
        if let MdValue::Eos { flushing, .. } = &mut self.value {
            *flushing = false;
        }
    }

    /// Destroy this object, firing the tracking event its mode calls for.
    pub fn destroy(mut self, is_dropped: bool, rendered_port_id: u32, raise: &mut dyn FnMut(TrackingEvent)) {
        if let Some(tracking) = self.tracking.take() {
            let fire = match tracking.mode {
                TrackingMode::Always => true,
                TrackingMode::DropOnly => is_dropped,
            };
            if fire {
                raise(TrackingEvent {
                    tracking,
                    is_dropped,
                    rendered_port_id: if is_dropped { 0 } else { rendered_port_id },
                });
            }
        }
    }

    /// Wire form for a client-bound metadata region.
    pub fn to_wire(&self) -> WireMetadata {
        let mut flags = 0u32;
        if self.sample_associated {
            flags |= MD_FLAG_SAMPLE_ASSOCIATED;
        }
        if self.from_client {
            flags |= MD_FLAG_CLIENT;
        }
        if self.needs_client_propagation {
            flags |= MD_FLAG_NEEDS_CLIENT_PROPAGATION;
        }
        let payload = match &self.value {
            MdValue::Eos { flushing, policy } => WrEpEos {
                flags: if *flushing { EOS_FLAG_FLUSHING } else { 0 },
                policy: if *policy == EosPolicy::Each {
                    EOS_POLICY_EACH
                } else {
                    aria_wire::packet::EOS_POLICY_LAST
                },
            }
            .to_bytes(),
            MdValue::DataFlowGap | MdValue::BufferEnd => Vec::new(),
            MdValue::MediaFormat(mf) => mf.to_wire(),
            MdValue::EncoderFrameInfo(info) => info.to_bytes(),
            MdValue::Opaque(bytes) => bytes.clone(),
        };
        WireMetadata {
            id: self.id,
            flags,
            offset: self.offset as u32,
            tracking: self.tracking.map(|t| WireTracking {
                src_domain: t.src_domain,
                dst_domain: t.dst_domain,
                src_port: t.src_port,
                dst_port: t.dst_port,
                token: t.token,
                flags: match t.mode {
                    TrackingMode::DropOnly => TRACK_MODE_DROP_ONLY,
                    TrackingMode::Always => TRACK_MODE_ALWAYS,
                } | if t.policy == EosPolicy::Each {
                    TRACK_POLICY_EACH
                } else {
                    0
                },
            }),
            payload,
        }
    }

    /// Parse one wire object into an owned metadata object.
    pub fn from_wire(wire: &WireMetadata) -> Result<Self> {
        let value = match wire.id {
            mdwire::MD_ID_EOS => {
                let eos = WrEpEos::from_bytes(&wire.payload)?;
                MdValue::Eos {
                    flushing: eos.flags & EOS_FLAG_FLUSHING != 0,
                    policy: if eos.policy == EOS_POLICY_EACH {
                        EosPolicy::Each
                    } else {
                        EosPolicy::Last
                    },
                }
            }
            mdwire::MD_ID_DFG => MdValue::DataFlowGap,
            mdwire::MD_ID_BUFFER_END => MdValue::BufferEnd,
            mdwire::MD_ID_MEDIA_FORMAT => MdValue::MediaFormat(MediaFormat::from_wire(&wire.payload)?),
            mdwire::MD_ID_ENCODER_FRAME_INFO => {
                MdValue::EncoderFrameInfo(mdwire::EncoderFrameInfo::from_bytes(&wire.payload)?)
            }
            _ => MdValue::Opaque(wire.payload.clone()),
        };
        let tracking = wire.tracking.map(|t| Tracking {
            src_domain: t.src_domain,
            dst_domain: t.dst_domain,
            src_port: t.src_port,
            dst_port: t.dst_port,
            token: t.token,
            mode: if t.flags & TRACK_MODE_ALWAYS != 0 {
                TrackingMode::Always
            } else {
                TrackingMode::DropOnly
            },
            policy: if t.flags & TRACK_POLICY_EACH != 0 {
                EosPolicy::Each
            } else {
                EosPolicy::Last
            },
        });
        Ok(Self {
            id: wire.id,
            offset: wire.offset as usize,
            sample_associated: wire.flags & MD_FLAG_SAMPLE_ASSOCIATED != 0,
            from_client: wire.flags & MD_FLAG_CLIENT != 0,
            needs_client_propagation: wire.flags & MD_FLAG_NEEDS_CLIENT_PROPAGATION != 0,
            value,
            tracking,
        })
    }
}

impl Drop for Metadata {
    fn drop(&mut self) {
        if let Some(t) = &self.tracking {
            tracing::warn!(
                id = format_args!("{:#x}", self.id),
                token = t.token,
                "metadata dropped without destroy - tracking event lost"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// List operations
// ---------------------------------------------------------------------------

/// Shift every offset down by `consumed` bytes after the owner drained
/// that much data.
pub fn adjust_after_consume(list: &mut [Metadata], consumed: usize) {
    for md in list {
        md.offset = md.offset.saturating_sub(consumed);
    }
}

/// Shift every offset up by `delta` (data was prepended or the list is
/// being re-anchored behind existing bytes).
pub fn shift_offsets(list: &mut [Metadata], delta: usize) {
    for md in list {
        md.offset += delta;
    }
}

/// New data arrived behind a pending list: demote flushing EOS (more
/// data follows, nothing to flush) and pull out stale data-flow gaps.
/// Returns the removed gap objects for the caller to destroy.
pub fn modify_on_new_data(list: &mut Vec<Metadata>) -> Vec<Metadata> {
    for md in list.iter_mut() {
        if md.is_flushing_eos() {
            tracing::debug!("demoting flushing EOS: new data arrived behind it");
            md.clear_flushing();
        }
    }
    let mut gaps = Vec::new();
    let mut i = 0;
    while i < list.len() {
        if list[i].is_dfg() {
            gaps.push(list.remove(i));
        } else {
            i += 1;
        }
    }
    gaps
}

/// Move every object anchored at or before `boundary` into the returned
/// list (offsets preserved); remaining objects are re-based to the new
/// start of the source buffer.
pub fn split_at(list: &mut Vec<Metadata>, boundary: usize) -> Vec<Metadata> {
    let mut taken = Vec::new();
    let mut i = 0;
    while i < list.len() {
        if list[i].offset <= boundary {
            taken.push(list.remove(i));
        } else {
            i += 1;
        }
    }
    adjust_after_consume(list, boundary);
    taken
}

/// Does any object in the list mark a flushing EOS.
pub fn has_flushing_eos(list: &[Metadata]) -> bool {
    list.iter().any(Metadata::is_flushing_eos)
}

/// Destroy a whole list with one disposition.
pub fn destroy_list(
    list: &mut Vec<Metadata>,
    is_dropped: bool,
    rendered_port_id: u32,
    raise: &mut dyn FnMut(TrackingEvent),
) {
    for md in list.drain(..) {
        md.destroy(is_dropped, rendered_port_id, raise);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked_eos(offset: usize, mode: TrackingMode) -> Metadata {
        Metadata::eos(offset, true, EosPolicy::Last).with_tracking(Tracking {
            src_domain: 1,
            dst_domain: 2,
            src_port: 10,
            dst_port: 20,
            token: 0x55,
            mode,
            policy: EosPolicy::Last,
        })
    }

    #[test]
    fn destroy_respects_tracking_mode() {
        let mut events = Vec::new();

        tracked_eos(0, TrackingMode::DropOnly).destroy(false, 7, &mut |e| events.push(e));
        assert!(events.is_empty());

        tracked_eos(0, TrackingMode::DropOnly).destroy(true, 0, &mut |e| events.push(e));
        assert_eq!(events.len(), 1);
        assert!(events[0].is_dropped);

        tracked_eos(0, TrackingMode::Always).destroy(false, 7, &mut |e| events.push(e));
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].rendered_port_id, 7);
    }

    #[test]
    fn new_data_demotes_flushing_eos_and_removes_gaps() {
        let mut list = vec![
            Metadata::eos(480, true, EosPolicy::Last),
            Metadata::dfg(480),
            Metadata::new(0x9999, 100, MdValue::Opaque(vec![1])),
        ];
        let gaps = modify_on_new_data(&mut list);
        assert_eq!(gaps.len(), 1);
        assert_eq!(list.len(), 2);
        assert!(!list[0].is_flushing_eos());
        assert!(list[0].is_eos());
    }

    #[test]
    fn split_rebases_remaining_offsets() {
        let mut list = vec![
            Metadata::new(1, 0, MdValue::BufferEnd),
            Metadata::new(2, 480, MdValue::BufferEnd),
            Metadata::new(3, 960, MdValue::BufferEnd),
        ];
        let taken = split_at(&mut list, 480);
        assert_eq!(taken.len(), 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].offset, 480);
    }

    #[test]
    fn wire_roundtrip_preserves_eos_semantics() {
        let md = tracked_eos(480, TrackingMode::Always);
        let wire = md.to_wire();
        let back = Metadata::from_wire(&wire).unwrap();
        assert!(back.is_flushing_eos());
        assert_eq!(back.tracking().unwrap().token, 0x55);
        assert_eq!(back.tracking().unwrap().mode, TrackingMode::Always);
        // Both objects still owe a tracking decision; settle them.
        let mut sink = |_e: TrackingEvent| {};
        md.destroy(true, 0, &mut sink);
        back.destroy(true, 0, &mut sink);
    }
}
