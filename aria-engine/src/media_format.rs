//! Media formats and layout conversions.

use serde::{Deserialize, Serialize};

use aria_sync::{Error, Result};

/// Sample layout of a PCM stream as it crosses a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interleaving {
    /// Channel samples alternate within one buffer.
    Interleaved,
    /// One buffer, channels concatenated in whole-channel runs.
    PackedDeinterleaved,
    /// One buffer per channel.
    UnpackedDeinterleaved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub num_channels: u16,
    pub interleaving: Interleaving,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample as usize).div_ceil(8)
    }

    /// Bytes covering one sample across every channel.
    pub fn unit_size(&self) -> usize {
        self.num_channels as usize * self.bytes_per_sample()
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.sample_rate as u64 * self.unit_size() as u64
    }
}

/// What flows through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatKind {
    Pcm(PcmFormat),
    /// Opaque compressed bitstream, single buffer.
    Raw { format_id: u32 },
    /// Compressed bitstream split across per-stream buffers.
    DeintRaw { format_id: u32, num_bufs: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub kind: FormatKind,
}

impl MediaFormat {
    pub fn pcm(sample_rate: u32, bits_per_sample: u16, num_channels: u16, interleaving: Interleaving) -> Self {
        Self {
            kind: FormatKind::Pcm(PcmFormat {
                sample_rate,
                bits_per_sample,
                num_channels,
                interleaving,
            }),
        }
    }

    pub fn raw(format_id: u32) -> Self {
        Self {
            kind: FormatKind::Raw { format_id },
        }
    }

    pub fn as_pcm(&self) -> Option<&PcmFormat> {
        match &self.kind {
            FormatKind::Pcm(pcm) => Some(pcm),
            _ => None,
        }
    }

    pub fn is_pcm(&self) -> bool {
        matches!(self.kind, FormatKind::Pcm(_))
    }

    /// Buffers a port carrying this format needs.
    pub fn num_bufs(&self) -> usize {
        match &self.kind {
            FormatKind::Pcm(pcm) if pcm.interleaving == Interleaving::UnpackedDeinterleaved => {
                pcm.num_channels as usize
            }
            FormatKind::DeintRaw { num_bufs, .. } => *num_bufs as usize,
            _ => 1,
        }
    }

    /// Data rate, None for compressed formats whose rate is unknown.
    pub fn bytes_per_ms(&self) -> Option<u64> {
        self.as_pcm().map(|pcm| pcm.bytes_per_sec() / 1000)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.kind {
            FormatKind::Pcm(pcm) => {
                if pcm.sample_rate == 0 || pcm.num_channels == 0 || pcm.bits_per_sample == 0 {
                    return Err(Error::BadParam);
                }
                if pcm.bits_per_sample % 8 != 0 {
                    tracing::error!(bits = pcm.bits_per_sample, "unsupported bit width");
                    return Err(Error::Unsupported);
                }
                Ok(())
            }
            FormatKind::Raw { format_id } => {
                if *format_id == 0 {
                    return Err(Error::BadParam);
                }
                Ok(())
            }
            FormatKind::DeintRaw { format_id, num_bufs } => {
                if *format_id == 0 || *num_bufs == 0 {
                    return Err(Error::BadParam);
                }
                Ok(())
            }
        }
    }

    /// Serialized form used for the control-path message and for
    /// media-format-as-metadata payloads.
    pub fn to_wire(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| Error::BadParam)
    }
}

/// Split one packed-deinterleaved buffer into per-channel buffers.
///
/// `src` carries `num_channels` whole-channel runs of equal length.
pub fn packed_to_unpacked(src: &[u8], pcm: &PcmFormat) -> Result<Vec<Vec<u8>>> {
    let ch = pcm.num_channels as usize;
    if ch == 0 || src.len() % ch != 0 {
        return Err(Error::BadParam);
    }
    let per_ch = src.len() / ch;
    Ok(src.chunks_exact(per_ch).map(<[u8]>::to_vec).collect())
}

/// Reassemble per-channel buffers into one packed-deinterleaved run.
///
/// Every channel must carry the same number of bytes.
pub fn unpacked_to_packed(bufs: &[Vec<u8>]) -> Result<Vec<u8>> {
    let Some(first) = bufs.first() else {
        return Err(Error::BadParam);
    };
    if bufs.iter().any(|b| b.len() != first.len()) {
        return Err(Error::BadParam);
    }
    let mut out = Vec::with_capacity(first.len() * bufs.len());
    for b in bufs {
        out.extend_from_slice(b);
    }
    Ok(out)
}
