/// Wire-level constants and framing for the scrcpy stream protocol
pub mod keycodes;

use thiserror::Error;

/// Media packet header size: pts_flags(8) + payload_size(4)
pub const PACKET_HEADER_SIZE: usize = 12;

/// Device name field at the head of the video socket (NUL padded)
pub const DEVICE_NAME_FIELD_LENGTH: usize = 64;

/// Maximum accepted payload size, guards against memory exhaustion
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// Upper bits of `pts_flags`
pub const PACKET_FLAG_CONFIG: u64 = 1 << 63;
pub const PACKET_FLAG_KEY_FRAME: u64 = 1 << 62;
pub const PACKET_PTS_MASK: u64 = PACKET_FLAG_KEY_FRAME - 1;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("payload size {0} exceeds maximum {MAX_PACKET_SIZE}")]
    PacketTooLarge(u32),

    #[error("unknown video codec id: 0x{0:08x}")]
    UnknownVideoCodec(u32),

    #[error("unknown audio codec id: 0x{0:08x}")]
    UnknownAudioCodec(u32),
}

/// Video codec ids as sent by the server (4-char tags, big-endian)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VideoCodecId {
    H264 = 0x6832_3634, // "h264"
    H265 = 0x6832_3635, // "h265"
    Av1 = 0x0061_7631,  // "\0av1"
}

impl VideoCodecId {
    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            0x6832_3634 => Ok(VideoCodecId::H264),
            0x6832_3635 => Ok(VideoCodecId::H265),
            0x0061_7631 => Ok(VideoCodecId::Av1),
            other => Err(ProtocolError::UnknownVideoCodec(other)),
        }
    }

    /// Config packets (SPS/PPS, VPS/SPS/PPS) must be merged into the next
    /// media packet for these codecs. AV1 carries its config in-band.
    pub fn needs_config_merge(self) -> bool {
        matches!(self, VideoCodecId::H264 | VideoCodecId::H265)
    }

    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            VideoCodecId::H264 => "h264",
            VideoCodecId::H265 => "hevc",
            VideoCodecId::Av1 => "av1",
        }
    }
}

/// Audio codec tag, sent exactly once at the start of the audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AudioCodecId {
    Opus = 0x6f70_7573, // "opus"
    Aac = 0x0061_6163,  // "\0aac"
    Flac = 0x666c_6163, // "flac"
    Raw = 0x0072_6177,  // "\0raw"
}

impl AudioCodecId {
    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        match raw {
            0x6f70_7573 => Ok(AudioCodecId::Opus),
            0x0061_6163 => Ok(AudioCodecId::Aac),
            0x666c_6163 => Ok(AudioCodecId::Flac),
            0x0072_6177 => Ok(AudioCodecId::Raw),
            other => Err(ProtocolError::UnknownAudioCodec(other)),
        }
    }

    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            AudioCodecId::Opus => "opus",
            AudioCodecId::Aac => "aac",
            AudioCodecId::Flac => "flac",
            AudioCodecId::Raw => "pcm_s16le",
        }
    }
}

/// Parsed 12-byte media packet header (video and audio share the layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub pts: u64,
    pub is_config: bool,
    pub is_key_frame: bool,
    pub size: u32,
}

impl PacketHeader {
    /// Parse a header from exactly 12 bytes. Rejects oversized payloads.
    pub fn parse(buf: &[u8; PACKET_HEADER_SIZE]) -> Result<Self, ProtocolError> {
        let pts_flags = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let size = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        if size > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge(size));
        }

        Ok(Self {
            pts: pts_flags & PACKET_PTS_MASK,
            is_config: pts_flags & PACKET_FLAG_CONFIG != 0,
            is_key_frame: pts_flags & PACKET_FLAG_KEY_FRAME != 0,
            size,
        })
    }

    /// Serialize back to the wire layout
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut pts_flags = self.pts & PACKET_PTS_MASK;
        if self.is_config {
            pts_flags |= PACKET_FLAG_CONFIG;
        }
        if self.is_key_frame {
            pts_flags |= PACKET_FLAG_KEY_FRAME;
        }

        let mut buf = [0u8; PACKET_HEADER_SIZE];
        buf[0..8].copy_from_slice(&pts_flags.to_be_bytes());
        buf[8..12].copy_from_slice(&self.size.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        for pts in [0u64, 1, 16_666, PACKET_PTS_MASK] {
            for is_config in [false, true] {
                for is_key_frame in [false, true] {
                    let header = PacketHeader {
                        pts,
                        is_config,
                        is_key_frame,
                        size: 4096,
                    };
                    let parsed = PacketHeader::parse(&header.to_bytes()).unwrap();
                    assert_eq!(parsed, header);
                }
            }
        }
    }

    #[test]
    fn test_header_flag_bits() {
        // config = bit 63, key frame = bit 62, pts in the low 62 bits
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        raw[0] = 0xC0; // both flags set
        raw[7] = 0x2A; // pts = 42
        raw[11] = 0x10; // size = 16
        let header = PacketHeader::parse(&raw).unwrap();
        assert!(header.is_config);
        assert!(header.is_key_frame);
        assert_eq!(header.pts, 42);
        assert_eq!(header.size, 16);
    }

    #[test]
    fn test_header_rejects_oversized_payload() {
        let mut raw = [0u8; PACKET_HEADER_SIZE];
        raw[8..12].copy_from_slice(&(MAX_PACKET_SIZE + 1).to_be_bytes());
        assert!(matches!(
            PacketHeader::parse(&raw),
            Err(ProtocolError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_codec_id_tags() {
        assert_eq!(
            VideoCodecId::from_raw(u32::from_be_bytes(*b"h264")).unwrap(),
            VideoCodecId::H264
        );
        assert_eq!(
            AudioCodecId::from_raw(u32::from_be_bytes(*b"opus")).unwrap(),
            AudioCodecId::Opus
        );
        assert!(VideoCodecId::from_raw(0xDEAD_BEEF).is_err());
    }

    #[test]
    fn test_config_merge_applies_to_h26x_only() {
        assert!(VideoCodecId::H264.needs_config_merge());
        assert!(VideoCodecId::H265.needs_config_merge());
        assert!(!VideoCodecId::Av1.needs_config_merge());
    }
}
