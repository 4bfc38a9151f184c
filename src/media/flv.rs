//! FLV audio/video tag bodies, as carried in RTMP messages
//!
//! Video tag:
//! ```text
//! | FrameType (4) | CodecID (4) | AVCPacketType (8) | CompositionTime (SI24) | Data
//! ```
//! Audio tag:
//! ```text
//! | SoundFormat (4) | Rate (2) | Size (1) | Type (1) | AACPacketType (8) | Data
//! ```

use super::MediaError;
use crate::stream::MediaCodec;

const CODEC_ID_AVC: u8 = 7;
const SOUND_FORMAT_AAC: u8 = 10;
const FRAME_TYPE_KEY: u8 = 1;

/// Length of the FLV video tag prefix before AVC payload data
pub const AVC_TAG_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvcPacketType {
    SequenceHeader,
    Nalu,
    EndOfSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTag {
    pub codec: MediaCodec,
    pub keyframe: bool,
    /// Only set for AVC
    pub avc_packet_type: Option<AvcPacketType>,
    pub composition_time: i32,
}

impl VideoTag {
    pub fn parse(body: &[u8]) -> Result<Self, MediaError> {
        let first = *body.first().ok_or(MediaError::ShortTag(0))?;
        let keyframe = (first >> 4) == FRAME_TYPE_KEY;
        let codec_id = first & 0x0F;

        if codec_id != CODEC_ID_AVC {
            return Ok(Self {
                codec: MediaCodec::Other,
                keyframe,
                avc_packet_type: None,
                composition_time: 0,
            });
        }

        if body.len() < AVC_TAG_HEADER_LEN {
            return Err(MediaError::ShortTag(body.len()));
        }

        let avc_packet_type = match body[1] {
            0 => AvcPacketType::SequenceHeader,
            1 => AvcPacketType::Nalu,
            _ => AvcPacketType::EndOfSequence,
        };

        // Signed 24-bit
        let raw = ((body[2] as i32) << 16) | ((body[3] as i32) << 8) | body[4] as i32;
        let composition_time = (raw << 8) >> 8;

        Ok(Self {
            codec: MediaCodec::H264,
            keyframe,
            avc_packet_type: Some(avc_packet_type),
            composition_time,
        })
    }

    pub fn is_sequence_header(&self) -> bool {
        self.avc_packet_type == Some(AvcPacketType::SequenceHeader)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTag {
    pub codec: MediaCodec,
    pub sequence_header: bool,
    /// Sample rate from the FLV rate field; AAC streams should prefer
    /// [`aac_sample_rate`] on the sequence header
    pub sample_rate: u32,
}

impl AudioTag {
    pub fn parse(body: &[u8]) -> Result<Self, MediaError> {
        let first = *body.first().ok_or(MediaError::ShortTag(0))?;
        let sound_format = first >> 4;
        let sample_rate = match (first >> 2) & 0x03 {
            0 => 5512,
            1 => 11025,
            2 => 22050,
            _ => 44100,
        };

        if sound_format != SOUND_FORMAT_AAC {
            return Ok(Self {
                codec: MediaCodec::Other,
                sequence_header: false,
                sample_rate,
            });
        }

        if body.len() < 2 {
            return Err(MediaError::ShortTag(body.len()));
        }

        Ok(Self {
            codec: MediaCodec::Aac,
            sequence_header: body[1] == 0,
            sample_rate,
        })
    }
}

/// Sample rate from an AAC sequence-header tag body (AudioSpecificConfig).
pub fn aac_sample_rate(body: &[u8]) -> Option<u32> {
    const RATES: [u32; 13] = [
        96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
    ];
    let config = body.get(2..4)?;
    let index = ((config[0] & 0x07) << 1) | (config[1] >> 7);
    RATES.get(index as usize).copied()
}
