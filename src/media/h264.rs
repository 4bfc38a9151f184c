//! H.264 helpers: AVC decoder configuration and AVCC to Annex-B conversion

use bytes::{BufMut, Bytes, BytesMut};

use super::flv::AVC_TAG_HEADER_LEN;
use super::MediaError;

pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub fn nalu_type(header: u8) -> u8 {
    header & 0x1F
}

/// Parsed AVCDecoderConfigurationRecord
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// Bytes per NALU length prefix (1, 2 or 4)
    pub nalu_length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcConfig {
    /// Parse a bare AVCDecoderConfigurationRecord.
    pub fn parse(record: &[u8]) -> Result<Self, MediaError> {
        if record.len() < 7 || record[0] != 1 {
            return Err(MediaError::InvalidAvcConfig);
        }

        let profile = record[1];
        let compatibility = record[2];
        let level = record[3];
        let nalu_length_size = (record[4] & 0x03) as usize + 1;

        let mut offset = 5;
        let sps_count = (record[offset] & 0x1F) as usize;
        offset += 1;
        let mut sps = Vec::with_capacity(sps_count);
        for _ in 0..sps_count {
            let (unit, next) = read_parameter_set(record, offset)?;
            sps.push(unit);
            offset = next;
        }

        let pps_count = *record.get(offset).ok_or(MediaError::InvalidAvcConfig)? as usize;
        offset += 1;
        let mut pps = Vec::with_capacity(pps_count);
        for _ in 0..pps_count {
            let (unit, next) = read_parameter_set(record, offset)?;
            pps.push(unit);
            offset = next;
        }

        Ok(Self {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
        })
    }

    /// Parse the record out of an FLV AVC sequence-header tag body.
    pub fn from_sequence_header(tag: &[u8]) -> Result<Self, MediaError> {
        let record = tag
            .get(AVC_TAG_HEADER_LEN..)
            .ok_or(MediaError::ShortTag(tag.len()))?;
        Self::parse(record)
    }

    /// `profile-level-id` for SDP fmtp lines, e.g. `42e01f`
    pub fn profile_level_id(&self) -> String {
        format!(
            "{:02x}{:02x}{:02x}",
            self.profile, self.compatibility, self.level
        )
    }
}

fn read_parameter_set(record: &[u8], offset: usize) -> Result<(Bytes, usize), MediaError> {
    let len_bytes = record
        .get(offset..offset + 2)
        .ok_or(MediaError::InvalidAvcConfig)?;
    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    let start = offset + 2;
    let unit = record
        .get(start..start + len)
        .ok_or(MediaError::InvalidAvcConfig)?;
    Ok((Bytes::copy_from_slice(unit), start + len))
}

/// Iterator over length-prefixed NAL units
pub struct NaluIter<'a> {
    data: &'a [u8],
    length_size: usize,
}

impl<'a> NaluIter<'a> {
    pub fn new(data: &'a [u8], length_size: usize) -> Self {
        Self { data, length_size }
    }
}

impl<'a> Iterator for NaluIter<'a> {
    type Item = Result<&'a [u8], MediaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.is_empty() {
            return None;
        }
        if self.data.len() < self.length_size {
            self.data = &[];
            return Some(Err(MediaError::TruncatedNalu));
        }

        let len = self.data[..self.length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        let rest = &self.data[self.length_size..];
        if rest.len() < len {
            self.data = &[];
            return Some(Err(MediaError::TruncatedNalu));
        }

        let (unit, tail) = rest.split_at(len);
        self.data = tail;
        Some(Ok(unit))
    }
}

/// Convert an FLV AVC NALU tag body into one Annex-B access unit.
///
/// SPS/PPS from `config` are prepended when the access unit holds an IDR
/// slice without in-band parameter sets, so decoders can join at any
/// keyframe.
pub fn flv_to_annexb(tag: &[u8], config: &AvcConfig) -> Result<Bytes, MediaError> {
    let data = tag
        .get(AVC_TAG_HEADER_LEN..)
        .ok_or(MediaError::ShortTag(tag.len()))?;

    let mut units = Vec::new();
    let mut has_idr = false;
    let mut has_sps = false;
    for unit in NaluIter::new(data, config.nalu_length_size) {
        let unit = unit?;
        if let Some(header) = unit.first() {
            match nalu_type(*header) {
                NALU_TYPE_IDR => has_idr = true,
                NALU_TYPE_SPS => has_sps = true,
                _ => {}
            }
            units.push(unit);
        }
    }

    let mut out = BytesMut::with_capacity(data.len() + 64);
    if has_idr && !has_sps {
        for unit in config.sps.iter().chain(config.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(unit);
        }
    }
    for unit in units {
        out.put_slice(&START_CODE);
        out.put_slice(unit);
    }
    Ok(out.freeze())
}
