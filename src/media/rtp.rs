//! RTP payload inspection

use super::h264::{nalu_type, NALU_TYPE_IDR, NALU_TYPE_SPS};

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

fn starts_keyframe(nal: u8) -> bool {
    nal == NALU_TYPE_IDR || nal == NALU_TYPE_SPS
}

/// Whether an H.264 RTP payload (RFC 6184) begins a keyframe.
///
/// True for a single IDR/SPS NAL unit, a STAP-A aggregating one, or the
/// first fragment of an FU-A IDR slice.
pub fn h264_payload_is_keyframe(payload: &[u8]) -> bool {
    let Some(&first) = payload.first() else {
        return false;
    };

    match nalu_type(first) {
        STAP_A => {
            let mut offset = 1;
            while offset + 2 < payload.len() {
                let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                if starts_keyframe(nalu_type(payload[offset + 2])) {
                    return true;
                }
                offset += 2 + size;
            }
            false
        }
        FU_A => payload
            .get(1)
            .is_some_and(|fu| fu & 0x80 != 0 && nalu_type(*fu) == NALU_TYPE_IDR),
        nal => starts_keyframe(nal),
    }
}
