//! H.264 Annex B bitstream utilities.
//!
//! NAL scanning, IDR detection and access-unit splitting for sources that
//! read raw elementary streams.

use bytes::Bytes;

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Location of one NAL unit inside an Annex B buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Offset of the start code
    pub start: usize,
    /// Offset of the NAL header byte
    pub payload: usize,
    /// End of the NAL payload (exclusive)
    pub end: usize,
    pub nal_type: u8,
}

impl NalUnit {
    fn is_vcl(&self) -> bool {
        self.nal_type == NAL_SLICE || self.nal_type == NAL_IDR
    }
}

/// Find every NAL unit in an Annex B byte stream. Accepts both 3-byte
/// (00 00 01) and 4-byte (00 00 00 01) start codes.
pub fn scan_nals(data: &[u8]) -> Vec<NalUnit> {
    let mut starts: Vec<(usize, usize)> = Vec::new();

    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            } else if data[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
        }
        i += 1;
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(start, payload)) in starts.iter().enumerate() {
        if payload >= data.len() {
            continue;
        }
        let end = starts.get(idx + 1).map_or(data.len(), |&(next, _)| next);
        if payload >= end {
            continue;
        }
        nals.push(NalUnit {
            start,
            payload,
            end,
            nal_type: data[payload] & 0x1F,
        });
    }
    nals
}

/// Check if an Annex B H.264 access unit contains an IDR slice (NAL type 5).
pub fn contains_idr(data: &[u8]) -> bool {
    scan_nals(data).iter().any(|n| n.nal_type == NAL_IDR)
}

/// Split an elementary stream into access units (one per frame).
///
/// A new unit begins at an AUD, SPS, PPS or SEI that follows a slice, or at
/// a slice whose `first_mb_in_slice` is zero once the current unit already
/// holds a slice. Bytes before the first start code are dropped.
pub fn split_access_units(data: &[u8]) -> Vec<Bytes> {
    let nals = scan_nals(data);
    let mut units = Vec::new();
    let mut unit_start: Option<usize> = None;
    let mut has_vcl = false;

    for nal in &nals {
        let begins_unit = if nal.is_vcl() {
            // first_mb_in_slice is ue(v); zero encodes as a single 1 bit.
            let first_mb_zero = data
                .get(nal.payload + 1)
                .is_some_and(|b| b & 0x80 != 0);
            has_vcl && first_mb_zero
        } else {
            has_vcl && matches!(nal.nal_type, NAL_AUD | NAL_SPS | NAL_PPS | NAL_SEI)
        };

        if begins_unit && let Some(start) = unit_start {
            units.push(Bytes::copy_from_slice(&data[start..nal.start]));
            unit_start = None;
            has_vcl = false;
        }
        if unit_start.is_none() {
            unit_start = Some(nal.start);
        }
        if nal.is_vcl() {
            has_vcl = true;
        }
    }

    if let (Some(start), Some(last)) = (unit_start, nals.last()) {
        units.push(Bytes::copy_from_slice(&data[start..last.end]));
    }
    units
}

/// Profile and level from an SPS NAL (including its header byte).
pub fn sps_profile_level(nal: &[u8]) -> Option<(u8, u8)> {
    if nal.len() < 4 || nal[0] & 0x1F != NAL_SPS {
        return None;
    }
    Some((nal[1], nal[3]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPS: [u8; 8] = [0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0xe0, 0x1f];
    const PPS: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x68, 0xce, 0x3c];
    const IDR: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80];
    const SLICE: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9a, 0x02];
    // Second slice of the same picture: first_mb_in_slice != 0.
    const SLICE_CONT: [u8; 7] = [0x00, 0x00, 0x00, 0x01, 0x41, 0x2a, 0x02];

    fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    // --- contains_idr tests ---

    #[test]
    fn idr_with_4byte_start_code() {
        assert!(contains_idr(&IDR));
    }

    #[test]
    fn idr_with_3byte_start_code() {
        let data = [0x00, 0x00, 0x01, 0x65, 0xAB, 0xCD];
        assert!(contains_idr(&data));
    }

    #[test]
    fn non_idr_returns_false() {
        assert!(!contains_idr(&concat(&[&SPS, &PPS, &SLICE])));
    }

    #[test]
    fn empty_and_short_data() {
        assert!(!contains_idr(&[]));
        assert!(!contains_idr(&[0x00, 0x00, 0x01]));
    }

    // --- scan_nals tests ---

    #[test]
    fn scan_mixed_start_codes() {
        let data = [
            0x00, 0x00, 0x01, 0x67, 0x4d, 0x40, 0x00, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C,
        ];
        let nals = scan_nals(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal_type, NAL_SPS);
        assert_eq!((nals[0].payload, nals[0].end), (3, 6));
        assert_eq!(nals[1].nal_type, NAL_PPS);
        assert_eq!((nals[1].start, nals[1].payload), (6, 10));
    }

    // --- split_access_units tests ---

    #[test]
    fn parameter_sets_stay_with_following_idr() {
        let stream = concat(&[&SPS, &PPS, &IDR, &SLICE, &SLICE]);
        let units = split_access_units(&stream);
        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &concat(&[&SPS, &PPS, &IDR])[..]);
        assert!(contains_idr(&units[0]));
        assert_eq!(&units[1][..], &SLICE[..]);
        assert_eq!(&units[2][..], &SLICE[..]);
    }

    #[test]
    fn multi_slice_picture_is_one_unit() {
        let stream = concat(&[&IDR, &SLICE_CONT, &SLICE, &SLICE_CONT]);
        let units = split_access_units(&stream);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].len(), IDR.len() + SLICE_CONT.len());
        assert_eq!(units[1].len(), SLICE.len() + SLICE_CONT.len());
    }

    #[test]
    fn garbage_before_first_start_code_is_dropped() {
        let stream = concat(&[&[0xff, 0xee], &IDR]);
        let units = split_access_units(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], &IDR[..]);
    }

    #[test]
    fn no_nals_yields_no_units() {
        assert!(split_access_units(&[1, 2, 3, 4]).is_empty());
    }

    #[test]
    fn sps_profile_level_reads_header() {
        assert_eq!(sps_profile_level(&SPS[4..]), Some((0x42, 0x1f)));
        assert_eq!(sps_profile_level(&PPS[4..]), None);
        assert_eq!(sps_profile_level(&[0x67, 0x42]), None);
    }
}
