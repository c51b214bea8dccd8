//! Annex-B stream handling: start-code scanning, NAL typing, and the
//! length-prefixed (AVCC) form the FLV and MP4 muxers consume.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub const NAL_SLICE: u8 = 1;
pub const NAL_IDR: u8 = 5;
pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// One NAL unit without its start code.
#[derive(Clone, Debug, PartialEq)]
pub struct NalUnit {
    pub nal_type: u8,
    pub data: Vec<u8>,
}

impl NalUnit {
    pub fn is_keyframe(&self) -> bool {
        self.nal_type == NAL_IDR
    }
}

fn start_code_len(buf: &[u8]) -> usize {
    if buf.starts_with(&[0, 0, 0, 1]) {
        4
    } else if buf.starts_with(&[0, 0, 1]) {
        3
    } else {
        0
    }
}

/// Splits an Annex-B buffer (3- or 4-byte start codes) into NAL units.
/// Bytes before the first start code are ignored; a buffer with no start
/// code at all is treated as a single bare NAL.
pub fn split_annex_b(buf: &[u8]) -> Vec<NalUnit> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut open_at: Option<usize> = None;
    let mut i = 0usize;
    while i < buf.len() {
        let sc = start_code_len(&buf[i..]);
        if sc > 0 {
            if let Some(s) = open_at {
                if i > s {
                    spans.push((s, i));
                }
            }
            open_at = Some(i + sc);
            i += sc;
        } else {
            i += 1;
        }
    }
    if let Some(s) = open_at {
        if buf.len() > s {
            spans.push((s, buf.len()));
        }
    }
    if spans.is_empty() && !buf.is_empty() {
        spans.push((0, buf.len()));
    }

    spans
        .into_iter()
        .filter_map(|(s, e)| {
            let body = &buf[s..e];
            let first = *body.first()?;
            let nal_type = first & 0x1F;
            if nal_type == 0 || nal_type > 31 {
                return None;
            }
            Some(NalUnit {
                nal_type,
                data: body.to_vec(),
            })
        })
        .collect()
}

/// Re-frames NAL units with 4-byte start codes.
pub fn to_annex_b(nals: &[NalUnit]) -> Vec<u8> {
    let total: usize = nals.iter().map(|n| n.data.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nals {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&nal.data);
    }
    out
}

/// Length-prefixes a set of NAL bodies (4-byte big-endian length per unit).
pub fn to_avcc(nals: &[&[u8]]) -> Vec<u8> {
    let total: usize = nals.iter().map(|n| n.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for nal in nals {
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Structural JPEG validation: a single `FF D8` at the start, a single
/// `FF D9` as the final two bytes, and neither marker anywhere in between.
pub fn validate_jpeg(buf: &[u8]) -> bool {
    if buf.len() < 4 {
        return false;
    }
    if buf[0] != 0xFF || buf[1] != 0xD8 {
        return false;
    }
    if buf[buf.len() - 2] != 0xFF || buf[buf.len() - 1] != 0xD9 {
        return false;
    }
    // No interior SOI and no premature EOI.
    for w in 2..buf.len() - 2 {
        if buf[w] == 0xFF && (buf[w + 1] == 0xD8 || (buf[w + 1] == 0xD9 && w + 2 < buf.len())) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annexb(units: &[(&[u8], usize)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (body, sc) in units {
            if *sc == 4 {
                out.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                out.extend_from_slice(&[0, 0, 1]);
            }
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn splits_mixed_start_codes() {
        let sps = [0x67u8, 0x42, 0x00, 0x1E];
        let pps = [0x68u8, 0xCE, 0x38, 0x80];
        let idr = [0x65u8, 0x88, 0x84, 0x00, 0x10];
        let buf = annexb(&[(&sps, 4), (&pps, 3), (&idr, 4)]);
        let nals = split_annex_b(&buf);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0].nal_type, NAL_SPS);
        assert_eq!(nals[1].nal_type, NAL_PPS);
        assert_eq!(nals[2].nal_type, NAL_IDR);
        assert!(nals[2].is_keyframe());
        assert_eq!(nals[0].data, sps);
    }

    #[test]
    fn ignores_leading_garbage() {
        let slice = [0x41u8, 0x9A, 0x02];
        let mut buf = vec![0xDE, 0xAD];
        buf.extend_from_slice(&annexb(&[(&slice, 4)]));
        let nals = split_annex_b(&buf);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0].nal_type, NAL_SLICE);
    }

    #[test]
    fn avcc_prefixes_big_endian_lengths() {
        let idr = vec![0x65u8; 15238];
        let out = to_avcc(&[&idr]);
        assert_eq!(&out[..4], &[0x00, 0x00, 0x3B, 0x86]);
        assert_eq!(out.len(), 15238 + 4);
    }

    #[test]
    fn jpeg_validation_accepts_well_formed() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0xFF, 0xD9];
        assert!(validate_jpeg(&jpeg));
    }

    #[test]
    fn jpeg_validation_rejects_malformed() {
        // Truncated, wrong prefix, interior SOI, premature EOI.
        assert!(!validate_jpeg(&[0xFF, 0xD8]));
        assert!(!validate_jpeg(&[0x00, 0xD8, 0x00, 0xFF, 0xD9]));
        assert!(!validate_jpeg(&[
            0xFF, 0xD8, 0x00, 0xFF, 0xD8, 0x00, 0xFF, 0xD9
        ]));
        assert!(!validate_jpeg(&[
            0xFF, 0xD8, 0x00, 0xFF, 0xD9, 0x00, 0xFF, 0xD9
        ]));
        // Missing EOI.
        assert!(!validate_jpeg(&[0xFF, 0xD8, 0x00, 0x00, 0x00, 0x00]));
    }
}
