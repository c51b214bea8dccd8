//! FLV muxing: the file header, tag framing, the `onMetaData` script tag
//! and AVC video tags built from cached SPS/PPS and Annex-B access units.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::h264::{self, NalUnit};
use bytes::{BufMut, BytesMut};

/// `F` `L` `V`, version 1, video-only flags, header size 9, PreviousTagSize0.
pub const FLV_FILE_HEADER: [u8; 13] = [
    0x46, 0x4C, 0x56, 0x01, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
];

pub const TAG_TYPE_VIDEO: u8 = 9;
pub const TAG_TYPE_SCRIPT: u8 = 18;

/// Tags with more data than this are skipped; the connection stays up.
pub const MAX_TAG_DATA: usize = 64 * 1024;

/// 11-byte tag header + data + 4-byte PreviousTagSize.
pub fn write_tag(tag_type: u8, timestamp_ms: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(11 + data.len() + 4);
    buf.put_u8(tag_type);
    buf.put_uint(data.len() as u64, 3);
    buf.put_uint(u64::from(timestamp_ms) & 0xFF_FFFF, 3);
    buf.put_u8((timestamp_ms >> 24) as u8);
    buf.put_uint(0, 3); // stream id
    buf.put_slice(data);
    buf.put_u32(11 + data.len() as u32);
    buf.to_vec()
}

fn put_amf_string_body(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_amf_number(buf: &mut BytesMut, key: &str, value: f64) {
    put_amf_string_body(buf, key);
    buf.put_u8(0x00);
    buf.put_f64(value);
}

fn put_amf_string(buf: &mut BytesMut, key: &str, value: &str) {
    put_amf_string_body(buf, key);
    buf.put_u8(0x02);
    put_amf_string_body(buf, value);
}

/// The `onMetaData` SCRIPTDATA tag sent once per connection, timestamp 0.
pub fn metadata_tag(width: u32, height: u32, framerate: u32, encoder: &str) -> Vec<u8> {
    let mut data = BytesMut::with_capacity(128);
    // AMF0 string "onMetaData".
    data.put_u8(0x02);
    put_amf_string_body(&mut data, "onMetaData");
    // ECMA array with six properties.
    data.put_u8(0x08);
    data.put_u32(6);
    put_amf_number(&mut data, "width", f64::from(width));
    put_amf_number(&mut data, "height", f64::from(height));
    put_amf_number(&mut data, "framerate", f64::from(framerate));
    put_amf_number(&mut data, "videocodecid", 7.0);
    put_amf_number(&mut data, "duration", 0.0);
    put_amf_string(&mut data, "encoder", encoder);
    // Object end marker.
    data.put_u8(0x00);
    data.put_u8(0x00);
    data.put_u8(0x09);
    write_tag(TAG_TYPE_SCRIPT, 0, &data)
}

/// AVCDecoderConfigurationRecord per ISO/IEC 14496-15 from bare SPS/PPS
/// bodies (no start codes).
pub fn decoder_config_record(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    debug_assert!(!sps.is_empty() && sps[0] & 0x1F == h264::NAL_SPS);
    debug_assert!(!pps.is_empty() && pps[0] & 0x1F == h264::NAL_PPS);
    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(1); // configurationVersion
    buf.put_u8(sps[1]); // AVCProfileIndication
    buf.put_u8(sps[2]); // profile_compatibility
    buf.put_u8(sps[3]); // AVCLevelIndication
    buf.put_u8(0b1111_1100 | 0b11); // lengthSizeMinusOne = 3
    buf.put_u8(0b1110_0000 | 1); // one SPS
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(1); // one PPS
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    buf.to_vec()
}

/// VIDEO tag carrying the AVC sequence header, timestamp 0.
pub fn sequence_header_tag(sps: &[u8], pps: &[u8]) -> Vec<u8> {
    let record = decoder_config_record(sps, pps);
    let mut data = BytesMut::with_capacity(5 + record.len());
    data.put_u8(0x17); // keyframe, AVC
    data.put_u8(0x00); // AVC sequence header
    data.put_uint(0, 3); // composition time
    data.put_slice(&record);
    write_tag(TAG_TYPE_VIDEO, 0, &data)
}

/// VIDEO tag for one access unit. SEI, slice and IDR NALs enter as 4-byte
/// length-prefixed units; the tag is marked keyframe when an IDR is
/// present. Returns `None` for an empty unit or one exceeding the tag cap.
pub fn access_unit_tag(timestamp_ms: u32, nals: &[NalUnit]) -> Option<Vec<u8>> {
    let mut bodies: Vec<&[u8]> = Vec::new();
    let mut keyframe = false;
    for nal in nals {
        match nal.nal_type {
            h264::NAL_IDR => {
                keyframe = true;
                bodies.push(&nal.data);
            }
            h264::NAL_SLICE | h264::NAL_SEI => bodies.push(&nal.data),
            _ => {}
        }
    }
    if bodies.is_empty() {
        return None;
    }
    let payload = h264::to_avcc(&bodies);
    if 5 + payload.len() > MAX_TAG_DATA {
        return None;
    }
    let mut data = BytesMut::with_capacity(5 + payload.len());
    data.put_u8(if keyframe { 0x17 } else { 0x27 });
    data.put_u8(0x01); // AVC NALU
    data.put_uint(0, 3); // composition time
    data.put_slice(&payload);
    Some(write_tag(TAG_TYPE_VIDEO, timestamp_ms, &data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_is_bit_exact() {
        assert_eq!(
            FLV_FILE_HEADER,
            [0x46, 0x4C, 0x56, 0x01, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn tag_framing_and_previous_tag_size() {
        let tag = write_tag(TAG_TYPE_VIDEO, 0x0102_0304, &[0xAA; 10]);
        assert_eq!(tag.len(), 11 + 10 + 4);
        assert_eq!(tag[0], 9);
        // data_size BE24.
        assert_eq!(&tag[1..4], &[0, 0, 10]);
        // timestamp low BE24 then extended byte.
        assert_eq!(&tag[4..7], &[0x02, 0x03, 0x04]);
        assert_eq!(tag[7], 0x01);
        // stream id.
        assert_eq!(&tag[8..11], &[0, 0, 0]);
        // PreviousTagSize = 11 + data_size.
        assert_eq!(&tag[21..25], &21u32.to_be_bytes());
    }

    #[test]
    fn metadata_tag_layout() {
        let tag = metadata_tag(1280, 720, 30, "printcam");
        assert_eq!(tag[0], TAG_TYPE_SCRIPT);
        let data = &tag[11..tag.len() - 4];
        // AMF0 string "onMetaData".
        assert_eq!(data[0], 0x02);
        assert_eq!(&data[1..3], &[0, 10]);
        assert_eq!(&data[3..13], b"onMetaData");
        // ECMA array of 6.
        assert_eq!(data[13], 0x08);
        assert_eq!(&data[14..18], &6u32.to_be_bytes());
        // First property: width = 1280.0 as AMF number.
        assert_eq!(&data[18..20], &[0, 5]);
        assert_eq!(&data[20..25], b"width");
        assert_eq!(data[25], 0x00);
        assert_eq!(&data[26..34], &1280f64.to_be_bytes());
        // Object end marker.
        assert_eq!(&data[data.len() - 3..], &[0x00, 0x00, 0x09]);
    }

    #[test]
    fn decoder_config_embeds_sps_pps() {
        let sps = [0x67u8, 0x64, 0x00, 0x1F, 0xAC, 0xD9];
        let pps = [0x68u8, 0xEB, 0xE3, 0xCB];
        let rec = decoder_config_record(&sps, &pps);
        assert_eq!(rec[0], 1);
        assert_eq!(&rec[1..4], &sps[1..4]);
        assert_eq!(rec[4], 0xFF);
        assert_eq!(rec[5], 0xE1);
        assert_eq!(&rec[6..8], &(sps.len() as u16).to_be_bytes());
        assert_eq!(&rec[8..8 + sps.len()], &sps);
        let pps_at = 8 + sps.len();
        assert_eq!(rec[pps_at], 1);
        assert_eq!(
            &rec[pps_at + 1..pps_at + 3],
            &(pps.len() as u16).to_be_bytes()
        );
        assert_eq!(&rec[pps_at + 3..], &pps);
    }

    #[test]
    fn access_unit_tag_marks_idr_keyframe() {
        let idr = NalUnit {
            nal_type: crate::h264::NAL_IDR,
            data: vec![0x65; 15238],
        };
        let tag = access_unit_tag(40, &[idr]).unwrap();
        let data = &tag[11..tag.len() - 4];
        assert_eq!(data[0], 0x17);
        assert_eq!(data[1], 0x01);
        assert_eq!(&data[2..5], &[0, 0, 0]);
        // 4-byte BE length 00 00 3B 86 then the body.
        assert_eq!(&data[5..9], &[0x00, 0x00, 0x3B, 0x86]);
        assert_eq!(data.len(), 5 + 4 + 15238);
    }

    #[test]
    fn access_unit_tag_inter_frame_and_filtering() {
        let sps = NalUnit {
            nal_type: crate::h264::NAL_SPS,
            data: vec![0x67, 0x64, 0x00, 0x1F],
        };
        let slice = NalUnit {
            nal_type: crate::h264::NAL_SLICE,
            data: vec![0x41, 0x9A],
        };
        let tag = access_unit_tag(33, &[sps.clone(), slice]).unwrap();
        let data = &tag[11..tag.len() - 4];
        assert_eq!(data[0], 0x27);
        // SPS does not enter the payload.
        assert_eq!(data.len(), 5 + 4 + 2);
        // SPS alone yields no tag.
        assert!(access_unit_tag(33, &[sps]).is_none());
    }

    #[test]
    fn oversized_access_unit_is_skipped() {
        let big = NalUnit {
            nal_type: crate::h264::NAL_IDR,
            data: vec![0; MAX_TAG_DATA],
        };
        assert!(access_unit_tag(0, &[big]).is_none());
    }
}
