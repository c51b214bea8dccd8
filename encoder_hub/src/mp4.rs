//! Plain (non-fragmented) MP4 writer for time-lapse output. Media data
//! streams into one `mdat` whose size is patched at finish; the `moov`
//! tables are buffered in memory and appended last.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use anyhow::{Context, Error};
use bytes::{BufMut, BytesMut};
use std::io::SeekFrom;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

pub const TIMESCALE: u32 = 90_000;

/// Writes a length-prefixed box: placeholder size, fourcc, body, then the
/// size patched in place.
#[macro_export]
macro_rules! write_box {
    ($buf:expr, $fourcc:expr, $b:block) => {{
        let pos_start = $buf.len();
        $buf.put_u32(0);
        $buf.extend_from_slice($fourcc);
        $b
        let size = ($buf.len() - pos_start) as u32;
        let size_bytes = size.to_be_bytes();
        $buf[pos_start..pos_start + 4].copy_from_slice(&size_bytes);
    }};
}

pub struct Mp4Writer<W: AsyncWrite + AsyncSeek + Unpin> {
    inner: W,
    sps: Vec<u8>,
    pps: Vec<u8>,
    width: u32,
    height: u32,
    frame_ticks: u32,
    mdat_size_pos: u64,
    pos: u64,
    sample_sizes: Vec<u32>,
    sync_samples: Vec<u32>,
}

impl<W: AsyncWrite + AsyncSeek + Unpin> Mp4Writer<W> {
    /// `sps`/`pps` are bare NAL bodies (no start codes).
    pub async fn new(
        mut inner: W,
        sps: Vec<u8>,
        pps: Vec<u8>,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Self, Error> {
        anyhow::ensure!(!sps.is_empty() && sps[0] & 0x1F == 7, "bad SPS NAL");
        anyhow::ensure!(!pps.is_empty() && pps[0] & 0x1F == 8, "bad PPS NAL");

        let mut buf = BytesMut::with_capacity(64);
        write_box!(&mut buf, b"ftyp", {
            buf.extend_from_slice(b"isom"); // major_brand
            buf.extend_from_slice(&0x0000_0200u32.to_be_bytes()); // minor_version
            buf.extend_from_slice(b"isom");
            buf.extend_from_slice(b"iso2");
            buf.extend_from_slice(b"avc1");
            buf.extend_from_slice(b"mp41");
        });
        inner.write_all(&buf).await?;
        let mdat_size_pos = buf.len() as u64;

        // mdat header with a placeholder size, patched at finish.
        inner.write_all(&[0, 0, 0, 8]).await?;
        inner.write_all(b"mdat").await?;

        Ok(Self {
            inner,
            sps,
            pps,
            width,
            height,
            frame_ticks: (TIMESCALE / fps.max(1)).max(1),
            mdat_size_pos,
            pos: mdat_size_pos + 8,
            sample_sizes: Vec::new(),
            sync_samples: Vec::new(),
        })
    }

    /// Appends one AVCC sample (length-prefixed NAL units).
    pub async fn write_sample(&mut self, avcc: &[u8], is_keyframe: bool) -> Result<(), Error> {
        self.inner.write_all(avcc).await?;
        self.pos += avcc.len() as u64;
        self.sample_sizes.push(
            u32::try_from(avcc.len()).context("sample exceeds u32")?,
        );
        if is_keyframe {
            self.sync_samples.push(self.sample_sizes.len() as u32);
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.sample_sizes.len()
    }

    /// Writes `moov`, patches the `mdat` size, flushes, and hands the sink
    /// back.
    pub async fn finish(mut self) -> Result<W, Error> {
        anyhow::ensure!(!self.sample_sizes.is_empty(), "no samples written");
        let mdat_size = self.pos - self.mdat_size_pos;
        let n = self.sample_sizes.len() as u32;
        let duration = u64::from(n) * u64::from(self.frame_ticks);

        let mut buf = BytesMut::with_capacity(1024 + self.sample_sizes.len() * 8);
        write_box!(&mut buf, b"moov", {
            write_box!(&mut buf, b"mvhd", {
                buf.put_u32(1 << 24); // version=1
                buf.put_u64(0); // creation_time
                buf.put_u64(0); // modification_time
                buf.put_u32(TIMESCALE);
                buf.put_u64(duration);
                buf.put_u32(0x0001_0000); // rate
                buf.put_u16(0x0100); // volume
                buf.put_u16(0); // reserved
                buf.put_u64(0); // reserved
                for v in &[0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                    buf.put_u32(*v); // matrix
                }
                for _ in 0..6 {
                    buf.put_u32(0); // pre_defined
                }
                buf.put_u32(2); // next_track_id
            });

            write_box!(&mut buf, b"trak", {
                write_box!(&mut buf, b"tkhd", {
                    buf.put_u32((1 << 24) | 7); // version=1, enabled|in_movie|in_preview
                    buf.put_u64(0);
                    buf.put_u64(0);
                    buf.put_u32(1); // track_id
                    buf.put_u32(0); // reserved
                    buf.put_u64(duration);
                    buf.put_u64(0); // reserved
                    buf.put_u16(0); // layer
                    buf.put_u16(0); // alternate_group
                    buf.put_u16(0); // volume
                    buf.put_u16(0); // reserved
                    for v in &[0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
                        buf.put_u32(*v);
                    }
                    buf.put_u32(self.width << 16);
                    buf.put_u32(self.height << 16);
                });
                write_box!(&mut buf, b"mdia", {
                    write_box!(&mut buf, b"mdhd", {
                        buf.put_u32(1 << 24);
                        buf.put_u64(0);
                        buf.put_u64(0);
                        buf.put_u32(TIMESCALE);
                        buf.put_u64(duration);
                        buf.put_u16(0x55C4); // und
                        buf.put_u16(0);
                    });
                    write_box!(&mut buf, b"hdlr", {
                        buf.put_u64(0x0000_0000_7669_6465); // pre_defined + 'vide'
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.put_u32(0);
                        buf.extend_from_slice(b"Video\0");
                    });
                    write_box!(&mut buf, b"minf", {
                        write_box!(&mut buf, b"vmhd", {
                            buf.put_u32(1);
                            buf.put_u64(0);
                        });
                        write_box!(&mut buf, b"dinf", {
                            write_box!(&mut buf, b"dref", {
                                buf.put_u32(0);
                                buf.put_u32(1);
                                write_box!(&mut buf, b"url ", {
                                    buf.put_u32(1); // self-contained
                                });
                            });
                        });
                        self.write_stbl(&mut buf, mdat_size);
                    });
                });
            });
        });

        self.inner.write_all(&buf).await?;
        // Patch the mdat size now that its extent is known.
        self.inner
            .seek(SeekFrom::Start(self.mdat_size_pos))
            .await?;
        self.inner
            .write_all(&(u32::try_from(mdat_size).context("mdat exceeds u32")?).to_be_bytes())
            .await?;
        self.inner.flush().await?;
        Ok(self.inner)
    }

    fn write_stbl(&self, buf: &mut BytesMut, _mdat_size: u64) {
        let n = self.sample_sizes.len() as u32;
        write_box!(buf, b"stbl", {
            write_box!(buf, b"stsd", {
                buf.put_u32(0);
                buf.put_u32(1);
                write_box!(buf, b"avc1", {
                    // VisualSampleEntry per ISO/IEC 14496-12.
                    for _ in 0..6 {
                        buf.put_u8(0); // reserved
                    }
                    buf.put_u16(1); // data_reference_index
                    buf.put_u16(0); // pre_defined
                    buf.put_u16(0); // reserved
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.put_u32(0);
                    buf.put_u16(self.width as u16);
                    buf.put_u16(self.height as u16);
                    buf.put_u32(0x0048_0000); // 72 dpi
                    buf.put_u32(0x0048_0000);
                    buf.put_u32(0); // reserved
                    buf.put_u16(1); // frame_count
                    let name = b"Printcam H.264";
                    let len = name.len().min(31) as u8;
                    buf.put_u8(len);
                    buf.extend_from_slice(&name[..len as usize]);
                    for _ in (len as usize + 1)..32 {
                        buf.put_u8(0);
                    }
                    buf.put_u16(0x0018); // depth
                    buf.put_i16(-1); // pre_defined
                    write_box!(buf, b"avcC", {
                        buf.put_u8(1); // configurationVersion
                        buf.put_u8(self.sps[1]);
                        buf.put_u8(self.sps[2]);
                        buf.put_u8(self.sps[3]);
                        buf.put_u8(0b1111_1100 | 0b11); // 4-byte NAL lengths
                        buf.put_u8(0b1110_0000 | 1);
                        buf.put_u16(self.sps.len() as u16);
                        buf.extend_from_slice(&self.sps);
                        buf.put_u8(1);
                        buf.put_u16(self.pps.len() as u16);
                        buf.extend_from_slice(&self.pps);
                    });
                });
            });
            write_box!(buf, b"stts", {
                buf.put_u32(0);
                buf.put_u32(1);
                buf.put_u32(n);
                buf.put_u32(self.frame_ticks);
            });
            if !self.sync_samples.is_empty() && self.sync_samples.len() != self.sample_sizes.len()
            {
                write_box!(buf, b"stss", {
                    buf.put_u32(0);
                    buf.put_u32(self.sync_samples.len() as u32);
                    for s in &self.sync_samples {
                        buf.put_u32(*s);
                    }
                });
            }
            write_box!(buf, b"stsc", {
                buf.put_u32(0);
                buf.put_u32(1);
                buf.put_u32(1); // first_chunk
                buf.put_u32(n); // samples_per_chunk
                buf.put_u32(1); // sample_description_index
            });
            write_box!(buf, b"stsz", {
                buf.put_u32(0);
                buf.put_u32(0); // per-sample sizes follow
                buf.put_u32(n);
                for s in &self.sample_sizes {
                    buf.put_u32(*s);
                }
            });
            write_box!(buf, b"stco", {
                buf.put_u32(0);
                buf.put_u32(1);
                // Single chunk right after the mdat header.
                buf.put_u32(self.mdat_size_pos as u32 + 8);
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::runtime::Runtime;

    fn sps() -> Vec<u8> {
        vec![0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9]
    }

    fn pps() -> Vec<u8> {
        vec![0x68, 0xEB, 0xE3, 0xCB]
    }

    fn find_box(data: &[u8], fourcc: &[u8; 4]) -> Option<usize> {
        data.windows(4).position(|w| w == fourcc)
    }

    #[test]
    fn writes_ftyp_mdat_moov_in_order() {
        let rt = Runtime::new().unwrap();
        let out = rt
            .block_on(async {
                let cursor = Cursor::new(Vec::new());
                let mut w = Mp4Writer::new(cursor, sps(), pps(), 640, 360, 30).await?;
                let sample = {
                    let body = vec![0x65u8; 100];
                    let mut s = (body.len() as u32).to_be_bytes().to_vec();
                    s.extend_from_slice(&body);
                    s
                };
                w.write_sample(&sample, true).await?;
                w.write_sample(&sample, false).await?;
                assert_eq!(w.sample_count(), 2);
                let cursor = w.finish().await?;
                Ok::<_, Error>(cursor.into_inner())
            })
            .unwrap();

        let ftyp = find_box(&out, b"ftyp").unwrap();
        let mdat = find_box(&out, b"mdat").unwrap();
        let moov = find_box(&out, b"moov").unwrap();
        assert!(ftyp < mdat && mdat < moov);
        // mdat size patched: 8 + two 104-byte samples.
        let size = u32::from_be_bytes(out[mdat - 4..mdat].try_into().unwrap());
        assert_eq!(size, 8 + 2 * 104);
        // avcC carries the SPS bytes verbatim.
        // avcC content: version, 3 profile bytes, length size, sps count,
        // 2-byte sps length, then the SPS itself.
        let avcc = find_box(&out, b"avcC").unwrap();
        assert_eq!(&out[avcc + 4 + 8..avcc + 4 + 8 + 6], &sps()[..]);
    }

    #[test]
    fn rejects_bad_parameter_sets() {
        let rt = Runtime::new().unwrap();
        let err = rt.block_on(async {
            Mp4Writer::new(Cursor::new(Vec::new()), vec![0x01], pps(), 640, 360, 30).await
        });
        assert!(err.is_err());
    }
}
