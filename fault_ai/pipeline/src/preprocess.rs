//! Frame preprocessing: JPEG decode bounded to a working size, then one
//! fused bilinear resize + center crop into the model input buffer.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::result::CropRect;
use crate::FaultError;
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer};
use image::ImageReader;
use std::io::Cursor;

/// Model input geometry: 448x224 RGB, two grid columns per row pair.
pub const INPUT_WIDTH: u32 = 448;
pub const INPUT_HEIGHT: u32 = 224;

/// Decode floor: the working image never drops below this while staying
/// large enough for the crop.
const MIN_DECODE_WIDTH: u32 = 512;
const MIN_DECODE_HEIGHT: u32 = 256;

/// Decoded RGB frame plus its dimensions.
pub struct WorkingImage {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

/// Decodes a JPEG and, when the source is much larger than the model input,
/// halves it as long as both floors hold. Camera frames are 1280x720 or
/// larger, so one halving step is the common case.
pub fn decode_bounded(jpeg: &[u8]) -> Result<WorkingImage, FaultError> {
    let decoded = ImageReader::new(Cursor::new(jpeg))
        .with_guessed_format()
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?
        .decode()
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    let (mut w, mut h) = (rgb.width(), rgb.height());

    let mut factor = 1u32;
    while w / (factor * 2) >= MIN_DECODE_WIDTH && h / (factor * 2) >= MIN_DECODE_HEIGHT {
        factor *= 2;
    }

    if factor == 1 {
        if w < INPUT_WIDTH || h < INPUT_HEIGHT {
            return Err(FaultError::FrameCorrupt(format!(
                "frame {}x{} smaller than model input",
                w, h
            )));
        }
        return Ok(WorkingImage {
            width: w,
            height: h,
            rgb: rgb.into_raw(),
        });
    }

    let dst_w = w / factor;
    let dst_h = h / factor;
    let src = Image::from_vec_u8(w, h, rgb.into_raw(), PixelType::U8x3)
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?;
    let mut dst = Image::new(dst_w, dst_h, PixelType::U8x3);
    let mut resizer = Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear)),
        )
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?;
    w = dst_w;
    h = dst_h;
    Ok(WorkingImage {
        width: w,
        height: h,
        rgb: dst.into_vec(),
    })
}

/// Largest centered rectangle with the model input's 2:1 aspect, in source
/// pixels.
pub fn center_crop_pixels(width: u32, height: u32) -> (u32, u32, u32, u32) {
    let aspect = INPUT_WIDTH / INPUT_HEIGHT; // 2
    if width >= height * aspect {
        let crop_w = height * aspect;
        ((width - crop_w) / 2, 0, crop_w, height)
    } else {
        let crop_h = width / aspect;
        (0, (height - crop_h) / 2, width, crop_h)
    }
}

/// Full preprocessing chain: bounded decode, fused bilinear resize + center
/// crop into a `448*224*3` u8 RGB buffer, plus the normalized crop rect.
pub fn prepare(jpeg: &[u8]) -> Result<(Vec<u8>, CropRect), FaultError> {
    let img = decode_bounded(jpeg)?;
    let (cx, cy, cw, ch) = center_crop_pixels(img.width, img.height);
    let crop = CropRect {
        x: cx as f32 / img.width as f32,
        y: cy as f32 / img.height as f32,
        w: cw as f32 / img.width as f32,
        h: ch as f32 / img.height as f32,
    };

    let src = Image::from_vec_u8(img.width, img.height, img.rgb, PixelType::U8x3)
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?;
    let mut dst = Image::new(INPUT_WIDTH, INPUT_HEIGHT, PixelType::U8x3);
    let mut resizer = Resizer::new();
    resizer
        .resize(
            &src,
            &mut dst,
            &ResizeOptions::new()
                .resize_alg(ResizeAlg::Convolution(FilterType::Bilinear))
                .crop(cx as f64, cy as f64, cw as f64, ch as f64),
        )
        .map_err(|e| FaultError::FrameCorrupt(e.to_string()))?;

    Ok((dst.into_vec(), crop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::RgbImage;

    fn jpeg_of(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 64])
        });
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode_image(&img)
            .unwrap();
        out
    }

    #[test]
    fn crop_rect_for_wide_source() {
        // 1280 < 720*2, so the crop is full width, half-width tall.
        let (x, y, w, h) = center_crop_pixels(1280, 720);
        assert_eq!((x, y, w, h), (0, (720 - 640) / 2, 1280, 640));
    }

    #[test]
    fn crop_rect_for_ultrawide_source() {
        let (x, y, w, h) = center_crop_pixels(2000, 500);
        assert_eq!((x, y, w, h), ((2000 - 1000) / 2, 0, 1000, 500));
    }

    #[test]
    fn prepare_produces_model_input_buffer() {
        let jpeg = jpeg_of(1280, 720);
        let (buf, crop) = prepare(&jpeg).unwrap();
        assert_eq!(buf.len(), (INPUT_WIDTH * INPUT_HEIGHT * 3) as usize);
        assert!(crop.x >= 0.0 && crop.x + crop.w <= 1.0 + f32::EPSILON);
        assert!(crop.y >= 0.0 && crop.y + crop.h <= 1.0 + f32::EPSILON);
        // 2:1 aspect in normalized terms scaled by source aspect.
        let src_aspect = 1280.0 / 720.0;
        let crop_aspect = (crop.w * src_aspect) / crop.h;
        assert!((crop_aspect - 2.0).abs() < 0.02, "aspect {crop_aspect}");
    }

    #[test]
    fn decode_keeps_floor_dimensions() {
        let jpeg = jpeg_of(1280, 720);
        let img = decode_bounded(&jpeg).unwrap();
        assert!(img.width >= 512 && img.height >= 256);
        // One halving is legal for 1280x720, two is not (640->320 ok, 360>=256 ok;
        // 320x180 would break both floors).
        assert!(img.width >= 640);
    }

    #[test]
    fn tiny_frame_is_rejected() {
        let jpeg = jpeg_of(100, 60);
        assert!(decode_bounded(&jpeg).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode_bounded(&[0u8; 64]).is_err());
    }
}
