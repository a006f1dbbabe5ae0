use std::path::Path;

use anyhow::{bail, Context, Result};
use dicom_object::{open_file, DefaultDicomObject, OpenFileOptions, Tag};
use dicom_pixeldata::PixelDecoder;

use crate::sync::WindowLevel;

const PIXEL_DATA: Tag = Tag(0x7FE0, 0x0010);

#[derive(Debug, Clone, PartialEq)]
pub enum SlicePixels {
    Mono(Vec<i32>),
    /// Interleaved samples, `samples_per_pixel` bytes per pixel.
    Rgb {
        samples: Vec<u8>,
        samples_per_pixel: u16,
    },
}

/// First frame of one image reference, decoded for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSlice {
    pub width: usize,
    pub height: usize,
    pub pixels: SlicePixels,
    pub invert: bool,
    pub default_window: WindowLevel,
    pub min_value: i32,
    pub max_value: i32,
}

impl DecodedSlice {
    pub fn is_monochrome(&self) -> bool {
        matches!(self.pixels, SlicePixels::Mono(_))
    }
}

/// Opens only the attributes before Pixel Data.
pub fn open_header_only(path: &Path) -> Result<DefaultDicomObject> {
    OpenFileOptions::new()
        .read_until(PIXEL_DATA)
        .open_file(path)
        .with_context(|| format!("Could not open {}", path.display()))
}

pub fn decode_slice(path: &Path) -> Result<DecodedSlice> {
    let obj = open_file(path).with_context(|| format!("Could not open {}", path.display()))?;

    let width: usize = obj
        .element_by_name("Columns")
        .context("Missing Columns tag")?
        .to_int()
        .context("Invalid Columns value")?;
    let height: usize = obj
        .element_by_name("Rows")
        .context("Missing Rows tag")?
        .to_int()
        .context("Invalid Rows value")?;
    let invert = read_string(&obj, "PhotometricInterpretation")
        .is_some_and(|value| value.eq_ignore_ascii_case("MONOCHROME1"));

    let decoded = obj
        .decode_pixel_data_frame(0)
        .context("Failed to decode PixelData frame 0")?;
    if decoded.columns() as usize != width || decoded.rows() as usize != height {
        bail!(
            "Decoded frame is {}x{} but tags say {}x{}",
            decoded.columns(),
            decoded.rows(),
            width,
            height
        );
    }

    let bits_allocated = decoded.bits_allocated();
    if bits_allocated != 8 && bits_allocated != 16 {
        bail!("BitsAllocated={bits_allocated} is not supported (only 8/16)");
    }

    match decoded.samples_per_pixel() {
        1 => {
            let pixels: Vec<i32> = decoded
                .to_vec_frame(0)
                .context("Could not convert frame 0 to i32 samples")?;
            if pixels.len() != width * height {
                bail!(
                    "Decoded pixel count mismatch: got {}, expected {}",
                    pixels.len(),
                    width * height
                );
            }
            let (min_value, max_value) =
                min_max(&pixels).context("No pixels available for rendering")?;
            let default_window = WindowLevel {
                center: read_float_first(&obj, "WindowCenter")
                    .unwrap_or((min_value + max_value) as f32 / 2.0),
                width: read_float_first(&obj, "WindowWidth")
                    .unwrap_or((max_value - min_value).max(1) as f32)
                    .max(1.0),
            };
            Ok(DecodedSlice {
                width,
                height,
                pixels: SlicePixels::Mono(pixels),
                invert,
                default_window,
                min_value,
                max_value,
            })
        }
        spp if spp >= 3 => {
            let shift = decoded.bits_stored().saturating_sub(8);
            let samples: Vec<u8> = if bits_allocated == 8 {
                decoded
                    .to_vec_frame(0)
                    .context("Could not convert frame 0 to u8 samples")?
            } else {
                let wide: Vec<u16> = decoded
                    .to_vec_frame(0)
                    .context("Could not convert frame 0 to u16 samples")?;
                wide.into_iter().map(|s| (s >> shift) as u8).collect()
            };
            let expected = width * height * spp as usize;
            if samples.len() != expected {
                bail!(
                    "Decoded color sample count mismatch: got {}, expected {expected}",
                    samples.len()
                );
            }
            Ok(DecodedSlice {
                width,
                height,
                pixels: SlicePixels::Rgb {
                    samples,
                    samples_per_pixel: spp,
                },
                invert: false,
                default_window: WindowLevel {
                    center: 127.5,
                    width: 255.0,
                },
                min_value: 0,
                max_value: 255,
            })
        }
        other => bail!("Unsupported SamplesPerPixel={other}"),
    }
}

pub(crate) fn read_string(obj: &DefaultDicomObject, name: &str) -> Option<String> {
    obj.element_by_name(name)
        .ok()
        .and_then(|el| el.to_str().ok())
        .map(|v| v.trim().trim_end_matches('\0').trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn read_int_first(obj: &DefaultDicomObject, name: &str) -> Option<i32> {
    read_string(obj, name).and_then(|value| first_value(&value))
}

fn read_float_first(obj: &DefaultDicomObject, name: &str) -> Option<f32> {
    read_string(obj, name).and_then(|value| first_value(&value))
}

fn first_value<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.split('\\').next()?.trim().parse::<T>().ok()
}

fn min_max(values: &[i32]) -> Option<(i32, i32)> {
    let mut iter = values.iter().copied();
    let first = iter.next()?;
    Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_valued_numbers_use_first_entry() {
        assert_eq!(first_value::<f32>("40\\400"), Some(40.0));
        assert_eq!(first_value::<i32>(" 7 "), Some(7));
        assert_eq!(first_value::<i32>("abc"), None);
    }

    #[test]
    fn min_max_handles_empty_and_negative() {
        assert_eq!(min_max(&[]), None);
        assert_eq!(min_max(&[3, -1024, 900]), Some((-1024, 900)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = decode_slice(Path::new("does/not/exist.dcm")).expect_err("should fail");
        assert!(format!("{err:#}").contains("does/not/exist.dcm"));
    }
}
