use egui::{Color32, ColorImage};
use perspecta_compare::dicom::{DecodedSlice, SlicePixels};
use perspecta_compare::WindowLevel;

pub fn render_slice(slice: &DecodedSlice, window_level: WindowLevel) -> ColorImage {
    match &slice.pixels {
        SlicePixels::Mono(pixels) => render_window_level(
            slice.width,
            slice.height,
            pixels,
            slice.invert,
            window_level,
        ),
        SlicePixels::Rgb {
            samples,
            samples_per_pixel,
        } => render_rgb(slice.width, slice.height, samples, *samples_per_pixel),
    }
}

fn render_window_level(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[i32],
    invert: bool,
    window_level: WindowLevel,
) -> ColorImage {
    let effective_width = window_level.width.max(1.0);
    let low = window_level.center - effective_width / 2.0;
    let range = effective_width.max(1e-6);

    let pixels = frame_pixels
        .iter()
        .map(|&sample| {
            let normalized = ((sample as f32 - low) / range).clamp(0.0, 1.0);
            let gray = (normalized * 255.0).round() as u8;
            Color32::from_gray(if invert { 255 - gray } else { gray })
        })
        .collect();

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

fn render_rgb(
    width_px: usize,
    height_px: usize,
    frame_pixels: &[u8],
    samples_per_pixel: u16,
) -> ColorImage {
    let spp = samples_per_pixel.max(1) as usize;
    let pixel_count = width_px.saturating_mul(height_px);
    let mut pixels = Vec::with_capacity(pixel_count);

    for chunk in frame_pixels.chunks_exact(spp).take(pixel_count) {
        let r = chunk[0];
        let g = if spp > 1 { chunk[1] } else { r };
        let b = if spp > 2 { chunk[2] } else { r };
        pixels.push(Color32::from_rgb(r, g, b));
    }

    if pixels.len() < pixel_count {
        pixels.resize(pixel_count, Color32::BLACK);
    }

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono(pixels: Vec<i32>, invert: bool) -> DecodedSlice {
        DecodedSlice {
            width: pixels.len(),
            height: 1,
            pixels: SlicePixels::Mono(pixels),
            invert,
            default_window: WindowLevel {
                center: 0.0,
                width: 1.0,
            },
            min_value: 0,
            max_value: 0,
        }
    }

    #[test]
    fn window_level_maps_edges_to_black_and_white() {
        let wl = WindowLevel {
            center: 50.0,
            width: 100.0,
        };
        let image = render_slice(&mono(vec![-10, 0, 50, 100, 500], false), wl);
        assert_eq!(image.pixels[0], Color32::from_gray(0));
        assert_eq!(image.pixels[1], Color32::from_gray(0));
        assert_eq!(image.pixels[3], Color32::from_gray(255));
        assert_eq!(image.pixels[4], Color32::from_gray(255));

        let inverted = render_slice(&mono(vec![0], true), wl);
        assert_eq!(inverted.pixels[0], Color32::from_gray(255));
    }

    #[test]
    fn short_rgb_buffers_are_padded() {
        let slice = DecodedSlice {
            width: 2,
            height: 1,
            pixels: SlicePixels::Rgb {
                samples: vec![10, 20, 30],
                samples_per_pixel: 3,
            },
            invert: false,
            default_window: WindowLevel {
                center: 127.5,
                width: 255.0,
            },
            min_value: 0,
            max_value: 255,
        };
        let image = render_slice(&slice, slice.default_window);
        assert_eq!(image.pixels, vec![Color32::from_rgb(10, 20, 30), Color32::BLACK]);
    }
}
