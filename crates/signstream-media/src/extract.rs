//! Landmark-extraction operator
//!
//! The extraction algorithm itself is behind the [`LandmarkExtractor`] trait;
//! the pipeline only relies on the detection flags, the optional hand center,
//! and the annotated frame. The complexity knob trades sampling density for
//! accuracy (0 fast, 1 medium, 2 accurate).

use image::{DynamicImage, Rgb};
use signstream_core::DetectionFlags;

/// Output of one extraction pass over a frame.
pub struct Extraction {
    /// Frame with landmark overlays drawn in.
    pub frame: DynamicImage,
    pub flags: DetectionFlags,
    /// Normalized hand-cluster centroid, present only when hands are detected.
    pub hand_center: Option<[f32; 2]>,
}

/// A single extractor instance per client; calls are serialized by the
/// pipeline worker and must not be issued concurrently.
pub trait LandmarkExtractor: Send + Sync {
    fn extract(&self, frame: &DynamicImage, complexity: u8) -> Extraction;
}

/// Built-in extraction operator: classifies skin-toned pixel mass and reports
/// region centroids as landmark proxies. Deterministic for identical input.
pub struct CentroidExtractor {
    detection_confidence: f32,
}

impl CentroidExtractor {
    pub fn new(detection_confidence: f32) -> Self {
        Self {
            detection_confidence: detection_confidence.clamp(0.0, 1.0),
        }
    }

    fn stride_for(complexity: u8) -> u32 {
        match complexity {
            0 => 8,
            1 => 4,
            _ => 2,
        }
    }

    fn is_candidate(pixel: &Rgb<u8>) -> bool {
        let [r, g, b] = pixel.0;
        r > 95 && g > 40 && b > 20 && r > g && r > b && r.saturating_sub(b) > 15
    }
}

impl Default for CentroidExtractor {
    fn default() -> Self {
        Self::new(0.5)
    }
}

impl LandmarkExtractor for CentroidExtractor {
    fn extract(&self, frame: &DynamicImage, complexity: u8) -> Extraction {
        let rgb = frame.to_rgb8();
        let (width, height) = rgb.dimensions();
        let stride = Self::stride_for(complexity);

        let mut sampled = 0u64;
        let mut total_hits = 0u64;
        let mut upper_hits = 0u64;
        let mut lower_hits = 0u64;
        let mut lower_sum = [0u64; 2];

        let upper_cutoff = height / 3;
        let mut y = 0;
        while y < height {
            let mut x = 0;
            while x < width {
                sampled += 1;
                if Self::is_candidate(rgb.get_pixel(x, y)) {
                    total_hits += 1;
                    if y < upper_cutoff {
                        upper_hits += 1;
                    } else {
                        lower_hits += 1;
                        lower_sum[0] += x as u64;
                        lower_sum[1] += y as u64;
                    }
                }
                x += stride;
            }
            y += stride;
        }

        if sampled == 0 {
            return Extraction {
                frame: frame.clone(),
                flags: DetectionFlags::none(),
                hand_center: None,
            };
        }

        // Mass thresholds scale with the configured detection confidence.
        let hit_fraction = total_hits as f32 / sampled as f32;
        let hand_fraction = lower_hits as f32 / sampled as f32;
        let face_fraction = upper_hits as f32 / sampled as f32;
        let floor = 0.01 * self.detection_confidence.max(0.1);

        let flags = DetectionFlags {
            hands: hand_fraction > floor,
            face: face_fraction > floor,
            pose: hit_fraction > floor * 2.0,
        };

        let hand_center = if flags.hands && lower_hits > 0 {
            Some([
                lower_sum[0] as f32 / lower_hits as f32 / width as f32,
                lower_sum[1] as f32 / lower_hits as f32 / height as f32,
            ])
        } else {
            None
        };

        let mut annotated = rgb;
        if let Some([cx, cy]) = hand_center {
            draw_marker(
                &mut annotated,
                (cx * width as f32) as u32,
                (cy * height as f32) as u32,
            );
        }

        Extraction {
            frame: DynamicImage::ImageRgb8(annotated),
            flags,
            hand_center,
        }
    }
}

/// Draw a small crosshair marker at the given pixel.
fn draw_marker(frame: &mut image::RgbImage, cx: u32, cy: u32) {
    let (width, height) = frame.dimensions();
    let color = Rgb([0u8, 255, 0]);
    for offset in 0..=8u32 {
        for (x, y) in [
            (cx.saturating_sub(offset), cy),
            (cx.saturating_add(offset), cy),
            (cx, cy.saturating_sub(offset)),
            (cx, cy.saturating_add(offset)),
        ] {
            if x < width && y < height {
                frame.put_pixel(x, y, color);
            }
        }
    }
}
