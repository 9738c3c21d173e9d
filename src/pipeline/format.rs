//! Output format negotiation.
//!
//! All dimension state lives in one [`FormatState`] behind one lock, so the
//! caller thread (resize detection) and the output thread (renegotiation,
//! conversion) always observe a consistent snapshot.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use super::convert::SourceGeometry;
use crate::codec::{ColorFormat, OutputFormat, PlaneLayout};
use crate::error::StreamError;

/// Negotiated output geometry.
///
/// After every update `stride >= width` and `slice_height >= height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatState {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub slice_height: usize,
    pub layout: PlaneLayout,
    pub color_format: Option<ColorFormat>,
    pub has_decoded_first_frame: bool,
}

impl FormatState {
    pub fn new(width: u32, height: u32, color_format: Option<ColorFormat>) -> Self {
        Self {
            width,
            height,
            stride: width as usize,
            slice_height: height as usize,
            layout: color_format.map_or(PlaneLayout::SemiPlanar, ColorFormat::layout),
            color_format,
            has_decoded_first_frame: false,
        }
    }

    pub fn geometry(&self) -> SourceGeometry {
        SourceGeometry {
            width: self.width,
            height: self.height,
            stride: self.stride,
            slice_height: self.slice_height,
        }
    }
}

/// Applies device format changes to the shared [`FormatState`]
#[derive(Debug)]
pub struct FormatNegotiator {
    state: Mutex<FormatState>,
    texture_output: bool,
}

impl FormatNegotiator {
    /// On texture output the colour format is ignored.
    pub fn new(initial: FormatState, texture_output: bool) -> Self {
        Self {
            state: Mutex::new(initial),
            texture_output,
        }
    }

    pub fn snapshot(&self) -> FormatState {
        *self.lock()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        let state = self.lock();
        (state.width, state.height)
    }

    /// Start over at a new size, as for a freshly configured device
    pub fn reset(&self, width: u32, height: u32) {
        let mut state = self.lock();
        *state = FormatState::new(width, height, state.color_format);
    }

    pub fn mark_first_frame_decoded(&self) {
        self.lock().has_decoded_first_frame = true;
    }

    /// Mark the first frame decoded and return the state to convert it with
    pub fn first_frame_decoded(&self) -> FormatState {
        let mut state = self.lock();
        state.has_decoded_first_frame = true;
        *state
    }

    /// Apply a reported output format.
    ///
    /// A size change after the first decoded frame, or an unknown colour
    /// format on buffer output, is fatal for the stream. On a resize error
    /// the state is left untouched.
    pub fn apply(&self, format: &OutputFormat) -> Result<FormatState, StreamError> {
        metrics::counter!("hwdec_format_changes").increment(1);
        info!(?format, "Decoder format changed");

        let crop = match (
            format.crop_left,
            format.crop_right,
            format.crop_top,
            format.crop_bottom,
        ) {
            (Some(left), Some(right), Some(top), Some(bottom)) => Some((
                right.saturating_add(1).saturating_sub(left),
                bottom.saturating_add(1).saturating_sub(top),
            )),
            _ => None,
        };

        let mut state = self.lock();
        let (new_width, new_height) = match (crop, format.width, format.height) {
            (Some(size), _, _) => size,
            (None, Some(width), Some(height)) => (width, height),
            _ => {
                warn!("Format change without dimensions; keeping current size");
                (state.width, state.height)
            }
        };

        if state.has_decoded_first_frame
            && (state.width != new_width || state.height != new_height)
        {
            return Err(StreamError::UnexpectedResize {
                configured_width: state.width,
                configured_height: state.height,
                new_width,
                new_height,
            });
        }
        state.width = new_width;
        state.height = new_height;

        if !self.texture_output {
            if let Some(tag) = format.color_format {
                let color_format =
                    ColorFormat::from_tag(tag).ok_or(StreamError::UnsupportedColorFormat(tag))?;
                info!(?color_format, "Output colour format");
                state.color_format = Some(color_format);
                state.layout = color_format.layout();
            }
        }

        if let Some(stride) = format.stride {
            state.stride = stride as usize;
        }
        if let Some(slice_height) = format.slice_height {
            state.slice_height = slice_height as usize;
        }
        state.stride = state.stride.max(state.width as usize);
        state.slice_height = state.slice_height.max(state.height as usize);
        info!(
            width = state.width,
            height = state.height,
            stride = state.stride,
            slice_height = state.slice_height,
            "Output geometry"
        );

        Ok(*state)
    }

    fn lock(&self) -> MutexGuard<'_, FormatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator(width: u32, height: u32) -> FormatNegotiator {
        FormatNegotiator::new(
            FormatState::new(width, height, Some(ColorFormat::Yuv420SemiPlanar)),
            false,
        )
    }

    #[test]
    fn crop_wins_over_raw_size() {
        let negotiator = negotiator(640, 480);
        let state = negotiator
            .apply(&OutputFormat {
                width: Some(640),
                height: Some(496),
                crop_left: Some(0),
                crop_right: Some(639),
                crop_top: Some(0),
                crop_bottom: Some(479),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((state.width, state.height), (640, 480));
    }

    #[test]
    fn crop_at_u32_max_saturates() {
        let negotiator = negotiator(16, 16);
        let state = negotiator
            .apply(&OutputFormat {
                crop_left: Some(1),
                crop_right: Some(u32::MAX),
                crop_top: Some(0),
                crop_bottom: Some(u32::MAX),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((state.width, state.height), (u32::MAX - 1, u32::MAX));
    }

    #[test]
    fn partial_crop_is_ignored() {
        let negotiator = negotiator(16, 16);
        let state = negotiator
            .apply(&OutputFormat {
                width: Some(32),
                height: Some(18),
                crop_right: Some(9),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((state.width, state.height), (32, 18));
    }

    #[test]
    fn stride_and_slice_are_clamped() {
        let negotiator = negotiator(320, 240);
        let state = negotiator
            .apply(&OutputFormat {
                width: Some(320),
                height: Some(240),
                stride: Some(100),
                slice_height: Some(256),
                ..Default::default()
            })
            .unwrap();
        assert_eq!((state.stride, state.slice_height), (320, 256));
    }

    #[test]
    fn resize_after_first_frame_is_fatal_and_leaves_state() {
        let negotiator = negotiator(320, 240);
        negotiator.mark_first_frame_decoded();
        let before = negotiator.snapshot();

        let err = negotiator
            .apply(&OutputFormat {
                width: Some(640),
                height: Some(480),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            StreamError::UnexpectedResize {
                configured_width: 320,
                configured_height: 240,
                new_width: 640,
                new_height: 480,
            }
        );
        assert_eq!(negotiator.snapshot(), before);
    }

    #[test]
    fn same_size_after_first_frame_is_accepted() {
        let negotiator = negotiator(320, 240);
        negotiator.mark_first_frame_decoded();
        let state = negotiator
            .apply(&OutputFormat {
                width: Some(320),
                height: Some(240),
                stride: Some(384),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(state.stride, 384);
    }

    #[test]
    fn color_format_resolves_layout() {
        let negotiator = negotiator(8, 8);
        let state = negotiator
            .apply(&OutputFormat {
                width: Some(8),
                height: Some(8),
                color_format: Some(ColorFormat::Yuv420Planar.tag()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(state.layout, PlaneLayout::Planar);

        let err = negotiator
            .apply(&OutputFormat {
                color_format: Some(0x7F00_0789),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err, StreamError::UnsupportedColorFormat(0x7F00_0789));
    }

    #[test]
    fn texture_output_ignores_color_format() {
        let negotiator = FormatNegotiator::new(FormatState::new(8, 8, None), true);
        let state = negotiator
            .apply(&OutputFormat {
                color_format: Some(0x7F00_0789),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(state.color_format, None);
    }

    #[test]
    fn reset_clears_first_frame() {
        let negotiator = negotiator(8, 8);
        negotiator.mark_first_frame_decoded();
        negotiator.reset(16, 12);
        let state = negotiator.snapshot();
        assert!(!state.has_decoded_first_frame);
        assert_eq!((state.width, state.height, state.stride), (16, 12, 16));
    }
}
