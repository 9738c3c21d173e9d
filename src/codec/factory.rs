//! Picks a hardware device for a codec and builds decoders on it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{CodecDeviceFactory, ColorFormat, VideoCodecType};
use crate::pipeline::HardwareVideoDecoder;
use crate::render::RenderContext;

const H264_PROFILE_CONSTRAINED_BASELINE: &str = "42e01f";
const H264_PROFILE_CONSTRAINED_HIGH: &str = "640c1f";

/// Device name prefixes known to decode H264 high profile
const HIGH_PROFILE_PREFIXES: [&str; 2] = ["OMX.qcom.", "OMX.Exynos."];

/// A codec device as enumerated by a [`CodecDeviceFactory`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub is_encoder: bool,
    pub supported_types: Vec<VideoCodecType>,
    /// Raw colour format tags the device can output
    pub color_formats: Vec<u32>,
}

impl DeviceInfo {
    pub fn supports(&self, codec_type: VideoCodecType) -> bool {
        self.supported_types.contains(&codec_type)
    }

    /// First supported decoder colour format this device offers
    pub fn select_color_format(&self) -> Option<ColorFormat> {
        ColorFormat::DECODER_FORMATS
            .into_iter()
            .find(|format| self.color_formats.contains(&format.tag()))
    }

    fn supports_h264_high_profile(&self) -> bool {
        HIGH_PROFILE_PREFIXES
            .iter()
            .any(|prefix| self.name.starts_with(prefix))
    }
}

/// A codec advertised to the session layer, with its SDP format parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodecInfo {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

impl VideoCodecInfo {
    fn new(codec_type: VideoCodecType, high_profile: bool) -> Self {
        let mut params = BTreeMap::new();
        if codec_type == VideoCodecType::H264 {
            let profile = if high_profile {
                H264_PROFILE_CONSTRAINED_HIGH
            } else {
                H264_PROFILE_CONSTRAINED_BASELINE
            };
            params.insert("level-asymmetry-allowed".into(), "1".into());
            params.insert("packetization-mode".into(), "1".into());
            params.insert("profile-level-id".into(), profile.into());
        }
        Self {
            name: codec_type.name().into(),
            params,
        }
    }
}

pub type DevicePredicate = Arc<dyn Fn(&DeviceInfo) -> bool + Send + Sync>;

/// Builds [`HardwareVideoDecoder`]s on the first suitable device
#[derive(Clone)]
pub struct HardwareDecoderFactory {
    devices: Arc<dyn CodecDeviceFactory>,
    render_context: Option<RenderContext>,
    allowed: Option<DevicePredicate>,
}

impl fmt::Debug for HardwareDecoderFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareDecoderFactory")
            .field("render_context", &self.render_context)
            .field("has_predicate", &self.allowed.is_some())
            .finish()
    }
}

impl HardwareDecoderFactory {
    /// With a render context, decoders deliver texture frames instead of
    /// converted I420 buffers.
    pub fn new(
        devices: Arc<dyn CodecDeviceFactory>,
        render_context: Option<RenderContext>,
        allowed: Option<DevicePredicate>,
    ) -> Self {
        Self {
            devices,
            render_context,
            allowed,
        }
    }

    /// Decoder for `codec_type`, or `None` if no device can handle it
    pub fn create_decoder(&self, codec_type: VideoCodecType) -> Option<HardwareVideoDecoder> {
        let device = self.find_device(codec_type)?;
        let color_format = device.select_color_format()?;
        info!(
            device = %device.name,
            codec = codec_type.name(),
            ?color_format,
            "Creating hardware decoder"
        );
        Some(HardwareVideoDecoder::new(
            self.devices.clone(),
            device.name,
            codec_type,
            color_format,
            self.render_context,
        ))
    }

    /// Codecs that have at least one usable device
    pub fn supported_codecs(&self) -> Vec<VideoCodecInfo> {
        let mut codecs = Vec::new();
        for codec_type in VideoCodecType::ALL {
            let Some(device) = self.find_device(codec_type) else {
                continue;
            };
            if codec_type == VideoCodecType::H264 && device.supports_h264_high_profile() {
                codecs.push(VideoCodecInfo::new(codec_type, true));
            }
            codecs.push(VideoCodecInfo::new(codec_type, false));
        }
        codecs
    }

    fn find_device(&self, codec_type: VideoCodecType) -> Option<DeviceInfo> {
        self.devices.enumerate().into_iter().find(|device| {
            if device.is_encoder || !device.supports(codec_type) {
                return false;
            }
            if device.select_color_format().is_none() {
                debug!(device = %device.name, "No supported colour format");
                return false;
            }
            self.allowed.as_ref().map_or(true, |allowed| allowed(device))
        })
    }
}
