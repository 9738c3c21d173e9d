//! The decode pipeline: session control, output correlation, format
//! negotiation, pixel conversion and delivery.

pub mod convert;
pub mod correlation;
pub mod decoder;
pub mod format;
pub mod sink;

pub use convert::{convert_to_i420, SourceGeometry};
pub use correlation::{CorrelationQueue, CorrelationStats, FrameMetadata};
pub use decoder::{DecoderCallback, HardwareVideoDecoder, SessionState};
pub use format::{FormatNegotiator, FormatState};
pub use sink::{OutputSink, PendingTextureSlot, RenderedTexture};
