//! hwdec demo: feeds synthetic coded frames through a loopback-backed
//! hardware decoder and logs what comes out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use color_eyre::{eyre::eyre, Result};
use flume::bounded;
use tracing::{error, info, warn};

use hwdec::codec::loopback::LoopbackFactory;
use hwdec::codec::{CodecDeviceFactory, Rotation};
use hwdec::{
    CodecStatus, CodedFrame, Config, DecodeInfo, DecodedFrame, DecoderSettings,
    HardwareDecoderFactory, HardwareVideoDecoder, RenderContext,
};

/// Summary of one delivered frame, sent from the decoder's threads
#[derive(Debug)]
struct Delivered {
    width: u32,
    height: u32,
    rotation: Rotation,
    timestamp_ns: u64,
    decode_time_ms: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing()?;

    info!("hwdec launching...");

    // Load configuration
    let path = std::env::args().nth(1).unwrap_or_else(|| "hwdec.toml".into());
    let config = Config::load(&path)?;
    hwdec::CONFIG.store(Arc::new(config.clone()));
    info!(%path, ?config, "Configuration loaded");

    let devices: Arc<dyn CodecDeviceFactory> =
        Arc::new(LoopbackFactory::new(config.loopback.clone()));
    let render_context = config
        .decoder
        .use_texture
        .then(|| RenderContext::new(config.decoder.texture_id));
    let factory = HardwareDecoderFactory::new(devices.clone(), render_context, None);
    for codec in factory.supported_codecs() {
        info!(name = %codec.name, params = ?codec.params, "Supported codec");
    }

    let mut decoder = match &config.decoder.codec_name {
        Some(name) => HardwareVideoDecoder::new(
            devices,
            name.clone(),
            config.decoder.codec_type,
            config.decoder.color_format,
            render_context,
        ),
        None => factory
            .create_decoder(config.decoder.codec_type)
            .ok_or_else(|| eyre!("No decoder for {}", config.decoder.codec_type.name()))?,
    };
    info!(implementation = decoder.implementation_name(), "Using decoder");

    // Decoded frames are reported from the output/render threads
    let (tx, rx) = bounded::<Delivered>(16);
    let callback = move |frame: &DecodedFrame, decode_time_ms: Option<u32>, _qp: Option<u32>| {
        let delivered = Delivered {
            width: frame.buffer.width(),
            height: frame.buffer.height(),
            rotation: frame.rotation,
            timestamp_ns: frame.timestamp_ns,
            decode_time_ms,
        };
        if tx.try_send(delivered).is_err() {
            warn!("Frame log channel full");
        }
    };

    let logger = tokio::spawn(async move {
        let mut count = 0u64;
        while let Ok(frame) = rx.recv_async().await {
            count += 1;
            info!(
                count,
                width = frame.width,
                height = frame.height,
                rotation = frame.rotation.degrees(),
                timestamp_ns = frame.timestamp_ns,
                decode_time_ms = ?frame.decode_time_ms,
                "Decoded frame"
            );
        }
        count
    });

    let settings = DecoderSettings::new(config.decoder.width, config.decoder.height);
    let status = decoder.init_decode(settings, Arc::new(callback));
    if status != CodecStatus::Ok {
        return Err(eyre!("init_decode failed: {:?}", status));
    }

    let fps = config.decoder.fps.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / fps);
    let frame_period_ns = 1_000_000_000 / fps as u64;
    let mut sent = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received");
                break;
            }
        }

        let data = Bytes::from(sent.to_le_bytes().to_vec());
        let frame = if sent % fps as u64 == 0 {
            CodedFrame::key(data, sent * frame_period_ns)
        } else {
            CodedFrame::delta(data, sent * frame_period_ns)
        }
        .with_size(config.decoder.width, config.decoder.height)
        .with_rotation(Rotation::R90);

        let status =
            tokio::task::block_in_place(|| decoder.decode(&frame, &DecodeInfo::default()));
        match status {
            CodecStatus::Ok => {}
            CodecStatus::NoOutput => warn!(frame = sent, "Decoder waiting for a key frame"),
            other => error!(frame = sent, status = ?other, "Decode failed"),
        }

        sent += 1;
        if config.decoder.frame_count != 0 && sent >= config.decoder.frame_count {
            break;
        }
    }

    // Let in-flight frames drain before tearing down
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = tokio::task::block_in_place(|| decoder.release());
    info!(?status, "Decoder released");
    drop(decoder);

    let delivered = logger.await?;
    info!(sent, delivered, "hwdec shutting down");
    Ok(())
}

#[cfg(not(feature = "profiling"))]
fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("hwdec=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();
    Ok(())
}

#[cfg(feature = "profiling")]
fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new("hwdec=debug"))
        .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()))
        .with(tracing_tracy::TracyLayer::default());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
