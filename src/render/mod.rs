//! Texture hand-off and the render-consumer thread.
//!
//! On the texture path the device renders decoded pictures straight into a
//! shared texture. [`SharedTexture`] is the handle the device sees: it
//! carries the texture id, the size and rotation of the next frame, and a
//! channel that announces "frame available" to the [`TextureRenderer`]
//! thread, which turns each announcement into a callback.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::codec::Rotation;

/// Describes the texture a decoder session should render into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderContext {
    pub texture_id: u32,
}

impl RenderContext {
    pub fn new(texture_id: u32) -> Self {
        Self { texture_id }
    }
}

/// Snapshot of the texture when the device finished rendering into it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureFrame {
    pub texture_id: u32,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
}

/// Messages for the render-consumer thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureEvent {
    FrameAvailable(TextureFrame),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default)]
struct Geometry {
    width: u32,
    height: u32,
    rotation: Rotation,
}

struct SharedTextureInner {
    texture_id: u32,
    geometry: Mutex<Geometry>,
    events: Sender<TextureEvent>,
}

/// Handle to a texture shared between the device and the render thread.
///
/// Cheap to clone; every clone refers to the same texture.
#[derive(Clone)]
pub struct SharedTexture {
    inner: Arc<SharedTextureInner>,
}

impl SharedTexture {
    fn new(texture_id: u32, events: Sender<TextureEvent>) -> Self {
        Self {
            inner: Arc::new(SharedTextureInner {
                texture_id,
                geometry: Mutex::new(Geometry::default()),
                events,
            }),
        }
    }

    pub fn texture_id(&self) -> u32 {
        self.inner.texture_id
    }

    /// Size of the next frame rendered into the texture
    pub fn set_texture_size(&self, width: u32, height: u32) {
        let mut geometry = self.geometry();
        geometry.width = width;
        geometry.height = height;
    }

    pub fn set_frame_rotation(&self, rotation: Rotation) {
        self.geometry().rotation = rotation;
    }

    /// Called by the device once a frame has landed in the texture.
    ///
    /// Returns `false` if the render thread is gone.
    pub fn frame_available(&self) -> bool {
        let frame = {
            let geometry = self.geometry();
            TextureFrame {
                texture_id: self.inner.texture_id,
                width: geometry.width,
                height: geometry.height,
                rotation: geometry.rotation,
            }
        };
        self.inner
            .events
            .send(TextureEvent::FrameAvailable(frame))
            .is_ok()
    }

    fn geometry(&self) -> std::sync::MutexGuard<'_, Geometry> {
        self.inner
            .geometry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns the render-consumer thread for one decoder session
pub struct TextureRenderer {
    texture: SharedTexture,
    events: Sender<TextureEvent>,
    handle: Option<JoinHandle<()>>,
}

impl TextureRenderer {
    /// Start the render thread; `on_frame` runs on it for every frame the
    /// device renders.
    pub fn spawn<F>(context: RenderContext, mut on_frame: F) -> io::Result<Self>
    where
        F: FnMut(TextureFrame) + Send + 'static,
    {
        let (tx, rx): (Sender<TextureEvent>, Receiver<TextureEvent>) = flume::unbounded();
        let texture = SharedTexture::new(context.texture_id, tx.clone());

        let handle = thread::Builder::new()
            .name("hwdec-render".into())
            .spawn(move || {
                info!(texture_id = context.texture_id, "Render thread started");
                while let Ok(event) = rx.recv() {
                    match event {
                        TextureEvent::FrameAvailable(frame) => on_frame(frame),
                        TextureEvent::Shutdown => break,
                    }
                }
                debug!("Render thread exiting");
            })?;

        Ok(Self {
            texture,
            events: tx,
            handle: Some(handle),
        })
    }

    pub fn texture(&self) -> SharedTexture {
        self.texture.clone()
    }

    /// Stop the render thread and wait for it.
    ///
    /// Frames announced before the call are still delivered.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.events.send(TextureEvent::Shutdown);
        if handle.thread().id() == thread::current().id() {
            warn!("Render thread stopping itself; not joining");
            return;
        }
        if handle.join().is_err() {
            warn!("Render thread panicked");
        }
    }
}

impl Drop for TextureRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}
