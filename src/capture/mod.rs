//! # Capture Abstraction
//!
//! The pipeline never talks to decoders directly. Each video source owns a
//! boxed [`Capture`] obtained from a [`CaptureRegistry`], which maps URI
//! schemes to pluggable [`CaptureFactory`] implementations.
//!
//! Two backends ship with the crate and need no codec bindings:
//!
//! - `synthetic://`: procedurally generated frames, live or finite
//!   ([`synthetic::SyntheticCapture`]), for demos and tests.
//! - `file://` (or a bare path): memory-mapped raw BGRA frame files
//!   ([`raw_file::RawFileCapture`]).
//!
//! Real decoders (RTSP, V4L2, GStreamer pipelines) are registered by the
//! embedder under their own schemes, or as the device backend for integer
//! camera references.

pub mod raw_file;
pub mod synthetic;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;

use crate::frame::ImageData;

/// Well-known capture property names accepted by `set_property`.
pub const PROP_WIDTH: &str = "frame_width";
pub const PROP_HEIGHT: &str = "frame_height";
pub const PROP_FPS: &str = "fps";

/// Descriptor of a connected capture, queried once after open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceProperties {
    pub width: u32,
    pub height: u32,
    pub declared_fps: f64,
    /// Total frame count for finite sources, -1 when live or unknown.
    pub total_frames: i64,
    /// Distinguishes a finite file from a live stream.
    pub is_file: bool,
}

/// A connected, frame-yielding capture handle.
///
/// `read` is the only suspension point: it resolves to `Ok(Some(image))` for
/// a decoded frame, `Ok(None)` at end of stream (finite sources only) and
/// `Err` on a read failure or connection loss. Implementations must tolerate
/// `release` being called more than once.
#[async_trait]
pub trait Capture: Send {
    async fn read(&mut self) -> Result<Option<ImageData>>;

    fn properties(&self) -> SourceProperties;

    /// Adjusts a capture parameter by well-known name. Backends reject
    /// properties they do not support or can no longer change.
    fn set_property(&mut self, name: &str, value: f64) -> Result<()>;

    fn get_property(&self, name: &str) -> Option<f64>;

    async fn release(&mut self);
}

/// Opens captures for a particular scheme or device class.
#[async_trait]
pub trait CaptureFactory: Send + Sync {
    async fn open(&self, reference: &VideoReference) -> Result<Box<dyn Capture>>;
}

/// Reference to a video source: a URI (or bare file path) or a local
/// device index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VideoReference {
    Uri(String),
    Device(u32),
}

impl VideoReference {
    /// Scheme of a URI reference, e.g. `rtsp` for `rtsp://...`. Bare paths
    /// and device indices have no scheme.
    pub fn scheme(&self) -> Option<&str> {
        match self {
            Self::Uri(uri) => uri.split_once("://").map(|(scheme, _)| scheme),
            Self::Device(_) => None,
        }
    }
}

impl From<&str> for VideoReference {
    fn from(value: &str) -> Self {
        Self::Uri(value.to_string())
    }
}

impl From<String> for VideoReference {
    fn from(value: String) -> Self {
        Self::Uri(value)
    }
}

impl From<u32> for VideoReference {
    fn from(value: u32) -> Self {
        Self::Device(value)
    }
}

impl fmt::Display for VideoReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uri(uri) => f.write_str(uri),
            Self::Device(index) => write!(f, "device:{index}"),
        }
    }
}

/// Scheme-keyed registry of capture factories.
///
/// Cloning shares the registered factories. URI references resolve through
/// their scheme (bare paths fall back to the `file` factory); device
/// references resolve through the device backend, which has no default.
#[derive(Clone)]
pub struct CaptureRegistry {
    factories: HashMap<String, Arc<dyn CaptureFactory>>,
    device_backend: Option<Arc<dyn CaptureFactory>>,
}

impl CaptureRegistry {
    /// Registry with the built-in `synthetic` and `file` factories.
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
            device_backend: None,
        };
        registry.register_scheme("synthetic", Arc::new(synthetic::SyntheticCaptureFactory));
        registry.register_scheme("file", Arc::new(raw_file::RawFileCaptureFactory));
        registry
    }

    pub fn register_scheme(&mut self, scheme: &str, factory: Arc<dyn CaptureFactory>) {
        self.factories.insert(scheme.to_string(), factory);
    }

    /// Backend used for [`VideoReference::Device`] references.
    pub fn register_device_backend(&mut self, factory: Arc<dyn CaptureFactory>) {
        self.device_backend = Some(factory);
    }

    pub async fn open(&self, reference: &VideoReference) -> Result<Box<dyn Capture>> {
        match reference {
            VideoReference::Uri(_) => {
                let scheme = reference.scheme().unwrap_or("file");
                let factory = self.factories.get(scheme).ok_or_else(|| {
                    anyhow!("no capture factory registered for scheme '{scheme}'")
                })?;
                factory.open(reference).await
            }
            VideoReference::Device(index) => match &self.device_backend {
                Some(factory) => factory.open(reference).await,
                None => Err(anyhow!(
                    "no device capture backend registered (device index {index})"
                )),
            },
        }
    }
}

impl fmt::Debug for CaptureRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureRegistry")
            .field("schemes", &self.factories.keys().collect::<Vec<_>>())
            .field("has_device_backend", &self.device_backend.is_some())
            .finish()
    }
}

/// Splits `key=value` pairs out of a URI query string. Unknown keys are left
/// for the caller to reject or ignore.
pub(crate) fn parse_uri_query(uri: &str) -> HashMap<String, String> {
    let Some((_, query)) = uri.split_once('?') else {
        return HashMap::new();
    };
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
