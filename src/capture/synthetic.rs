//! Procedural test-pattern capture.
//!
//! Generates BGRA gradient frames without touching any decoder, which makes
//! it the reference backend for demos and tests. References look like:
//!
//! ```text
//! synthetic://gradient?width=64&height=48&fps=30          (live, endless)
//! synthetic://gradient?width=64&height=48&frames=120      (finite file)
//! ```
//!
//! A live synthetic source paces itself at the declared FPS, like a camera
//! would; a finite one yields frames as fast as they are consumed and then
//! signals end of stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;

use super::{
    Capture, CaptureFactory, PROP_FPS, PROP_HEIGHT, PROP_WIDTH, SourceProperties, VideoReference,
    parse_uri_query,
};
use crate::frame::ImageData;

const DEFAULT_WIDTH: u32 = 64;
const DEFAULT_HEIGHT: u32 = 64;
const DEFAULT_FPS: f64 = 30.0;

pub struct SyntheticCapture {
    width: u32,
    height: u32,
    fps: f64,
    /// `None` for a live endless source.
    total_frames: Option<u64>,
    next_index: u64,
    released: bool,
}

impl SyntheticCapture {
    pub fn live(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps,
            total_frames: None,
            next_index: 0,
            released: false,
        }
    }

    pub fn finite(width: u32, height: u32, fps: f64, frames: u64) -> Self {
        Self {
            total_frames: Some(frames),
            ..Self::live(width, height, fps)
        }
    }

    fn render(&self, index: u64) -> ImageData {
        let mut pixels = vec![0u8; (self.width * self.height * 4) as usize];
        // Shifting gradient, distinct per frame so tests can tell frames apart.
        for (offset, value) in pixels.iter_mut().enumerate() {
            *value = (offset as u64).wrapping_add(index) as u8;
        }
        Arc::new(pixels)
    }
}

#[async_trait]
impl Capture for SyntheticCapture {
    async fn read(&mut self) -> Result<Option<ImageData>> {
        if self.released {
            bail!("synthetic capture already released");
        }
        match self.total_frames {
            Some(total) if self.next_index >= total => return Ok(None),
            Some(_) => {}
            None => {
                // Live sources deliver at their declared rate.
                tokio::time::sleep(Duration::from_secs_f64(1.0 / self.fps)).await;
            }
        }
        let image = self.render(self.next_index);
        self.next_index += 1;
        Ok(Some(image))
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            width: self.width,
            height: self.height,
            declared_fps: self.fps,
            total_frames: self.total_frames.map(|n| n as i64).unwrap_or(-1),
            is_file: self.total_frames.is_some(),
        }
    }

    fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        match name {
            PROP_WIDTH => self.width = value as u32,
            PROP_HEIGHT => self.height = value as u32,
            PROP_FPS if value > 0.0 => self.fps = value,
            PROP_FPS => bail!("fps must be positive, got {value}"),
            other => bail!("synthetic capture does not support property '{other}'"),
        }
        Ok(())
    }

    fn get_property(&self, name: &str) -> Option<f64> {
        match name {
            PROP_WIDTH => Some(self.width as f64),
            PROP_HEIGHT => Some(self.height as f64),
            PROP_FPS => Some(self.fps),
            _ => None,
        }
    }

    async fn release(&mut self) {
        self.released = true;
    }
}

pub struct SyntheticCaptureFactory;

#[async_trait]
impl CaptureFactory for SyntheticCaptureFactory {
    async fn open(&self, reference: &VideoReference) -> Result<Box<dyn Capture>> {
        let VideoReference::Uri(uri) = reference else {
            bail!("synthetic factory expects a URI reference");
        };
        let params = parse_uri_query(uri);
        let width = parse_param(&params, "width", DEFAULT_WIDTH)?;
        let height = parse_param(&params, "height", DEFAULT_HEIGHT)?;
        let fps = parse_param(&params, "fps", DEFAULT_FPS)?;
        let capture = match params.get("frames") {
            Some(raw) => {
                let frames: u64 = raw
                    .parse()
                    .map_err(|_| anyhow!("invalid frames count '{raw}' in '{uri}'"))?;
                SyntheticCapture::finite(width, height, fps, frames)
            }
            None => SyntheticCapture::live(width, height, fps),
        };
        Ok(Box::new(capture))
    }
}

fn parse_param<T: std::str::FromStr>(
    params: &std::collections::HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid value '{raw}' for synthetic parameter '{name}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finite_capture_signals_end_of_stream() {
        let mut capture = SyntheticCapture::finite(8, 8, 30.0, 3);
        for _ in 0..3 {
            assert!(capture.read().await.unwrap().is_some());
        }
        assert!(capture.read().await.unwrap().is_none());
        assert!(capture.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frames_have_expected_size_and_differ_per_index() {
        let mut capture = SyntheticCapture::finite(8, 4, 30.0, 2);
        let first = capture.read().await.unwrap().unwrap();
        let second = capture.read().await.unwrap().unwrap();
        assert_eq!(first.len(), 8 * 4 * 4);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn factory_parses_query_parameters() {
        let factory = SyntheticCaptureFactory;
        let capture = factory
            .open(&VideoReference::from(
                "synthetic://gradient?width=32&height=16&fps=10&frames=5",
            ))
            .await
            .unwrap();
        let properties = capture.properties();
        assert_eq!(properties.width, 32);
        assert_eq!(properties.height, 16);
        assert_eq!(properties.declared_fps, 10.0);
        assert_eq!(properties.total_frames, 5);
        assert!(properties.is_file);
    }

    #[tokio::test]
    async fn live_capture_reports_unknown_total() {
        let properties = SyntheticCapture::live(8, 8, 30.0).properties();
        assert_eq!(properties.total_frames, -1);
        assert!(!properties.is_file);
    }

    #[tokio::test]
    async fn released_capture_refuses_reads() {
        let mut capture = SyntheticCapture::live(8, 8, 30.0);
        capture.release().await;
        assert!(capture.read().await.is_err());
    }
}
