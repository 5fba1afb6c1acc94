//! Memory-mapped raw frame file capture.
//!
//! Reads a file of back-to-back uncompressed BGRA frames. The file is mapped
//! once at open; each read copies a single frame slice out of the mapping.
//! Frame layout comes from the reference query or from `set_property` calls
//! made before the first read:
//!
//! ```text
//! file:///videos/clip.raw?width=640&height=480&fps=25
//! /videos/clip.raw                      (layout set via source properties)
//! ```

use std::fs::File;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use memmap2::Mmap;

use super::{
    Capture, CaptureFactory, PROP_FPS, PROP_HEIGHT, PROP_WIDTH, SourceProperties, VideoReference,
    parse_uri_query,
};
use crate::frame::ImageData;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: f64 = 30.0;
const BYTES_PER_PIXEL: usize = 4;

pub struct RawFileCapture {
    mmap: Mmap,
    path: String,
    width: u32,
    height: u32,
    fps: f64,
    next_index: usize,
    reading_started: bool,
    released: bool,
}

impl RawFileCapture {
    pub fn open(path: &str, width: u32, height: u32, fps: f64) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening raw video '{path}'"))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("memory-mapping raw video '{path}'"))?;
        Ok(Self {
            mmap,
            path: path.to_string(),
            width,
            height,
            fps,
            next_index: 0,
            reading_started: false,
            released: false,
        })
    }

    fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    fn total_frames(&self) -> usize {
        // A trailing partial frame is ignored.
        self.mmap.len() / self.frame_size().max(1)
    }
}

#[async_trait]
impl Capture for RawFileCapture {
    async fn read(&mut self) -> Result<Option<ImageData>> {
        if self.released {
            bail!("raw file capture for '{}' already released", self.path);
        }
        if self.frame_size() == 0 {
            bail!("frame layout for '{}' has zero size", self.path);
        }
        self.reading_started = true;
        if self.next_index >= self.total_frames() {
            return Ok(None);
        }
        let offset = self.next_index * self.frame_size();
        let frame = self.mmap[offset..offset + self.frame_size()].to_vec();
        self.next_index += 1;
        Ok(Some(Arc::new(frame)))
    }

    fn properties(&self) -> SourceProperties {
        SourceProperties {
            width: self.width,
            height: self.height,
            declared_fps: self.fps,
            total_frames: self.total_frames() as i64,
            is_file: true,
        }
    }

    fn set_property(&mut self, name: &str, value: f64) -> Result<()> {
        match name {
            PROP_WIDTH | PROP_HEIGHT if self.reading_started => {
                bail!("frame layout of '{}' is fixed once reading has started", self.path)
            }
            PROP_WIDTH => self.width = value as u32,
            PROP_HEIGHT => self.height = value as u32,
            PROP_FPS if value > 0.0 => self.fps = value,
            PROP_FPS => bail!("fps must be positive, got {value}"),
            other => bail!("raw file capture does not support property '{other}'"),
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

pub struct RawFileCaptureFactory;

#[async_trait]
impl CaptureFactory for RawFileCaptureFactory {
    async fn open(&self, reference: &VideoReference) -> Result<Box<dyn Capture>> {
        let VideoReference::Uri(uri) = reference else {
            bail!("raw file factory expects a URI reference");
        };
        let params = parse_uri_query(uri);
        let without_scheme = uri.strip_prefix("file://").unwrap_or(uri);
        let path = without_scheme
            .split_once('?')
            .map(|(path, _)| path)
            .unwrap_or(without_scheme);
        let width = parse_dim(&params, "width", DEFAULT_WIDTH)?;
        let height = parse_dim(&params, "height", DEFAULT_HEIGHT)?;
        let fps = match params.get("fps") {
            None => DEFAULT_FPS,
            Some(raw) => raw
                .parse()
                .map_err(|_| anyhow!("invalid fps '{raw}' in '{uri}'"))?,
        };
        Ok(Box::new(RawFileCapture::open(path, width, height, fps)?))
    }
}

fn parse_dim(
    params: &std::collections::HashMap<String, String>,
    name: &str,
    default: u32,
) -> Result<u32> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("invalid value '{raw}' for raw file parameter '{name}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn raw_video(frames: usize, width: u32, height: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let frame_size = (width * height * 4) as usize;
        for index in 0..frames {
            file.write_all(&vec![index as u8; frame_size]).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn reads_every_frame_then_signals_eof() {
        let file = raw_video(4, 8, 8);
        let mut capture =
            RawFileCapture::open(file.path().to_str().unwrap(), 8, 8, 25.0).unwrap();
        assert_eq!(capture.properties().total_frames, 4);

        for index in 0..4u8 {
            let frame = capture.read().await.unwrap().unwrap();
            assert_eq!(frame.len(), 8 * 8 * 4);
            assert!(frame.iter().all(|byte| *byte == index));
        }
        assert!(capture.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn layout_is_frozen_after_first_read() {
        let file = raw_video(2, 8, 8);
        let mut capture =
            RawFileCapture::open(file.path().to_str().unwrap(), 8, 8, 25.0).unwrap();
        capture.set_property(PROP_WIDTH, 16.0).unwrap();
        assert_eq!(capture.properties().width, 16);

        capture.set_property(PROP_WIDTH, 8.0).unwrap();
        capture.read().await.unwrap();
        assert!(capture.set_property(PROP_WIDTH, 16.0).is_err());
        assert!(capture.set_property(PROP_FPS, 50.0).is_ok());
    }

    #[tokio::test]
    async fn factory_resolves_path_and_query() {
        let file = raw_video(3, 4, 4);
        let uri = format!("file://{}?width=4&height=4&fps=12", file.path().display());
        let factory = RawFileCaptureFactory;
        let capture = factory.open(&VideoReference::from(uri)).await.unwrap();
        let properties = capture.properties();
        assert_eq!(properties.width, 4);
        assert_eq!(properties.declared_fps, 12.0);
        assert_eq!(properties.total_frames, 3);
        assert!(properties.is_file);
    }

    #[tokio::test]
    async fn missing_file_is_an_open_error() {
        let factory = RawFileCaptureFactory;
        let result = factory
            .open(&VideoReference::from("/definitely/not/here.raw"))
            .await;
        assert!(result.is_err());
    }
}
