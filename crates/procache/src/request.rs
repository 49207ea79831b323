//! # Decode Pipeline Types
//!
//! The narrow view of a load request and its decode result that the cache
//! consumes. Decoding itself happens elsewhere.

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::key::{DisplayHints, OutputFormat, SourceIdentity, TransformOptions};

/// A single image load as seen by the cache.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub source: SourceIdentity,
    pub options: TransformOptions,
    pub display: DisplayHints,
    /// Caller asked for this load to bypass caching
    pub no_cache: bool,
    cancel: CancellationToken,
}

impl LoadRequest {
    pub fn new(source: SourceIdentity, options: TransformOptions) -> Self {
        Self {
            source,
            options,
            display: DisplayHints::default(),
            no_cache: false,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_display(mut self, display: DisplayHints) -> Self {
        self.display = display;
        self
    }

    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// Share a cancellation token owned by the caller.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Encoded raster ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: OutputFormat,
}

impl RasterImage {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, format: OutputFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
        }
    }
}

/// What the decoder produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Raster(RasterImage),
    Vector { data: Bytes },
    Animated { frame_count: u32 },
    GifFrame { index: u32 },
}

impl Artifact {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Raster(_) => "raster",
            Self::Vector { .. } => "vector",
            Self::Animated { .. } => "animated",
            Self::GifFrame { .. } => "gif-frame",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecodeResult {
    pub artifact: Artifact,
    /// Decoder marked this result as not cacheable
    pub banned: bool,
    /// A transformation was actually applied while decoding
    pub processed: bool,
}

impl DecodeResult {
    pub fn raster(image: RasterImage) -> Self {
        Self {
            artifact: Artifact::Raster(image),
            banned: false,
            processed: false,
        }
    }

    pub fn new(artifact: Artifact) -> Self {
        Self {
            artifact,
            banned: false,
            processed: false,
        }
    }

    pub fn with_banned(mut self, banned: bool) -> Self {
        self.banned = banned;
        self
    }

    pub fn with_processed(mut self, processed: bool) -> Self {
        self.processed = processed;
        self
    }

    pub fn raster_image(&self) -> Option<&RasterImage> {
        match &self.artifact {
            Artifact::Raster(image) => Some(image),
            _ => None,
        }
    }
}
