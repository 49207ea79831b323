//! # Cache Keys
//!
//! Derives a stable fingerprint for a load request from its source identity
//! and every option that changes the output pixels.
//!
//! ## Canonical form
//!
//! Components are written in this fixed order, separated by `|`, and each
//! one is emitted only when it differs from its default:
//!
//! ```text
//! src=<uri:..|content:..> max=WxH resize=WxH:mode crop=x,y,w,h rot=D
//! fmt=F q=Q lq thumb noorient proc=NAME
//! ```
//!
//! The canonical string is hashed with SHA-256 and the lowercase hex digest
//! becomes the key. Changing this order invalidates every existing cache
//! directory, so append new components at the end.

use std::fmt;
use std::fmt::Write as _;

use sha2::{Digest, Sha256};

/// Quality used when the request does not ask for a specific one.
pub const DEFAULT_QUALITY: u8 = 100;

const KEY_LEN: usize = 64;

/// Opaque cache key: hex encoded SHA-256 of the canonical request form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Parse a key previously produced by [`FingerprintKeyer`].
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() == KEY_LEN && value.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two character shard used as the parent directory on disk.
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }

    /// Filename-safe form of the key.
    pub fn to_filename(&self) -> String {
        self.0.clone()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where an image came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceIdentity {
    /// A URI such as `https://...`, `file://...` or `asset://...`
    Uri(String),
    /// A content digest computed by the caller
    Content(String),
}

impl SourceIdentity {
    pub fn uri(uri: impl Into<String>) -> Self {
        Self::Uri(uri.into())
    }

    pub fn content(digest: impl Into<String>) -> Self {
        Self::Content(digest.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// How a resize target is applied to the decoded bitmap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResizeMode {
    /// Keep the aspect ratio and fit inside the target
    #[default]
    AspectFit,
    /// Produce exactly the requested dimensions
    Exact,
}

impl ResizeMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::AspectFit => "fit",
            Self::Exact => "exact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resize {
    pub size: Size,
    pub mode: ResizeMode,
}

impl Resize {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            size: Size::new(width, height),
            mode: ResizeMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: ResizeMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    /// Re-encode with the source format
    #[default]
    Original,
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Original => "original",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
        }
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "original" => Ok(Self::Original),
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpeg),
            "webp" => Ok(Self::Webp),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

/// Options that affect the processed pixels of a load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOptions {
    pub max_size: Option<Size>,
    pub resize: Option<Resize>,
    pub crop: Option<CropRect>,
    /// Clockwise rotation in degrees; normalized to `[0, 360)` when keyed
    pub rotation: i32,
    pub format: OutputFormat,
    pub quality: Option<u8>,
    pub low_quality: bool,
    pub thumbnail_mode: bool,
    pub orientation_correction_disabled: bool,
    /// Key of a custom image processor applied after decoding
    pub processor: Option<String>,
    /// Whether processed results of this request may be written to disk.
    /// Consulted by the usage policy only; it never changes the key.
    pub cache_processed_in_disk: bool,
}

impl TransformOptions {
    pub fn new() -> Self {
        Self {
            cache_processed_in_disk: true,
            ..Default::default()
        }
    }

    pub fn with_max_size(mut self, width: u32, height: u32) -> Self {
        self.max_size = Some(Size::new(width, height));
        self
    }

    pub fn with_resize(mut self, resize: Resize) -> Self {
        self.resize = Some(resize);
        self
    }

    pub fn with_crop(mut self, crop: CropRect) -> Self {
        self.crop = Some(crop);
        self
    }

    pub fn with_rotation(mut self, degrees: i32) -> Self {
        self.rotation = degrees;
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_quality(mut self, quality: u8) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn with_low_quality(mut self, low_quality: bool) -> Self {
        self.low_quality = low_quality;
        self
    }

    pub fn with_thumbnail_mode(mut self, thumbnail_mode: bool) -> Self {
        self.thumbnail_mode = thumbnail_mode;
        self
    }

    pub fn with_orientation_correction_disabled(mut self, disabled: bool) -> Self {
        self.orientation_correction_disabled = disabled;
        self
    }

    pub fn with_processor(mut self, processor: impl Into<String>) -> Self {
        self.processor = Some(processor.into());
        self
    }

    pub fn with_cache_processed_in_disk(mut self, enabled: bool) -> Self {
        self.cache_processed_in_disk = enabled;
        self
    }

    /// Rotation folded into `[0, 360)`.
    pub fn normalized_rotation(&self) -> u32 {
        self.rotation.rem_euclid(360) as u32
    }

    /// Whether any option that changes the output pixels is set.
    pub fn has_pixel_transform(&self) -> bool {
        self.max_size.is_some_and(|s| !s.is_empty())
            || self.resize.is_some_and(|r| !r.size.is_empty())
            || self.crop.is_some_and(|c| !c.is_empty())
            || self.normalized_rotation() != 0
            || self.thumbnail_mode
            || self.processor.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Display-only hints. They never reach the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayHints {
    pub fade_in: bool,
    pub placeholder: Option<String>,
    pub corner_radius: Option<u32>,
}

/// Computes [`CacheKey`]s. Pure and deterministic.
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintKeyer;

impl FingerprintKeyer {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_key(&self, source: &SourceIdentity, options: &TransformOptions) -> CacheKey {
        let canonical = Self::canonicalize(source, options);
        let digest = Sha256::digest(canonical.as_bytes());
        CacheKey(hex::encode(digest))
    }

    /// Canonical, human readable form that is hashed into the key.
    pub fn canonicalize(source: &SourceIdentity, options: &TransformOptions) -> String {
        let mut out = String::with_capacity(128);

        match source {
            SourceIdentity::Uri(uri) => {
                out.push_str("src=uri:");
                push_escaped(&mut out, uri);
            }
            SourceIdentity::Content(digest) => {
                out.push_str("src=content:");
                push_escaped(&mut out, digest);
            }
        }

        if let Some(size) = options.max_size.filter(|s| !s.is_empty()) {
            let _ = write!(out, "|max={}x{}", size.width, size.height);
        }
        if let Some(resize) = options.resize.filter(|r| !r.size.is_empty()) {
            let _ = write!(
                out,
                "|resize={}x{}:{}",
                resize.size.width,
                resize.size.height,
                resize.mode.as_str()
            );
        }
        if let Some(crop) = options.crop.filter(|c| !c.is_empty()) {
            let _ = write!(
                out,
                "|crop={},{},{},{}",
                crop.x, crop.y, crop.width, crop.height
            );
        }
        let rotation = options.normalized_rotation();
        if rotation != 0 {
            let _ = write!(out, "|rot={rotation}");
        }
        if options.format != OutputFormat::Original {
            let _ = write!(out, "|fmt={}", options.format.as_str());
        }
        let quality = options.quality.unwrap_or(DEFAULT_QUALITY);
        if quality != DEFAULT_QUALITY {
            let _ = write!(out, "|q={quality}");
        }
        if options.low_quality {
            out.push_str("|lq");
        }
        if options.thumbnail_mode {
            out.push_str("|thumb");
        }
        if options.orientation_correction_disabled {
            out.push_str("|noorient");
        }
        if let Some(processor) = options.processor.as_deref().filter(|p| !p.is_empty()) {
            out.push_str("|proc=");
            push_escaped(&mut out, processor);
        }

        out
    }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        if c == '\\' || c == '|' {
            out.push('\\');
        }
        out.push(c);
    }
}
