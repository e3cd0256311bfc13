//! Image decoding: raw upload bytes or base64 data URIs into an RGB raster.
//!
//! Only PNG, JPEG and GIF sources are accepted. The format is sniffed from the
//! content before any decode work happens.

use base64::engine::general_purpose;
use base64::Engine as _;
use image::ImageFormat;
use thiserror::Error;

const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];
const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("empty image payload")]
    EmptyPayload,
    #[error("unsupported file extension: {0:?} (expected png, jpg, jpeg or gif)")]
    UnsupportedExtension(Option<String>),
    #[error("unsupported image format (expected PNG, JPEG or GIF)")]
    UnsupportedFormat,
    #[error("malformed data URI: {0}")]
    MalformedDataUri(String),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),
    #[error("image decoded to zero pixels")]
    ZeroPixels,
}

/// A decoded image: row-major RGB, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Raster {
    /// Wrap RGB pixel data. Returns `None` when dimensions are zero or the
    /// buffer length does not match `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if width == 0 || height == 0 || data.len() != width as usize * height as usize * RGB_CHANNELS
        {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB bytes.
    pub fn as_rgb(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at (x, y). Callers must stay in bounds.
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width as usize + x) * RGB_CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    /// Copy into an `image` buffer for resizing or re-encoding.
    pub fn to_rgb_image(&self) -> image::RgbImage {
        image::RgbImage::from_fn(self.width, self.height, |x, y| {
            image::Rgb(self.pixel(x as usize, y as usize))
        })
    }
}

/// An image as it arrives at the upload boundary.
#[derive(Debug, Clone)]
pub enum ImageInput {
    /// A multipart file upload. The file name's extension is checked when present.
    Upload {
        file_name: Option<String>,
        bytes: Vec<u8>,
    },
    /// A `data:image/...;base64,...` string (or bare base64) from a live capture.
    DataUri(String),
}

impl ImageInput {
    pub fn bytes(bytes: Vec<u8>) -> Self {
        ImageInput::Upload {
            file_name: None,
            bytes,
        }
    }

    /// Normalize either variant to raw encoded image bytes.
    pub fn into_bytes(self) -> Result<Vec<u8>, DecodeError> {
        match self {
            ImageInput::Upload { file_name, bytes } => {
                if let Some(name) = file_name.as_deref() {
                    check_extension(name)?;
                }
                Ok(bytes)
            }
            ImageInput::DataUri(uri) => decode_data_uri(&uri),
        }
    }
}

fn check_extension(file_name: &str) -> Result<(), DecodeError> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match ext {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        other => Err(DecodeError::UnsupportedExtension(other)),
    }
}

/// Strip an optional `data:<mime>;base64,` header and decode the payload.
pub fn decode_data_uri(uri: &str) -> Result<Vec<u8>, DecodeError> {
    let uri = uri.trim();
    let payload = if let Some(rest) = uri.strip_prefix("data:") {
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| DecodeError::MalformedDataUri("missing ',' separator".into()))?;
        if !header.ends_with(";base64") {
            return Err(DecodeError::MalformedDataUri(format!(
                "expected base64 encoding, got header {header:?}"
            )));
        }
        payload
    } else {
        uri
    };

    if payload.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    Ok(general_purpose::STANDARD.decode(payload)?)
}

/// Decode encoded image bytes into an RGB raster.
pub fn decode(bytes: &[u8]) -> Result<Raster, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::EmptyPayload);
    }

    let format = image::guess_format(bytes).map_err(|_| DecodeError::UnsupportedFormat)?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::Gif) {
        return Err(DecodeError::UnsupportedFormat);
    }

    let rgb = image::load_from_memory_with_format(bytes, format)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    tracing::debug!(?format, width, height, "decoded image");

    Raster::from_rgb(width, height, rgb.into_raw()).ok_or(DecodeError::ZeroPixels)
}

/// Normalize an upload and decode it.
pub fn decode_input(input: ImageInput) -> Result<Raster, DecodeError> {
    let bytes = input.into_bytes()?;
    decode(&bytes)
}
