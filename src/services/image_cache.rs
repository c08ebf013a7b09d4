// src/services/image_cache.rs

//! Content-addressed cache of resized show images.
//!
//! An image URL maps to a stable name derived from its hash. The first
//! request downloads, resizes and stores the image; later requests for the
//! same URL are answered from storage without touching the network.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageFormat, ImageReader};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::Result;
use crate::models::{CollectorConfig, ImageConfig};
use crate::storage::BlobStore;
use crate::utils::security::{SecurityError, UrlValidator};

/// Hex characters of the URL hash kept in a cache name.
const STEM_LEN: usize = 24;
const MAX_REDIRECTS: usize = 5;
const JPEG_QUALITY: u8 = 80;

/// Why an image could not be cached.
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("refusing {url}: {reason}")]
    Refused { url: String, reason: SecurityError },

    #[error("fetching {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} is not an image ({content_type})")]
    NotImage { url: String, content_type: String },

    #[error("{url} is larger than {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("{url} is {width}x{height}, over the {limit}px limit")]
    TooManyPixels {
        url: String,
        width: u32,
        height: u32,
        limit: u32,
    },

    #[error("decoding {url}: {message}")]
    Decode { url: String, message: String },

    #[error("storing {name}: {message}")]
    Store { name: String, message: String },
}

/// A stored image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedImage {
    /// Name within the image namespace, e.g. `3f2a...9c.jpg`
    pub name: String,

    /// True if the image was already stored before this request
    pub was_cached: bool,
}

/// Stable cache stem for an image URL.
pub fn cache_stem(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut stem = hex::encode(digest);
    stem.truncate(STEM_LEN);
    stem
}

/// Image cache over the pix namespace.
#[derive(Clone)]
pub struct ImageCache {
    store: Arc<dyn BlobStore>,
    client: reqwest::Client,
    validator: UrlValidator,
    config: ImageConfig,
}

impl ImageCache {
    /// Build an image cache with its own HTTP client.
    ///
    /// The client re-validates every redirect hop against the same address
    /// policy as the original URL.
    pub fn new(
        store: Arc<dyn BlobStore>,
        collector: &CollectorConfig,
        config: &ImageConfig,
    ) -> Result<Self> {
        let validator = config
            .allowed_hosts
            .iter()
            .fold(UrlValidator::new(), |v, host| v.allow_host(host));

        let redirect_validator = validator.clone();
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if redirect_validator.validate(attempt.url().as_str()).is_err() {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .user_agent(&collector.user_agent)
            .timeout(Duration::from_secs(collector.timeout_secs))
            .redirect(policy)
            .build()?;

        Ok(Self {
            store,
            client,
            validator,
            config: config.clone(),
        })
    }

    /// Return the cached copy of an image, fetching and storing it first if
    /// needed.
    pub async fn get_or_fetch(&self, url: &str) -> std::result::Result<CachedImage, ImageError> {
        let url = UrlValidator::normalize(url);
        let refused = |reason| ImageError::Refused {
            url: url.clone(),
            reason,
        };
        self.validator.validate(&url).map_err(refused)?;

        let stem = cache_stem(&url);
        if let Some(entry) = self.store.has(&stem).await {
            log::debug!("Image cache hit {} for {}", entry.name, url);
            return Ok(CachedImage {
                name: entry.name,
                was_cached: true,
            });
        }

        let target = if self.config.resolve_dns {
            self.validator.validate_with_dns(&url).await
        } else {
            self.validator.validate(&url)
        }
        .map_err(refused)?;

        let bytes = self.download(target, &url).await?;

        let config = self.config.clone();
        let source_url = url.clone();
        let (encoded, format) =
            tokio::task::spawn_blocking(move || shrink(&bytes, &config, &source_url))
                .await
                .map_err(|e| ImageError::Decode {
                    url: url.clone(),
                    message: e.to_string(),
                })??;

        let (ext, content_type) = match format {
            ImageFormat::Jpeg => ("jpg", "image/jpeg"),
            _ => ("png", "image/png"),
        };
        let name = format!("{stem}.{ext}");
        self.store
            .put(&name, content_type, &encoded)
            .await
            .map_err(|e| ImageError::Store {
                name: name.clone(),
                message: e.to_string(),
            })?;

        log::info!("Cached {} as {} ({} bytes)", url, name, encoded.len());
        Ok(CachedImage {
            name,
            was_cached: false,
        })
    }

    /// Remove every stored image.
    pub async fn purge(&self) -> Result<usize> {
        self.store.purge().await
    }

    /// Download with the configured byte ceiling.
    async fn download(
        &self,
        target: url::Url,
        url: &str,
    ) -> std::result::Result<Vec<u8>, ImageError> {
        let fetch_error = |e: reqwest::Error| ImageError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        };
        let too_large = || ImageError::TooLarge {
            url: url.to_string(),
            limit: self.config.max_bytes,
        };

        let mut response = self.client.get(target).send().await.map_err(fetch_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImageError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(ImageError::NotImage {
                url: url.to_string(),
                content_type,
            });
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.config.max_bytes)
        {
            return Err(too_large());
        }

        // Content-Length can be absent or wrong; count while streaming too
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(fetch_error)? {
            if (body.len() + chunk.len()) as u64 > self.config.max_bytes {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

/// Decode and resize an image, returning the encoded bytes and their format.
///
/// Dimensions are read from the header before the full decode so oversized
/// images are refused without allocating their pixels. Images narrower than
/// the target width are kept at their size.
fn shrink(
    bytes: &[u8],
    config: &ImageConfig,
    url: &str,
) -> std::result::Result<(Vec<u8>, ImageFormat), ImageError> {
    let decode_error = |e: &dyn std::fmt::Display| ImageError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    };
    let reader = || {
        ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| decode_error(&e))
    };

    let sniffed = reader()?;
    let source_format = sniffed.format();
    let (width, height) = sniffed.into_dimensions().map_err(|e| decode_error(&e))?;
    if width > config.max_dimension || height > config.max_dimension {
        return Err(ImageError::TooManyPixels {
            url: url.to_string(),
            width,
            height,
            limit: config.max_dimension,
        });
    }

    let mut img = reader()?.decode().map_err(|e| decode_error(&e))?;
    if width > config.target_width {
        let new_height = ((u64::from(height) * u64::from(config.target_width))
            / u64::from(width))
        .max(1) as u32;
        img = img.resize_exact(config.target_width, new_height, FilterType::Triangle);
    }

    let opaque_jpeg = source_format == Some(ImageFormat::Jpeg) && !img.color().has_alpha();
    let mut out = Vec::new();
    if opaque_jpeg {
        let rgb = img.to_rgb8();
        JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .encode(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                ExtendedColorType::Rgb8,
            )
            .map_err(|e| decode_error(&e))?;
        Ok((out, ImageFormat::Jpeg))
    } else {
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .map_err(|e| decode_error(&e))?;
        Ok((out, ImageFormat::Png))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use image::{DynamicImage, Rgb, RgbImage};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 40, 40])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), format).unwrap();
        out
    }

    fn test_cache(store: Arc<MemoryStorage>, config: ImageConfig) -> ImageCache {
        let config = ImageConfig {
            resolve_dns: false,
            allowed_hosts: vec!["127.0.0.1".to_string()],
            ..config
        };
        ImageCache::new(store, &CollectorConfig::default(), &config).unwrap()
    }

    async fn serve(server: &MockServer, route: &str, body: Vec<u8>, content_type: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type))
            .expect(1)
            .mount(server)
            .await;
    }

    fn dimensions(bytes: &[u8]) -> (u32, u32) {
        image::load_from_memory(bytes).unwrap().into_rgb8().dimensions()
    }

    #[test]
    fn test_cache_stem_is_stable() {
        let a = cache_stem("https://example.com/a.jpg");
        assert_eq!(a.len(), 24);
        assert_eq!(a, cache_stem("https://example.com/a.jpg"));
        assert_ne!(a, cache_stem("https://example.com/b.jpg"));
    }

    #[tokio::test]
    async fn test_second_request_is_cached() {
        let server = MockServer::start().await;
        serve(&server, "/poster.png", encoded(600, 400, ImageFormat::Png), "image/png").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let cache = test_cache(store.clone(), ImageConfig::default());
        let url = format!("{}/poster.png", server.uri());

        let first = cache.get_or_fetch(&url).await.unwrap();
        assert!(!first.was_cached);
        assert!(first.name.ends_with(".png"));
        assert!(first.name.starts_with(&cache_stem(&url)));

        let second = cache.get_or_fetch(&url).await.unwrap();
        assert!(second.was_cached);
        assert_eq!(second.name, first.name);

        let stored = store.get(&first.name).await.unwrap();
        assert_eq!(dimensions(&stored), (300, 200));
        assert_eq!(
            store.content_type(&first.name).await.as_deref(),
            Some("image/png")
        );
    }

    #[tokio::test]
    async fn test_jpeg_stays_jpeg() {
        let server = MockServer::start().await;
        serve(&server, "/p.jpg", encoded(900, 900, ImageFormat::Jpeg), "image/jpeg").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let cache = test_cache(store.clone(), ImageConfig::default());

        let image = cache
            .get_or_fetch(&format!("{}/p.jpg", server.uri()))
            .await
            .unwrap();
        assert!(image.name.ends_with(".jpg"));
        let stored = store.get(&image.name).await.unwrap();
        assert_eq!(dimensions(&stored), (300, 300));
    }

    #[tokio::test]
    async fn test_small_images_are_not_upscaled() {
        let server = MockServer::start().await;
        serve(&server, "/small.png", encoded(120, 80, ImageFormat::Png), "image/png").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let cache = test_cache(store.clone(), ImageConfig::default());

        let image = cache
            .get_or_fetch(&format!("{}/small.png", server.uri()))
            .await
            .unwrap();
        let stored = store.get(&image.name).await.unwrap();
        assert_eq!(dimensions(&stored), (120, 80));
    }

    #[tokio::test]
    async fn test_rejects_non_image_content() {
        let server = MockServer::start().await;
        serve(&server, "/page", b"<html></html>".to_vec(), "text/html").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let cache = test_cache(store.clone(), ImageConfig::default());

        let err = cache
            .get_or_fetch(&format!("{}/page", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::NotImage { .. }));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_oversized_download() {
        let server = MockServer::start().await;
        serve(&server, "/big.png", encoded(600, 400, ImageFormat::Png), "image/png").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let config = ImageConfig {
            max_bytes: 64,
            ..ImageConfig::default()
        };
        let cache = test_cache(store, config);

        let err = cache
            .get_or_fetch(&format!("{}/big.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::TooLarge { limit: 64, .. }));
    }

    #[tokio::test]
    async fn test_rejects_oversized_dimensions() {
        let server = MockServer::start().await;
        serve(&server, "/wide.png", encoded(500, 20, ImageFormat::Png), "image/png").await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let config = ImageConfig {
            max_dimension: 400,
            ..ImageConfig::default()
        };
        let cache = test_cache(store, config);

        let err = cache
            .get_or_fetch(&format!("{}/wide.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::TooManyPixels { width: 500, .. }));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cache = test_cache(Arc::new(MemoryStorage::new("pix")), ImageConfig::default());
        let err = cache
            .get_or_fetch(&format!("{}/gone.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_redirect_to_metadata_address_is_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/hop.png"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "http://169.254.169.254/latest/meta-data"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStorage::new("pix"));
        let cache = test_cache(store.clone(), ImageConfig::default());

        let err = cache
            .get_or_fetch(&format!("{}/hop.png", server.uri()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ImageError::Status { status: 302, .. }),
            "unexpected error: {err:?}"
        );
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refuses_internal_addresses() {
        let cache = ImageCache::new(
            Arc::new(MemoryStorage::new("pix")),
            &CollectorConfig::default(),
            &ImageConfig::default(),
        )
        .unwrap();

        for url in [
            "http://127.0.0.1/a.png",
            "http://169.254.169.254/latest/meta-data",
            "http://localhost/a.png",
            "file:///etc/passwd",
        ] {
            let err = cache.get_or_fetch(url).await.unwrap_err();
            assert!(matches!(err, ImageError::Refused { .. }), "{url}");
        }
    }
}
