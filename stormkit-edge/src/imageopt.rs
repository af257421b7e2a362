//! Image variant optimization.
//!
//! Requested via `?size=<w>x<h>` (height optional) on image responses.
//! Variants are cached in the shared KV for 24 hours under
//! `<deploymentID>:<size><fileName>`, with a per-file variant budget
//! tracked under `<deploymentID>-<fileName>`. Oversized requests and
//! exhausted budgets serve the original bytes untouched.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::imageops::FilterType;
use std::io::Cursor;
use std::time::Duration;
use stormkit_core::DeploymentId;
use stormkit_storage::Kv;

pub const MAX_IMAGE_VARIANTS: i64 = 5;

/// Dimensions above this are never generated.
const MAX_DIMENSION: u32 = 2048;

const VARIANT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Parsed `size`/`smart` query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageQuery {
    pub width: u32,
    pub height: u32,
    pub smart: bool,
}

impl ImageQuery {
    /// Parse from raw query values. `size=300x200`, `size=300` (height
    /// free) and `smart=true` are accepted.
    pub fn parse(size: &str, smart: Option<&str>) -> Self {
        let (w, h) = match size.split_once('x') {
            Some((w, h)) => (w, h),
            None => (size, ""),
        };

        Self {
            width: w.parse().unwrap_or(0),
            height: h.parse().unwrap_or(0),
            smart: smart == Some("true"),
        }
    }
}

pub struct ImageOptimizer {
    kv: Kv,
}

impl ImageOptimizer {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    fn variant_key(deployment_id: DeploymentId, size: &str, file_name: &str) -> String {
        format!("{deployment_id}:{size}{file_name}")
    }

    fn counter_key(deployment_id: DeploymentId, file_name: &str) -> String {
        format!("{deployment_id}-{file_name}")
    }

    /// Look up a previously generated variant.
    pub async fn cached(
        &self,
        deployment_id: DeploymentId,
        size: &str,
        file_name: &str,
    ) -> Option<Vec<u8>> {
        let key = Self::variant_key(deployment_id, size, file_name);
        let encoded = self.kv.get(&key).await.ok()??;
        BASE64.decode(encoded).ok()
    }

    /// Produce (and cache) the requested variant, or return the original
    /// bytes when the request is out of policy or optimization fails.
    ///
    /// Cache writes are detached from the request: a canceled request must
    /// not lose the variant for subsequent requests.
    pub async fn optimize(
        &self,
        deployment_id: DeploymentId,
        size: &str,
        file_name: &str,
        query: ImageQuery,
        original: Vec<u8>,
    ) -> Vec<u8> {
        if query.width == 0 && query.height == 0 {
            return original;
        }

        if query.width > MAX_DIMENSION || query.height > MAX_DIMENSION {
            return original;
        }

        let counter_key = Self::counter_key(deployment_id, file_name);
        let variants: i64 = match self.kv.get(&counter_key).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0),
            // KV trouble degrades to "no cache", not to a failed request.
            Err(_) => 0,
        };

        if variants > MAX_IMAGE_VARIANTS {
            tracing::info!(file = file_name, "image already has too many variants");
            return original;
        }

        let optimized = match resize(&original, query) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("error while optimizing image: {e}");
                return original;
            }
        };

        let kv = self.kv.clone();
        let variant_key = Self::variant_key(deployment_id, size, file_name);
        let encoded = BASE64.encode(&optimized);
        tokio::spawn(async move {
            if let Err(e) = kv
                .set(&counter_key, &(variants + 1).to_string(), Some(VARIANT_TTL))
                .await
            {
                tracing::error!("error while writing image variant count: {e}");
            }
            if let Err(e) = kv.set(&variant_key, &encoded, Some(VARIANT_TTL)).await {
                tracing::error!("error while writing optimized image: {e}");
            }
        });

        optimized
    }
}

fn resize(content: &[u8], query: ImageQuery) -> Result<Vec<u8>, image::ImageError> {
    let format = image::guess_format(content)?;
    let img = image::load_from_memory_with_format(content, format)?;

    // A single zero dimension leaves that side free, preserving the
    // aspect ratio.
    let (width, height) = match (query.width, query.height) {
        (w, 0) => {
            let h = (u64::from(w) * u64::from(img.height()) / u64::from(img.width().max(1))) as u32;
            (w, h.max(1))
        }
        (0, h) => {
            let w = (u64::from(h) * u64::from(img.width()) / u64::from(img.height().max(1))) as u32;
            (w.max(1), h)
        }
        (w, h) => (w, h),
    };

    let resized = if query.smart {
        img.resize_to_fill(width, height, FilterType::Lanczos3)
    } else {
        img.resize_exact(width, height, FilterType::Lanczos3)
    };

    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, format)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_fixture(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::new_rgb8(width, height);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn dimensions(bytes: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(bytes).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(
            ImageQuery::parse("300x200", None),
            ImageQuery {
                width: 300,
                height: 200,
                smart: false
            }
        );
        assert_eq!(
            ImageQuery::parse("300", Some("true")),
            ImageQuery {
                width: 300,
                height: 0,
                smart: true
            }
        );
        assert_eq!(
            ImageQuery::parse("junk", None),
            ImageQuery {
                width: 0,
                height: 0,
                smart: false
            }
        );
    }

    #[tokio::test]
    async fn test_optimize_resizes_and_caches() {
        let optimizer = ImageOptimizer::new(Kv::in_memory());
        let original = png_fixture(100, 50);

        let out = optimizer
            .optimize(
                DeploymentId(1),
                "10x10",
                "/image.png",
                ImageQuery::parse("10x10", None),
                original,
            )
            .await;
        assert_eq!(dimensions(&out), (10, 10));

        // The detached cache write lands shortly after.
        for _ in 0..50 {
            if optimizer
                .cached(DeploymentId(1), "10x10", "/image.png")
                .await
                .is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("variant was not cached");
    }

    #[tokio::test]
    async fn test_oversized_request_bypasses() {
        let optimizer = ImageOptimizer::new(Kv::in_memory());
        let original = png_fixture(20, 20);

        let out = optimizer
            .optimize(
                DeploymentId(1),
                "4000x10",
                "/image.png",
                ImageQuery::parse("4000x10", None),
                original.clone(),
            )
            .await;
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn test_variant_budget_bypasses_at_cap() {
        let kv = Kv::in_memory();
        // Counter beyond the budget: bypass and return the original bytes.
        kv.set("1-/image.png", "6", None).await.unwrap();

        let optimizer = ImageOptimizer::new(kv);
        let original = png_fixture(20, 20);
        let out = optimizer
            .optimize(
                DeploymentId(1),
                "10x10",
                "/image.png",
                ImageQuery::parse("10x10", None),
                original.clone(),
            )
            .await;
        assert_eq!(out, original);
    }

    #[tokio::test]
    async fn test_single_dimension_preserves_aspect_ratio() {
        let optimizer = ImageOptimizer::new(Kv::in_memory());
        let original = png_fixture(100, 50);

        let out = optimizer
            .optimize(
                DeploymentId(2),
                "40",
                "/wide.png",
                ImageQuery::parse("40", None),
                original,
            )
            .await;
        assert_eq!(dimensions(&out), (40, 20));
    }

    #[tokio::test]
    async fn test_garbage_bytes_fall_back_to_original() {
        let optimizer = ImageOptimizer::new(Kv::in_memory());
        let garbage = b"definitely not an image".to_vec();

        let out = optimizer
            .optimize(
                DeploymentId(3),
                "10x10",
                "/x.png",
                ImageQuery::parse("10x10", None),
                garbage.clone(),
            )
            .await;
        assert_eq!(out, garbage);
    }
}
