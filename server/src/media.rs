//! This module generates the downscaled WebP preview ("derived image") of a source image.

use {
    crate::{
        metadata,
        store::{Blob, ObjectStore},
    },
    anyhow::{anyhow, Result},
    bytes::Bytes,
    image::{imageops::FilterType, DynamicImage, GenericImageView},
    mime::Mime,
    std::path::Path,
    tokio::task,
    tracing::debug,
};

pub const PREVIEW_EXTENSION: &str = "webp";

const WEBP_QUALITY: f32 = 85.0;

/// Previews are shrunk by the largest integer factor which keeps their short side at or above this size
const PREVIEW_SHORT_SIDE: u32 = 500;

/// Return true if `content_type` is in the image family (e.g. "image/jpeg")
pub fn is_image(content_type: &str) -> bool {
    content_type
        .parse::<Mime>()
        .map(|mime| mime.type_() == mime::IMAGE)
        .unwrap_or(false)
}

/// Name of the preview of the object named `key`: the same directory and stem, with a WebP extension
pub fn preview_name(key: &str) -> String {
    let (dir, file) = match key.rfind('/') {
        Some(index) => key.split_at(index + 1),
        None => ("", key),
    };

    let stem = Path::new(file)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file);

    format!("{}{}.{}", dir, stem, PREVIEW_EXTENSION)
}

/// Integer factor by which both dimensions of an image are divided to produce its preview
pub fn downscale_factor(width: u32, height: u32) -> u32 {
    (width.min(height) / PREVIEW_SHORT_SIDE).max(1)
}

/// Rotate and/or flip an image so that it is upright according to its EXIF orientation
fn orient(image: DynamicImage, orientation: Option<u32>) -> DynamicImage {
    match orientation {
        Some(2) => image.fliph(),
        Some(3) => image.rotate180(),
        Some(4) => image.flipv(),
        Some(5) => image.rotate90().fliph(),
        Some(6) => image.rotate90(),
        Some(7) => image.rotate270().fliph(),
        Some(8) => image.rotate270(),
        _ => image,
    }
}

/// Decode an ISO base media image with libheif, which applies the container's own rotation and mirroring
#[cfg(feature = "heif")]
fn decode_iso(data: &[u8]) -> Result<DynamicImage> {
    use {
        image::RgbImage,
        libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma},
    };

    let context = HeifContext::read_from_bytes(data)?;
    let handle = context.primary_image_handle()?;
    let decoded = LibHeif::new().decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)?;

    let plane = decoded
        .planes()
        .interleaved
        .ok_or_else(|| anyhow!("decoded HEIF image has no interleaved plane"))?;

    let row = plane.width as usize * 3;
    let mut pixels = Vec::with_capacity(row * plane.height as usize);

    for line in plane.data.chunks(plane.stride).take(plane.height as usize) {
        pixels.extend_from_slice(
            line.get(..row)
                .ok_or_else(|| anyhow!("truncated HEIF image row"))?,
        );
    }

    Ok(DynamicImage::ImageRgb8(
        RgbImage::from_raw(plane.width, plane.height, pixels)
            .ok_or_else(|| anyhow!("truncated HEIF image"))?,
    ))
}

#[cfg(not(feature = "heif"))]
fn decode_iso(_data: &[u8]) -> Result<DynamicImage> {
    Err(anyhow!(
        "unsupported format: HEIF/AVIF decoding requires the `heif` feature"
    ))
}

/// Decode an image and make it upright
fn decode(data: &[u8]) -> Result<DynamicImage> {
    if metadata::is_iso_image(data) {
        decode_iso(data)
    } else {
        Ok(orient(
            image::load_from_memory(data)?,
            metadata::orientation(data),
        ))
    }
}

fn render(data: &[u8]) -> Result<Vec<u8>> {
    let upright = DynamicImage::ImageRgb8(decode(data)?.to_rgb8());

    let (width, height) = upright.dimensions();
    let factor = downscale_factor(width, height);

    let resized = if factor > 1 {
        upright.resize_exact(width / factor, height / factor, FilterType::Lanczos3)
    } else {
        upright
    };

    Ok(webp::Encoder::from_image(&resized)
        .map_err(|e| anyhow!("{}", e))?
        .encode(WEBP_QUALITY)
        .to_vec())
}

/// Generate the preview of `blob`, storing it beside the source, and return its name.
///
/// Returns `Ok(None)` without touching the store if `blob` is not an image.  If an object already exists under
/// the preview name, nothing is generated and that name is returned, which makes repeated and concurrent calls for
/// the same source harmless.  Decoding and upload failures are returned to the caller.
pub async fn derive_preview(store: &dyn ObjectStore, blob: &Blob) -> Result<Option<String>> {
    if !is_image(&blob.content_type) {
        return Ok(None);
    }

    let name = preview_name(&blob.key);

    if store.exists(&blob.container, &name).await? {
        debug!("preview {}/{} already exists", blob.container, name);

        return Ok(Some(name));
    }

    let data = blob.data.clone();
    let encoded = task::spawn_blocking(move || render(&data)).await??;

    store
        .put(&blob.container, &name, Bytes::from(encoded))
        .await?;

    debug!("generated preview {}/{}", blob.container, name);

    Ok(Some(name))
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::test_util::{self, CountingStore},
        exif::{Field, In, Tag, Value},
        image::{ImageFormat, Rgb},
        tempfile::TempDir,
    };

    fn decode_webp(data: &[u8]) -> Result<(u32, u32)> {
        Ok(webp::Decoder::new(data)
            .decode()
            .map(|image| image.to_image())
            .ok_or_else(|| anyhow!("invalid WebP image"))?
            .dimensions())
    }

    async fn source(store: &CountingStore, key: &str, data: Vec<u8>) -> Result<Blob> {
        store.put("photos", key, Bytes::from(data)).await?;
        store.reset();
        store.blob("photos", key).await
    }

    #[test]
    fn preview_names() {
        assert_eq!("20230525_192803.webp", preview_name("20230525_192803.jpg"));
        assert_eq!("album/a.b.webp", preview_name("album/a.b.png"));
        assert_eq!("album/noext.webp", preview_name("album/noext"));
        assert_eq!("x/y/IMG_1.webp", preview_name("x/y/IMG_1.HEIC"));
    }

    #[test]
    fn downscale_factors() {
        assert_eq!(1, downscale_factor(400, 300));
        assert_eq!(1, downscale_factor(1000, 999));
        assert_eq!(2, downscale_factor(1200, 1000));
        assert_eq!(6, downscale_factor(4032, 3024));
        assert_eq!(1, downscale_factor(0, 0));
    }

    #[test]
    fn image_family() {
        assert!(is_image("image/jpeg"));
        assert!(is_image("image/heic"));
        assert!(!is_image("video/mp4"));
        assert!(!is_image("application/octet-stream"));
        assert!(!is_image("garbage"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn generates_once() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let blob = source(
            &store,
            "album/big.jpg",
            test_util::encode(1200, 1000, Rgb([200, 10, 10]), ImageFormat::Jpeg)?,
        )
        .await?;

        assert_eq!(
            Some("album/big.webp".to_string()),
            derive_preview(&store, &blob).await?
        );
        assert_eq!(1, store.puts());

        assert_eq!(
            Some("album/big.webp".to_string()),
            derive_preview(&store, &blob).await?
        );
        assert_eq!(1, store.puts());

        let (data, _) = store.get("photos", "album/big.webp").await?;

        assert_eq!((600, 500), decode_webp(&data)?);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn small_images_keep_their_size() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let blob = source(
            &store,
            "small.png",
            test_util::encode(64, 48, Rgb([10, 200, 10]), ImageFormat::Png)?,
        )
        .await?;

        derive_preview(&store, &blob).await?;

        let (data, _) = store.get("photos", "small.webp").await?;

        assert_eq!((64, 48), decode_webp(&data)?);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn previews_are_upright() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let jpeg = test_util::with_exif(
            &test_util::encode(40, 20, Rgb([10, 10, 200]), ImageFormat::Jpeg)?,
            &[Field {
                tag: Tag::Orientation,
                ifd_num: In::PRIMARY,
                value: Value::Short(vec![6]),
            }],
        )?;

        let blob = source(&store, "rotated.jpg", jpeg).await?;

        derive_preview(&store, &blob).await?;

        let (data, _) = store.get("photos", "rotated.webp").await?;

        assert_eq!((20, 40), decode_webp(&data)?);

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn non_images_are_skipped() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let blob = source(&store, "notes.txt", b"hello".to_vec()).await?;

        assert_eq!(None, derive_preview(&store, &blob).await?);
        assert_eq!(0, store.puts());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn heif_sources_take_the_iso_path() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let heif = test_util::heif_with_exif(&[test_util::ascii(
            Tag::DateTimeOriginal,
            "2021:06:07 08:09:10",
        )])?;

        let blob = source(&store, "IMG_0001.HEIC", heif).await?;

        assert_eq!("image/heic", blob.content_type);

        // The fixture holds no coded image, so decoding fails whichever way HEIF support is built.
        let error = derive_preview(&store, &blob)
            .await
            .err()
            .ok_or_else(|| anyhow!("expected a decode failure"))?;

        if cfg!(not(feature = "heif")) {
            assert!(error.to_string().starts_with("unsupported format"), "{}", error);
        }

        assert!(!error.to_string().contains("could not be determined"), "{}", error);
        assert_eq!(0, store.puts());

        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn decode_failures_propagate() -> Result<()> {
        let dir = TempDir::new()?;
        let store = CountingStore::new(dir.path());

        let blob = source(&store, "broken.jpg", b"not a jpeg".to_vec()).await?;

        assert!(derive_preview(&store, &blob).await.is_err());
        assert_eq!(0, store.puts());
        assert!(!store.exists("photos", "broken.webp").await?);

        Ok(())
    }
}
