//! Fixtures shared by the test modules of this crate

use {
    crate::{fs_store::FsObjectStore, store::ObjectStore},
    anyhow::{anyhow, Result},
    async_trait::async_trait,
    bytes::Bytes,
    chrono::{NaiveDate, NaiveDateTime},
    exif::{experimental::Writer, Field, In, Rational, Tag, Value},
    futures::stream::BoxStream,
    image::{DynamicImage, ImageBuffer, ImageFormat, Rgb},
    std::{
        io::Cursor,
        path::Path,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Once,
        },
    },
};

pub fn init_logging() {
    static ONCE: Once = Once::new();

    ONCE.call_once(pretty_env_logger::init_timed);
}

pub fn datetime(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

pub fn ascii(tag: Tag, text: &str) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Ascii(vec![text.as_bytes().to_vec()]),
    }
}

pub fn rational(tag: Tag, num: u32, denom: u32) -> Field {
    Field {
        tag,
        ifd_num: In::PRIMARY,
        value: Value::Rational(vec![Rational { num, denom }]),
    }
}

/// Encode a solid-color image in the specified format
pub fn encode(width: u32, height: u32, color: Rgb<u8>, format: ImageFormat) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();

    DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, color))
        .write_to(&mut Cursor::new(&mut buffer), format)?;

    Ok(buffer)
}

fn tiff(fields: &[Field]) -> Result<Vec<u8>> {
    let mut writer = Writer::new();

    for field in fields {
        writer.push_field(field);
    }

    let mut buffer = Cursor::new(Vec::new());

    writer.write(&mut buffer, false)?;

    Ok(buffer.into_inner())
}

/// Insert an APP1 Exif segment holding `fields` into a JPEG image
pub fn with_exif(jpeg: &[u8], fields: &[Field]) -> Result<Vec<u8>> {
    if jpeg.len() < 2 {
        return Err(anyhow!("not a JPEG image"));
    }

    let tiff = tiff(fields)?;

    let mut result = jpeg[..2].to_vec();
    result.extend_from_slice(&[0xff, 0xe1]);
    result.extend_from_slice(&u16::try_from(tiff.len() + 8)?.to_be_bytes());
    result.extend_from_slice(b"Exif\0\0");
    result.extend_from_slice(&tiff);
    result.extend_from_slice(&jpeg[2..]);

    Ok(result)
}

/// Encode a lossy WebP image with an "EXIF" chunk holding `fields` appended
pub fn webp_with_exif(width: u32, height: u32, fields: &[Field]) -> Result<Vec<u8>> {
    let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(width, height, Rgb([90, 90, 90])));

    let mut webp = webp::Encoder::from_image(&image)
        .map_err(|e| anyhow!("{}", e))?
        .encode(80.0)
        .to_vec();

    let tiff = tiff(fields)?;

    webp.extend_from_slice(b"EXIF");
    webp.extend_from_slice(&u32::try_from(tiff.len())?.to_le_bytes());
    webp.extend_from_slice(&tiff);

    if tiff.len() % 2 != 0 {
        webp.push(0);
    }

    let riff_size = u32::try_from(webp.len() - 8)?;
    webp[4..8].copy_from_slice(&riff_size.to_le_bytes());

    Ok(webp)
}

fn iso_box(kind: &[u8; 4], body: &[u8]) -> Result<Vec<u8>> {
    let mut result = u32::try_from(body.len() + 8)?.to_be_bytes().to_vec();
    result.extend_from_slice(kind);
    result.extend_from_slice(body);

    Ok(result)
}

/// Build a HEIF file whose only item is an Exif block holding `fields`.  It carries no image data.
pub fn heif_with_exif(fields: &[Field]) -> Result<Vec<u8>> {
    let mut exif = 0_u32.to_be_bytes().to_vec();
    exif.extend_from_slice(&tiff(fields)?);

    let mut infe = 0x0200_0000_u32.to_be_bytes().to_vec();
    infe.extend_from_slice(&1_u16.to_be_bytes());
    infe.extend_from_slice(&0_u16.to_be_bytes());
    infe.extend_from_slice(b"Exif");

    let mut iinf = 0_u32.to_be_bytes().to_vec();
    iinf.extend_from_slice(&1_u16.to_be_bytes());
    iinf.extend_from_slice(&iso_box(b"infe", &infe)?);

    // Version 1, four byte offsets and lengths, one item stored in the "idat" box.
    let mut iloc = 0x0100_0000_u32.to_be_bytes().to_vec();
    iloc.extend_from_slice(&0x4400_u16.to_be_bytes());
    iloc.extend_from_slice(&1_u16.to_be_bytes());
    iloc.extend_from_slice(&1_u16.to_be_bytes());
    iloc.extend_from_slice(&1_u16.to_be_bytes());
    iloc.extend_from_slice(&0_u16.to_be_bytes());
    iloc.extend_from_slice(&1_u16.to_be_bytes());
    iloc.extend_from_slice(&0_u32.to_be_bytes());
    iloc.extend_from_slice(&u32::try_from(exif.len())?.to_be_bytes());

    let mut meta = 0_u32.to_be_bytes().to_vec();
    meta.extend_from_slice(&iso_box(b"iinf", &iinf)?);
    meta.extend_from_slice(&iso_box(b"iloc", &iloc)?);
    meta.extend_from_slice(&iso_box(b"idat", &exif)?);

    let mut result = iso_box(b"ftyp", b"heic\0\0\0\0mif1heic")?;
    result.extend_from_slice(&iso_box(b"meta", &meta)?);

    Ok(result)
}

/// An [FsObjectStore] which counts the writes made through it
pub struct CountingStore {
    inner: FsObjectStore,
    puts: AtomicUsize,
}

impl CountingStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: FsObjectStore::new(root),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.puts.store(0, Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn get(&self, container: &str, key: &str) -> Result<(Bytes, String)> {
        self.inner.get(container, key).await
    }

    async fn exists(&self, container: &str, key: &str) -> Result<bool> {
        self.inner.exists(container, key).await
    }

    async fn put(&self, container: &str, key: &str, data: Bytes) -> Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(container, key, data).await
    }

    async fn delete(&self, container: &str, key: &str) -> Result<()> {
        self.inner.delete(container, key).await
    }

    fn list<'a>(&'a self, container: &'a str) -> BoxStream<'a, Result<(String, String)>> {
        self.inner.list(container)
    }
}
