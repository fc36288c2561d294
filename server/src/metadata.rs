//! This module extracts the embedded tags (EXIF) of an image into a flat, normalized [Metadata] mapping.

use {
    anyhow::Result,
    exif::{Context, Exif, Field, In, Reader, Tag, Value},
    image::ImageFormat,
    photos_shared::{Metadata, TagValue},
    serde_json::Value as JsonValue,
    std::io::Cursor,
};

/// How a container format carries its embedded tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagLayout {
    /// The format defines no tag schema
    Untagged,

    /// Tags live in a native tag directory of the container
    Directory,

    /// Tags are an opaque Exif block stored in a RIFF chunk
    RiffChunk,

    /// Tags are an opaque Exif item of an ISO base media file (HEIF and friends)
    IsoItem,
}

impl TagLayout {
    fn embedded(self) -> bool {
        matches!(self, TagLayout::RiffChunk | TagLayout::IsoItem)
    }
}

/// Brands identifying HEIF images, which the `image` crate does not recognize
static HEIF_BRANDS: &[&[u8]] = &[
    b"heic", b"heix", b"hevc", b"hevx", b"heim", b"heis", b"mif1", b"msf1",
];

/// Conventional names of the tags whose names differ from those the `exif` crate uses.  Other tags the crate
/// knows keep its name, and tags it does not know are keyed by their number.
static CONVENTIONAL_NAMES: &[(Tag, &str)] = &[
    (Tag::ExifIFDPointer, "ExifOffset"),
    (Tag::GPSInfoIFDPointer, "GPSInfo"),
    (Tag::InteropIFDPointer, "ExifInteroperabilityOffset"),
    (Tag::JPEGInterchangeFormat, "JpegIFOffset"),
    (Tag::JPEGInterchangeFormatLength, "JpegIFByteCount"),
    (Tag::PhotographicSensitivity, "ISOSpeedRatings"),
    (Tag::SubSecTime, "SubsecTime"),
    (Tag::SubSecTimeOriginal, "SubsecTimeOriginal"),
    (Tag::SubSecTimeDigitized, "SubsecTimeDigitized"),
    (Tag::FlashpixVersion, "FlashPixVersion"),
    (Tag::PixelXDimension, "ExifImageWidth"),
    (Tag::PixelYDimension, "ExifImageHeight"),
    (Tag::SourceImageNumberOfCompositeImage, "SourceImageNumberCompositeImage"),
    (Tag::SourceExposureTimesOfCompositeImage, "SourceExposureTimesCompositeImage"),
    (Tag::InteroperabilityIndex, "InteropIndex"),
    (Tag::InteroperabilityVersion, "InteropVersion"),
];

fn tag_name(tag: Tag) -> String {
    if let Some((_, name)) = CONVENTIONAL_NAMES.iter().find(|(known, _)| *known == tag) {
        (*name).to_owned()
    } else if tag.description().is_some() {
        tag.to_string()
    } else {
        tag.number().to_string()
    }
}

fn tag_layout(data: &[u8]) -> Result<TagLayout> {
    if data.len() >= 12 && &data[4..8] == b"ftyp" && HEIF_BRANDS.contains(&&data[8..12]) {
        return Ok(TagLayout::IsoItem);
    }

    Ok(match image::guess_format(data)? {
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Tiff => TagLayout::Directory,
        ImageFormat::WebP => TagLayout::RiffChunk,
        ImageFormat::Avif => TagLayout::IsoItem,
        _ => TagLayout::Untagged,
    })
}

/// Return true if `data` is an ISO base media image (e.g. HEIF or AVIF), which the `image` crate cannot decode
pub fn is_iso_image(data: &[u8]) -> bool {
    matches!(tag_layout(data), Ok(TagLayout::IsoItem))
}

/// Find the payload of the "EXIF" chunk of a RIFF (e.g. WebP) file, minus any "Exif\0\0" preamble
fn riff_exif_chunk(data: &[u8]) -> Option<&[u8]> {
    let mut offset = 12;

    while offset + 8 <= data.len() {
        let fourcc = &data[offset..offset + 4];
        let size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;

        let start = offset + 8;
        let end = start.checked_add(size)?;

        if end > data.len() {
            return None;
        }

        if fourcc == b"EXIF" {
            let payload = &data[start..end];

            return Some(payload.strip_prefix(b"Exif\0\0").unwrap_or(payload));
        }

        // Chunks are padded to an even length.
        offset = end + (size & 1);
    }

    None
}

fn read_container(data: &[u8]) -> Result<Option<Exif>> {
    match Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif) => Ok(Some(exif)),
        Err(exif::Error::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_tags(data: &[u8], layout: TagLayout) -> Result<Option<Exif>> {
    match layout {
        TagLayout::Untagged => Ok(None),
        TagLayout::RiffChunk => riff_exif_chunk(data)
            .map(|block| Reader::new().read_raw(block.to_vec()))
            .transpose()
            .map_err(anyhow::Error::from),
        TagLayout::Directory | TagLayout::IsoItem => read_container(data),
    }
}

fn single_or_sequence<T>(
    items: impl IntoIterator<Item = T>,
    convert: impl Fn(T) -> TagValue,
) -> TagValue {
    let mut values = items.into_iter().map(convert).collect::<Vec<_>>();

    if values.len() == 1 {
        values.remove(0)
    } else {
        TagValue::Sequence(values)
    }
}

/// Convert a decoded field into a (not yet normalized) [TagValue]
fn tag_value(field: &Field) -> TagValue {
    match &field.value {
        Value::Byte(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::SByte(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::Short(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::SShort(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::Long(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::SLong(v) => single_or_sequence(v, |&n| TagValue::Integer(n.into())),
        Value::Float(v) => single_or_sequence(v, |&n| TagValue::Float(n.into())),
        Value::Double(v) => single_or_sequence(v, |&n| TagValue::Float(n)),
        Value::Ascii(v) => single_or_sequence(v, |s| TagValue::Bytes(s.clone())),
        Value::Undefined(bytes, _) => TagValue::Bytes(bytes.clone()),
        Value::Rational(v) => single_or_sequence(v, |r| TagValue::Rational {
            numerator: r.num.into(),
            denominator: r.denom.into(),
        }),
        Value::SRational(v) => single_or_sequence(v, |r| TagValue::Rational {
            numerator: r.num.into(),
            denominator: r.denom.into(),
        }),
        _ => TagValue::Raw(JsonValue::String(field.display_value().to_string())),
    }
}

/// Extract the embedded tags of an image.
///
/// Returns an empty mapping for content which is not an image or whose format defines no tags.  Formats which
/// embed their tags as an opaque Exif block (WebP, HEIF) only contribute the tags of that block's Exif directory.
pub fn extract(data: &[u8], content_type: &str) -> Result<Metadata> {
    if !crate::media::is_image(content_type) {
        return Ok(Metadata::new());
    }

    let layout = tag_layout(data)?;

    let exif = if let Some(exif) = read_tags(data, layout)? {
        exif
    } else {
        return Ok(Metadata::new());
    };

    Ok(exif
        .fields()
        .filter(|field| field.ifd_num == In::PRIMARY)
        .filter(|field| !layout.embedded() || field.tag.context() == Context::Exif)
        .map(|field| (tag_name(field.tag), tag_value(field).normalize().flatten()))
        .collect())
}

/// Read the EXIF orientation (1 through 8) of an image, if it has one
pub fn orientation(data: &[u8]) -> Option<u32> {
    read_container(data)
        .ok()
        .flatten()?
        .get_field(Tag::Orientation, In::PRIMARY)?
        .value
        .get_uint(0)
}
