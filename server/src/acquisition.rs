//! This module determines when a photo was taken, from its embedded tags or, failing that, its filename.

use {
    chrono::{DateTime, NaiveDateTime, Utc},
    lazy_static::lazy_static,
    photos_shared::Metadata,
    regex::Regex,
    std::path::Path,
};

/// Tag holding the time the photo was originally captured
const CAPTURE_TIME_TAG: &str = "DateTimeOriginal";

const CAPTURE_TIME_FORMAT: &str = "%Y:%m:%d %H:%M:%S";

const FILENAME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// The timestamp used when no acquisition time can be determined: the start of the Unix epoch
pub fn sentinel() -> NaiveDateTime {
    DateTime::<Utc>::UNIX_EPOCH.naive_utc()
}

fn from_metadata(metadata: &Metadata) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(
        metadata.get(CAPTURE_TIME_TAG)?.as_text()?.trim(),
        CAPTURE_TIME_FORMAT,
    )
    .ok()
}

fn from_filename(blob_name: &str) -> Option<NaiveDateTime> {
    lazy_static! {
        static ref FILENAME_PATTERN: Regex = Regex::new(
            r"^\d{4}(0[1-9]|1[0-2])(0[1-9]|[12]\d|3[01])_([01]\d|2[0-3])([0-5]\d){2}$"
        )
        .unwrap();
    }

    let stem = Path::new(blob_name).file_stem()?.to_str()?;

    if FILENAME_PATTERN.is_match(stem) {
        // The pattern admits days which do not exist in a given month (e.g. 20230231), which parsing rejects.
        NaiveDateTime::parse_from_str(stem, FILENAME_FORMAT).ok()
    } else {
        None
    }
}

/// Determine when a photo was taken.
///
/// If `metadata` is non-empty, only its capture time tag is consulted.  The filename (e.g. "20230525_192803.jpg")
/// is consulted only when `metadata` is empty.  In every other case, and whenever parsing fails, [sentinel] is
/// returned.
pub fn resolve(metadata: &Metadata, blob_name: &str) -> NaiveDateTime {
    if !metadata.is_empty() {
        from_metadata(metadata)
    } else {
        from_filename(blob_name)
    }
    .unwrap_or_else(sentinel)
}
