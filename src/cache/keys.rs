//! Memory cache key format shared with downstream decode consumers
//!
//! Keys look like `mem:1a2b3c4d:0007.jpg`: a fixed namespace prefix, the
//! gallery id, a 4-digit 1-based page index and the image extension.

/// Namespace prefix separating memory-resident buffers from filesystem paths
pub const MEMORY_PREFIX: &str = "mem:";

/// Number of hex characters kept from the gallery URL digest
pub const GALLERY_ID_LEN: usize = 8;

const DEFAULT_EXTENSION: &str = ".jpg";
const KNOWN_EXTENSIONS: [&str; 6] = ["jpg", "jpeg", "png", "gif", "webp", "bmp"];

/// Short fixed-width id for a gallery URL.
#[must_use]
pub fn gallery_id(gallery_url: &str) -> String {
    let digest = md5::compute(gallery_url.trim().as_bytes());
    format!("{digest:x}")[..GALLERY_ID_LEN].to_string()
}

/// Build the memory key for a 0-based page index.
#[must_use]
pub fn memory_key(gallery_id: &str, index: usize, extension: &str) -> String {
    let extension = if extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{extension}")
    };
    format!("{MEMORY_PREFIX}{gallery_id}:{:04}{extension}", index + 1)
}

/// Prefix matching every key of one gallery, for bulk removal.
#[must_use]
pub fn gallery_prefix(gallery_id: &str) -> String {
    format!("{MEMORY_PREFIX}{gallery_id}:")
}

#[must_use]
pub fn is_memory_key(key: &str) -> bool {
    key.len() > MEMORY_PREFIX.len() && key.starts_with(MEMORY_PREFIX)
}

/// Split a memory key back into `(gallery_id, 0-based index)`.
#[must_use]
pub fn parse_memory_key(key: &str) -> Option<(&str, usize)> {
    let rest = key.strip_prefix(MEMORY_PREFIX)?;
    let (gallery, file) = rest.split_once(':')?;
    let digits: &str = file.split('.').next()?;
    if gallery.is_empty() || digits.len() < 4 {
        return None;
    }
    let one_based: usize = digits.parse().ok()?;
    Some((gallery, one_based.checked_sub(1)?))
}

/// Image extension (with leading dot) taken from the URL path.
///
/// Query strings and fragments are ignored, `.jpeg` is folded into `.jpg`,
/// and anything unrecognised falls back to `.jpg`.
#[must_use]
pub fn image_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);

    let Some((_, ext)) = file.rsplit_once('.') else {
        return DEFAULT_EXTENSION.to_string();
    };
    let ext = ext.to_ascii_lowercase();
    if !KNOWN_EXTENSIONS.contains(&ext.as_str()) {
        return DEFAULT_EXTENSION.to_string();
    }
    if ext == "jpeg" {
        return DEFAULT_EXTENSION.to_string();
    }
    format!(".{ext}")
}
