//! On-disk naming of plain downloads and cache entries.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use uuid::Uuid;

pub(crate) const PART_SUFFIX: &str = ".part";

pub(crate) fn download_name(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4())
}

pub(crate) fn cache_name(prefix: &str, key: &str) -> String {
    format!("{prefix}_{}", URL_SAFE.encode(key.as_bytes()))
}

/// Logical file name of a cache entry, if `file_name` is one.
pub(crate) fn decode_cache_name(prefix: &str, file_name: &str) -> Option<String> {
    let encoded = file_name.strip_prefix(prefix)?.strip_prefix('_')?;
    let bytes = URL_SAFE.decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// True for finished or in-flight plain downloads.
pub(crate) fn is_download_name(prefix: &str, file_name: &str) -> bool {
    file_name
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .map(|rest| rest.strip_suffix(PART_SUFFIX).unwrap_or(rest))
        .is_some_and(|id| Uuid::parse_str(id).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_names_decode_back() {
        let name = cache_name("pkgwarden_cache", "weather/module-1.2.zip");
        assert!(!name.contains('/'));
        assert_eq!(
            decode_cache_name("pkgwarden_cache", &name).as_deref(),
            Some("weather/module-1.2.zip")
        );
        assert_eq!(decode_cache_name("other", &name), None);
    }

    #[test]
    fn download_names_are_recognized_with_or_without_suffix() {
        let name = download_name("pkgwarden_dl");
        assert!(is_download_name("pkgwarden_dl", &name));
        assert!(is_download_name("pkgwarden_dl", &format!("{name}{PART_SUFFIX}")));
        assert!(!is_download_name("pkgwarden_dl", "pkgwarden_dl_notes.txt"));
        assert!(!is_download_name("pkgwarden_dl", &cache_name("pkgwarden_dl", "x")));
    }
}
