//! Minimal `multipart/form-data` reader for Pebble file downloads.
//!
//! Pebble answers `GET /v1/files?action=read` with a multipart body holding one
//! `files` part per requested path followed by a `response` part with the usual
//! JSON envelope.

/// Extract the `boundary` parameter of a multipart content type.
pub fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .filter(|b| !b.is_empty())
}

/// Content of the first part whose form name is `name`.
pub fn named_part<'a>(body: &'a [u8], boundary: &str, name: &str) -> Option<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let wanted = format!("name=\"{name}\"");

    split_on(body, delimiter.as_bytes())
        .into_iter()
        .find_map(|part| {
            let part = part.strip_prefix(b"\r\n")?;
            let header_end = find(part, b"\r\n\r\n")?;
            let headers = std::str::from_utf8(part.get(..header_end)?).ok()?;
            let content = part.get(header_end..)?.strip_prefix(b"\r\n\r\n")?;
            let content = content.strip_suffix(b"\r\n").unwrap_or(content);

            headers
                .lines()
                .any(|line| {
                    line.to_ascii_lowercase().starts_with("content-disposition:")
                        && line.contains(&wanted)
                })
                .then_some(content)
        })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn split_on<'a>(mut haystack: &'a [u8], needle: &[u8]) -> Vec<&'a [u8]> {
    let mut pieces = Vec::new();
    while let Some(at) = find(haystack, needle) {
        if let Some(piece) = haystack.get(..at) {
            pieces.push(piece);
        }
        haystack = haystack
            .get(at.saturating_add(needle.len())..)
            .unwrap_or_default();
    }
    pieces.push(haystack);
    pieces
}
