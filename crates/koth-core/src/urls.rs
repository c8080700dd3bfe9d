//! URL construction for artifact and public-file fetches.

use crate::sanitize::sanitize_relative_path;

/// Base URL for a competition's public folder route.
pub fn competition_public_base(base_url: &str, competition_id: &str) -> String {
    format!(
        "{}/api/competitions/{}/public",
        base_url.trim_end_matches('/'),
        path_escape(competition_id)
    )
}

/// Base URL for a competition's artifact route.
pub fn competition_artifact_base(base_url: &str, competition_id: &str) -> String {
    format!(
        "{}/api/competitions/{}/artifacts",
        base_url.trim_end_matches('/'),
        path_escape(competition_id)
    )
}

/// Join a sanitized relative path onto a base URL, encoding each segment.
pub fn join_url(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let encoded = encode_relative_path(relative);
    if encoded.is_empty() {
        base.to_string()
    } else {
        format!("{base}/{encoded}")
    }
}

/// Sanitize then percent-encode a relative path, segment by segment.
pub fn encode_relative_path(relative: &str) -> String {
    sanitize_relative_path(relative)
        .split('/')
        .filter(|s| !s.is_empty())
        .map(path_escape)
        .collect::<Vec<_>>()
        .join("/")
}

/// Percent-encode one path segment (RFC 3986 unreserved set kept).
pub fn path_escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bases_embed_the_competition_id() {
        assert_eq!(
            competition_public_base("https://koth.lab/", "demo comp"),
            "https://koth.lab/api/competitions/demo%20comp/public"
        );
        assert_eq!(
            competition_artifact_base("https://koth.lab", "demo"),
            "https://koth.lab/api/competitions/demo/artifacts"
        );
    }

    #[test]
    fn join_encodes_and_strips_escapes() {
        let base = "https://koth.lab/api/competitions/demo/artifacts";
        assert_eq!(
            join_url(base, "scripts/setup web.sh"),
            format!("{base}/scripts/setup%20web.sh")
        );
        assert_eq!(join_url(base, "../../etc/passwd"), format!("{base}/etc/passwd"));
        assert_eq!(join_url(base, ""), base);
    }
}
