//! Archive inspection: validate the upload and extract its contents.

use std::io::{Cursor, Read};

use koth_core::spec::CompetitionConfig;
use tracing::debug;
use zip::ZipArchive;

use crate::error::IntakeError;

/// Upload size cap.
pub const MAX_ARCHIVE_BYTES: u64 = 75 * 1024 * 1024;

/// One extracted file (everything that is not `config.json`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Path relative to the package root, root prefix already trimmed.
    pub relative_path: String,
    pub content: Vec<u8>,
}

/// The validated contents of an uploaded archive.
#[derive(Debug)]
pub struct IntakePlan {
    pub config: CompetitionConfig,
    /// Raw bytes of the config.json that was parsed.
    pub config_bytes: Vec<u8>,
    pub attachments: Vec<Attachment>,
    /// Detected top-level directory, if the archive had one.
    pub root_prefix: Option<String>,
}

/// Validate an uploaded archive and extract config + attachments.
///
/// Entries with `..` components or absolute paths fail the whole intake
/// before anything is written anywhere. The first `config.json` wins;
/// its parent directory takes precedence over the first-entry heuristic
/// when detecting the archive's root prefix.
pub fn inspect_archive(bytes: &[u8]) -> Result<IntakePlan, IntakeError> {
    if bytes.is_empty() {
        return Err(IntakeError::Empty);
    }
    if bytes.len() as u64 > MAX_ARCHIVE_BYTES {
        return Err(IntakeError::TooLarge {
            size: bytes.len() as u64,
            limit: MAX_ARCHIVE_BYTES,
        });
    }

    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|e| IntakeError::NotAZip(e.to_string()))?;

    let mut config: Option<CompetitionConfig> = None;
    let mut config_bytes = Vec::new();
    let mut config_dir: Option<String> = None;
    let mut attachments: Vec<Attachment> = Vec::new();
    let mut root_candidate: Option<String> = None;
    let mut root_ambiguous = false;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| IntakeError::EntryRead {
            name: format!("#{index}"),
            detail: e.to_string(),
        })?;

        if entry.is_dir() {
            continue;
        }

        let raw_name = entry.name().to_string();
        let cleaned = normalize_entry_path(&raw_name).ok_or(IntakeError::UnsafePath(raw_name.clone()))?;

        // Root prefix heuristic: a consistent single top-level directory.
        match cleaned.split_once('/') {
            Some((top, _)) => match &root_candidate {
                None => root_candidate = Some(top.to_string()),
                Some(existing) if existing != top => root_ambiguous = true,
                Some(_) => {}
            },
            None => {
                if root_candidate.as_deref().is_some_and(|c| c != cleaned) {
                    root_ambiguous = true;
                }
            }
        }

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| IntakeError::EntryRead {
                name: cleaned.clone(),
                detail: e.to_string(),
            })?;

        let base = cleaned.rsplit('/').next().unwrap_or(&cleaned);
        if base.eq_ignore_ascii_case("config.json") {
            if config.is_none() {
                debug!(entry = %cleaned, "parsing config.json");
                config = Some(serde_json::from_slice(&data)?);
                config_bytes = data;
                if let Some((dir, _)) = cleaned.rsplit_once('/') {
                    config_dir = Some(dir.to_string());
                }
            }
            continue;
        }

        attachments.push(Attachment {
            relative_path: cleaned,
            content: data,
        });
    }

    let config = config.ok_or(IntakeError::ConfigMissing)?;

    // The config's directory wins over the heuristic when they disagree.
    let root_prefix = match config_dir {
        Some(dir) => Some(dir),
        None if !root_ambiguous => root_candidate,
        None => None,
    }
    .filter(|p| !p.is_empty() && p != ".");

    if let Some(prefix) = &root_prefix {
        let with_slash = format!("{prefix}/");
        for attachment in &mut attachments {
            if let Some(stripped) = attachment.relative_path.strip_prefix(&with_slash) {
                attachment.relative_path = stripped.to_string();
            }
        }
        debug!(root = %prefix, "trimmed archive root prefix");
    }

    Ok(IntakePlan {
        config,
        config_bytes,
        attachments,
        root_prefix,
    })
}

/// Normalize an archive entry path; `None` means the path is unsafe.
fn normalize_entry_path(name: &str) -> Option<String> {
    let slashed = name.replace('\\', "/");
    if slashed.starts_with('/') {
        return None;
    }

    let mut parts = Vec::new();
    for segment in slashed.split('/') {
        match segment {
            "" | "." => {}
            ".." => return None,
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, content) in entries {
                writer
                    .start_file(name.to_string(), SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    fn minimal_config(id: &str) -> String {
        format!(
            "{{\"competitionID\": \"{id}\", \"competitionName\": \"{id} comp\", \"numTeams\": 1}}"
        )
    }

    #[test]
    fn happy_path_extracts_config_and_attachments() {
        let config = minimal_config("demo");
        let bytes = build_zip(&[
            ("config.json", config.as_bytes()),
            ("public/index.html", b"<html></html>"),
            ("setup_web.sh", b"#!/bin/bash\n"),
        ]);

        let plan = inspect_archive(&bytes).unwrap();
        assert_eq!(plan.config.competition_id, "demo");
        assert_eq!(plan.attachments.len(), 2);
        assert_eq!(plan.root_prefix, None);
    }

    #[test]
    fn root_prefix_is_trimmed_from_attachments() {
        let config = minimal_config("demo");
        let bytes = build_zip(&[
            ("pkg/config.json", config.as_bytes()),
            ("pkg/public/index.html", b"x"),
            ("pkg/scripts/setup.sh", b"y"),
        ]);

        let plan = inspect_archive(&bytes).unwrap();
        assert_eq!(plan.root_prefix.as_deref(), Some("pkg"));
        let paths: Vec<&str> = plan
            .attachments
            .iter()
            .map(|a| a.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["public/index.html", "scripts/setup.sh"]);
    }

    #[test]
    fn config_dir_wins_over_first_entry_heuristic() {
        let config = minimal_config("demo");
        let bytes = build_zip(&[
            ("other/readme.txt", b"hello"),
            ("pkg/config.json", config.as_bytes()),
            ("pkg/public/index.html", b"x"),
        ]);

        let plan = inspect_archive(&bytes).unwrap();
        assert_eq!(plan.root_prefix.as_deref(), Some("pkg"));
        // The attachment outside the config dir keeps its full path.
        assert!(plan
            .attachments
            .iter()
            .any(|a| a.relative_path == "other/readme.txt"));
    }

    #[test]
    fn dot_dot_entries_fail_the_whole_intake() {
        let config = minimal_config("demo");
        let bytes = build_zip(&[
            ("config.json", config.as_bytes()),
            ("../escape.sh", b"evil"),
        ]);

        assert!(matches!(
            inspect_archive(&bytes),
            Err(IntakeError::UnsafePath(_))
        ));
    }

    #[test]
    fn absolute_entries_fail_the_whole_intake() {
        let config = minimal_config("demo");
        let bytes = build_zip(&[
            ("config.json", config.as_bytes()),
            ("/etc/passwd", b"evil"),
        ]);

        assert!(matches!(
            inspect_archive(&bytes),
            Err(IntakeError::UnsafePath(_))
        ));
    }

    #[test]
    fn missing_config_is_rejected() {
        let bytes = build_zip(&[("readme.md", b"no config here")]);
        assert!(matches!(
            inspect_archive(&bytes),
            Err(IntakeError::ConfigMissing)
        ));
    }

    #[test]
    fn first_config_wins() {
        let first = minimal_config("first");
        let second = minimal_config("second");
        let bytes = build_zip(&[
            ("config.json", first.as_bytes()),
            ("nested/config.json", second.as_bytes()),
        ]);

        let plan = inspect_archive(&bytes).unwrap();
        assert_eq!(plan.config.competition_id, "first");
        // Neither config.json lands in the attachments.
        assert!(plan.attachments.is_empty());
    }

    #[test]
    fn non_zip_and_empty_uploads_are_rejected() {
        assert!(matches!(inspect_archive(b""), Err(IntakeError::Empty)));
        assert!(matches!(
            inspect_archive(b"definitely not a zip"),
            Err(IntakeError::NotAZip(_))
        ));
    }

    #[test]
    fn oversized_uploads_are_rejected_before_parsing() {
        let huge = vec![0u8; (MAX_ARCHIVE_BYTES + 1) as usize];
        assert!(matches!(
            inspect_archive(&huge),
            Err(IntakeError::TooLarge { .. })
        ));
    }

    #[test]
    fn entry_normalization() {
        assert_eq!(normalize_entry_path("./a/b.txt").as_deref(), Some("a/b.txt"));
        assert_eq!(normalize_entry_path("a//b.txt").as_deref(), Some("a/b.txt"));
        assert_eq!(normalize_entry_path("a/../b.txt"), None);
        assert_eq!(normalize_entry_path("/abs.txt"), None);
        assert_eq!(normalize_entry_path("."), None);
    }
}
