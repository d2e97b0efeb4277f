use std::io::{Cursor, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::error::ArchiveError;

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*([^#\s][^\r\n]*?\.ts)[ \t]*\r?$").expect("valid segment regex")
    })
}

fn playlist_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*([^#\s][^\r\n]*?\.m3u8)[ \t]*\r?$").expect("valid playlist regex")
    })
}

/// Segment references in order of appearance. Repeats are kept.
pub fn segment_references(manifest: &str) -> Vec<String> {
    segment_pattern()
        .captures_iter(manifest)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Variant playlists referenced by a master manifest.
pub fn playlist_references(manifest: &str) -> Vec<String> {
    playlist_pattern()
        .captures_iter(manifest)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// An archive entry: the name inside the zip and the file it is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub source: PathBuf,
}

/// Lists everything `archive` would pack for `manifest`, without reading
/// segment contents. Variant playlists of a master manifest are expanded.
pub fn collect_entries(manifest: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let contents = read_manifest(manifest)?;
    let base = manifest.parent().unwrap_or_else(|| Path::new(""));
    let manifest_name = manifest
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ArchiveError::ManifestNotFound(manifest.to_path_buf()))?;

    let mut entries = vec![ArchiveEntry {
        name: manifest_name,
        source: manifest.to_path_buf(),
    }];
    push_segments(&mut entries, base, "", &contents)?;

    for variant in playlist_references(&contents) {
        check_reference(&variant)?;
        let variant_path = base.join(&variant);
        let variant_contents = read_manifest(&variant_path)?;
        let prefix = match variant.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/"),
            None => String::new(),
        };
        let variant_base = variant_path.parent().unwrap_or(base);
        entries.push(ArchiveEntry {
            name: variant,
            source: variant_path.clone(),
        });
        push_segments(&mut entries, variant_base, &prefix, &variant_contents)?;
    }
    Ok(entries)
}

/// Packs a manifest and every file it references into an in-memory zip.
/// Any unreadable segment aborts the whole archive.
pub fn archive(manifest: &Path) -> Result<Vec<u8>, ArchiveError> {
    let entries = collect_entries(manifest)?;
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for entry in &entries {
        let bytes = std::fs::read(&entry.source).map_err(|source| ArchiveError::Io {
            path: entry.source.clone(),
            source,
        })?;
        let method = if entry.name.ends_with(".ts") {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = FileOptions::default().compression_method(method);
        writer.start_file(entry.name.as_str(), options)?;
        writer.write_all(&bytes).map_err(|source| ArchiveError::Io {
            path: entry.source.clone(),
            source,
        })?;
    }
    let bytes = writer.finish()?.into_inner();
    debug!(
        target: "transform.archive",
        manifest = %manifest.display(),
        entries = entries.len(),
        bytes = bytes.len(),
        "archive built"
    );
    Ok(bytes)
}

fn push_segments(
    entries: &mut Vec<ArchiveEntry>,
    base: &Path,
    prefix: &str,
    contents: &str,
) -> Result<(), ArchiveError> {
    for segment in segment_references(contents) {
        check_reference(&segment)?;
        entries.push(ArchiveEntry {
            name: format!("{prefix}{segment}"),
            source: base.join(&segment),
        });
    }
    Ok(())
}

fn read_manifest(path: &Path) -> Result<String, ArchiveError> {
    std::fs::read_to_string(path).map_err(|source| {
        if source.kind() == ErrorKind::NotFound {
            ArchiveError::ManifestNotFound(path.to_path_buf())
        } else {
            ArchiveError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn check_reference(reference: &str) -> Result<(), ArchiveError> {
    let safe = !reference.contains('\\')
        && Path::new(reference)
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(ArchiveError::InvalidReference(reference.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    const MEDIA_PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n\
#EXTINF:10.0,\ns0.ts\n#EXTINF:10.0,\ns1.ts\n#EXTINF:4.2,\ns2.ts\n#EXT-X-ENDLIST\n";

    fn unzip(bytes: Vec<u8>) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|index| {
                let mut file = archive.by_index(index).unwrap();
                let mut contents = Vec::new();
                file.read_to_end(&mut contents).unwrap();
                (file.name().to_string(), contents)
            })
            .collect()
    }

    #[test]
    fn references_keep_order_and_repeats() {
        let manifest = "#EXTM3U\n#EXTINF:1,\nb.ts\n#EXTINF:1,\na.ts\n#EXTINF:1,\nb.ts\n# c.ts\n";
        assert_eq!(segment_references(manifest), vec!["b.ts", "a.ts", "b.ts"]);
        assert!(playlist_references(manifest).is_empty());
    }

    #[test]
    fn archive_contains_manifest_and_segments_verbatim() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("index.m3u8");
        std::fs::write(&manifest, MEDIA_PLAYLIST).unwrap();
        for (index, name) in ["s0.ts", "s1.ts", "s2.ts"].iter().enumerate() {
            std::fs::write(dir.path().join(name), vec![index as u8; 188]).unwrap();
        }

        let files = unzip(archive(&manifest).unwrap());
        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["index.m3u8", "s0.ts", "s1.ts", "s2.ts"]);
        assert_eq!(files[0].1, MEDIA_PLAYLIST.as_bytes());
        assert_eq!(files[2].1, vec![1u8; 188]);
    }

    #[test]
    fn missing_manifest_and_segments_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("index.m3u8");
        assert!(matches!(archive(&manifest), Err(ArchiveError::ManifestNotFound(_))));

        std::fs::write(&manifest, MEDIA_PLAYLIST).unwrap();
        std::fs::write(dir.path().join("s0.ts"), b"ts").unwrap();
        assert!(matches!(archive(&manifest), Err(ArchiveError::Io { .. })));
    }

    #[test]
    fn master_manifest_pulls_in_variants() {
        let dir = TempDir::new().unwrap();
        let master = dir.path().join("master.m3u8");
        std::fs::write(
            &master,
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n800k/index.m3u8\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("800k")).unwrap();
        std::fs::write(dir.path().join("800k/index.m3u8"), "#EXTM3U\n#EXTINF:10,\nsegment_000.ts\n").unwrap();
        std::fs::write(dir.path().join("800k/segment_000.ts"), b"ts").unwrap();

        let names: Vec<String> = collect_entries(&master)
            .unwrap()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        assert_eq!(names, vec!["master.m3u8", "800k/index.m3u8", "800k/segment_000.ts"]);
    }

    #[test]
    fn escaping_references_are_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("index.m3u8");
        std::fs::write(&manifest, "#EXTM3U\n../../etc/secret.ts\n").unwrap();
        assert!(matches!(archive(&manifest), Err(ArchiveError::InvalidReference(_))));
    }
}
