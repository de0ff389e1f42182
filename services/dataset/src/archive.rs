use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Errors raised while extracting or packing an archive
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("archive io error: {0}")]
    Io(#[from] io::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("invalid source directory: {0}")]
    InvalidSource(PathBuf),
}

/// Unpack `archive_path` into `dest_dir`, preserving relative paths. Blocking.
///
/// Entries whose names would land outside `dest_dir` are skipped.
/// Returns the number of files written.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<usize, CodecError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    fs::create_dir_all(dest_dir)?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let relative = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                warn!(entry = %entry.name(), "Skipping archive entry with unsafe path");
                continue;
            }
        };
        let out_path = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = BufWriter::new(File::create(&out_path)?);
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }

    debug!(
        archive = %archive_path.display(),
        files = written,
        "Archive extracted"
    );

    Ok(written)
}

/// Pack every file under `src_dir` into a new archive at `archive_path`.
///
/// Entry names are `<basename of src_dir>/<relative path>`, so the source
/// directory becomes the archive's internal root. Files are added in
/// lexicographic path order. Returns the number of files packed.
pub fn pack(src_dir: &Path, archive_path: &Path) -> Result<usize, CodecError> {
    let root = src_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| CodecError::InvalidSource(src_dir.to_path_buf()))?;

    if !src_dir.is_dir() {
        return Err(CodecError::InvalidSource(src_dir.to_path_buf()));
    }

    let mut zip = ZipWriter::new(BufWriter::new(File::create(archive_path)?));
    let options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut packed = 0;

    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(src_dir)
            .map_err(|_| CodecError::InvalidSource(entry.path().to_path_buf()))?;
        let name = archive_entry_name(&root, relative);

        zip.start_file(name, options)?;
        let mut input = File::open(entry.path())?;
        io::copy(&mut input, &mut zip)?;
        packed += 1;
    }

    zip.finish()?;

    debug!(
        archive = %archive_path.display(),
        files = packed,
        "Archive packed"
    );

    Ok(packed)
}

/// Forward-slash entry name regardless of platform separator
fn archive_entry_name(root: &str, relative: &Path) -> String {
    let mut name = root.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        archive.file_names().map(String::from).collect()
    }

    #[test]
    fn test_extract_preserves_relative_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("in.zip");
        write_zip(
            &archive,
            &[("cats/a.jpg", "aaa"), ("cats/nested/b.png", "bbb"), ("readme.txt", "hi")],
        );

        let dest = tmp.path().join("out");
        let written = extract(&archive, &dest).unwrap();

        assert_eq!(written, 3);
        assert_eq!(fs::read(dest.join("cats/a.jpg")).unwrap(), b"aaa");
        assert_eq!(fs::read(dest.join("cats/nested/b.png")).unwrap(), b"bbb");
        assert_eq!(fs::read(dest.join("readme.txt")).unwrap(), b"hi");
    }

    #[test]
    fn test_extract_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("bad.zip");
        fs::write(&archive, b"definitely not a zip file").unwrap();

        let result = extract(&archive, &tmp.path().join("out"));
        assert!(matches!(result, Err(CodecError::Zip(_))));
    }

    #[test]
    fn test_pack_uses_directory_name_as_root() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("cats");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("00002.png"), b"two").unwrap();
        fs::write(src.join("00001.jpg"), b"one").unwrap();
        fs::write(src.join("sub/labels.json"), b"{}").unwrap();

        let archive = tmp.path().join("cats.zip");
        let packed = pack(&src, &archive).unwrap();

        assert_eq!(packed, 3);
        let mut names = entry_names(&archive);
        names.sort();
        assert_eq!(names, vec!["cats/00001.jpg", "cats/00002.png", "cats/sub/labels.json"]);

        let mut zip = ZipArchive::new(File::open(&archive).unwrap()).unwrap();
        let mut content = String::new();
        zip.by_name("cats/00002.png")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "two");
    }

    #[test]
    fn test_pack_missing_source() {
        let tmp = tempfile::tempdir().unwrap();
        let result = pack(&tmp.path().join("missing"), &tmp.path().join("x.zip"));
        assert!(matches!(result, Err(CodecError::InvalidSource(_))));
    }
}
