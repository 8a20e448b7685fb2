//! ZIP helpers for OCF containers (EPUB input and output).

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use zip::read::ZipArchive;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

/// Local file header signature of a ZIP archive.
pub const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Check whether `bytes` starts like a ZIP archive.
pub fn is_zip(bytes: &[u8]) -> bool {
    bytes.starts_with(ZIP_MAGIC)
}

/// Extract all entries of a ZIP archive below `output_dir`.
///
/// Entries whose names would escape `output_dir` (absolute paths, `..`
/// components) are skipped with a warning.
pub fn extract_zip(zip_path: &Path, output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative = match entry.enclosed_name() {
            Some(p) => p,
            None => {
                log::warn!("Skipping unsafe archive entry: {}", entry.name());
                continue;
            }
        };
        let out_path = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut outfile = File::create(&out_path)?;
        io::copy(&mut entry, &mut outfile)?;
        extracted.push(out_path);
    }

    log::debug!(
        "Extracted {} entries from {}",
        extracted.len(),
        zip_path.display()
    );
    Ok(extracted)
}

/// Read a single entry from a ZIP archive.
pub fn read_zip_entry(zip_path: &Path, entry_name: &str) -> io::Result<Vec<u8>> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = archive.by_name(entry_name)?;
    let mut buf = Vec::new();
    entry.read_to_end(&mut buf)?;
    Ok(buf)
}

/// List the entry names of a ZIP archive.
pub fn list_zip_entries(zip_path: &Path) -> io::Result<Vec<String>> {
    let file = File::open(zip_path)?;
    let archive = ZipArchive::new(file)?;
    let entries = (0..archive.len())
        .filter_map(|i| archive.name_for_index(i).map(|s| s.to_string()))
        .collect();
    Ok(entries)
}

/// Writer for ZIP archives. EPUB requires the `mimetype` entry first and
/// stored, which is what [`ZipBuilder::add_stored`] is for.
pub struct ZipBuilder {
    writer: ZipWriter<File>,
}

impl ZipBuilder {
    /// Create a new ZIP file at the given path.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: ZipWriter::new(file),
        })
    }

    /// Add a deflated entry.
    pub fn add_file(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        self.writer.start_file(name, options)?;
        self.writer.write_all(content)?;
        Ok(())
    }

    /// Add an entry without compression.
    pub fn add_stored(&mut self, name: &str, content: &[u8]) -> io::Result<()> {
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        self.writer.start_file(name, options)?;
        self.writer.write_all(content)?;
        Ok(())
    }

    /// Add an entry, storing it when the payload is already compressed.
    pub fn add_entry(&mut self, name: &str, content: &[u8], precompressed: bool) -> io::Result<()> {
        if precompressed {
            self.add_stored(name, content)
        } else {
            self.add_file(name, content)
        }
    }

    /// Finish writing the ZIP archive.
    pub fn finish(self) -> io::Result<()> {
        self.writer.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.epub");

        let mut builder = ZipBuilder::new(&path).unwrap();
        builder
            .add_stored("mimetype", b"application/epub+zip")
            .unwrap();
        builder.add_file("OEBPS/content.opf", b"<package/>").unwrap();
        builder.add_entry("OEBPS/cover.png", b"\x89PNG", true).unwrap();
        builder.finish().unwrap();

        let entries = list_zip_entries(&path).unwrap();
        assert_eq!(entries[0], "mimetype");
        assert_eq!(entries.len(), 3);

        let content = read_zip_entry(&path, "OEBPS/content.opf").unwrap();
        assert_eq!(content, b"<package/>");
        assert!(is_zip(&std::fs::read(&path).unwrap()));
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.zip");
        let mut builder = ZipBuilder::new(&path).unwrap();
        builder.add_file("a/b.txt", b"hello").unwrap();
        builder.finish().unwrap();

        let out = dir.path().join("out");
        let files = extract_zip(&path, &out).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(std::fs::read(out.join("a/b.txt")).unwrap(), b"hello");
    }
}
