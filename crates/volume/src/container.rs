use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use common::{Error, Result};

/// Pluggable archive container: the zip family, or a streaming tar+zstd
/// alternative for backends that dislike seeking writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Zip,
    TarZstd,
}

impl Default for ContainerKind {
    fn default() -> Self {
        ContainerKind::Zip
    }
}

impl ContainerKind {
    /// Extension segment used in remote names.
    pub fn extension(self) -> &'static str {
        match self {
            ContainerKind::Zip => "zip",
            ContainerKind::TarZstd => "tzst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "zip" => Some(ContainerKind::Zip),
            "tzst" => Some(ContainerKind::TarZstd),
            _ => None,
        }
    }

    pub fn writer(self, file: File) -> Result<Box<dyn ArchiveWrite>> {
        match self {
            ContainerKind::Zip => Ok(Box::new(ZipWrite::new(file))),
            ContainerKind::TarZstd => Ok(Box::new(TarZstdWrite::new(file)?)),
        }
    }

    pub fn reader(self, path: &Path) -> Result<Box<dyn ArchiveRead>> {
        let file = File::open(path).map_err(|e| Error::path(path, e))?;
        match self {
            ContainerKind::Zip => Ok(Box::new(ZipRead::new(file)?)),
            ContainerKind::TarZstd => Ok(Box::new(TarZstdRead::new(file)?)),
        }
    }
}

/// Append-only archive writer.
pub trait ArchiveWrite: Send {
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()>;

    /// Stream a large entry from an open file of known length.
    fn add_entry_from_file(&mut self, name: &str, source: &mut File, len: u64) -> Result<()>;

    /// Flush framing and close the underlying file.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Random-access view of a finished archive.
pub trait ArchiveRead: Send {
    fn entry_names(&self) -> Vec<String>;
    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>>;
    fn has_entry(&self, name: &str) -> bool {
        self.entry_names().iter().any(|n| n == name)
    }
}

// -- zip ---------------------------------------------------------------

struct ZipWrite {
    inner: Option<zip::ZipWriter<File>>,
}

impl ZipWrite {
    fn new(file: File) -> Self {
        Self {
            inner: Some(zip::ZipWriter::new(file)),
        }
    }

    fn options() -> zip::write::SimpleFileOptions {
        // large_file keeps Zip64 framing available for spill-sized entries.
        zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(true)
    }

    fn writer(&mut self) -> Result<&mut zip::ZipWriter<File>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::codec("zip", "archive already finished"))
    }
}

impl ArchiveWrite for ZipWrite {
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let writer = self.writer()?;
        writer
            .start_file(name, Self::options())
            .map_err(|e| Error::codec("zip", e))?;
        writer.write_all(data)?;
        Ok(())
    }

    fn add_entry_from_file(&mut self, name: &str, source: &mut File, _len: u64) -> Result<()> {
        let writer = self.writer()?;
        writer
            .start_file(name, Self::options())
            .map_err(|e| Error::codec("zip", e))?;
        std::io::copy(source, writer)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let writer = self
            .inner
            .take()
            .ok_or_else(|| Error::codec("zip", "archive already finished"))?;
        let mut file = writer.finish().map_err(|e| Error::codec("zip", e))?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

struct ZipRead {
    inner: zip::ZipArchive<File>,
}

impl ZipRead {
    fn new(file: File) -> Result<Self> {
        let inner = zip::ZipArchive::new(file).map_err(|e| Error::codec("zip", e))?;
        Ok(Self { inner })
    }
}

impl ArchiveRead for ZipRead {
    fn entry_names(&self) -> Vec<String> {
        self.inner.file_names().map(String::from).collect()
    }

    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut entry = self
            .inner
            .by_name(name)
            .map_err(|e| Error::codec("zip", format!("entry {name}: {e}")))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(data)
    }
}

// -- tar + zstd --------------------------------------------------------

const TAR_ZSTD_LEVEL: i32 = 3;

struct TarZstdWrite {
    inner: Option<tar::Builder<zstd::Encoder<'static, File>>>,
}

impl TarZstdWrite {
    fn new(file: File) -> Result<Self> {
        let encoder =
            zstd::Encoder::new(file, TAR_ZSTD_LEVEL).map_err(|e| Error::codec("zstd", e))?;
        Ok(Self {
            inner: Some(tar::Builder::new(encoder)),
        })
    }

    fn builder(&mut self) -> Result<&mut tar::Builder<zstd::Encoder<'static, File>>> {
        self.inner
            .as_mut()
            .ok_or_else(|| Error::codec("tar", "archive already finished"))
    }

    fn header(len: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        header
    }
}

impl ArchiveWrite for TarZstdWrite {
    fn add_entry(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = Self::header(data.len() as u64);
        self.builder()?
            .append_data(&mut header, name, data)
            .map_err(|e| Error::codec("tar", e))?;
        Ok(())
    }

    fn add_entry_from_file(&mut self, name: &str, source: &mut File, len: u64) -> Result<()> {
        let mut header = Self::header(len);
        self.builder()?
            .append_data(&mut header, name, source)
            .map_err(|e| Error::codec("tar", e))?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        let builder = self
            .inner
            .take()
            .ok_or_else(|| Error::codec("tar", "archive already finished"))?;
        let encoder = builder.into_inner().map_err(|e| Error::codec("tar", e))?;
        let mut file = encoder.finish().map_err(|e| Error::codec("zstd", e))?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

/// The tar stream cannot seek, so the whole archive is inflated once at
/// open; volumes are bounded by `volume_size` which keeps this in memory
/// territory.
struct TarZstdRead {
    entries: HashMap<String, Vec<u8>>,
}

impl TarZstdRead {
    fn new(file: File) -> Result<Self> {
        let decoder = zstd::Decoder::new(file).map_err(|e| Error::codec("zstd", e))?;
        let mut archive = tar::Archive::new(decoder);
        let mut entries = HashMap::new();
        for entry in archive.entries().map_err(|e| Error::codec("tar", e))? {
            let mut entry = entry.map_err(|e| Error::codec("tar", e))?;
            let name = entry
                .path()
                .map_err(|e| Error::codec("tar", e))?
                .to_string_lossy()
                .into_owned();
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            entries.insert(name, data);
        }
        Ok(Self { entries })
    }
}

impl ArchiveRead for TarZstdRead {
    fn entry_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::codec("tar", format!("no entry {name}")))
    }

    fn has_entry(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: ContainerKind) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("vol.{}", kind.extension()));

        let file = File::create(&path).unwrap();
        let mut writer = kind.writer(file).unwrap();
        writer.add_entry("manifest", b"{}").unwrap();
        writer.add_entry("data/abc", &[7u8; 4096]).unwrap();

        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![3u8; 10_000]).unwrap();
        let mut big = File::open(&big).unwrap();
        writer.add_entry_from_file("data/big", &mut big, 10_000).unwrap();
        writer.finish().unwrap();

        let mut reader = kind.reader(&path).unwrap();
        let mut names = reader.entry_names();
        names.sort();
        assert_eq!(names, vec!["data/abc", "data/big", "manifest"]);
        assert_eq!(reader.read_entry("manifest").unwrap(), b"{}");
        assert_eq!(reader.read_entry("data/abc").unwrap(), vec![7u8; 4096]);
        assert_eq!(reader.read_entry("data/big").unwrap(), vec![3u8; 10_000]);
        assert!(reader.read_entry("data/missing").is_err());
    }

    #[test]
    fn test_zip_round_trip() {
        round_trip(ContainerKind::Zip);
    }

    #[test]
    fn test_tar_zstd_round_trip() {
        round_trip(ContainerKind::TarZstd);
    }

    #[test]
    fn test_extension_parse() {
        assert_eq!(ContainerKind::parse("zip"), Some(ContainerKind::Zip));
        assert_eq!(ContainerKind::parse("tzst"), Some(ContainerKind::TarZstd));
        assert_eq!(ContainerKind::parse("7z"), None);
    }
}
