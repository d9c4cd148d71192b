//! Tar framing of nydus artifacts.
//!
//! A converted layer is a tar holding the data blob at `image/image.blob`
//! and the bootstrap at `image/image.boot`. Bootstrap-only artifacts carry
//! just the latter. Packing is deterministic: every header has a zero mtime,
//! zero owner and a fixed mode, so equal inputs give equal digests.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use tar::{Archive, Builder, EntryType, Header};

use crate::content::{ReaderAt, SectionReader};

/// Entry holding the bootstrap.
pub const BOOTSTRAP_ENTRY: &str = "image/image.boot";
/// Entry holding the data blob.
pub const BLOB_ENTRY: &str = "image/image.blob";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether `header` starts a gzip stream.
pub fn is_gzip(header: &[u8]) -> bool {
    header.starts_with(&GZIP_MAGIC)
}

/// Pack named entries into a tar, in order.
pub fn pack(entries: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
    let mut builder = Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, name, *data)?;
    }
    builder.into_inner()
}

/// Pack a bootstrap as a bootstrap-only artifact.
pub fn pack_bootstrap(bootstrap: &[u8]) -> io::Result<Vec<u8>> {
    pack(&[(BOOTSTRAP_ENTRY, bootstrap)])
}

/// Read the bootstrap out of a stored artifact, plain or gzip-compressed.
///
/// Zero-length content yields an empty bootstrap.
pub fn extract_bootstrap(reader: &dyn ReaderAt) -> io::Result<Vec<u8>> {
    extract_entry(reader, BOOTSTRAP_ENTRY)
}

/// Read one named entry out of a stored tar, plain or gzip-compressed.
pub fn extract_entry(reader: &dyn ReaderAt, name: &str) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    copy_entry(reader, name, &mut out)?;
    Ok(out)
}

/// Stream the bootstrap of a stored artifact into `dest`.
pub fn copy_bootstrap<W: Write>(reader: &dyn ReaderAt, dest: &mut W) -> io::Result<u64> {
    copy_entry(reader, BOOTSTRAP_ENTRY, dest)
}

/// Stream one named entry of a stored tar into `dest`.
///
/// Returns the number of bytes copied. The entry's header size is never
/// trusted for allocation.
pub fn copy_entry<W: Write>(reader: &dyn ReaderAt, name: &str, dest: &mut W) -> io::Result<u64> {
    if reader.size() == 0 {
        return Ok(0);
    }

    let mut magic = [0u8; 2];
    let n = reader.read_at(&mut magic, 0)?;
    let section = SectionReader::new(reader);
    if is_gzip(&magic[..n]) {
        copy_from(Archive::new(GzDecoder::new(section)), name, dest)
    } else {
        copy_from(Archive::new(section), name, dest)
    }
}

fn copy_from<R: Read, W: Write>(
    mut archive: Archive<R>,
    name: &str,
    dest: &mut W,
) -> io::Result<u64> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(name) {
            return io::copy(&mut entry, dest);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("no {name} entry in artifact"),
    ))
}

/// Pack files on disk into a tar at `dest`, with the same headers as [`pack`].
pub fn pack_files(entries: &[(&str, &Path)], dest: &Path) -> io::Result<()> {
    let mut builder = Builder::new(File::create(dest)?);
    for (name, path) in entries {
        let mut file = File::open(path)?;
        let mut header = Header::new_ustar();
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.metadata()?.len());
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, name, &mut file)?;
    }
    builder.into_inner()?.flush()
}

/// Regular files of a layer tar, in archive order, as (path, contents).
///
/// Accepts plain or gzip-compressed input.
pub fn layer_files(raw: &[u8]) -> io::Result<Vec<(String, Vec<u8>)>> {
    if is_gzip(raw) {
        regular_files(Archive::new(GzDecoder::new(raw)))
    } else {
        regular_files(Archive::new(raw))
    }
}

fn regular_files<R: Read>(mut archive: Archive<R>) -> io::Result<Vec<(String, Vec<u8>)>> {
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        files.push((path, data));
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;

    use super::*;

    #[test]
    fn test_pack_is_deterministic() {
        let a = pack(&[(BLOB_ENTRY, &b"blob"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        let b = pack(&[(BLOB_ENTRY, &b"blob"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_plain_and_gzip() {
        let tarball =
            pack(&[(BLOB_ENTRY, &b"blob"[..]), (BOOTSTRAP_ENTRY, &b"boot"[..])]).unwrap();
        assert_eq!(extract_bootstrap(&tarball).unwrap(), b"boot");
        assert_eq!(extract_entry(&tarball, BLOB_ENTRY).unwrap(), b"blob");

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tarball).unwrap();
        let gz = encoder.finish().unwrap();
        assert!(is_gzip(&gz));
        assert_eq!(extract_bootstrap(&gz).unwrap(), b"boot");
    }

    #[test]
    fn test_zero_size_is_empty_bootstrap() {
        assert!(extract_bootstrap(&Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_missing_entry() {
        let tarball = pack(&[(BLOB_ENTRY, &b"blob"[..])]).unwrap();
        let err = extract_bootstrap(&tarball).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_entry_header_is_not_trusted() {
        let mut header = Header::new_ustar();
        header.set_path(BOOTSTRAP_ENTRY).unwrap();
        header.set_entry_type(EntryType::Regular);
        header.set_size(1 << 46);
        header.set_mode(0o644);
        header.set_cksum();
        let mut raw = header.as_bytes().to_vec();
        raw.extend_from_slice(&[7u8; 1024]);

        // Truncated data either reads short or errors; it never allocates
        // what the header claims.
        if let Ok(boot) = extract_bootstrap(&raw) {
            assert!(boot.len() <= 1024);
        }
    }

    #[test]
    fn test_pack_files_streams_into_tar() {
        let dir = tempfile::tempdir().unwrap();
        let boot = dir.path().join("merged.boot");
        std::fs::write(&boot, b"merged").unwrap();
        let tarball = dir.path().join("merged.tar");

        pack_files(&[(BOOTSTRAP_ENTRY, &boot)], &tarball).unwrap();

        let raw = std::fs::read(&tarball).unwrap();
        assert_eq!(raw, pack_bootstrap(b"merged").unwrap());

        let mut out = Vec::new();
        assert_eq!(copy_bootstrap(&raw, &mut out).unwrap(), 6);
        assert_eq!(out, b"merged");
    }

    #[test]
    fn test_layer_files_skips_directories() {
        let mut builder = Builder::new(Vec::new());
        let mut dir = Header::new_ustar();
        dir.set_entry_type(EntryType::Directory);
        dir.set_size(0);
        dir.set_mode(0o755);
        builder.append_data(&mut dir, "etc/", io::empty()).unwrap();
        let mut file = Header::new_ustar();
        file.set_size(5);
        file.set_mode(0o644);
        builder.append_data(&mut file, "etc/hosts", &b"hosts"[..]).unwrap();
        let raw = builder.into_inner().unwrap();

        let files = layer_files(&raw).unwrap();
        assert_eq!(files, vec![("etc/hosts".to_string(), b"hosts".to_vec())]);
    }
}
