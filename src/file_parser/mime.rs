//! MIME type detection from leading magic bytes with an extension fallback.

use tokio::io::AsyncReadExt;

use crate::storage::{split_extension, Storage};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Bytes read from the start of a file for sniffing.
pub const SNIFF_LEN: usize = 512;

const SIGNATURES: &[(usize, &[u8], &str)] = &[
    (0, b"\x89PNG\r\n\x1a\n", "image/png"),
    (0, b"\xff\xd8\xff", "image/jpeg"),
    (0, b"GIF87a", "image/gif"),
    (0, b"GIF89a", "image/gif"),
    (0, b"%PDF-", "application/pdf"),
    (0, b"II*\x00", "image/tiff"),
    (0, b"MM\x00*", "image/tiff"),
    (0, b"BM", "image/bmp"),
    (0, b"\x1f\x8b", "application/gzip"),
    (0, b"7z\xbc\xaf\x27\x1c", "application/x-7z-compressed"),
    (0, b"Rar!\x1a\x07", "application/vnd.rar"),
    (0, b"ID3", "audio/mpeg"),
    (0, b"OggS", "audio/ogg"),
    (0, b"fLaC", "audio/flac"),
    (0, b"\x89HDF\r\n\x1a\n", "application/x-hdf5"),
    (0, b"CDF\x01", "application/x-netcdf"),
    (0, b"CDF\x02", "application/x-netcdf"),
    (0, b"SQLite format 3\x00", "application/vnd.sqlite3"),
    (0, b"PK\x03\x04", "application/zip"),
    (0, b"<?xml", "application/xml"),
    (4, b"ftyp", "video/mp4"),
];

/// Detects a MIME type from the first bytes of a file.
pub fn sniff(head: &[u8]) -> Option<&'static str> {
    if head.len() >= 12 && &head[..4] == b"RIFF" {
        return match &head[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }
    SIGNATURES
        .iter()
        .find(|(offset, magic, _)| head.len() >= offset + magic.len() && &head[*offset..offset + magic.len()] == *magic)
        .map(|(_, _, mime)| *mime)
}

/// Guesses a MIME type from the extension of `name`.
pub fn from_extension(name: &str) -> Option<&'static str> {
    let (_, ext) = split_extension(name);
    let mime = match ext?.to_ascii_lowercase().as_str() {
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" | "htm" => "text/html",
        "md" => "text/markdown",
        "yaml" | "yml" => "application/yaml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "7z" => "application/x-7z-compressed",
        "h5" | "hdf5" => "application/x-hdf5",
        "nc" => "application/x-netcdf",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        _ => return None,
    };
    Some(mime)
}

/// Combines sniffing and the extension table.
///
/// Container formats (zip) defer to the extension so office documents keep their specific type.
pub fn detect(head: &[u8], name: &str) -> &'static str {
    match (sniff(head), from_extension(name)) {
        (Some("application/zip"), Some(ext)) => ext,
        (Some(sniffed), _) => sniffed,
        (None, Some(ext)) => ext,
        (None, None) => OCTET_STREAM,
    }
}

/// Reads the head of a stored file and detects its type.
pub async fn detect_stored(storage: &Storage, relative: &str, name: &str) -> anyhow::Result<&'static str> {
    let mut file = storage.open(relative).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(detect(&head, name))
}
