use crate::prelude::*;
use std::io::{Read, Write};
use std::path::Path;

/// SHA-256 as 64 lowercase hex characters, the form the registry stores and
/// the register/install clients exchange.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    data_encoding::HEXLOWER.encode(digest.as_ref())
}

/// SHA-256 as unpadded urlsafe base64, the form RECORD files use (PEP 427).
pub fn sha256_record_digest(data: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    format!("sha256={}", data_encoding::BASE64URL_NOPAD.encode(digest.as_ref()))
}

pub fn sha256_file_hex(path: &Path) -> Result<(String, u64)> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.update(&buf[..n]);
        size += n as u64;
    }
    let digest = ctx.finish();
    Ok((data_encoding::HEXLOWER.encode(digest.as_ref()), size))
}

pub fn is_valid_sha256_hex(value: &str) -> bool {
    static SHA256_HEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-f]{64}$").unwrap());
    SHA256_HEX.is_match(value)
}

/// Wraps a writer and accumulates a SHA-256 of everything written through it,
/// so archive entries can be hashed as they're streamed into the zip.
pub struct HashingWriter<T: Write> {
    inner: T,
    ctx: ring::digest::Context,
    written: u64,
}

impl<T: Write> HashingWriter<T> {
    pub fn new(inner: T) -> HashingWriter<T> {
        HashingWriter {
            inner,
            ctx: ring::digest::Context::new(&ring::digest::SHA256),
            written: 0,
        }
    }

    /// Returns (inner writer, RECORD-style digest, bytes written).
    pub fn finish(self) -> (T, String, u64) {
        let digest = self.ctx.finish();
        let encoded = format!(
            "sha256={}",
            data_encoding::BASE64URL_NOPAD.encode(digest.as_ref())
        );
        (self.inner, encoded, self.written)
    }
}

impl<T: Write> Write for HashingWriter<T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.ctx.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_record_digest_is_unpadded_urlsafe() {
        let digest = sha256_record_digest(b"hello world");
        let encoded = digest.strip_prefix("sha256=").unwrap();
        assert!(!encoded.contains('='), "{encoded:?} should strip padding");
        assert!(!encoded.contains('+'));
        assert!(!encoded.contains('/'));
        assert_eq!(encoded, "uU0nuZNNPgilLlLX2n2r-sSE7-N6U4DukIj3rOLvzek");
    }

    #[test]
    fn test_hashing_writer_matches_direct() {
        let mut sink = Vec::new();
        let mut writer = HashingWriter::new(&mut sink);
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (_, digest, size) = writer.finish();
        assert_eq!(digest, sha256_record_digest(b"hello world"));
        assert_eq!(size, 11);
        assert_eq!(sink, b"hello world");
    }

    #[test]
    fn test_file_and_content_hashes_agree() {
        let mut bytes = vec![0u8; 4096];
        for b in bytes.iter_mut() {
            *b = fastrand::u8(..);
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, &bytes).unwrap();
        let (hex, size) = sha256_file_hex(&path).unwrap();
        assert_eq!(hex, sha256_hex(&bytes));
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_valid_sha256_hex() {
        assert!(is_valid_sha256_hex(&sha256_hex(b"x")));
        assert!(!is_valid_sha256_hex("00"));
        assert!(!is_valid_sha256_hex(&sha256_hex(b"x").to_uppercase()));
        assert!(!is_valid_sha256_hex(&format!("{}0", sha256_hex(b"x"))));
    }
}
