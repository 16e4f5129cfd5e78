use std::{
    fmt,
    io::{self, Read as _},
};

use flate2::read::MultiGzDecoder;
use rama::bytes::Bytes;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const GZIP_METHOD_DEFLATE: u8 = 8;

const FLAG_HCRC: u8 = 0x02;
const FLAG_EXTRA: u8 = 0x04;
const FLAG_NAME: u8 = 0x08;
const FLAG_COMMENT: u8 = 0x10;
const FLAGS_RESERVED: u8 = 0xe0;

/// Length of the fixed part of a gzip member header.
pub const GZIP_HEADER_LEN: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a payload cannot be opened as a gzip stream.
pub enum GzipHeaderError {
    /// More bytes are needed to complete the header.
    Truncated { len: usize },
    BadMagic,
    UnsupportedMethod(u8),
    ReservedFlags(u8),
    HeaderCrcMismatch { stored: u16, computed: u16 },
}

impl fmt::Display for GzipHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "gzip header truncated after {len} bytes"),
            Self::BadMagic => f.write_str("invalid gzip header: bad magic number"),
            Self::UnsupportedMethod(method) => {
                write!(f, "invalid gzip header: unsupported compression method {method}")
            }
            Self::ReservedFlags(flags) => {
                write!(f, "invalid gzip header: reserved flags set ({flags:#04x})")
            }
            Self::HeaderCrcMismatch { stored, computed } => write!(
                f,
                "invalid gzip header: header crc {stored:#06x} does not match {computed:#06x}"
            ),
        }
    }
}

impl std::error::Error for GzipHeaderError {}

/// Validates the header of the first gzip member, optional fields included,
/// returning the length of that header.
pub fn check_header(data: &[u8]) -> Result<usize, GzipHeaderError> {
    let truncated = || GzipHeaderError::Truncated { len: data.len() };

    // reject a bad magic early, even if the header is incomplete
    if data.len() >= 2 && data[..2] != GZIP_MAGIC {
        return Err(GzipHeaderError::BadMagic);
    }
    if data.len() < GZIP_HEADER_LEN {
        return Err(truncated());
    }
    if data[2] != GZIP_METHOD_DEFLATE {
        return Err(GzipHeaderError::UnsupportedMethod(data[2]));
    }
    let flags = data[3];
    if flags & FLAGS_RESERVED != 0 {
        return Err(GzipHeaderError::ReservedFlags(flags));
    }

    let mut end = GZIP_HEADER_LEN;

    if flags & FLAG_EXTRA != 0 {
        let xlen = read_u16_le(data, end).ok_or_else(truncated)?;
        end += 2 + usize::from(xlen);
        if data.len() < end {
            return Err(truncated());
        }
    }

    for flag in [FLAG_NAME, FLAG_COMMENT] {
        if flags & flag != 0 {
            let terminator = data[end..]
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(truncated)?;
            end += terminator + 1;
        }
    }

    if flags & FLAG_HCRC != 0 {
        let stored = read_u16_le(data, end).ok_or_else(truncated)?;
        let mut crc = flate2::Crc::new();
        crc.update(&data[..end]);
        // only the two least significant bytes are stored
        let computed = (crc.sum() & 0xffff) as u16;
        if stored != computed {
            return Err(GzipHeaderError::HeaderCrcMismatch { stored, computed });
        }
        end += 2;
    }

    Ok(end)
}

fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decompressed {
    /// The full payload, at most the requested limit in size.
    Complete(Vec<u8>),
    /// The payload is larger than the requested limit.
    TooLarge,
}

#[derive(Debug, Clone)]
/// A compressed payload of which the gzip header was validated.
pub struct GzipPayload {
    compressed: Bytes,
}

impl GzipPayload {
    pub fn open(compressed: Bytes) -> Result<Self, GzipHeaderError> {
        check_header(&compressed)?;
        Ok(Self { compressed })
    }

    pub fn compressed_len(&self) -> usize {
        self.compressed.len()
    }

    /// Decompresses up to one byte beyond `max`, which is enough
    /// to tell whether the payload exceeds the limit.
    pub fn read_limited(&self, max: usize) -> io::Result<Decompressed> {
        let mut reader = MultiGzDecoder::new(&self.compressed[..]).take(max as u64 + 1);

        let mut data = Vec::with_capacity(self.compressed.len().saturating_mul(4).min(max + 1));
        reader.read_to_end(&mut data)?;

        if data.len() > max {
            return Ok(Decompressed::TooLarge);
        }
        Ok(Decompressed::Complete(data))
    }
}

#[cfg(test)]
pub(crate) fn compress(data: &[u8]) -> Vec<u8> {
    use std::io::Write as _;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed gzip header with the given flags, followed by `fields`.
    fn header_with(flags: u8, fields: &[u8]) -> Vec<u8> {
        let mut header = vec![0x1f, 0x8b, 0x08, flags, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff];
        header.extend_from_slice(fields);
        header
    }

    #[test]
    fn test_check_header() {
        let valid = compress(b"hello");

        for (description, input, expected_result) in [
            ("valid header", valid.clone(), Ok(GZIP_HEADER_LEN)),
            ("empty", Vec::new(), Err(GzipHeaderError::Truncated { len: 0 })),
            (
                "magic only",
                GZIP_MAGIC.to_vec(),
                Err(GzipHeaderError::Truncated { len: 2 }),
            ),
            ("plain text", b"hello world".to_vec(), Err(GzipHeaderError::BadMagic)),
            ("short plain text", b"[{}]".to_vec(), Err(GzipHeaderError::BadMagic)),
            (
                "zlib instead of gzip",
                vec![0x78, 0x9c, 0x4b, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
                Err(GzipHeaderError::BadMagic),
            ),
            (
                "stored method",
                vec![0x1f, 0x8b, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff],
                Err(GzipHeaderError::UnsupportedMethod(0)),
            ),
            (
                "reserved flags",
                header_with(0x20, &[]),
                Err(GzipHeaderError::ReservedFlags(0x20)),
            ),
            (
                "file name",
                header_with(FLAG_NAME, b"batch.json\0"),
                Ok(GZIP_HEADER_LEN + 11),
            ),
            (
                "unterminated file name",
                header_with(FLAG_NAME, b"abc"),
                Err(GzipHeaderError::Truncated { len: 13 }),
            ),
            (
                "file name and comment",
                header_with(FLAG_NAME | FLAG_COMMENT, b"a\0bc\0"),
                Ok(GZIP_HEADER_LEN + 5),
            ),
            (
                "unterminated comment",
                header_with(FLAG_NAME | FLAG_COMMENT, b"a\0bc"),
                Err(GzipHeaderError::Truncated { len: 14 }),
            ),
            (
                "extra field",
                header_with(FLAG_EXTRA, &[0x02, 0x00, b'x', b'y']),
                Ok(GZIP_HEADER_LEN + 4),
            ),
            (
                "truncated extra field",
                header_with(FLAG_EXTRA, &[0x05, 0x00, b'x']),
                Err(GzipHeaderError::Truncated { len: 13 }),
            ),
            (
                "truncated extra field length",
                header_with(FLAG_EXTRA, &[0x05]),
                Err(GzipHeaderError::Truncated { len: 11 }),
            ),
            (
                "header crc",
                header_with(FLAG_HCRC, &[0x90, 0xc9]),
                Ok(GZIP_HEADER_LEN + 2),
            ),
            (
                "header crc mismatch",
                header_with(FLAG_HCRC, &[0xde, 0xad]),
                Err(GzipHeaderError::HeaderCrcMismatch {
                    stored: 0xadde,
                    computed: 0xc990,
                }),
            ),
            (
                "missing header crc",
                header_with(FLAG_HCRC, &[0x90]),
                Err(GzipHeaderError::Truncated { len: 11 }),
            ),
        ] {
            assert_eq!(expected_result, check_header(&input), "{description}");
        }
    }

    #[test]
    fn test_open_rejects_malformed_optional_fields() {
        let deflate_stream = &compress(br#"[{"msg":"a"}]"#)[GZIP_HEADER_LEN..];

        let mut bad_crc = header_with(FLAG_HCRC, &[0xde, 0xad]);
        bad_crc.extend_from_slice(deflate_stream);
        assert!(matches!(
            GzipPayload::open(bad_crc.into()),
            Err(GzipHeaderError::HeaderCrcMismatch { .. })
        ));

        let unterminated_name = header_with(FLAG_NAME, b"abc");
        assert!(matches!(
            GzipPayload::open(unterminated_name.into()),
            Err(GzipHeaderError::Truncated { .. })
        ));
    }

    #[test]
    fn test_read_with_optional_header_fields() {
        use std::io::Write as _;

        let mut encoder = flate2::GzBuilder::new()
            .filename("batch.json")
            .comment("nightly")
            .extra(vec![b'l', b's', 0x00, 0x00])
            .write(Vec::new(), flate2::Compression::fast());
        encoder.write_all(b"hello").unwrap();
        let data = encoder.finish().unwrap();

        let payload = GzipPayload::open(data.into()).unwrap();
        assert_eq!(
            Decompressed::Complete(b"hello".to_vec()),
            payload.read_limited(1024).unwrap()
        );
    }

    #[test]
    fn test_read_limited_at_and_beyond_limit() {
        const MAX: usize = 1024;

        let at_limit = GzipPayload::open(compress(&[b'a'; MAX]).into()).unwrap();
        assert_eq!(
            Decompressed::Complete(vec![b'a'; MAX]),
            at_limit.read_limited(MAX).unwrap()
        );

        let beyond_limit = GzipPayload::open(compress(&[b'a'; MAX + 1]).into()).unwrap();
        assert_eq!(Decompressed::TooLarge, beyond_limit.read_limited(MAX).unwrap());
    }

    #[test]
    fn test_read_concatenated_members() {
        let mut data = compress(b"hello ");
        data.extend(compress(b"world"));

        let payload = GzipPayload::open(data.into()).unwrap();
        assert_eq!(
            Decompressed::Complete(b"hello world".to_vec()),
            payload.read_limited(1024).unwrap()
        );
    }

    #[test]
    fn test_read_truncated_stream_fails() {
        let data = compress(br#"[{"msg":"a"},{"msg":"b"}]"#);
        let truncated = &data[..data.len() - 6];

        let payload = GzipPayload::open(Bytes::copy_from_slice(truncated)).unwrap();
        assert!(payload.read_limited(1024).is_err());
    }

    #[test]
    fn test_read_corrupt_stream_fails() {
        let mut data = compress(b"some log line that will be corrupted");
        // flip the stored crc32
        let crc_offset = data.len() - 8;
        data[crc_offset] ^= 0xff;

        let payload = GzipPayload::open(data.into()).unwrap();
        assert!(payload.read_limited(1024).is_err());
    }
}
