//! Encoders and decoders for every Rapid wire format.
//!
//! Text indices are plain CSV lines, package indices are packed binary
//! records, and streamer traffic uses a bitmask request with a
//! length-prefixed response. Decoders never panic; malformed input is
//! reported as [`CorruptionError`].

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

use crate::error::CorruptionError;
use crate::hash::Md5Digest;
use crate::types::{BlobEntry, PackageDescriptor, PackageIndex, RepositoryIndex, RootIndex};

/// Fixed bytes after the filename in a package record: md5, crc32, size.
const RECORD_TAIL: usize = Md5Digest::LEN + 4 + 4;

fn text_lines(bytes: &[u8]) -> Result<impl Iterator<Item = (usize, &str)>, CorruptionError> {
    let text = std::str::from_utf8(bytes).map_err(|_| CorruptionError::NotUtf8)?;
    Ok(text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim_end_matches('\r')))
        .filter(|(_, line)| !line.is_empty()))
}

/// Decode a root index (`repos.gz`, already decompressed).
///
/// # Errors
///
/// Fails on non-UTF-8 input, lines without a name and URL, or duplicate names.
pub fn decode_root(bytes: &[u8]) -> Result<RootIndex, CorruptionError> {
    let mut root = RootIndex::new();
    for (line_no, line) in text_lines(bytes)? {
        let mut fields = line.split(',');
        let name = fields.next().unwrap_or_default();
        let url = fields.next().unwrap_or_default();
        if name.is_empty() || url.is_empty() {
            return Err(CorruptionError::MalformedLine {
                line: line_no,
                reason: "expected 'name,url,,'".into(),
            });
        }
        if root.insert(name, url).is_some() {
            return Err(CorruptionError::Duplicate(name.to_string()));
        }
    }
    Ok(root)
}

/// Encode a root index as text.
pub fn encode_root(root: &RootIndex) -> Vec<u8> {
    let mut out = String::new();
    for repo in root.repositories() {
        out.push_str(&repo.name);
        out.push(',');
        out.push_str(&repo.base_url);
        out.push_str(",,\n");
    }
    out.into_bytes()
}

/// Decode a repository index (`versions.gz`, already decompressed).
///
/// # Errors
///
/// Fails on non-UTF-8 input, lines with fewer than four fields, malformed
/// digests, or duplicate tags.
pub fn decode_repository(bytes: &[u8]) -> Result<RepositoryIndex, CorruptionError> {
    let mut repo = RepositoryIndex::new();
    for (line_no, line) in text_lines(bytes)? {
        let fields: Vec<&str> = line.splitn(4, ',').collect();
        let [tag, digest, depends, display_name] = fields[..] else {
            return Err(CorruptionError::MalformedLine {
                line: line_no,
                reason: "expected 'tag,digest,depends,name'".into(),
            });
        };
        if tag.is_empty() {
            return Err(CorruptionError::MalformedLine {
                line: line_no,
                reason: "empty tag".into(),
            });
        }
        repo.insert(PackageDescriptor {
            tag: tag.to_string(),
            digest: Md5Digest::from_hex(digest)?,
            depends: depends
                .split('|')
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect(),
            display_name: display_name.to_string(),
        })?;
    }
    Ok(repo)
}

/// Encode a repository index as text.
pub fn encode_repository(repo: &RepositoryIndex) -> Vec<u8> {
    let mut out = String::new();
    for d in repo.packages() {
        out.push_str(&d.tag);
        out.push(',');
        out.push_str(&d.digest.to_hex());
        out.push(',');
        out.push_str(&d.depends.join("|"));
        out.push(',');
        out.push_str(&d.display_name);
        out.push('\n');
    }
    out.into_bytes()
}

/// Decode a package index (`.sdp`, already decompressed).
///
/// Records are read until the buffer is exhausted; there is no count.
///
/// # Errors
///
/// Fails on truncated records, empty or non-UTF-8 filenames, and filenames
/// that are not strictly ascending.
pub fn decode_package(bytes: &[u8]) -> Result<PackageIndex, CorruptionError> {
    let mut entries: Vec<BlobEntry> = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let name_len = usize::from(bytes[offset]);
        if name_len == 0 {
            return Err(CorruptionError::EmptyFilename(offset));
        }
        let needed = 1 + name_len + RECORD_TAIL;
        let available = bytes.len() - offset;
        if available < needed {
            return Err(CorruptionError::Truncated {
                offset,
                needed,
                available,
            });
        }

        let record = &bytes[offset + 1..offset + needed];
        let (name, tail) = record.split_at(name_len);
        let filename = std::str::from_utf8(name)
            .map_err(|_| CorruptionError::FilenameNotUtf8(offset))?
            .to_string();

        let mut md5 = [0u8; Md5Digest::LEN];
        md5.copy_from_slice(&tail[..Md5Digest::LEN]);
        let crc32 = read_u32_be(&tail[Md5Digest::LEN..]);
        let size = read_u32_be(&tail[Md5Digest::LEN + 4..]);

        if let Some(prev) = entries.last() {
            if prev.filename.as_bytes() >= filename.as_bytes() {
                return Err(CorruptionError::Unordered {
                    previous: prev.filename.clone(),
                    current: filename,
                });
            }
        }

        entries.push(BlobEntry {
            filename,
            content_md5: Md5Digest::from_bytes(md5),
            crc32,
            size,
        });
        offset += needed;
    }

    Ok(PackageIndex::from_sorted(entries))
}

/// Encode a package index to its binary form.
pub fn encode_package(index: &PackageIndex) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in index.entries() {
        out.push(entry.filename.len() as u8);
        out.extend_from_slice(entry.filename.as_bytes());
        out.extend_from_slice(entry.content_md5.as_bytes());
        out.extend_from_slice(&entry.crc32.to_be_bytes());
        out.extend_from_slice(&entry.size.to_be_bytes());
    }
    out
}

fn read_u32_be(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Build a streamer request bitmask: bit `i` (LSB first) of byte `i / 8` is
/// set for every requested position. Positions at or past `count` are ignored.
pub fn encode_bitmask(positions: impl IntoIterator<Item = usize>, count: usize) -> Vec<u8> {
    let mut mask = vec![0u8; count.div_ceil(8)];
    for pos in positions.into_iter().filter(|&p| p < count) {
        mask[pos / 8] |= 1 << (pos % 8);
    }
    mask
}

/// Positions set in a bitmask, ascending, limited to `count`.
pub fn decode_bitmask(mask: &[u8], count: usize) -> Vec<usize> {
    (0..count.min(mask.len() * 8))
        .filter(|&pos| mask[pos / 8] & (1 << (pos % 8)) != 0)
        .collect()
}

/// Split a streamer response into its `[u32 BE len][bytes]` records.
///
/// # Errors
///
/// Returns [`CorruptionError::Truncated`] if a length prefix or body runs
/// past the end of the buffer.
pub fn decode_length_prefixed_stream(bytes: &[u8]) -> Result<Vec<&[u8]>, CorruptionError> {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let available = bytes.len() - offset;
        if available < 4 {
            return Err(CorruptionError::Truncated {
                offset,
                needed: 4,
                available,
            });
        }
        let len = read_u32_be(&bytes[offset..]) as usize;
        let needed = 4 + len;
        if available < needed {
            return Err(CorruptionError::Truncated {
                offset,
                needed,
                available,
            });
        }
        records.push(&bytes[offset + 4..offset + needed]);
        offset += needed;
    }
    Ok(records)
}

/// Concatenate records in the streamer response framing.
pub fn encode_length_prefixed_stream<'a>(records: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        out.extend_from_slice(&(record.len() as u32).to_be_bytes());
        out.extend_from_slice(record);
    }
    out
}

/// Gzip-compress a buffer.
///
/// # Errors
///
/// Propagates encoder I/O errors.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress a gzip buffer.
///
/// # Errors
///
/// Returns [`CorruptionError::Gzip`] for empty, truncated or invalid input.
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>, CorruptionError> {
    if data.is_empty() {
        return Err(CorruptionError::Gzip("empty input".into()));
    }
    let mut out = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CorruptionError::Gzip(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, content: &[u8]) -> BlobEntry {
        BlobEntry {
            filename: name.to_string(),
            content_md5: Md5Digest::compute(content),
            crc32: 0xDEAD_BEEF,
            size: content.len() as u32,
        }
    }

    fn sample_package() -> PackageIndex {
        PackageIndex::new(vec![
            entry("modinfo.lua", b"return {}"),
            entry("units/armcom.lua", b"unit"),
            entry("LuaUI/main.lua", b"ui"),
        ])
        .unwrap()
    }

    #[test]
    fn root_round_trip() {
        let mut root = RootIndex::new();
        root.insert("byar", "https://repos.example.com/byar");
        root.insert("ba", "https://repos.example.com/ba");
        let encoded = encode_root(&root);
        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            "ba,https://repos.example.com/ba,,\nbyar,https://repos.example.com/byar,,\n"
        );
        assert_eq!(decode_root(&encoded).unwrap(), root);
    }

    #[test]
    fn root_ignores_extra_fields_and_blank_lines() {
        let root = decode_root(b"a,http://x/a,,\r\n\nb,http://x/b\n").unwrap();
        assert_eq!(root.len(), 2);
        assert_eq!(root.base_url("b"), Some("http://x/b"));
    }

    #[test]
    fn root_rejects_missing_url() {
        let err = decode_root(b"a,http://x/a,,\nb\n").unwrap_err();
        assert!(matches!(err, CorruptionError::MalformedLine { line: 2, .. }));
    }

    #[test]
    fn root_rejects_duplicate_name() {
        let err = decode_root(b"a,http://x/1,,\na,http://x/2,,\n").unwrap_err();
        assert_eq!(err, CorruptionError::Duplicate("a".into()));
    }

    #[test]
    fn repository_round_trip() {
        let digest = Md5Digest::compute(b"pkg");
        let text = format!("r:2,{digest},base:1|map:x,Game 2, Director's Cut\nr:1,{digest},,Game 1\n");
        let repo = decode_repository(text.as_bytes()).unwrap();

        let d = repo.get("r:2").unwrap();
        assert_eq!(d.depends, vec!["base:1", "map:x"]);
        assert_eq!(d.display_name, "Game 2, Director's Cut");
        assert!(repo.get("r:1").unwrap().depends.is_empty());

        assert_eq!(decode_repository(&encode_repository(&repo)).unwrap(), repo);
    }

    #[test]
    fn repository_rejects_short_line() {
        let err = decode_repository(b"r:1,00000000000000000000000000000000,\n").unwrap_err();
        assert!(matches!(err, CorruptionError::MalformedLine { line: 1, .. }));
    }

    #[test]
    fn repository_rejects_bad_digest() {
        let err = decode_repository(b"r:1,nothex,,Game\n").unwrap_err();
        assert_eq!(err, CorruptionError::InvalidDigest("nothex".into()));
    }

    #[test]
    fn repository_rejects_duplicate_tag() {
        let line = "r:1,00000000000000000000000000000000,,Game\n";
        let err = decode_repository(format!("{line}{line}").as_bytes()).unwrap_err();
        assert_eq!(err, CorruptionError::Duplicate("r:1".into()));
    }

    #[test]
    fn package_round_trip() {
        let index = sample_package();
        let bytes = encode_package(&index);
        let decoded = decode_package(&bytes).unwrap();
        assert_eq!(decoded, index);
        assert_eq!(decoded.digest(), index.digest());
    }

    #[test]
    fn package_record_layout() {
        let index = PackageIndex::new(vec![BlobEntry {
            filename: "a".into(),
            content_md5: Md5Digest::from_bytes([7; 16]),
            crc32: 0x0102_0304,
            size: 0x0A0B_0C0D,
        }])
        .unwrap();
        let bytes = encode_package(&index);
        assert_eq!(bytes.len(), 1 + 1 + 16 + 4 + 4);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], b'a');
        assert_eq!(&bytes[18..22], &[1, 2, 3, 4]);
        assert_eq!(&bytes[22..26], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn package_empty_buffer_is_empty_index() {
        assert!(decode_package(&[]).unwrap().is_empty());
    }

    #[test]
    fn package_truncation_inside_any_record_fails() {
        let bytes = encode_package(&sample_package());
        let mut boundaries = vec![0];
        let mut offset = 0;
        while offset < bytes.len() {
            offset += 1 + usize::from(bytes[offset]) + RECORD_TAIL;
            boundaries.push(offset);
        }

        for cut in 0..bytes.len() {
            let result = decode_package(&bytes[..cut]);
            if boundaries.contains(&cut) {
                assert!(result.is_ok(), "cut at record boundary {cut} should decode");
            } else {
                assert!(
                    matches!(result, Err(CorruptionError::Truncated { .. })),
                    "cut at {cut} should be truncated"
                );
            }
        }
    }

    #[test]
    fn package_rejects_empty_filename() {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(&[0; RECORD_TAIL]);
        assert_eq!(decode_package(&bytes).unwrap_err(), CorruptionError::EmptyFilename(0));
    }

    #[test]
    fn package_rejects_invalid_utf8_name() {
        let mut bytes = vec![2u8, 0xFF, 0xFE];
        bytes.extend_from_slice(&[0; RECORD_TAIL]);
        assert_eq!(decode_package(&bytes).unwrap_err(), CorruptionError::FilenameNotUtf8(0));
    }

    #[test]
    fn package_rejects_unsorted_and_duplicate_names() {
        let a = encode_package(&PackageIndex::new(vec![entry("a", b"1")]).unwrap());
        let b = encode_package(&PackageIndex::new(vec![entry("b", b"2")]).unwrap());

        let unsorted = [b.clone(), a.clone()].concat();
        assert!(matches!(
            decode_package(&unsorted),
            Err(CorruptionError::Unordered { .. })
        ));

        let duplicate = [a.clone(), a].concat();
        assert!(matches!(
            decode_package(&duplicate),
            Err(CorruptionError::Unordered { .. })
        ));
    }

    #[test]
    fn bitmask_is_lsb_first() {
        assert_eq!(encode_bitmask([0, 3, 8], 10), vec![0b0000_1001, 0b0000_0001]);
        assert_eq!(encode_bitmask([], 8), vec![0]);
        assert_eq!(encode_bitmask([], 0), Vec::<u8>::new());
        assert_eq!(encode_bitmask([7, 99], 8), vec![0b1000_0000]);
    }

    #[test]
    fn bitmask_decodes_positions() {
        let mask = encode_bitmask([1, 2, 9, 16], 17);
        assert_eq!(mask.len(), 3);
        assert_eq!(decode_bitmask(&mask, 17), vec![1, 2, 9, 16]);
        assert_eq!(decode_bitmask(&mask, 9), vec![1, 2]);
    }

    #[test]
    fn stream_splits_records() {
        let body = encode_length_prefixed_stream([&b"abc"[..], b"", b"xy"]);
        let records = decode_length_prefixed_stream(&body).unwrap();
        assert_eq!(records, vec![&b"abc"[..], b"", b"xy"]);
    }

    #[test]
    fn stream_rejects_short_prefix_and_short_body() {
        let body = encode_length_prefixed_stream([&b"abc"[..]]);
        for cut in 1..body.len() {
            assert!(matches!(
                decode_length_prefixed_stream(&body[..cut]),
                Err(CorruptionError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn gzip_round_trip_and_garbage() {
        let compressed = gzip(b"hello rapid").unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"hello rapid");
        assert!(matches!(gunzip(b"not gzip"), Err(CorruptionError::Gzip(_))));
        assert!(matches!(gunzip(&[]), Err(CorruptionError::Gzip(_))));
        assert!(matches!(
            gunzip(&compressed[..compressed.len() - 4]),
            Err(CorruptionError::Gzip(_))
        ));
    }
}
