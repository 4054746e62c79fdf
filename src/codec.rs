//! Little-endian primitives used by every `write_to`/`read_from` pair.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

#[inline]
pub(crate) fn write_u8<W: Write>(w: &mut W, value: u8) -> io::Result<()> {
    w.write_all(&[value])
}

#[inline]
pub(crate) fn write_u32<W: Write>(w: &mut W, value: u32) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

#[inline]
pub(crate) fn write_f64<W: Write>(w: &mut W, value: f64) -> io::Result<()> {
    w.write_all(&value.to_le_bytes())
}

/// Write a length or index, failing when it does not fit the u32 on-disk width.
pub(crate) fn write_len<W: Write>(w: &mut W, value: usize, what: &str) -> Result<()> {
    let value = u32::try_from(value)
        .map_err(|_| Error::invalid_data(format!("{} exceeds u32::MAX", what)))?;
    write_u32(w, value)?;
    Ok(())
}

pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    write_len(w, s.len(), "string length")?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub(crate) fn write_metadata<W: Write>(w: &mut W, map: &HashMap<String, String>) -> Result<()> {
    write_len(w, map.len(), "metadata size")?;
    // Sorted keys keep the output byte-stable across runs
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    for (key, value) in entries {
        write_str(w, key)?;
        write_str(w, value)?;
    }
    Ok(())
}

#[inline]
pub(crate) fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

#[inline]
pub(crate) fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

#[inline]
pub(crate) fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

#[inline]
pub(crate) fn read_len<R: Read>(r: &mut R) -> io::Result<usize> {
    read_u32(r).map(|v| v as usize)
}

/// Upper bound on what a count read from a stream may preallocate.
const MAX_PREALLOCATION: usize = 4096;

/// Capacity to reserve for `len` items whose count came from untrusted input.
///
/// Collections still grow past this as items actually arrive.
#[inline]
pub(crate) fn bounded_capacity(len: usize) -> usize {
    len.min(MAX_PREALLOCATION)
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let len = read_len(r)?;
    let mut buf = Vec::with_capacity(bounded_capacity(len));
    r.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "string is truncated").into());
    }
    String::from_utf8(buf).map_err(|_| Error::invalid_data("string is not valid UTF-8"))
}

pub(crate) fn read_metadata<R: Read>(r: &mut R) -> Result<HashMap<String, String>> {
    let len = read_len(r)?;
    let mut map = HashMap::with_capacity(bounded_capacity(len));
    for _ in 0..len {
        let key = read_str(r)?;
        let value = read_str(r)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Check a four byte magic tag at the current stream position.
pub(crate) fn expect_magic<R: Read>(r: &mut R, magic: &[u8; 4]) -> Result<()> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    if &buf != magic {
        return Err(Error::invalid_data(format!(
            "invalid stream format, expected magic {:?}",
            String::from_utf8_lossy(magic)
        )));
    }
    Ok(())
}

/// Unpack a u32 from the start of an in-memory buffer.
#[inline]
pub(crate) fn unpack_u32(buf: &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough data for unpacking u32",
        ));
    }
    Ok(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_metadata_round_trip() {
        let mut map = HashMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "ünïcode".to_string());

        let mut buf = Vec::new();
        write_metadata(&mut buf, &map).unwrap();
        let read = read_metadata(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, map);
    }

    #[test]
    fn test_magic_mismatch() {
        let mut cursor = Cursor::new(b"nope".to_vec());
        let err = expect_magic(&mut cursor, b"lGMF").unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn test_corrupt_lengths_fail_without_allocating() {
        let mut huge = Vec::new();
        write_u32(&mut huge, u32::MAX).unwrap();
        huge.extend_from_slice(b"abc");
        let err = read_str(&mut Cursor::new(huge.clone())).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(read_metadata(&mut Cursor::new(huge)).is_err());
        assert_eq!(bounded_capacity(usize::MAX), MAX_PREALLOCATION);
        assert_eq!(bounded_capacity(3), 3);
    }

    #[test]
    fn test_unpack_short_buffer() {
        let err = unpack_u32(&[1, 2]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
