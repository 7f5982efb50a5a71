//! Object framing: `total_len u32 | id_len u32 | id | object`

use super::{EncodingError, Result};
use std::io::Write;

/// Bytes of framing in front of every object
pub const OBJECT_HEADER_LEN: usize = 8;

/// Size of a framed object
#[inline]
pub fn framed_len(id: &[u8], object: &[u8]) -> usize {
    OBJECT_HEADER_LEN + id.len() + object.len()
}

/// Write one framed object, returning the number of bytes written.
pub fn marshal_object<W: Write>(id: &[u8], object: &[u8], w: &mut W) -> Result<usize> {
    let total = framed_len(id, object);
    if total > u32::MAX as usize {
        return Err(EncodingError::CorruptObject(format!(
            "object of {} bytes exceeds frame limit",
            total
        )));
    }

    w.write_all(&(total as u32).to_le_bytes())?;
    w.write_all(&(id.len() as u32).to_le_bytes())?;
    w.write_all(id)?;
    w.write_all(object)?;
    Ok(total)
}

/// Read one framed object from the front of `buf`.
///
/// Returns `(id, object, consumed)`.
pub fn unmarshal_object(buf: &[u8]) -> Result<(&[u8], &[u8], usize)> {
    if buf.len() < OBJECT_HEADER_LEN {
        return Err(EncodingError::CorruptObject(format!(
            "{} bytes is shorter than an object header",
            buf.len()
        )));
    }

    let total = read_u32(buf, 0) as usize;
    let id_len = read_u32(buf, 4) as usize;

    if total < OBJECT_HEADER_LEN + id_len || total > buf.len() {
        return Err(EncodingError::CorruptObject(format!(
            "frame of {} bytes with id of {} bytes does not fit in {} bytes",
            total,
            id_len,
            buf.len()
        )));
    }

    let id = &buf[OBJECT_HEADER_LEN..OBJECT_HEADER_LEN + id_len];
    let object = &buf[OBJECT_HEADER_LEN + id_len..total];
    Ok((id, object, total))
}

/// Iterates the framed objects of a decoded page
pub struct ObjectIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> ObjectIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for ObjectIter<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }

        match unmarshal_object(&self.buf[self.pos..]) {
            Ok((id, object, consumed)) => {
                self.pos += consumed;
                Some(Ok((id, object)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Find the largest object stored under `id` in a decoded page.
pub fn find_object<'a>(buf: &'a [u8], id: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut found: Option<&[u8]> = None;
    for entry in ObjectIter::new(buf) {
        let (entry_id, object) = entry?;
        if entry_id == id && found.map_or(true, |f| object.len() > f.len()) {
            found = Some(object);
        }
    }
    Ok(found)
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}
