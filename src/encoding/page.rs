//! Page framing: `total_len u32 | header_len u16 | header | data`
//!
//! Every cut of a [`DataWriter`] produces exactly one page. The page data is a
//! run of framed objects compressed as a unit, so a [`Record`](super::Record)
//! pointing at a page can be fetched with one ranged read and decoded alone.

use super::object::{marshal_object, read_u32};
use super::{Encoding, EncodingError, Result};
use std::io::{self, Read, Write};

/// Fixed bytes in front of every page header
pub const PAGE_FRAME_LEN: usize = 6;

/// Sink for framed objects, cut into pages on demand
pub trait DataWriter: Send {
    /// Buffer one object. Returns the framed size buffered.
    fn write(&mut self, id: &[u8], object: &[u8]) -> Result<usize>;

    /// Flush buffered objects as a single page. Returns the bytes written to
    /// the underlying stream, or 0 when nothing was buffered.
    fn cut_page(&mut self) -> Result<usize>;

    /// Flush any remaining data and the underlying stream.
    fn complete(&mut self) -> Result<()>;
}

/// [`DataWriter`] over any `Write`, compressing each page with `encoding`
pub struct PagedDataWriter<W: Write + Send> {
    inner: W,
    encoding: Encoding,
    buffer: Vec<u8>,
}

impl<W: Write + Send> PagedDataWriter<W> {
    pub fn new(inner: W, encoding: Encoding) -> Self {
        Self {
            inner,
            encoding,
            buffer: Vec::new(),
        }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> DataWriter for PagedDataWriter<W> {
    fn write(&mut self, id: &[u8], object: &[u8]) -> Result<usize> {
        marshal_object(id, object, &mut self.buffer)
    }

    fn cut_page(&mut self) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let data = self.encoding.compress(&self.buffer)?;
        self.buffer.clear();
        write_page(&mut self.inner, &[], &data)
    }

    fn complete(&mut self) -> Result<()> {
        self.cut_page()?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Write one page with the given header and already-encoded data.
pub fn write_page<W: Write>(w: &mut W, header: &[u8], data: &[u8]) -> Result<usize> {
    let total = PAGE_FRAME_LEN + header.len() + data.len();
    if header.len() > u16::MAX as usize || total > u32::MAX as usize {
        return Err(EncodingError::CorruptPage(format!(
            "page of {} bytes is too large",
            total
        )));
    }

    let mut page = Vec::with_capacity(total);
    page.extend_from_slice(&(total as u32).to_le_bytes());
    page.extend_from_slice(&(header.len() as u16).to_le_bytes());
    page.extend_from_slice(header);
    page.extend_from_slice(data);
    w.write_all(&page)?;
    Ok(total)
}

/// Split one framed page into `(header, data, consumed)`.
pub fn split_page(buf: &[u8]) -> Result<(&[u8], &[u8], usize)> {
    if buf.len() < PAGE_FRAME_LEN {
        return Err(EncodingError::CorruptPage(format!(
            "{} bytes is shorter than a page frame",
            buf.len()
        )));
    }

    let total = read_u32(buf, 0) as usize;
    let header_len = u16::from_le_bytes([buf[4], buf[5]]) as usize;

    if total < PAGE_FRAME_LEN + header_len || total > buf.len() {
        return Err(EncodingError::CorruptPage(format!(
            "page of {} bytes with header of {} bytes does not fit in {} bytes",
            total,
            header_len,
            buf.len()
        )));
    }

    let header = &buf[PAGE_FRAME_LEN..PAGE_FRAME_LEN + header_len];
    let data = &buf[PAGE_FRAME_LEN + header_len..total];
    Ok((header, data, total))
}

/// Decode the objects of one or more consecutive pages into a flat buffer of
/// framed objects.
pub fn decode_pages(buf: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let (_, data, consumed) = split_page(&buf[pos..])?;
        out.extend_from_slice(&encoding.decompress(data)?);
        pos += consumed;
    }
    Ok(out)
}

/// A page read back from a stream
#[derive(Debug, Clone)]
pub struct RawPage {
    pub offset: u64,
    pub length: u32,
    pub data: Vec<u8>,
}

/// Sequential page reader used by WAL replay
pub struct PageReader<R: Read> {
    inner: R,
    offset: u64,
}

impl<R: Read> PageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, offset: 0 }
    }

    /// Read the next page. `Ok(None)` at a clean end of stream; a partially
    /// written trailing page is reported as [`EncodingError::CorruptPage`].
    pub fn next_page(&mut self) -> Result<Option<RawPage>> {
        let mut frame = [0u8; PAGE_FRAME_LEN];
        let n = read_full(&mut self.inner, &mut frame)?;
        if n == 0 {
            return Ok(None);
        }
        if n < PAGE_FRAME_LEN {
            return Err(EncodingError::CorruptPage(format!(
                "truncated page frame at offset {}",
                self.offset
            )));
        }

        let total = read_u32(&frame, 0) as usize;
        let header_len = u16::from_le_bytes([frame[4], frame[5]]) as usize;
        if total < PAGE_FRAME_LEN + header_len {
            return Err(EncodingError::CorruptPage(format!(
                "invalid page length {} at offset {}",
                total, self.offset
            )));
        }

        // grows with what is actually there, not with what the frame claims
        let want = (total - PAGE_FRAME_LEN) as u64;
        let mut rest = Vec::new();
        (&mut self.inner).take(want).read_to_end(&mut rest)?;
        if (rest.len() as u64) < want {
            return Err(EncodingError::CorruptPage(format!(
                "truncated page at offset {}",
                self.offset
            )));
        }

        let page = RawPage {
            offset: self.offset,
            length: total as u32,
            data: rest.split_off(header_len),
        };
        self.offset += total as u64;
        Ok(Some(page))
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
