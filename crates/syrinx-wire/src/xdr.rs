// XDR-style primitives shared by the packet, value, and expression codecs.
// Everything is big-endian; strings and opaques are length-prefixed and
// padded to a four-byte boundary.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

pub(crate) fn get_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_u64())
}

pub(crate) fn get_i32(buf: &mut Bytes) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_i32())
}

pub(crate) fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_i64())
}

pub(crate) fn get_f64(buf: &mut Bytes) -> Result<f64> {
    if buf.remaining() < 8 {
        return Err(Error::Truncated);
    }
    Ok(buf.get_f64())
}

pub(crate) fn get_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(get_u32(buf)? != 0)
}

pub(crate) fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u32(u32::from(value));
}

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

pub(crate) fn put_opaque(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
    buf.put_bytes(0, padding(value.len()));
}

pub(crate) fn get_opaque(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(buf)? as usize;
    let padded = len + padding(len);
    if buf.remaining() < padded {
        return Err(Error::Truncated);
    }
    let value = buf.slice(0..len);
    buf.advance(padded);
    Ok(value)
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_opaque(buf, value.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    let raw = get_opaque(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::InvalidUtf8)
}
