use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Literal byte marker separating consecutive messages on the wire.
pub const SEPARATOR: &[u8] = b"<?!!?>";

/// Ceiling on a single frame. Inline transfers top out at 50 MiB of file
/// bytes, which hex-encoding and the JSON envelope roughly double.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

/// Frames are arbitrary byte runs terminated by [`SEPARATOR`]. The decoder
/// keeps a scan cursor so a partial separator split across reads is found
/// without rescanning the whole buffer.
pub struct SeparatorCodec {
    max_frame_length: usize,
    scanned: usize,
}

impl Default for SeparatorCodec {
    fn default() -> Self {
        Self {
            max_frame_length: MAX_FRAME_LENGTH,
            scanned: 0,
        }
    }
}

impl SeparatorCodec {
    pub fn with_max_length(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            scanned: 0,
        }
    }
}

fn find_separator(haystack: &[u8], from: usize) -> Option<usize> {
    if haystack.len() < SEPARATOR.len() {
        return None;
    }
    (from..=haystack.len() - SEPARATOR.len())
        .find(|&i| &haystack[i..i + SEPARATOR.len()] == SEPARATOR)
}

impl Decoder for SeparatorCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, io::Error> {
        match find_separator(src, self.scanned) {
            Some(at) => {
                let frame = src.split_to(at).freeze();
                src.advance(SEPARATOR.len());
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                if src.len() > self.max_frame_length {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("frame exceeds {} bytes", self.max_frame_length),
                    ));
                }
                // Leave enough tail unscanned to catch a split separator.
                self.scanned = src.len().saturating_sub(SEPARATOR.len() - 1);
                Ok(None)
            }
        }
    }
}

impl Encoder<Bytes> for SeparatorCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.reserve(item.len() + SEPARATOR.len());
        dst.put(item);
        dst.put_slice(SEPARATOR);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut SeparatorCodec, buf: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_decode_splits_on_separator() {
        let mut codec = SeparatorCodec::default();
        let mut buf = BytesMut::from(&b"first<?!!?>second<?!!?>"[..]);

        let frames = decode_all(&mut codec, &mut buf);
        assert_eq!(frames, vec![Bytes::from("first"), Bytes::from("second")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_handles_separator_split_across_reads() {
        let mut codec = SeparatorCodec::default();
        let mut buf = BytesMut::from(&b"payload<?!"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"!?>rest");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::from("payload")));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_empty_frame() {
        let mut codec = SeparatorCodec::default();
        let mut buf = BytesMut::from(&b"<?!!?>"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Bytes::new()));
    }

    #[test]
    fn test_oversized_frame_is_an_error() {
        let mut codec = SeparatorCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"0123456789abcdef"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_encode_appends_separator() {
        let mut codec = SeparatorCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from("msg"), &mut buf).unwrap();
        assert_eq!(&buf[..], b"msg<?!!?>");
    }
}
