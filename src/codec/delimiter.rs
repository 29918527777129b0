//! Delimiter-based framing.

use crate::buffer::ChannelBuffer;
use crate::codec::frame::Decoder;
use crate::error::{NetError, NetResult};
use bytes::Bytes;

/// Common delimiter sets.
pub struct Delimiters;

impl Delimiters {
    /// `\r\n` and `\n`.
    pub fn line() -> Vec<Bytes> {
        vec![Bytes::from_static(b"\r\n"), Bytes::from_static(b"\n")]
    }

    /// A single NUL byte, as used by Flash XML sockets.
    pub fn nul() -> Vec<Bytes> {
        vec![Bytes::from_static(b"\0")]
    }
}

/// Splits the stream on one or more delimiters.
///
/// When several delimiters match, the one producing the shortest frame wins.
/// A frame longer than `max_frame_length` fails with `TooLongFrame`; its
/// bytes are discarded up to and including the next delimiter, so decoding
/// resumes with the frame after it.
pub struct DelimiterBasedFrameDecoder {
    delimiters: Vec<Bytes>,
    max_frame_length: usize,
    strip_delimiter: bool,
    /// Set while skipping the tail of an oversized frame
    discarding: bool,
    discarded: usize,
}

impl DelimiterBasedFrameDecoder {
    /// Creates a decoder that strips the delimiter from each frame.
    pub fn new(max_frame_length: usize, delimiters: Vec<Bytes>) -> NetResult<Self> {
        if max_frame_length == 0 {
            return Err(NetError::invalid_option(
                "maxFrameLength",
                "must be a positive integer",
            ));
        }
        let delimiters: Vec<Bytes> = delimiters.into_iter().filter(|d| !d.is_empty()).collect();
        if delimiters.is_empty() {
            return Err(NetError::invalid_option(
                "delimiters",
                "at least one non-empty delimiter is required",
            ));
        }
        Ok(Self {
            delimiters,
            max_frame_length,
            strip_delimiter: true,
            discarding: false,
            discarded: 0,
        })
    }

    /// Newline-delimited frames (`\n` or `\r\n`).
    pub fn lines(max_frame_length: usize) -> NetResult<Self> {
        Self::new(max_frame_length, Delimiters::line())
    }

    /// Keeps the delimiter at the end of each frame.
    pub fn keep_delimiter(mut self) -> Self {
        self.strip_delimiter = false;
        self
    }

    /// The shortest frame ending in a delimiter, as (frame length, delimiter
    /// length).
    fn find_frame(&self, buffer: &ChannelBuffer) -> Option<(usize, usize)> {
        self.delimiters
            .iter()
            .filter_map(|delimiter| {
                buffer
                    .index_of(delimiter)
                    .map(|index| (index, delimiter.len()))
            })
            .min_by_key(|(index, _)| *index)
    }

    fn too_long(&self, length: usize) -> NetError {
        NetError::TooLongFrame(format!(
            "frame length exceeds {}: {}",
            self.max_frame_length, length
        ))
    }
}

impl Decoder for DelimiterBasedFrameDecoder {
    type Frame = ChannelBuffer;

    fn decode(&mut self, buffer: &mut ChannelBuffer) -> NetResult<Option<ChannelBuffer>> {
        match self.find_frame(buffer) {
            Some((length, delimiter)) if self.discarding => {
                buffer.skip_bytes(length + delimiter)?;
                self.discarding = false;
                self.discarded = 0;
                Ok(None)
            }
            Some((length, delimiter)) if length > self.max_frame_length => {
                buffer.skip_bytes(length + delimiter)?;
                Err(self.too_long(length))
            }
            Some((length, delimiter)) => {
                let frame = if self.strip_delimiter {
                    let frame = buffer.read_bytes(length)?;
                    buffer.skip_bytes(delimiter)?;
                    frame
                } else {
                    buffer.read_bytes(length + delimiter)?
                };
                Ok(Some(frame))
            }
            None if self.discarding => {
                let readable = buffer.readable_bytes();
                self.discarded += readable;
                buffer.skip_bytes(readable)?;
                Ok(None)
            }
            None if buffer.readable_bytes() > self.max_frame_length => {
                // No delimiter in sight and already too long: drop it all and
                // keep dropping until the next delimiter
                let readable = buffer.readable_bytes();
                buffer.skip_bytes(readable)?;
                self.discarding = true;
                self.discarded = readable;
                Err(self.too_long(readable))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHandler;
    use crate::codec::frame::{decode_frames, FrameDecoder};
    use crate::codec::testing::Harness;

    fn decode_all(decoder: &mut DelimiterBasedFrameDecoder, input: &str) -> Vec<String> {
        let mut buffer = ChannelBuffer::from(input);
        let mut frames = Vec::new();
        decode_frames(decoder, &mut buffer, &mut frames).unwrap();
        frames.iter().map(ChannelBuffer::to_string_lossy).collect()
    }

    #[test]
    fn test_newline_scenario() {
        let harness = Harness::new(vec![(
            "framer",
            ChannelHandler::upstream(FrameDecoder::new(
                DelimiterBasedFrameDecoder::lines(8192).unwrap(),
            )),
        )]);
        harness.feed(b"he");
        assert!(harness.frames().is_empty());
        harness.feed(b"llo\nworld\n");
        assert_eq!(harness.frames(), vec!["hello", "world"]);
    }

    #[test]
    fn test_shortest_frame_wins() {
        let mut decoder = DelimiterBasedFrameDecoder::lines(64).unwrap();
        assert_eq!(decode_all(&mut decoder, "a\r\nb\nc"), vec!["a", "b"]);
    }

    #[test]
    fn test_keep_delimiter() {
        let mut decoder = DelimiterBasedFrameDecoder::new(64, Delimiters::nul())
            .unwrap()
            .keep_delimiter();
        assert_eq!(decode_all(&mut decoder, "x\0y\0"), vec!["x\0", "y\0"]);
    }

    #[test]
    fn test_too_long_frame_with_delimiter_is_skipped() {
        let mut decoder = DelimiterBasedFrameDecoder::lines(4).unwrap();
        let mut buffer = ChannelBuffer::from("toolong\nok\n");
        let mut frames = Vec::new();

        let err = decode_frames(&mut decoder, &mut buffer, &mut frames).unwrap_err();
        assert!(matches!(err, NetError::TooLongFrame(_)));
        assert!(frames.is_empty());

        decode_frames(&mut decoder, &mut buffer, &mut frames).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].to_string_lossy(), "ok");
    }

    #[test]
    fn test_too_long_frame_without_delimiter_discards_until_next() {
        let harness = Harness::new(vec![(
            "framer",
            ChannelHandler::upstream(FrameDecoder::new(
                DelimiterBasedFrameDecoder::lines(4).unwrap(),
            )),
        )]);
        harness.feed(b"abcdef");
        assert_eq!(harness.errors().len(), 1);
        harness.feed(b"ghi\nok\n");
        assert_eq!(harness.frames(), vec!["ok"]);
        assert_eq!(harness.errors().len(), 1);
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(DelimiterBasedFrameDecoder::lines(0).is_err());
        assert!(DelimiterBasedFrameDecoder::new(8, vec![Bytes::new()]).is_err());
    }
}
