//! ICY in-band metadata.
//!
//! Players that send `Icy-MetaData: 1` expect a metadata block after every
//! `icy-metaint` bytes of audio. A block is one length byte `n` followed by
//! `16 * n` bytes of text, zero padded: `StreamTitle='Artist - Title';`.
//! An empty block (`n = 0`) means "unchanged".

use bytes::{BufMut, Bytes, BytesMut};

/// Audio bytes between metadata blocks unless configured otherwise.
pub const DEFAULT_INTERVAL: usize = 16_000;

/// Largest text a block can carry.
const MAX_TEXT_LEN: usize = 255 * 16;

/// Encodes `title` as a metadata block.
#[must_use]
pub fn encode_title(title: &str) -> Bytes {
    // Single quotes delimit the value and players do not unescape them.
    let title = title.replace('\'', "’");
    let mut text = format!("StreamTitle='{title}';");

    if text.len() > MAX_TEXT_LEN {
        let mut end = MAX_TEXT_LEN - 2;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("';");
    }

    let blocks = text.len().div_ceil(16);
    let mut block = BytesMut::with_capacity(1 + blocks * 16);
    #[expect(clippy::cast_possible_truncation)]
    block.put_u8(blocks as u8);
    block.put_slice(text.as_bytes());
    block.resize(1 + blocks * 16, 0);
    block.freeze()
}

/// Interleaves metadata blocks into an audio byte stream.
#[derive(Clone, Debug)]
pub struct MetadataInjector {
    interval: usize,
    until_block: usize,
    title: Option<Bytes>,
}

impl MetadataInjector {
    /// Creates an injector whose first block carries `title`.
    ///
    /// An `interval` of zero is treated as one.
    #[must_use]
    pub fn new(interval: usize, title: &str) -> Self {
        let interval = interval.max(1);
        Self {
            interval,
            until_block: interval,
            title: Some(encode_title(title)),
        }
    }

    /// Audio bytes between metadata blocks, as announced in `icy-metaint`.
    #[must_use]
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Returns `audio` with metadata blocks inserted where due.
    ///
    /// Keeps count across calls, so chunk boundaries do not matter.
    pub fn inject(&mut self, mut audio: Bytes) -> Bytes {
        if audio.len() < self.until_block {
            self.until_block -= audio.len();
            return audio;
        }

        let mut out = BytesMut::with_capacity(audio.len() + audio.len() / self.interval + 64);
        while audio.len() >= self.until_block {
            out.put(audio.split_to(self.until_block));
            match self.title.take() {
                Some(title) => out.put(title),
                None => out.put_u8(0),
            }
            self.until_block = self.interval;
        }

        self.until_block -= audio.len();
        out.put(audio);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_padded_title_block() {
        let block = encode_title("Artist - Title");
        let text = b"StreamTitle='Artist - Title';";

        assert_eq!(block[0], 2);
        assert_eq!(block.len(), 1 + 32);
        assert_eq!(&block[1..=text.len()], text);
        assert!(block[1 + text.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn truncates_long_titles_on_char_boundary() {
        let block = encode_title(&"é".repeat(4_000));
        assert_eq!(block[0], 255);
        assert_eq!(block.len(), 1 + MAX_TEXT_LEN);

        let text = std::str::from_utf8(&block[1..])
            .unwrap()
            .trim_end_matches('\0');
        assert!(text.starts_with("StreamTitle='"));
        assert!(text.ends_with("';"));
    }

    #[test]
    fn replaces_quotes() {
        let block = encode_title("Guns N' Roses - Patience");
        let text = std::str::from_utf8(&block[1..]).unwrap();
        assert!(text.starts_with("StreamTitle='Guns N’ Roses - Patience';"));
    }

    #[test]
    fn interleaves_across_chunks() {
        let mut injector = MetadataInjector::new(4, "A - B");
        let title = encode_title("A - B");

        let mut out = Vec::new();
        for chunk in [&b"ab"[..], b"cdef", b"ghijk"] {
            out.extend_from_slice(&injector.inject(Bytes::copy_from_slice(chunk)));
        }

        let mut expected = b"abcd".to_vec();
        expected.extend_from_slice(&title);
        expected.extend_from_slice(b"efgh");
        expected.push(0);
        expected.extend_from_slice(b"ijk");
        assert_eq!(out, expected);
    }

    #[test]
    fn passes_short_chunks_through() {
        let mut injector = MetadataInjector::new(DEFAULT_INTERVAL, "A - B");
        let audio = Bytes::from_static(b"hello");
        assert_eq!(injector.inject(audio.clone()), audio);
    }
}
