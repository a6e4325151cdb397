use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Incremental charset -> UTF-8 transcoder for `FramedRead`.
///
/// Multi-byte sequences split across chunks stay inside the decoder until the
/// next chunk arrives, so the CSV reader only ever sees whole UTF-8 text.
pub struct Utf8Transcoder {
    decoder: encoding_rs::Decoder,
    scratch: Vec<u8>,
}

impl Utf8Transcoder {
    pub fn new(encoding: &'static encoding_rs::Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder_with_bom_removal(),
            scratch: Vec::new(),
        }
    }

    fn transcode(&mut self, src: &mut BytesMut, last: bool) -> Option<Bytes> {
        let needed = self
            .decoder
            .max_utf8_buffer_length(src.len())
            .unwrap_or_else(|| src.len() * 3 + 4);
        self.scratch.resize(needed, 0);

        let (_result, read, written, _replaced) =
            self.decoder
                .decode_to_utf8(&src[..], &mut self.scratch, last);
        src.advance(read);

        (written > 0).then(|| Bytes::copy_from_slice(&self.scratch[..written]))
    }
}

impl Decoder for Utf8Transcoder {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        Ok(self.transcode(src, false))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let out = self.transcode(src, true);
        src.clear();
        Ok(out)
    }
}
