//! Request and response body codecs.
//!
//! Encoding and decoding registry payloads happens outside this crate. The client only resolves
//! the codec pair it was configured with and carries it, so the request layer can find it.

use std::{fmt, sync::Arc};

/// Serializes request bodies.
pub trait EncoderWrapper: Send + Sync {
    /// Name the encoder is registered under.
    fn codec_name(&self) -> &str;

    /// `Content-Type` of encoded bodies.
    fn content_type(&self) -> &str;
}

/// Deserializes response bodies.
pub trait DecoderWrapper: Send + Sync {
    /// Name the decoder is registered under.
    fn codec_name(&self) -> &str;

    /// Returns true if this decoder handles the given client data accept mode (e.g. `full`
    /// or `compact`).
    fn supports(&self, accept: &str) -> bool {
        let _ = accept;
        true
    }
}

/// Resolves codecs by name.
pub trait CodecRegistry: Send + Sync {
    fn encoder(&self, name: &str) -> Option<Arc<dyn EncoderWrapper>>;

    fn decoder(&self, name: &str, accept: &str) -> Option<Arc<dyn DecoderWrapper>>;
}

/// Registry over a fixed set of codecs.
#[derive(Default, Clone)]
pub struct StaticCodecRegistry {
    encoders: Vec<Arc<dyn EncoderWrapper>>,
    decoders: Vec<Arc<dyn DecoderWrapper>>,
}

impl StaticCodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn EncoderWrapper>) -> Self {
        self.encoders.push(encoder);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn DecoderWrapper>) -> Self {
        self.decoders.push(decoder);
        self
    }
}

impl fmt::Debug for StaticCodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCodecRegistry")
            .field(
                "encoders",
                &self.encoders.iter().map(|c| c.codec_name()).collect::<Vec<_>>(),
            )
            .field(
                "decoders",
                &self.decoders.iter().map(|c| c.codec_name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl CodecRegistry for StaticCodecRegistry {
    fn encoder(&self, name: &str) -> Option<Arc<dyn EncoderWrapper>> {
        self.encoders
            .iter()
            .find(|enc| enc.codec_name() == name)
            .cloned()
    }

    /// First decoder registered under `name` that supports `accept`.
    fn decoder(&self, name: &str, accept: &str) -> Option<Arc<dyn DecoderWrapper>> {
        self.decoders
            .iter()
            .find(|dec| dec.codec_name() == name && dec.supports(accept))
            .cloned()
    }
}

/// Codec pair bound to a client.
///
/// An unset codec means the request layer's default applies.
#[derive(Clone, Default)]
pub struct Codecs {
    encoder: Option<Arc<dyn EncoderWrapper>>,
    decoder: Option<Arc<dyn DecoderWrapper>>,
}

impl Codecs {
    pub(crate) fn new(
        encoder: Option<Arc<dyn EncoderWrapper>>,
        decoder: Option<Arc<dyn DecoderWrapper>>,
    ) -> Self {
        Self { encoder, decoder }
    }

    pub fn encoder(&self) -> Option<&Arc<dyn EncoderWrapper>> {
        self.encoder.as_ref()
    }

    pub fn decoder(&self) -> Option<&Arc<dyn DecoderWrapper>> {
        self.decoder.as_ref()
    }
}

impl fmt::Debug for Codecs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codecs")
            .field("encoder", &self.encoder.as_ref().map(|c| c.codec_name()))
            .field("decoder", &self.decoder.as_ref().map(|c| c.codec_name()))
            .finish()
    }
}
