//! The contract between a datamodel and its wire formats.
//!
//! Codecs are registered process-wide under an `(encoding, version)` key.
//! Loading sniffs the leading header line to pick one; saving names one
//! explicitly. A decoder may leave bulk values as deferred offsets and is
//! then kept alive, behind a codec-wide lock, to service per-attribute
//! decode calls until the datamodel releases it.

use std::collections::HashMap;
use std::fmt;
use std::io::{BufRead, Write};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use crate::attribute::Value;
use crate::datamodel::Datamodel;
use crate::error::{CodecSourceError, DmError, Result};

/// The parsed first line of a DMX stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub encoding: String,
    pub encoding_version: i32,
    pub format: String,
    pub format_version: i32,
}

impl Header {
    /// Longest header line we are willing to scan for before giving up.
    const MAX_HEADER_LENGTH: usize = 168;

    pub fn new(encoding: impl Into<String>, encoding_version: i32, format: impl Into<String>, format_version: i32) -> Self {
        Self {
            encoding: encoding.into(),
            encoding_version,
            format: format.into(),
            format_version,
        }
    }

    /// Consume exactly the header line (through the newline) from the
    /// reader and parse it. Nothing past the newline is read.
    pub fn read_from(reader: &mut impl BufRead) -> Result<Self> {
        let mut line = Vec::with_capacity(64);
        loop {
            if line.len() >= Self::MAX_HEADER_LENGTH {
                return Err(DmError::UnsupportedFormat("no header line within the first 168 bytes".to_string()));
            }
            let mut byte = [0u8; 1];
            if let Err(error) = reader.read_exact(&mut byte) {
                if error.kind() == std::io::ErrorKind::UnexpectedEof {
                    return Err(DmError::UnsupportedFormat("stream ended before the header line".to_string()));
                }
                return Err(error.into());
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }

        let line = std::str::from_utf8(&line).map_err(|_| DmError::UnsupportedFormat("header line is not valid ASCII".to_string()))?;
        Self::parse(line)
    }

    pub fn parse(line: &str) -> Result<Self> {
        static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"<!-- dmx encoding (\S+) (\d+) format (\S+) (\d+) -->").unwrap());

        let captures = HEADER
            .captures(line)
            .ok_or_else(|| DmError::UnsupportedFormat(format!("malformed header line: {}", line.trim_end())))?;

        let parse_version = |text: &str| {
            text.parse::<i32>()
                .map_err(|error| DmError::UnsupportedFormat(format!("bad version number in header: {error}")))
        };

        Ok(Self {
            encoding: captures[1].to_string(),
            encoding_version: parse_version(&captures[2])?,
            format: captures[3].to_string(),
            format_version: parse_version(&captures[4])?,
        })
    }

    /// Render the header line, trailing newline included.
    pub fn to_line(&self) -> String {
        format!(
            "<!-- dmx encoding {} {} format {} {} -->\n",
            self.encoding, self.encoding_version, self.format, self.format_version
        )
    }
}

/// How eagerly a decoder must materialize attribute values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeferredMode {
    /// Everything is decoded up front.
    Disabled,
    /// The codec may defer large or expensive values.
    #[default]
    Automatic,
    /// The codec defers everything it is able to.
    Always,
}

/// A pluggable encoder/decoder for one wire form.
pub trait Codec: Send + Sync {
    /// The encoding name this codec serves, e.g. `"binary"`.
    fn encoding(&self) -> &'static str;

    /// Write the datamodel, header line included, at the given encoding
    /// version. Attributes are materialized before this is called.
    fn encode(&self, datamodel: &Datamodel, header: &Header, sink: &mut dyn Write) -> Result<()>;

    /// Build a datamodel from the stream positioned just past the header
    /// line. The codec binds itself to the result if it left any value
    /// deferred.
    fn decode(&self, header: &Header, source: &mut dyn BufRead, mode: DeferredMode) -> Result<Datamodel>;
}

/// The retained decoder half used to service deferred attribute loads.
///
/// Calls are serialized by the binding's mutex; implementations only need
/// to be safe for one caller at a time.
pub trait DeferredDecoder: Send {
    fn decode_deferred(&mut self, offset: u64) -> std::result::Result<Value, CodecSourceError>;
}

/// The codec handle a datamodel keeps while deferred attributes remain.
/// Releasing drops the decoder (and whatever stream it holds) but keeps
/// the identity so later failures can still name the codec.
pub struct CodecBinding {
    encoding: String,
    version: i32,
    decoder: Mutex<Option<Box<dyn DeferredDecoder>>>,
}

impl CodecBinding {
    pub fn new(encoding: impl Into<String>, version: i32, decoder: Box<dyn DeferredDecoder>) -> Self {
        Self {
            encoding: encoding.into(),
            version,
            decoder: Mutex::new(Some(decoder)),
        }
    }

    pub fn encoding(&self) -> &str {
        &self.encoding
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Identity string used in error context, e.g. `"binary 5"`.
    pub fn identity(&self) -> String {
        format!("{} {}", self.encoding, self.version)
    }

    pub(crate) fn decode_deferred(&self, offset: u64) -> std::result::Result<Value, CodecSourceError> {
        let mut decoder = self.decoder.lock();
        match decoder.as_mut() {
            Some(decoder) => decoder.decode_deferred(offset),
            None => Err("codec disposed".into()),
        }
    }

    pub(crate) fn release(&self) {
        *self.decoder.lock() = None;
    }
}

impl fmt::Debug for CodecBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecBinding")
            .field("encoding", &self.encoding)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

type CodecKey = (String, i32);

static CODECS: Lazy<RwLock<HashMap<CodecKey, Arc<dyn Codec>>>> = Lazy::new(|| {
    let mut table: HashMap<CodecKey, Arc<dyn Codec>> = HashMap::new();

    let binary: Arc<dyn Codec> = Arc::new(crate::codecs::binary::BinaryCodec);
    for version in crate::codecs::binary::SUPPORTED_VERSIONS {
        table.insert(("binary".to_string(), version), Arc::clone(&binary));
    }

    let keyvalues2: Arc<dyn Codec> = Arc::new(crate::codecs::keyvalues2::KeyValues2Codec);
    table.insert(("keyvalues2".to_string(), 1), keyvalues2);

    RwLock::new(table)
});

/// Register a codec under an `(encoding, version)` key, replacing any
/// previous registration.
pub fn register_codec(encoding: &str, version: i32, codec: Arc<dyn Codec>) {
    CODECS
        .write()
        .expect("codec registry poisoned")
        .insert((encoding.to_string(), version), codec);
}

/// Look up a registered codec.
pub fn lookup_codec(encoding: &str, version: i32) -> Result<Arc<dyn Codec>> {
    CODECS
        .read()
        .expect("codec registry poisoned")
        .get(&(encoding.to_string(), version))
        .cloned()
        .ok_or_else(|| DmError::CodecNotFound {
            encoding: encoding.to_string(),
            version,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_line_round_trips() {
        let header = Header::new("binary", 5, "model", 18);
        let line = header.to_line();
        assert_eq!(line, "<!-- dmx encoding binary 5 format model 18 -->\n");
        assert_eq!(Header::parse(&line).unwrap(), header);
    }

    #[test]
    fn read_from_stops_at_newline() {
        let bytes = b"<!-- dmx encoding keyvalues2 1 format dmx 18 -->\ntrailing";
        let mut reader = &bytes[..];
        let header = Header::read_from(&mut reader).unwrap();
        assert_eq!(header.encoding, "keyvalues2");
        assert_eq!(reader, b"trailing");
    }

    #[test]
    fn malformed_header_is_rejected() {
        assert!(matches!(Header::parse("<!-- not a dmx header -->"), Err(DmError::UnsupportedFormat(_))));

        let endless = [b'x'; 200];
        let mut reader = &endless[..];
        assert!(matches!(Header::read_from(&mut reader), Err(DmError::UnsupportedFormat(_))));
    }

    #[test]
    fn builtin_codecs_are_registered() {
        assert!(lookup_codec("binary", 5).is_ok());
        assert!(lookup_codec("binary", 2).is_ok());
        assert!(lookup_codec("keyvalues2", 1).is_ok());
        assert!(matches!(
            lookup_codec("binary", 99),
            Err(DmError::CodecNotFound { version: 99, .. })
        ));
    }

    #[test]
    fn released_binding_reports_disposed() {
        struct NoopDecoder;

        impl DeferredDecoder for NoopDecoder {
            fn decode_deferred(&mut self, _offset: u64) -> std::result::Result<Value, CodecSourceError> {
                Ok(Value::Int(1))
            }
        }

        let binding = CodecBinding::new("binary", 5, Box::new(NoopDecoder));
        assert!(binding.decode_deferred(8).is_ok());

        binding.release();
        let error = binding.decode_deferred(8).unwrap_err();
        assert!(error.to_string().contains("disposed"));
    }
}
