//! Payload encoding families.
//!
//! Every payload carried by the bridge starts with a one-byte discriminant
//! identifying its encoding family. The bridge only reads this byte to keep
//! merged batches homogeneous; it never rewrites payloads.

use std::fmt;

/// Encoding family announced by a payload's leading byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// JSON documents (`{` or `[`).
    Json,
    /// XML documents (`<`).
    Xml,
    /// Any other discriminant, carried verbatim.
    Other(u8),
}

impl Format {
    /// Classify a discriminant byte.
    ///
    /// ```
    /// use queuebridge::format::Format;
    ///
    /// assert_eq!(Format::from_discriminant(b'{'), Format::Json);
    /// assert_eq!(Format::from_discriminant(b'<'), Format::Xml);
    /// assert_eq!(Format::from_discriminant(0x07), Format::Other(0x07));
    /// ```
    #[must_use]
    pub const fn from_discriminant(byte: u8) -> Self {
        match byte {
            b'{' | b'[' => Self::Json,
            b'<' => Self::Xml,
            other => Self::Other(other),
        }
    }

    /// Classify a payload by its first byte, or `None` for an empty payload.
    #[must_use]
    pub fn of(body: &[u8]) -> Option<Self> { body.first().copied().map(Self::from_discriminant) }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => f.write_str("json"),
            Self::Xml => f.write_str("xml"),
            Self::Other(byte) => write!(f, "other(0x{byte:02x})"),
        }
    }
}
