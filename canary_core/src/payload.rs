use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("truncated escape sequence at position {0}")]
    TruncatedEscape(usize),

    #[error("invalid hex escape \\x{0}")]
    InvalidHex(String),

    #[error("unknown escape \\{0}")]
    UnknownEscape(char),

    #[error("expected exactly one byte, got {0}")]
    NotOneByte(usize),
}

/// Builds probe payloads: `prefix`, then padding, then whatever is being guessed.
#[derive(Debug, Clone, Copy)]
pub struct PayloadBuilder<'a> {
    prefix: &'a [u8],
    pad: u8,
}

impl<'a> PayloadBuilder<'a> {
    pub fn new(prefix: &'a [u8], pad: u8) -> Self {
        Self { prefix, pad }
    }

    /// `prefix + pad * len`
    pub fn padded(&self, len: usize) -> Vec<u8> {
        self.with_tail(len, &[])
    }

    /// `prefix + pad * offset + tail`
    pub fn with_tail(&self, offset: usize, tail: &[u8]) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.prefix.len() + offset + tail.len());
        data.extend_from_slice(self.prefix);
        data.resize(self.prefix.len() + offset, self.pad);
        data.extend_from_slice(tail);
        data
    }
}

/// Decodes `\xHH`, `\n`, `\r`, `\t`, `\0` and `\\`. Other characters are kept as
/// their UTF-8 bytes.
pub fn parse_escaped(s: &str) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.char_indices();
    while let Some((pos, c)) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let (_, esc) = chars.next().ok_or(PayloadError::TruncatedEscape(pos))?;
        match esc {
            'x' => {
                let hi = chars.next().map(|(_, c)| c);
                let lo = chars.next().map(|(_, c)| c);
                let (Some(hi), Some(lo)) = (hi, lo) else {
                    return Err(PayloadError::TruncatedEscape(pos));
                };
                let digits: String = [hi, lo].iter().collect();
                if !hi.is_ascii_hexdigit() || !lo.is_ascii_hexdigit() {
                    return Err(PayloadError::InvalidHex(digits));
                }
                let byte =
                    u8::from_str_radix(&digits, 16).map_err(|_| PayloadError::InvalidHex(digits))?;
                out.push(byte);
            }
            'n' => out.push(b'\n'),
            'r' => out.push(b'\r'),
            't' => out.push(b'\t'),
            '0' => out.push(0),
            '\\' => out.push(b'\\'),
            other => return Err(PayloadError::UnknownEscape(other)),
        }
    }
    Ok(out)
}

/// Parses a padding byte given as a single character or a single escape.
///
/// A lone character up to U+00FF stands for its Latin-1 byte, so `é` is `0xe9`.
pub fn parse_pad(s: &str) -> Result<u8, PayloadError> {
    let mut chars = s.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if c != '\\' {
            return u8::try_from(c).map_err(|_| PayloadError::NotOneByte(c.len_utf8()));
        }
    }
    match parse_escaped(s)?.as_slice() {
        [b] => Ok(*b),
        other => Err(PayloadError::NotOneByte(other.len())),
    }
}
