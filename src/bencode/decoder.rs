use crate::error::{BittorrentError, Result};
use super::BencodeValue;
use std::collections::BTreeMap;

/// Lists and dictionaries nested deeper than this are rejected
const MAX_DEPTH: usize = 64;

/// Decode bencoded data into a BencodeValue
pub fn decode(data: &[u8]) -> Result<BencodeValue> {
    Decoder::new(data).value()
}

/// Return the raw encoded bytes of `key`'s value in a top-level dictionary.
///
/// The info hash is computed over exactly these bytes, so they are sliced
/// out of the input rather than re-encoded.
pub fn raw_dict_value<'a>(data: &'a [u8], key: &[u8]) -> Result<&'a [u8]> {
    let mut decoder = Decoder::new(data);
    decoder.expect(b'd')?;

    while decoder.peek()? != b'e' {
        let entry_key = decoder.bytes()?;
        let start = decoder.pos;
        decoder.skip_value()?;
        if entry_key == key {
            return Ok(&data[start..decoder.pos]);
        }
    }

    Err(BittorrentError::BencodeError(format!(
        "Key '{}' not found",
        String::from_utf8_lossy(key)
    )))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| {
            BittorrentError::BencodeError("Unexpected end of input".to_string())
        })
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.peek()? != byte {
            return Err(BittorrentError::BencodeError(format!(
                "Expected '{}' at offset {}",
                byte as char, self.pos
            )));
        }
        self.pos += 1;
        Ok(())
    }

    /// Read bytes up to (not including) `terminator` and consume it
    fn until(&mut self, terminator: u8) -> Result<&'a [u8]> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| {
                BittorrentError::BencodeError(format!(
                    "Missing '{}' terminator",
                    terminator as char
                ))
            })?;
        self.pos = start + len + 1;
        Ok(&self.data[start..start + len])
    }

    /// Step into a list or dictionary
    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(BittorrentError::BencodeError(format!(
                "Nesting deeper than {} at offset {}",
                MAX_DEPTH, self.pos
            )));
        }
        self.depth += 1;
        self.pos += 1;
        Ok(())
    }

    /// Consume the `e` closing a list or dictionary
    fn leave(&mut self) {
        self.depth -= 1;
        self.pos += 1;
    }

    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer().map(BencodeValue::Integer),
            b'l' => {
                self.enter()?;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.value()?);
                }
                self.leave();
                Ok(BencodeValue::List(list))
            }
            b'd' => {
                self.enter()?;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?.to_vec();
                    let value = self.value()?;
                    dict.insert(key, value);
                }
                self.leave();
                Ok(BencodeValue::Dict(dict))
            }
            b'0'..=b'9' => self.bytes().map(|b| BencodeValue::String(b.to_vec())),
            c => Err(BittorrentError::BencodeError(format!(
                "Invalid bencode token: {}",
                c as char
            ))),
        }
    }

    fn skip_value(&mut self) -> Result<()> {
        match self.peek()? {
            b'i' => self.integer().map(|_| ()),
            b'l' | b'd' => {
                self.enter()?;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.leave();
                Ok(())
            }
            _ => self.bytes().map(|_| ()),
        }
    }

    fn integer(&mut self) -> Result<i64> {
        self.expect(b'i')?;
        let digits = self.until(b'e')?;
        let text = std::str::from_utf8(digits)
            .map_err(|_| BittorrentError::BencodeError("Invalid integer".to_string()))?;

        let canonical = match text.strip_prefix('-') {
            Some(rest) => !rest.is_empty() && !rest.starts_with('0'),
            None => text == "0" || (!text.is_empty() && !text.starts_with('0')),
        };
        if !canonical {
            return Err(BittorrentError::BencodeError(format!(
                "Non-canonical integer: {}",
                text
            )));
        }

        text.parse::<i64>()
            .map_err(|_| BittorrentError::BencodeError("Invalid integer".to_string()))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len_digits = self.until(b':')?;
        let len = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                BittorrentError::BencodeError("Invalid string length".to_string())
            })?;

        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len());
        let end = end.ok_or_else(|| {
            BittorrentError::BencodeError("String length exceeds data".to_string())
        })?;

        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }
}
