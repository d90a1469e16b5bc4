//! String table upload
//!
//! ```text
//! u32 magic, u32 length, u32 str_count, u32 lang_count
//! lang_count x { u16 language, str_count x NUL-terminated UTF-8 }
//! ```

use crate::error::{ProtocolError, Result};
use crate::wire::{MIN_UPLOAD_LEN, STRINGS_MAGIC};
use bytes::{Buf, BufMut};
use serde::Serialize;

/// One string of a language table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsbString {
    /// Id assigned by the composite layer at bind, 0 until then
    pub id: u8,
    pub text: String,
}

/// All strings for one language, in descriptor index order (index 1 first)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StringTable {
    pub language: u16,
    pub strings: Vec<UsbString>,
}

/// Parse a string upload.
///
/// `needed` is the highest string index referenced by the accepted
/// descriptors. Only the first `needed` strings of each language are kept.
/// When `needed` is zero the body is not inspected and no tables result.
pub fn parse_strings(data: &[u8], needed: usize) -> Result<Vec<StringTable>> {
    if data.len() < MIN_UPLOAD_LEN {
        return Err(ProtocolError::truncated(
            "string header",
            MIN_UPLOAD_LEN,
            data.len(),
        ));
    }
    let mut cursor = data;
    let magic = cursor.get_u32_le();
    if magic != STRINGS_MAGIC {
        return Err(ProtocolError::BadMagic(magic));
    }
    let declared = cursor.get_u32_le() as usize;
    if declared != data.len() {
        return Err(ProtocolError::LengthMismatch {
            declared,
            actual: data.len(),
        });
    }
    let str_count = cursor.get_u32_le();
    let lang_count = cursor.get_u32_le();

    if (str_count == 0) != (lang_count == 0) {
        return Err(ProtocolError::InconsistentStringCounts {
            strings: str_count,
            languages: lang_count,
        });
    }
    if (str_count as usize) < needed {
        return Err(ProtocolError::NotEnoughStrings {
            supplied: str_count,
            needed,
        });
    }
    if needed == 0 {
        return Ok(Vec::new());
    }

    // Each language needs at least its id and one terminator
    let mut tables = Vec::with_capacity((lang_count as usize).min(cursor.len() / 3));
    for _ in 0..lang_count {
        if cursor.len() < 3 {
            return Err(ProtocolError::truncated("language table", 3, cursor.len()));
        }
        let language = cursor.get_u16_le();
        let mut strings = Vec::with_capacity(needed);
        for index in 0..str_count as usize {
            let Some(nul) = cursor.iter().position(|&b| b == 0) else {
                return Err(ProtocolError::UnterminatedString { language, index });
            };
            if index < needed {
                let text = std::str::from_utf8(&cursor[..nul])
                    .map_err(|_| ProtocolError::InvalidString { language, index })?;
                strings.push(UsbString {
                    id: 0,
                    text: text.to_owned(),
                });
            }
            cursor.advance(nul + 1);
        }
        tables.push(StringTable { language, strings });
    }

    if !cursor.is_empty() {
        return Err(ProtocolError::TrailingBytes(cursor.len()));
    }
    Ok(tables)
}

/// Encode string tables into an upload. Every table must hold the same
/// number of strings.
pub fn encode_strings(tables: &[StringTable]) -> Vec<u8> {
    let str_count = tables.first().map_or(0, |t| t.strings.len());
    let body: usize = tables
        .iter()
        .map(|t| 2 + t.strings.iter().map(|s| s.text.len() + 1).sum::<usize>())
        .sum();
    let total = MIN_UPLOAD_LEN + body;

    let mut out = Vec::with_capacity(total);
    out.put_u32_le(STRINGS_MAGIC);
    out.put_u32_le(total as u32);
    out.put_u32_le(str_count as u32);
    out.put_u32_le(tables.len() as u32);
    for table in tables {
        out.put_u16_le(table.language);
        for s in &table.strings {
            out.put_slice(s.text.as_bytes());
            out.put_u8(0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(language: u16, texts: &[&str]) -> StringTable {
        StringTable {
            language,
            strings: texts
                .iter()
                .map(|t| UsbString {
                    id: 0,
                    text: (*t).to_owned(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_parse_two_languages() {
        let raw = encode_strings(&[table(0x0409, &["Source", "Sink"]), table(0x0407, &["Quelle", "Senke"])]);
        let tables = parse_strings(&raw, 2).unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1].language, 0x0407);
        assert_eq!(tables[1].strings[1].text, "Senke");
    }

    #[test]
    fn test_extra_strings_ignored() {
        let raw = encode_strings(&[table(0x0409, &["one", "two", "three"])]);
        let tables = parse_strings(&raw, 1).unwrap();
        assert_eq!(tables[0].strings.len(), 1);
        assert_eq!(tables[0].strings[0].text, "one");
    }

    #[test]
    fn test_not_enough_strings() {
        let raw = encode_strings(&[table(0x0409, &["one"])]);
        assert_eq!(
            parse_strings(&raw, 2),
            Err(ProtocolError::NotEnoughStrings {
                supplied: 1,
                needed: 2
            })
        );
    }

    #[test]
    fn test_no_strings_needed_skips_body() {
        let mut raw = encode_strings(&[]);
        assert_eq!(raw.len(), MIN_UPLOAD_LEN);
        assert_eq!(parse_strings(&raw, 0), Ok(Vec::new()));

        // counts must still agree with each other
        raw[12] = 1;
        assert!(matches!(
            parse_strings(&raw, 0),
            Err(ProtocolError::InconsistentStringCounts { .. })
        ));
    }

    #[test]
    fn test_unterminated_string() {
        let mut raw = encode_strings(&[table(0x0409, &["abc"])]);
        raw.pop();
        let len = raw.len() as u32;
        raw[4..8].copy_from_slice(&len.to_le_bytes());
        assert_eq!(
            parse_strings(&raw, 1),
            Err(ProtocolError::UnterminatedString {
                language: 0x0409,
                index: 0
            })
        );
    }

    #[test]
    fn test_header_checks() {
        let mut raw = encode_strings(&[table(0x0409, &["abc"])]);
        assert!(matches!(
            parse_strings(&raw[..10], 1),
            Err(ProtocolError::Truncated { .. })
        ));

        raw[0] = 1;
        assert_eq!(parse_strings(&raw, 1), Err(ProtocolError::BadMagic(1)));
        raw[0] = 2;

        raw.push(0);
        assert!(matches!(
            parse_strings(&raw, 1),
            Err(ProtocolError::LengthMismatch { .. })
        ));
        let len = raw.len() as u32;
        raw[4..8].copy_from_slice(&len.to_le_bytes());
        assert_eq!(parse_strings(&raw, 1), Err(ProtocolError::TrailingBytes(1)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut raw = encode_strings(&[table(0x0409, &["ab"])]);
        let at = MIN_UPLOAD_LEN + 2;
        raw[at] = 0xff;
        assert_eq!(
            parse_strings(&raw, 1),
            Err(ProtocolError::InvalidString {
                language: 0x0409,
                index: 0
            })
        );
    }
}
