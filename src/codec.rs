//! Content-encoding and charset handling for buffered response bodies

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use regex::bytes::Regex;
use std::io::{self, Read, Write};
use std::sync::OnceLock;

/// Number of leading bytes scanned for a `<meta charset>` declaration
const META_PRESCAN_LEN: usize = 1024;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: i32 = 5;
const BROTLI_LGWIN: i32 = 22;

/// Transfer compression declared by `Content-Encoding`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentEncoding {
    Gzip,
    /// HTTP "deflate", which is zlib-wrapped
    Deflate,
    Brotli,
    Identity,
}

impl ContentEncoding {
    /// Parse a `Content-Encoding` header value; unknown codings are treated as identity
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip") | Some("x-gzip") => ContentEncoding::Gzip,
            Some("deflate") => ContentEncoding::Deflate,
            Some("br") => ContentEncoding::Brotli,
            _ => ContentEncoding::Identity,
        }
    }

    /// Header value to send with bodies in this encoding
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            ContentEncoding::Gzip => Some("gzip"),
            ContentEncoding::Deflate => Some("deflate"),
            ContentEncoding::Brotli => Some("br"),
            ContentEncoding::Identity => None,
        }
    }

    pub fn decode(self, body: &[u8]) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(body.len() * 4);
        match self {
            ContentEncoding::Gzip => {
                GzDecoder::new(body).read_to_end(&mut out)?;
            }
            ContentEncoding::Deflate => {
                ZlibDecoder::new(body).read_to_end(&mut out)?;
            }
            ContentEncoding::Brotli => {
                brotli::Decompressor::new(body, BROTLI_BUFFER_SIZE).read_to_end(&mut out)?;
            }
            ContentEncoding::Identity => out.extend_from_slice(body),
        }
        Ok(out)
    }

    pub fn encode(self, body: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            ContentEncoding::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len()), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
            ContentEncoding::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len()), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()
            }
            ContentEncoding::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: BROTLI_QUALITY,
                    lgwin: BROTLI_LGWIN,
                    ..Default::default()
                };
                let mut out = Vec::with_capacity(body.len());
                brotli::BrotliCompress(&mut io::Cursor::new(body), &mut out, &params)?;
                Ok(out)
            }
            ContentEncoding::Identity => Ok(body.to_vec()),
        }
    }
}

fn meta_charset_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?\s*([a-z0-9_\-:.]+)"#)
            .expect("valid meta charset regex")
    })
}

/// Charset parameter of a `Content-Type` header value
fn content_type_charset(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches(['"', '\'']))
    })
}

/// Pick the encoding of `body`: BOM, declared charset, `<meta>` prescan,
/// UTF-8 validity, then windows-1252.
pub fn sniff_encoding(body: &[u8], content_type: &str) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(body) {
        return encoding;
    }

    if let Some(encoding) = content_type_charset(content_type)
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return encoding;
    }

    let head = &body[..body.len().min(META_PRESCAN_LEN)];
    if let Some(encoding) = meta_charset_regex()
        .captures(head)
        .and_then(|caps| caps.get(1))
        .and_then(|label| Encoding::for_label(label.as_bytes()))
    {
        return encoding;
    }

    if !body.iter().any(|b| *b >= 0x80) || std::str::from_utf8(body).is_ok() {
        return UTF_8;
    }

    WINDOWS_1252
}

/// Decode `body` to UTF-8 text using the sniffed encoding
pub fn to_utf8(body: &[u8], content_type: &str) -> String {
    let encoding = sniff_encoding(body, content_type);
    let (text, _, _) = encoding.decode(body);
    text.into_owned()
}

/// Rewrite a `Content-Type` value so it declares UTF-8
pub fn utf8_content_type(content_type: &str) -> String {
    let mime = content_type.split(';').next().unwrap_or("").trim();
    if mime.is_empty() {
        "text/html; charset=utf-8".to_string()
    } else {
        format!("{}; charset=utf-8", mime)
    }
}
