//! # SQRL Pack Codec
//!
//! The SQRL wire format is almost insultingly simple: CRLF-delimited
//! `key=value` lines, base64url-wrapped for transport. Both the client's
//! `client` parameter and the server's response body use it.
//!
//! Two rules matter and both are about robustness against hostile input:
//!
//! 1. **Decoding never fails.** Malformed lines are skipped; a duplicate key
//!    keeps its last occurrence. The worst a client can do is produce an
//!    empty map, which the engine rejects as a protocol failure anyway.
//! 2. **Encoding preserves insertion order** and serializes `tif` as
//!    lowercase hexadecimal, because that is what deployed clients parse.

use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;

// ---------------------------------------------------------------------------
// Pack Encode / Decode
// ---------------------------------------------------------------------------

/// Decode a raw SQRL pack into a key → value map.
///
/// Splits on CRLF; each non-empty line is `key=value`. Lines without an `=`
/// are skipped. The last occurrence of a duplicate key wins. Values are
/// opaque strings — no type coercion, no trimming.
pub fn decode(raw: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for line in raw.split("\r\n") {
        if let Some((key, value)) = line.split_once('=') {
            if !key.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        }
    }
    fields
}

/// Encode ordered key/value pairs as a SQRL pack.
///
/// Every pair becomes `key=value\r\n`, in the order given.
pub fn encode<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}

// ---------------------------------------------------------------------------
// Base64url Transport Wrapping
// ---------------------------------------------------------------------------

/// Encode bytes as unpadded base64url, the transport encoding for every
/// SQRL blob (packs, signatures, keys, CPS URLs).
pub fn to_base64url(bytes: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decode base64 leniently: url-safe or standard alphabet, padded or not.
///
/// Deployed SQRL clients are not uniform about padding, and the reference
/// server accepted both alphabets. Returns `None` on anything that decodes
/// under no variant.
pub fn from_base64_lenient(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| URL_SAFE.decode(s))
        .or_else(|_| STANDARD_NO_PAD.decode(s))
        .or_else(|_| STANDARD.decode(s))
        .ok()
}

/// Decode a base64url blob into a UTF-8 string. `None` if either the
/// base64 or the UTF-8 is invalid.
pub fn from_base64url_utf8(s: &str) -> Option<String> {
    from_base64_lenient(s).and_then(|bytes| String::from_utf8(bytes).ok())
}

// ---------------------------------------------------------------------------
// Server Response
// ---------------------------------------------------------------------------

/// The server's half of a SQRL exchange, assembled by the engine and
/// serialized into the response body.
///
/// Field order in the encoded pack is fixed (`ver`, `nut`, `tif`, `qry`,
/// then the optional `suk`/`url`/`can`) so responses are byte-stable for a
/// given state — the follow-up nut's HMAC is computed over these bytes.
#[derive(Debug, Clone, Default)]
pub struct ServerResponse {
    /// New nonce for the client's next exchange.
    pub nut: String,
    /// Transaction information flags, serialized as lowercase hex.
    pub tif: u16,
    /// Path (with `nut` query parameter) for the next POST.
    pub qry: String,
    /// Server unlock key, attached when the client needs to run the unlock
    /// protocol (or asked for it via `opt=suk`).
    pub suk: Option<String>,
    /// CPS redirect target, attached on same-device login success.
    pub url: Option<String>,
    /// Cancel redirect target.
    pub can: Option<String>,
}

impl ServerResponse {
    /// A response carrying only flags. The engine fills in `nut`/`qry`
    /// when it binds the response to a nonce.
    pub fn with_tif(tif: u16) -> Self {
        Self {
            tif,
            ..Self::default()
        }
    }

    /// The ordered `key=value` pairs of this response.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("ver", crate::config::PROTOCOL_VERSION.to_string()),
            ("nut", self.nut.clone()),
            ("tif", format!("{:x}", self.tif)),
            ("qry", self.qry.clone()),
        ];
        if let Some(suk) = &self.suk {
            pairs.push(("suk", suk.clone()));
        }
        if let Some(url) = &self.url {
            pairs.push(("url", url.clone()));
        }
        if let Some(can) = &self.can {
            pairs.push(("can", can.clone()));
        }
        pairs
    }

    /// Serialize to the wire: pack-encode, then base64url-wrap.
    pub fn to_body(&self) -> String {
        let pairs = self.to_pairs();
        let raw = encode(pairs.iter().map(|(k, v)| (*k, v.as_str())));
        to_base64url(raw)
    }
}
