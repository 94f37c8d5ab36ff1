//! # Response-Body HMAC
//!
//! When the engine mints a follow-up nut, it computes an HMAC-SHA256 over
//! the finished response body and stores it on the new nut. The client's
//! next request must echo that body verbatim in its `server` field; the nut
//! validator recomputes the HMAC and compares. A client that tampers with —
//! or replays — server state fails the comparison and burns the nut.
//!
//! Output is standard base64, matching what gets persisted and compared.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 `message` under `secret`, returned as standard base64.
pub fn sign_hmac(message: &str, secret: &str) -> String {
    // new_from_slice accepts any key length for HMAC.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        assert_eq!(sign_hmac("body", "secret"), sign_hmac("body", "secret"));
    }

    #[test]
    fn differs_per_message() {
        assert_ne!(sign_hmac("body-a", "secret"), sign_hmac("body-b", "secret"));
    }

    #[test]
    fn differs_per_secret() {
        assert_ne!(sign_hmac("body", "secret-a"), sign_hmac("body", "secret-b"));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2: key "Jefe", data "what do ya want for nothing?".
        let expected_hex = "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843";
        let got = sign_hmac("what do ya want for nothing?", "Jefe");
        let raw = base64::engine::general_purpose::STANDARD.decode(got).unwrap();
        assert_eq!(hex_string(&raw), expected_hex);
    }

    fn hex_string(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
