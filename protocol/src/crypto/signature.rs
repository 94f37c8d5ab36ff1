//! # Request Signature Verification
//!
//! Ed25519 verification over SQRL request fields — the authentication
//! backbone of the protocol.
//!
//! The signed message is the **byte-for-byte concatenation of the raw
//! `client` and `server` wire fields as received**, not the decoded
//! structures. Re-encoding and signing decoded data is the classic SQRL
//! implementation bug: any canonicalization difference between client and
//! server silently breaks every login.
//!
//! ## Failure policy
//!
//! [`verify_signature`] returns a bare `bool` and is intentionally vague —
//! malformed base64, a wrong-length key, a non-canonical point, and a
//! genuinely bad signature are all just "no". Giving attackers a detailed
//! error oracle is a bad idea, and the engine maps every flavor of "no" to
//! the same wire bits anyway.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::pack::from_base64_lenient;

/// Verify a detached Ed25519 signature over `client_raw + server_raw`.
///
/// * `client_raw` / `server_raw` — the raw wire field values, exactly as
///   they appeared in the POST body.
/// * `signature_b64` — the `ids`/`pids`/`urs` parameter (base64, 64 bytes).
/// * `public_key_b64` — the `idk`/`pidk`/`vuk` the signature must match
///   (base64, 32 bytes).
///
/// Returns `true` only when everything decodes and the signature checks
/// out. Never panics, never errors.
pub fn verify_signature(
    client_raw: &str,
    server_raw: &str,
    signature_b64: &str,
    public_key_b64: &str,
) -> bool {
    let Some(signature_bytes) = from_base64_lenient(signature_b64) else {
        return false;
    };
    let Some(key_bytes) = from_base64_lenient(public_key_b64) else {
        return false;
    };

    let Ok(signature_bytes) = <[u8; 64]>::try_from(signature_bytes) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes) else {
        return false;
    };

    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature_bytes);

    let mut message = Vec::with_capacity(client_raw.len() + server_raw.len());
    message.extend_from_slice(client_raw.as_bytes());
    message.extend_from_slice(server_raw.as_bytes());

    verifying_key.verify(&message, &signature).is_ok()
}
