//! # Protocol Constants & Engine Configuration
//!
//! Every magic number in the SQRL engine lives here. If you're hardcoding a
//! constant somewhere else, you're doing it wrong and you owe the team coffee.
//!
//! The second half of this module is [`SqrlConfig`]: the explicit
//! configuration value handed to [`crate::engine::SqrlHandler`] at
//! construction time. There is deliberately no ambient/static configuration —
//! two independently-keyed engines can coexist in one process, which is
//! exactly what the integration tests do.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Wire Protocol Constants
// ---------------------------------------------------------------------------

/// The SQRL protocol version we speak. There is only one.
pub const PROTOCOL_VERSION: &str = "1";

/// Length of a base64url-encoded Ed25519 public key (32 bytes, no padding).
/// Every `idk`, `pidk`, `suk`, and `vuk` on the wire is exactly this long.
pub const IDK_LENGTH: usize = 43;

/// Longest command name a client may send (`disable` is 7 chars).
pub const MAX_CMD_LENGTH: usize = 7;

/// Longest remote address we accept. 45 covers a full IPv6 literal.
pub const MAX_IP_LENGTH: usize = 45;

/// Hard ceiling on the POST body. A legitimate SQRL exchange is well under
/// 1 KiB; anything bigger is noise or abuse.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Longest `nut=` query parameter we accept before even looking it up.
pub const MAX_NUT_PARAM_LENGTH: usize = 64;

/// Entropy per nut id. 16 CSPRNG bytes = 128 bits, the floor for
/// "unguessable" in this protocol. Encoded as 22 chars of base64url.
pub const NUT_ID_BYTES: usize = 16;

/// How long a nut stays redeemable after minting.
pub const DEFAULT_NUT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Loopback URL where a same-device SQRL client listens for CPS handoff.
/// Port 25519 is fixed by the SQRL client specification.
pub const DEFAULT_CPS_BASE_URL: &str = "http://localhost:25519";

// ---------------------------------------------------------------------------
// tif — Transaction Information Flags
// ---------------------------------------------------------------------------

/// Current identity (`idk`) is known to this server.
pub const TIF_ID_MATCH: u16 = 0x01;

/// Previous identity (`pidk`) is known to this server.
pub const TIF_PREVIOUS_ID_MATCH: u16 = 0x02;

/// The request arrived from the same IP the nut was minted for.
pub const TIF_IP_MATCH: u16 = 0x04;

/// The matched identity is disabled and needs an unlock to authenticate.
pub const TIF_SQRL_DISABLED: u16 = 0x08;

/// The presented nut is missing, stale, replayed, or failed its HMAC check.
/// Transient: the client should retry against the fresh nut we return.
pub const TIF_TRANSIENT_ERROR: u16 = 0x20;

/// The command could not be completed.
pub const TIF_COMMAND_FAILED: u16 = 0x40;

/// The failure is the client's fault (malformed request, bad signature,
/// ineligible command).
pub const TIF_CLIENT_FAILURE: u16 = 0x80;

/// The matched identity has been superseded by a rotated key and can never
/// authenticate again.
pub const TIF_ID_SUPERSEDED: u16 = 0x200;

// ---------------------------------------------------------------------------
// Engine Configuration
// ---------------------------------------------------------------------------

/// Everything the protocol engine needs to know about its deployment:
/// where it lives (for deriving the URLs handed to clients), its HMAC
/// secret, and its nut timeout.
///
/// Built from a base URL with [`SqrlConfig::new`]; the derived fields follow
/// the same rules as the reference implementation so that existing SQRL
/// clients interoperate:
///
/// | Field            | Derivation                                        |
/// |------------------|---------------------------------------------------|
/// | `sqrl_url`       | `<base path>/sqrl` — the `qry` path in responses  |
/// | `sqrl_proto_url` | `sqrl://<host>[:port]<base path>/sqrl`            |
/// | `auth_url`       | `<base url>/authenticate`                         |
/// | `success_url`    | `<base url>/loggedin`                             |
/// | `cancel_path`    | `<base path>/sqrl`                                |
/// | `x`              | length of the base path (SQRL domain extension)   |
#[derive(Debug, Clone)]
pub struct SqrlConfig {
    /// Secret for HMAC-binding follow-up nuts to response bodies.
    pub hmac_secret: String,
    /// How long a nut stays valid after creation.
    pub nut_timeout: Duration,
    /// Path clients POST protocol exchanges to (the `qry` return value).
    pub sqrl_url: String,
    /// Full `sqrl://` scheme URL encoded into login QR codes and links.
    pub sqrl_proto_url: String,
    /// Endpoint that redeems out-of-band codes for browser sessions.
    pub auth_url: String,
    /// Where a browser lands after a successful login.
    pub success_url: String,
    /// Path a same-device client navigates to when the user cancels.
    pub cancel_path: String,
    /// SQRL `x` parameter: how many chars of the path are part of the
    /// server's identity domain. Zero when serving from the root.
    pub x: usize,
    /// Base URL of the loopback CPS listener on the client device.
    pub cps_base_url: String,
}

impl SqrlConfig {
    /// Derive a configuration from the server's public base URL.
    ///
    /// `base_url` is where this server is reachable by browsers and SQRL
    /// clients, e.g. `https://example.com` or `https://example.com/app`.
    /// Returns `None` when the URL cannot be parsed.
    pub fn new(base_url: &str, hmac_secret: impl Into<String>) -> Option<Self> {
        let base = BaseUrl::parse(base_url)?;

        let port_part = match base.port {
            None | Some(80) | Some(443) => String::new(),
            Some(p) => format!(":{p}"),
        };

        let path = base.path.trim_end_matches('/');

        Some(Self {
            hmac_secret: hmac_secret.into(),
            nut_timeout: DEFAULT_NUT_TIMEOUT,
            sqrl_url: format!("{path}/sqrl"),
            sqrl_proto_url: format!("sqrl://{}{}{}/sqrl", base.host, port_part, path),
            auth_url: url_join(base_url, "/authenticate"),
            success_url: url_join(base_url, "/loggedin"),
            cancel_path: format!("{path}/sqrl"),
            x: path.len(),
            cps_base_url: DEFAULT_CPS_BASE_URL.to_string(),
        })
    }

    /// Override the nut timeout.
    pub fn with_nut_timeout(mut self, timeout: Duration) -> Self {
        self.nut_timeout = timeout;
        self
    }

    /// Override the CPS loopback base URL. Only useful in tests — real
    /// clients listen on the spec-fixed port.
    pub fn with_cps_base_url(mut self, url: impl Into<String>) -> Self {
        self.cps_base_url = url.into();
        self
    }

    /// Override the post-login success URL.
    pub fn with_success_url(mut self, url: impl Into<String>) -> Self {
        self.success_url = url.into();
        self
    }
}

/// Join a base URL and a path segment without doubling the slash.
fn url_join(left: &str, right: &str) -> String {
    if left.ends_with('/') {
        format!("{}{}", left, &right[1..])
    } else {
        format!("{left}{right}")
    }
}

// ---------------------------------------------------------------------------
// Minimal Base-URL Parser
// ---------------------------------------------------------------------------

/// Just enough URL parsing to split scheme://host[:port][/path].
/// Not worth a crate dependency for one call site at startup.
struct BaseUrl {
    host: String,
    port: Option<u16>,
    path: String,
}

impl BaseUrl {
    fn parse(s: &str) -> Option<Self> {
        let rest = s
            .strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))?;

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };

        if authority.is_empty() {
            return None;
        }

        let (host, port) = match authority.rfind(':') {
            Some(i) => {
                let p = authority[i + 1..].parse::<u16>().ok()?;
                (authority[..i].to_string(), Some(p))
            }
            None => (authority.to_string(), None),
        };

        Some(BaseUrl {
            host,
            port,
            path: path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_root_base_url() {
        let cfg = SqrlConfig::new("https://example.com", "secret").unwrap();
        assert_eq!(cfg.sqrl_url, "/sqrl");
        assert_eq!(cfg.sqrl_proto_url, "sqrl://example.com/sqrl");
        assert_eq!(cfg.auth_url, "https://example.com/authenticate");
        assert_eq!(cfg.success_url, "https://example.com/loggedin");
        assert_eq!(cfg.x, 0);
    }

    #[test]
    fn config_from_subpath_base_url() {
        let cfg = SqrlConfig::new("https://example.com/app", "secret").unwrap();
        assert_eq!(cfg.sqrl_url, "/app/sqrl");
        assert_eq!(cfg.sqrl_proto_url, "sqrl://example.com/app/sqrl");
        assert_eq!(cfg.cancel_path, "/app/sqrl");
        // The `x` extension covers "/app".
        assert_eq!(cfg.x, 4);
    }

    #[test]
    fn config_trailing_slash_is_normalized() {
        let cfg = SqrlConfig::new("https://example.com/app/", "secret").unwrap();
        assert_eq!(cfg.sqrl_url, "/app/sqrl");
        assert_eq!(cfg.x, 4);
        // url_join must not double the slash either.
        assert_eq!(cfg.auth_url, "https://example.com/app/authenticate");
    }

    #[test]
    fn config_nonstandard_port_kept_in_proto_url() {
        let cfg = SqrlConfig::new("https://example.com:8443", "secret").unwrap();
        assert_eq!(cfg.sqrl_proto_url, "sqrl://example.com:8443/sqrl");
    }

    #[test]
    fn config_standard_ports_omitted() {
        let cfg = SqrlConfig::new("https://example.com:443", "secret").unwrap();
        assert_eq!(cfg.sqrl_proto_url, "sqrl://example.com/sqrl");
        let cfg = SqrlConfig::new("http://example.com:80", "secret").unwrap();
        assert_eq!(cfg.sqrl_proto_url, "sqrl://example.com/sqrl");
    }

    #[test]
    fn config_rejects_garbage() {
        assert!(SqrlConfig::new("not a url", "secret").is_none());
        assert!(SqrlConfig::new("ftp://example.com", "secret").is_none());
        assert!(SqrlConfig::new("https://", "secret").is_none());
    }

    #[test]
    fn builder_overrides() {
        let cfg = SqrlConfig::new("https://example.com", "secret")
            .unwrap()
            .with_nut_timeout(Duration::from_secs(5))
            .with_cps_base_url("http://localhost:9999");
        assert_eq!(cfg.nut_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cps_base_url, "http://localhost:9999");
    }
}
