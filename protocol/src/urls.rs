//! # Client-Facing URL Builder & Code Redemption
//!
//! Browsers start a SQRL login by fetching a URL bundle: the `sqrl://` link
//! (rendered as text and QR code), the CPS loopback variant for same-device
//! login, and a poll URL the page hits while waiting for an out-of-band
//! approval. All three hang off one freshly minted initial nut.
//!
//! The flip side is [`UrlBuilder::use_code`]: once a SQRL client has
//! authenticated a nut chain, the browser redeems a single-use code —
//! `off-<root nut>` from polling, or `cps-<follow-up nut>` from the CPS
//! redirect — for the authenticated account.

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;

use crate::config::SqrlConfig;
use crate::identity::Account;
use crate::nut::NutManager;
use crate::pack::to_base64url;
use crate::store::{SqrlStore, StoreError};

// ---------------------------------------------------------------------------
// Out-of-Band Codes
// ---------------------------------------------------------------------------

/// Which login path a redemption code came from. The kind is encoded as a
/// prefix on the code itself and must agree with the nut's position in its
/// chain — a CPS code names the follow-up nut that completed authentication,
/// an off-device code names the chain root the browser has been polling on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Same-device (client-provided session) redirect.
    Cps,
    /// Off-device polling.
    Off,
}

/// Format the code embedded in a CPS redirect URL.
pub fn cps_code(nut_id: &str) -> String {
    format!("cps-{nut_id}")
}

/// Format the code embedded in the browser's poll URL.
pub fn off_code(nut_id: &str) -> String {
    format!("off-{nut_id}")
}

/// Split a code parameter into its kind and nut id.
pub fn parse_code(param: &str) -> Option<(CodeKind, &str)> {
    if let Some(id) = param.strip_prefix("cps-") {
        return Some((CodeKind::Cps, id));
    }
    if let Some(id) = param.strip_prefix("off-") {
        return Some((CodeKind::Off, id));
    }
    None
}

// ---------------------------------------------------------------------------
// URL Bundle
// ---------------------------------------------------------------------------

/// The URLs a login page needs, all bound to one fresh nut.
#[derive(Debug, Clone, Serialize)]
pub struct SqrlUrls {
    /// `sqrl://` URL for QR rendering and off-device clients.
    pub login: String,
    /// Loopback URL that hands the login URL to a same-device client.
    pub cps: String,
    /// URL the browser polls; redeems `off-<nut>` once identified.
    pub poll: String,
    /// Where to send the browser after redemption succeeds.
    pub success: String,
}

/// Mints login URL bundles and redeems their codes.
#[derive(Clone)]
pub struct UrlBuilder {
    config: SqrlConfig,
    store: Arc<dyn SqrlStore>,
    nuts: NutManager,
}

impl UrlBuilder {
    pub fn new(config: SqrlConfig, store: Arc<dyn SqrlStore>) -> Self {
        let nuts = NutManager::new(Arc::clone(&store), &config);
        Self {
            config,
            store,
            nuts,
        }
    }

    /// Mint an initial nut for `ip` and derive the full URL bundle from it.
    pub async fn create_urls(&self, ip: IpAddr) -> Result<SqrlUrls, StoreError> {
        tracing::debug!(%ip, "creating login urls");
        let nut = self.nuts.create_initial(ip).await?;

        let mut login_query = format!("nut={}", nut.id);
        if self.config.x > 0 {
            login_query.push_str(&format!("&x={}", self.config.x));
        }
        let login = format!("{}?{}", self.config.sqrl_proto_url, login_query);

        // The CPS variant carries a cancel path so the client can bail out
        // gracefully; the whole URL rides inside the loopback path as
        // base64url.
        let cps_target = format!(
            "{}&can={}",
            login,
            to_base64url(&self.config.cancel_path)
        );
        let cps = format!("{}/{}", self.config.cps_base_url, to_base64url(cps_target));

        let poll = format!("{}?code={}", self.config.auth_url, off_code(&nut.id));

        Ok(SqrlUrls {
            login,
            cps,
            poll,
            success: self.config.success_url.clone(),
        })
    }

    /// Redeem an out-of-band code for the account that authenticated it.
    ///
    /// A code redeems iff all of the following hold; each is checked against
    /// the nut the code names:
    ///
    /// - the code kind matches the nut's chain position (`off` ⇒ initial,
    ///   `cps` ⇒ follow-up);
    /// - the caller's address matches the nut's bound address;
    /// - the chain has been `identified` by a successful SQRL command;
    /// - a `user_id` is bound;
    /// - the nut has not been `issued` before (single-use redemption).
    ///
    /// On success the nut is marked `issued` and the account returned.
    pub async fn use_code(
        &self,
        code_param: &str,
        ip: IpAddr,
    ) -> Result<Option<Account>, StoreError> {
        let Some((kind, nut_id)) = parse_code(code_param) else {
            tracing::debug!(code = code_param, "unparseable code");
            return Ok(None);
        };

        let Some(mut nut) = self.store.retrieve_nut(nut_id).await? else {
            tracing::debug!(code = code_param, "code names unknown nut");
            return Ok(None);
        };

        let kind_matches = match kind {
            CodeKind::Off => nut.is_initial(),
            CodeKind::Cps => !nut.is_initial(),
        };

        let Some(user_id) = nut.user_id else {
            return Ok(None);
        };

        if !kind_matches || nut.ip != ip || nut.identified.is_none() || nut.issued.is_some() {
            tracing::debug!(code = code_param, %ip, "code not redeemable");
            return Ok(None);
        }

        nut.issued = Some(chrono::Utc::now());
        self.store.update_nut(&nut).await?;
        tracing::info!(%user_id, "out-of-band code redeemed");
        self.store.retrieve_account(user_id).await
    }
}
