//! # Protocol Engine
//!
//! [`SqrlHandler::handle`] is the server side of a SQRL exchange: one POST
//! in, one pack body out. The handler is deliberately infallible at that
//! boundary — whatever a client throws at it (garbage, replays, forged
//! signatures, a store outage mid-command), the reply is always a valid
//! pack whose `tif` flags say what went wrong.
//!
//! An exchange walks a fixed pipeline:
//!
//! 1. shape checks and envelope/pack parsing,
//! 2. Ed25519 signature verification (`ids`, and `pids` when a previous
//!    identity is presented),
//! 3. nut validation and the atomic single-use claim,
//! 4. identity resolution and nut-chain claiming,
//! 5. an eligibility gate that rejects command/state combinations the
//!    protocol forbids,
//! 6. command dispatch,
//! 7. a follow-up nut minted and HMAC-bound to the response body.
//!
//! Steps 1 and 2 answer with a fresh initial nut (there is no chain to
//! continue); step 3 failures answer the same way with the transient flag
//! so a live client can restart cleanly. From step 4 on, every outcome rides
//! the chain via a follow-up nut.

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;

use crate::config::{
    SqrlConfig, IDK_LENGTH, MAX_CMD_LENGTH, MAX_MESSAGE_SIZE, MAX_NUT_PARAM_LENGTH,
    PROTOCOL_VERSION, TIF_CLIENT_FAILURE, TIF_COMMAND_FAILED, TIF_ID_MATCH, TIF_ID_SUPERSEDED,
    TIF_IP_MATCH, TIF_PREVIOUS_ID_MATCH, TIF_SQRL_DISABLED, TIF_TRANSIENT_ERROR,
};
use crate::crypto::verify_signature;
use crate::identity::{Identity, IdentityProvider};
use crate::nut::{Nut, NutManager};
use crate::pack::{self, from_base64url_utf8, ServerResponse};
use crate::store::{SqrlStore, StoreError};
use crate::urls::cps_code;

// ---------------------------------------------------------------------------
// Client Request
// ---------------------------------------------------------------------------

/// A SQRL command verb.
///
/// Unrecognized verbs parse to [`Command::Unknown`] rather than failing:
/// the protocol's answer to "command I don't speak" is a command-failed
/// response on the existing chain, not a parse error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Query,
    Ident,
    Enable,
    Disable,
    Remove,
    Unknown,
}

impl Command {
    fn parse(raw: &str) -> Self {
        match raw {
            "query" => Command::Query,
            "ident" => Command::Ident,
            "enable" => Command::Enable,
            "disable" => Command::Disable,
            "remove" => Command::Remove,
            _ => Command::Unknown,
        }
    }

    /// Query and ident are the only commands allowed against unknown or
    /// previous identities.
    fn is_basic(self) -> bool {
        matches!(self, Command::Query | Command::Ident)
    }
}

/// Option flags from the client's `opt` field (`~`-separated).
/// Unknown flags are ignored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptFlags {
    /// Client-provided session: same-device login via redirect URL.
    pub cps: bool,
    /// Client asks for the stored server unlock key.
    pub suk: bool,
    /// Client requests that the source-address check be skipped.
    pub noiptest: bool,
    pub hardlock: bool,
    pub sqrlonly: bool,
}

impl OptFlags {
    fn parse(raw: &str) -> Self {
        let mut flags = Self::default();
        for flag in raw.split('~') {
            match flag {
                "cps" => flags.cps = true,
                "suk" => flags.suk = true,
                "noiptest" => flags.noiptest = true,
                "hardlock" => flags.hardlock = true,
                "sqrlonly" => flags.sqrlonly = true,
                _ => {}
            }
        }
        flags
    }
}

/// The decoded `client` pack of an exchange.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub cmd: Command,
    /// Current identity key (base64url Ed25519 public key).
    pub idk: String,
    /// Previous identity key, present during key rotation.
    pub pidk: Option<String>,
    /// Server unlock key offered for registration/rotation.
    pub suk: Option<String>,
    /// Verify unlock key offered for registration/rotation.
    pub vuk: Option<String>,
    pub opt: OptFlags,
}

impl ClientRequest {
    /// Decode and validate a base64url client pack. `None` on anything
    /// malformed; the caller answers with a client-failure pack.
    pub fn parse(client_b64: &str) -> Option<Self> {
        let raw = from_base64url_utf8(client_b64)?;
        let mut fields = pack::decode(&raw);

        if fields.remove("ver")? != PROTOCOL_VERSION {
            return None;
        }
        let cmd = fields.remove("cmd")?;
        if cmd.is_empty() || cmd.len() > MAX_CMD_LENGTH {
            return None;
        }
        let idk = fields.remove("idk")?;
        if idk.len() != IDK_LENGTH {
            return None;
        }
        let opt = fields.remove("opt")?;
        if opt.is_empty() {
            return None;
        }
        let pidk = fields.remove("pidk");
        if pidk.as_ref().is_some_and(|p| p.len() != IDK_LENGTH) {
            return None;
        }

        Some(Self {
            cmd: Command::parse(&cmd),
            idk,
            pidk,
            suk: fields.remove("suk"),
            vuk: fields.remove("vuk"),
            opt: OptFlags::parse(&opt),
        })
    }
}

/// The form-encoded POST envelope: raw base64url fields as transmitted.
#[derive(Debug, Deserialize)]
struct Envelope {
    client: Option<String>,
    server: Option<String>,
    ids: Option<String>,
    pids: Option<String>,
    urs: Option<String>,
}

/// A fully parsed exchange: raw envelope fields (signatures verify over the
/// raw base64url text) plus the decoded client pack.
struct ExchangeRequest {
    client_raw: String,
    server_raw: String,
    ids: String,
    pids: Option<String>,
    urs: Option<String>,
    client: ClientRequest,
}

impl ExchangeRequest {
    fn parse(nut_param: &str, body: &str) -> Option<Self> {
        let envelope: Envelope = serde_urlencoded::from_str(body).ok()?;
        let client_raw = envelope.client.filter(|s| !s.is_empty())?;
        let server_raw = envelope.server.filter(|s| !s.is_empty())?;
        let ids = envelope.ids.filter(|s| !s.is_empty())?;

        // The server field must echo prior server output verbatim (still
        // base64url). A literal `nut=<param>` means the client sent a
        // reconstructed query string instead.
        if server_raw.contains(&format!("nut={nut_param}")) {
            return None;
        }

        let client = ClientRequest::parse(&client_raw)?;
        Some(Self {
            client_raw,
            server_raw,
            ids,
            pids: envelope.pids.filter(|s| !s.is_empty()),
            urs: envelope.urs.filter(|s| !s.is_empty()),
            client,
        })
    }

    /// Verify `ids` against the current idk, and `pids` against the
    /// previous idk when one is presented. Signatures cover the raw
    /// `client` and `server` fields concatenated.
    fn signatures_valid(&self) -> bool {
        if !verify_signature(&self.client_raw, &self.server_raw, &self.ids, &self.client.idk) {
            return false;
        }
        match (&self.client.pidk, &self.pids) {
            (None, _) => true,
            (Some(pidk), Some(pids)) => {
                verify_signature(&self.client_raw, &self.server_raw, pids, pidk)
            }
            (Some(_), None) => false,
        }
    }

    /// Verify the unlock request signature (`urs`) against a stored verify
    /// unlock key. A missing `urs` never verifies.
    fn unlock_signature_valid(&self, vuk: &str) -> bool {
        match &self.urs {
            Some(urs) => verify_signature(&self.client_raw, &self.server_raw, urs, vuk),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// The SQRL protocol engine.
///
/// Construct once per deployment and share; all state lives in the store.
pub struct SqrlHandler {
    config: SqrlConfig,
    store: Arc<dyn SqrlStore>,
    nuts: NutManager,
    identities: IdentityProvider,
}

impl SqrlHandler {
    pub fn new(config: SqrlConfig, store: Arc<dyn SqrlStore>) -> Self {
        let nuts = NutManager::new(Arc::clone(&store), &config);
        let identities = IdentityProvider::new(Arc::clone(&store));
        Self {
            config,
            store,
            nuts,
            identities,
        }
    }

    pub fn config(&self) -> &SqrlConfig {
        &self.config
    }

    /// Run one protocol exchange. Always returns a response body.
    ///
    /// `ip` is the client's remote address, `nut_param` the `nut` query
    /// parameter, `body` the raw form-encoded POST body.
    pub async fn handle(&self, ip: IpAddr, nut_param: &str, body: &str) -> String {
        match self.process(ip, nut_param, body).await {
            Ok(body) => body,
            Err(err) => {
                tracing::error!(error = %err, %ip, "sqrl exchange failed on storage");
                match self
                    .error_return(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE, ip)
                    .await
                {
                    Ok(body) => body,
                    Err(err) => {
                        // Even the error nut could not be minted. Answer
                        // without one; the client restarts from a new URL.
                        tracing::error!(error = %err, %ip, "error nut could not be minted");
                        ServerResponse::with_tif(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE).to_body()
                    }
                }
            }
        }
    }

    async fn process(
        &self,
        ip: IpAddr,
        nut_param: &str,
        body: &str,
    ) -> Result<String, StoreError> {
        // Shape checks before any parsing or store traffic.
        if body.is_empty()
            || body.len() > MAX_MESSAGE_SIZE
            || nut_param.is_empty()
            || nut_param.len() > MAX_NUT_PARAM_LENGTH
        {
            tracing::debug!(%ip, body_len = body.len(), "rejecting oversized or empty exchange");
            return self.error_return(TIF_CLIENT_FAILURE, ip).await;
        }

        let Some(request) = ExchangeRequest::parse(nut_param, body) else {
            tracing::debug!(%ip, nut = nut_param, "malformed sqrl exchange");
            return self.error_return(TIF_CLIENT_FAILURE, ip).await;
        };

        if !request.signatures_valid() {
            tracing::debug!(%ip, nut = nut_param, idk = %request.client.idk, "signature verification failed");
            return self
                .error_return(TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE, ip)
                .await;
        }

        // Validate against a snapshot, then claim atomically. The claim can
        // still lose to a concurrent request that validated the same nut.
        let Some(snapshot) = self.store.retrieve_nut(nut_param).await? else {
            tracing::debug!(nut = nut_param, "unknown nut");
            return self.error_return(TIF_TRANSIENT_ERROR, ip).await;
        };
        if let Err(reason) = self.nuts.validate(&snapshot, &request.server_raw) {
            tracing::debug!(nut = nut_param, %reason, "nut refused");
            return self.error_return(TIF_TRANSIENT_ERROR, ip).await;
        }
        let Some(mut nut) = self.nuts.use_nut(nut_param).await? else {
            tracing::debug!(nut = nut_param, "nut claimed by concurrent exchange");
            return self.error_return(TIF_TRANSIENT_ERROR, ip).await;
        };

        let same_ip = nut.ip == ip;

        // Resolve both presented identity keys positionally.
        let found = self
            .identities
            .find(&[Some(request.client.idk.as_str()), request.client.pidk.as_deref()])
            .await?;
        let sqrl_data = found.first().cloned().flatten();
        let p_sqrl_data = found.get(1).cloned().flatten();

        // The first resolved identity claims the chain, root included, so a
        // later off-device redemption knows its account.
        if nut.user_id.is_none() {
            if let Some(user_id) = sqrl_data
                .as_ref()
                .or(p_sqrl_data.as_ref())
                .map(|identity| identity.user_id)
            {
                tracing::info!(%user_id, nut = %nut.id, "claiming nut chain for account");
                nut.user_id = Some(user_id);
                self.store.update_nut(&nut).await?;
                if !nut.is_initial() {
                    if let Some(mut root) = self.store.retrieve_nut(nut.root_id()).await? {
                        if root.user_id.is_none() {
                            root.user_id = Some(user_id);
                            self.store.update_nut(&root).await?;
                        }
                    }
                }
            }
        }

        let mut tif: u16 = 0;
        if same_ip {
            tif |= TIF_IP_MATCH;
        }

        let mut resp = ServerResponse::default();
        if let Some(sqrl) = &sqrl_data {
            tif |= TIF_ID_MATCH;
            if sqrl.is_disabled() {
                tif |= TIF_SQRL_DISABLED;
            }
            if sqrl.is_superseded() {
                tif |= TIF_ID_SUPERSEDED;
            }
            if request.client.opt.suk {
                resp.suk = Some(sqrl.suk.clone());
            }
        }

        // Eligibility gate: command/state combinations the protocol forbids.
        let is_basic = request.client.cmd.is_basic();
        let ineligible =
            // Source address must match unless the client opted out.
            (!same_ip && !request.client.opt.noiptest)
            // Initial nuts only carry queries.
            || (request.client.cmd != Command::Query && nut.is_initial())
            // A follow-up chain stays pinned to the account that claimed it.
            || (!nut.is_initial()
                && sqrl_data.as_ref().is_some_and(|s| Some(s.user_id) != nut.user_id))
            // idk and pidk must belong to the same account.
            || (matches!((&sqrl_data, &p_sqrl_data), (Some(a), Some(b)) if a.user_id != b.user_id))
            // Unknown idks can only query and ident.
            || (sqrl_data.is_none() && !is_basic)
            // Superseded idks can only query.
            || (request.client.cmd != Command::Query
                && sqrl_data.as_ref().is_some_and(Identity::is_superseded))
            // Previous identities can only query and ident.
            || (request.client.pidk.is_some() && !is_basic);
        if ineligible {
            tracing::debug!(nut = %nut.id, cmd = ?request.client.cmd, "exchange ineligible for command");
            tif |= TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE;
            return self.follow_up_return(resp, tif, &nut).await;
        }

        match request.client.cmd {
            Command::Query => {
                if let Some(sqrl) = &sqrl_data {
                    if sqrl.is_disabled() {
                        // Client needs the suk to run the unlock protocol.
                        resp.suk = Some(sqrl.suk.clone());
                    }
                }
                if let Some(previous) = &p_sqrl_data {
                    tif |= TIF_PREVIOUS_ID_MATCH;
                    if sqrl_data.is_none() {
                        resp.suk = Some(previous.suk.clone());
                    }
                }
            }
            Command::Ident => {
                tif = self
                    .ident(
                        &request,
                        &mut nut,
                        sqrl_data.as_ref(),
                        p_sqrl_data.as_ref(),
                        tif,
                        &mut resp,
                    )
                    .await?;
            }
            Command::Enable => {
                // Gate guarantees a known, non-superseded identity here.
                if let Some(sqrl) = &sqrl_data {
                    if request.unlock_signature_valid(&sqrl.vuk) {
                        self.identities.enable(sqrl).await?;
                        self.login(sqrl.user_id, &mut nut, request.client.opt.cps, &mut resp)
                            .await?;
                        tif &= !TIF_SQRL_DISABLED;
                    } else {
                        tif |= TIF_COMMAND_FAILED;
                        resp.suk = Some(sqrl.suk.clone());
                        tracing::info!(idk = %sqrl.idk, "enable unlock signature failed");
                    }
                }
            }
            Command::Disable => {
                if let Some(sqrl) = &sqrl_data {
                    self.identities.disable(sqrl).await?;
                    self.login(sqrl.user_id, &mut nut, request.client.opt.cps, &mut resp)
                        .await?;
                }
            }
            Command::Remove => {
                if let Some(sqrl) = &sqrl_data {
                    self.identities.remove(sqrl).await?;
                    self.store.delete_account(sqrl.user_id).await?;
                    self.login(sqrl.user_id, &mut nut, request.client.opt.cps, &mut resp)
                        .await?;
                }
            }
            Command::Unknown => {
                tracing::debug!("unknown command");
                tif |= TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE;
            }
        }

        self.follow_up_return(resp, tif, &nut).await
    }

    /// The `ident` command: authenticate, register, unlock, or rotate,
    /// depending on which of the presented keys resolved.
    async fn ident(
        &self,
        request: &ExchangeRequest,
        nut: &mut Nut,
        sqrl_data: Option<&Identity>,
        p_sqrl_data: Option<&Identity>,
        mut tif: u16,
        resp: &mut ServerResponse,
    ) -> Result<u16, StoreError> {
        let cps = request.client.opt.cps;
        match (sqrl_data, p_sqrl_data) {
            // Known identity: straight login, or unlock-then-login when
            // disabled.
            (Some(sqrl), _) => {
                if !sqrl.is_disabled() {
                    self.login(sqrl.user_id, nut, cps, resp).await?;
                } else if request.unlock_signature_valid(&sqrl.vuk) {
                    self.identities.enable(sqrl).await?;
                    tif &= !TIF_SQRL_DISABLED;
                    self.login(sqrl.user_id, nut, cps, resp).await?;
                } else {
                    tif |= TIF_COMMAND_FAILED;
                    resp.suk = Some(sqrl.suk.clone());
                    tracing::info!(idk = %sqrl.idk, "ident on disabled identity without valid unlock");
                }
            }
            // Only the previous identity resolved: key rotation.
            (None, Some(previous)) => {
                if previous.is_superseded() {
                    tif |= TIF_ID_SUPERSEDED | TIF_COMMAND_FAILED;
                    tracing::debug!(pidk = %previous.idk, "previous identity already superseded");
                } else if request.unlock_signature_valid(&previous.vuk) {
                    if self.rotate(request, previous).await?.is_some() {
                        tif |= TIF_ID_MATCH;
                        self.login(previous.user_id, nut, cps, resp).await?;
                    } else {
                        tif |= TIF_COMMAND_FAILED;
                    }
                } else {
                    tif |= TIF_COMMAND_FAILED;
                    tracing::info!(pidk = %previous.idk, "previous identity unlock signature failed");
                }
            }
            // Neither resolved: register a new identity, creating an
            // account unless the chain already has one.
            (None, None) => {
                let user_id = match nut.user_id {
                    Some(id) => id,
                    None => self.store.create_account().await?.id,
                };
                let (Some(suk), Some(vuk)) = (&request.client.suk, &request.client.vuk) else {
                    tracing::info!("ident without unlock key material");
                    tif |= TIF_COMMAND_FAILED;
                    return Ok(tif);
                };
                match self
                    .identities
                    .create(user_id, &request.client.idk, suk, vuk)
                    .await
                {
                    Ok(_) => {
                        tif |= TIF_ID_MATCH;
                        self.login(user_id, nut, cps, resp).await?;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "identity registration failed");
                        tif |= TIF_COMMAND_FAILED;
                    }
                }
            }
        }
        Ok(tif)
    }

    /// Register the new idk under the previous identity's account, then
    /// permanently retire the previous key. `None` when the client omitted
    /// its unlock key material or the registration was refused.
    async fn rotate(
        &self,
        request: &ExchangeRequest,
        previous: &Identity,
    ) -> Result<Option<Identity>, StoreError> {
        let (Some(suk), Some(vuk)) = (&request.client.suk, &request.client.vuk) else {
            tracing::info!(pidk = %previous.idk, "rotation without unlock key material");
            return Ok(None);
        };
        let created = match self
            .identities
            .create(previous.user_id, &request.client.idk, suk, vuk)
            .await
        {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = %err, "rotated identity registration failed");
                return Ok(None);
            }
        };
        self.identities.supersede(previous).await?;
        Ok(Some(created))
    }

    /// Mark a login on the chain.
    ///
    /// CPS logins identify the *current* nut and hand the client a redirect
    /// URL carrying its code; off-device logins identify the chain root,
    /// which the browser's poll code names.
    async fn login(
        &self,
        user_id: uuid::Uuid,
        nut: &mut Nut,
        cps: bool,
        resp: &mut ServerResponse,
    ) -> Result<(), StoreError> {
        tracing::info!(%user_id, nut = %nut.id, cps, "logging in account");
        if cps {
            resp.url = Some(format!(
                "{}?code={}",
                self.config.auth_url,
                cps_code(&nut.id)
            ));
            nut.identified = Some(Utc::now());
            nut.user_id = Some(user_id);
            self.store.update_nut(nut).await?;
        } else {
            let Some(mut root) = self.store.retrieve_nut(nut.root_id()).await? else {
                return Err(StoreError::MissingEntity("chain root nut"));
            };
            root.identified = Some(Utc::now());
            root.user_id = Some(user_id);
            self.store.update_nut(&root).await?;
        }
        Ok(())
    }

    /// Mint the chain's next nut, bind it to the response body by HMAC, and
    /// serialize the body.
    async fn follow_up_return(
        &self,
        mut resp: ServerResponse,
        tif: u16,
        existing: &Nut,
    ) -> Result<String, StoreError> {
        let mut created = self.nuts.create_follow_up(existing).await?;
        resp.tif = tif;
        resp.nut = created.id.clone();
        resp.qry = format!("{}?nut={}", self.config.sqrl_url, created.id);
        let body = resp.to_body();
        created.hmac = Some(self.nuts.sign_body(&body));
        self.store.update_nut(&created).await?;
        tracing::info!(nut = %created.id, tif = format!("{tif:x}"), "sqrl exchange complete");
        Ok(body)
    }

    /// Answer outside any chain: flags plus a fresh initial nut the client
    /// can restart from.
    async fn error_return(&self, tif: u16, ip: IpAddr) -> Result<String, StoreError> {
        let created = self.nuts.create_initial(ip).await?;
        let mut resp = ServerResponse::with_tif(tif);
        resp.nut = created.id.clone();
        resp.qry = format!("{}?nut={}", self.config.sqrl_url, created.id);
        Ok(resp.to_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use std::collections::HashMap;
    use std::time::Duration;

    fn handler() -> (SqrlHandler, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let config = SqrlConfig::new("https://example.com", "engine-test-secret")
            .unwrap()
            .with_nut_timeout(Duration::from_secs(60));
        (
            SqrlHandler::new(config, Arc::clone(&store) as Arc<dyn SqrlStore>),
            store,
        )
    }

    fn ip() -> IpAddr {
        "192.0.2.77".parse().unwrap()
    }

    fn decode_response(body: &str) -> HashMap<String, String> {
        pack::decode(&from_base64url_utf8(body).unwrap())
    }

    fn tif_of(fields: &HashMap<String, String>) -> u16 {
        u16::from_str_radix(fields.get("tif").unwrap(), 16).unwrap()
    }

    struct TestClient {
        key: SigningKey,
        idk: String,
    }

    impl TestClient {
        fn new() -> Self {
            let key = SigningKey::generate(&mut OsRng);
            let idk = pack::to_base64url(key.verifying_key().to_bytes());
            Self { key, idk }
        }

        fn body(&self, cmd: &str, opt: &str, server_raw: &str, extra: &[(&str, &str)]) -> String {
            let mut pairs = vec![
                ("ver", "1"),
                ("cmd", cmd),
                ("idk", self.idk.as_str()),
                ("opt", opt),
            ];
            pairs.extend_from_slice(extra);
            let client_raw = pack::to_base64url(pack::encode(pairs));
            let message = format!("{client_raw}{server_raw}");
            let ids = pack::to_base64url(self.key.sign(message.as_bytes()).to_bytes());
            serde_urlencoded::to_string([
                ("client", client_raw.as_str()),
                ("server", server_raw),
                ("ids", ids.as_str()),
            ])
            .unwrap()
        }
    }

    async fn fresh_nut(store: &Arc<MemoryStore>, handler: &SqrlHandler) -> String {
        let nuts = NutManager::new(
            Arc::clone(store) as Arc<dyn SqrlStore>,
            handler.config(),
        );
        nuts.create_initial(ip()).await.unwrap().id
    }

    #[tokio::test]
    async fn empty_body_is_client_failure() {
        let (handler, _) = handler();
        let fields = decode_response(&handler.handle(ip(), "somenut", "").await);
        assert_eq!(tif_of(&fields), TIF_CLIENT_FAILURE);
        // The error carries a fresh nut to restart from.
        assert!(!fields.get("nut").unwrap().is_empty());
        assert!(fields.get("qry").unwrap().starts_with("/sqrl?nut="));
    }

    #[tokio::test]
    async fn garbage_body_is_client_failure() {
        let (handler, _) = handler();
        let fields =
            decode_response(&handler.handle(ip(), "somenut", "client=!!!&server=x&ids=y").await);
        assert_eq!(tif_of(&fields), TIF_CLIENT_FAILURE);
    }

    #[tokio::test]
    async fn unknown_nut_is_transient() {
        let (handler, _) = handler();
        let client = TestClient::new();
        let server_raw = pack::to_base64url("sqrl://example.com/sqrl?nut=missing");
        let body = client.body("query", "suk", &server_raw, &[]);
        let fields = decode_response(&handler.handle(ip(), "missing", &body).await);
        assert_eq!(tif_of(&fields), TIF_TRANSIENT_ERROR);
    }

    #[tokio::test]
    async fn tampered_signature_is_command_and_client_failure() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let mut body = client.body("query", "suk", &server_raw, &[]);
        // Flip a character inside the ids parameter.
        let ids_at = body.find("ids=").unwrap() + 10;
        let original = body.as_bytes()[ids_at] as char;
        let replacement = if original == 'A' { 'B' } else { 'A' };
        body.replace_range(ids_at..ids_at + 1, &replacement.to_string());

        let fields = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(tif_of(&fields), TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
    }

    #[tokio::test]
    async fn server_field_echoing_bare_nut_is_rejected() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        // Decoded query string instead of the base64url echo.
        let body = client.body("query", "suk", &format!("nut={nut}"), &[]);
        let fields = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(tif_of(&fields), TIF_CLIENT_FAILURE);
    }

    #[tokio::test]
    async fn query_unknown_identity_only_ip_match() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let body = client.body("query", "suk", &server_raw, &[]);

        let fields = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(tif_of(&fields), TIF_IP_MATCH);
        // Response is chained: a new nut, qry pointing at it.
        let next = fields.get("nut").unwrap();
        assert_ne!(next, &nut);
        assert_eq!(fields.get("qry").unwrap(), &format!("/sqrl?nut={next}"));
    }

    #[tokio::test]
    async fn nut_is_single_use() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let body = client.body("query", "suk", &server_raw, &[]);

        let first = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(tif_of(&first), TIF_IP_MATCH);
        let second = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(tif_of(&second), TIF_TRANSIENT_ERROR);
    }

    #[tokio::test]
    async fn ident_on_initial_nut_is_ineligible() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let body = client.body("ident", "suk", &server_raw, &[("suk", "S"), ("vuk", "V")]);

        let fields = decode_response(&handler.handle(ip(), &nut, &body).await);
        assert_eq!(
            tif_of(&fields),
            TIF_IP_MATCH | TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE
        );
        assert_eq!(store.account_count(), 0);
    }

    #[tokio::test]
    async fn mismatched_ip_without_noiptest_is_ineligible() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let body = client.body("query", "suk", &server_raw, &[]);

        let other: IpAddr = "203.0.113.200".parse().unwrap();
        let fields = decode_response(&handler.handle(other, &nut, &body).await);
        assert_eq!(tif_of(&fields), TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE);
    }

    #[tokio::test]
    async fn mismatched_ip_with_noiptest_queries_fine() {
        let (handler, store) = handler();
        let nut = fresh_nut(&store, &handler).await;
        let client = TestClient::new();
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={nut}"));
        let body = client.body("query", "suk~noiptest", &server_raw, &[]);

        let other: IpAddr = "203.0.113.200".parse().unwrap();
        let fields = decode_response(&handler.handle(other, &nut, &body).await);
        assert_eq!(tif_of(&fields), 0);
    }

    #[tokio::test]
    async fn unknown_command_fails_on_chain() {
        let (handler, store) = handler();
        let root = fresh_nut(&store, &handler).await;
        let client = TestClient::new();

        // Query first to obtain a follow-up nut and its body echo.
        let server_raw = pack::to_base64url(format!("sqrl://example.com/sqrl?nut={root}"));
        let body = client.body("query", "suk", &server_raw, &[]);
        let reply = handler.handle(ip(), &root, &body).await;
        let fields = decode_response(&reply);
        let next = fields.get("nut").unwrap().clone();

        let body = client.body("bogus", "suk", &reply, &[]);
        let fields = decode_response(&handler.handle(ip(), &next, &body).await);
        assert_eq!(
            tif_of(&fields),
            TIF_IP_MATCH | TIF_COMMAND_FAILED | TIF_CLIENT_FAILURE
        );
    }

    #[test]
    fn command_parse() {
        assert_eq!(Command::parse("query"), Command::Query);
        assert_eq!(Command::parse("ident"), Command::Ident);
        assert_eq!(Command::parse("enable"), Command::Enable);
        assert_eq!(Command::parse("disable"), Command::Disable);
        assert_eq!(Command::parse("remove"), Command::Remove);
        assert_eq!(Command::parse("QUERY"), Command::Unknown);
        assert_eq!(Command::parse(""), Command::Unknown);
    }

    #[test]
    fn opt_flags_parse() {
        let flags = OptFlags::parse("cps~suk~noiptest");
        assert!(flags.cps && flags.suk && flags.noiptest);
        assert!(!flags.hardlock && !flags.sqrlonly);
        // Unknown flags are ignored, known ones still picked up.
        let flags = OptFlags::parse("mystery~hardlock");
        assert!(flags.hardlock && !flags.cps);
    }

    #[test]
    fn client_request_parse_rejects_bad_shapes() {
        let pack_of = |raw: &str| pack::to_base64url(raw);
        let idk = "A".repeat(IDK_LENGTH);

        // Happy path.
        let good = pack_of(&format!("ver=1\r\ncmd=query\r\nidk={idk}\r\nopt=suk\r\n"));
        assert!(ClientRequest::parse(&good).is_some());

        // Wrong version.
        let bad = pack_of(&format!("ver=2\r\ncmd=query\r\nidk={idk}\r\nopt=suk\r\n"));
        assert!(ClientRequest::parse(&bad).is_none());

        // Short idk.
        let bad = pack_of("ver=1\r\ncmd=query\r\nidk=short\r\nopt=suk\r\n");
        assert!(ClientRequest::parse(&bad).is_none());

        // Missing opt.
        let bad = pack_of(&format!("ver=1\r\ncmd=query\r\nidk={idk}\r\n"));
        assert!(ClientRequest::parse(&bad).is_none());

        // Overlong command.
        let bad = pack_of(&format!(
            "ver=1\r\ncmd=definitelytoolong\r\nidk={idk}\r\nopt=suk\r\n"
        ));
        assert!(ClientRequest::parse(&bad).is_none());

        // Not base64.
        assert!(ClientRequest::parse("!!not-base64!!").is_none());
    }
}
