//! Interactive CLI demo of a full SQRL authentication lifecycle.
//!
//! Plays both sides of the protocol against one in-memory store: the server
//! mints a login URL bundle, a simulated client with real Ed25519 keys runs
//! query/ident exchanges over the nut chain, the browser redeems its poll
//! code, and the demo closes with a replay attempt and a disable/enable
//! unlock ceremony. The output uses ANSI escape codes for colored,
//! storytelling-style terminal rendering.
//!
//! Run with:
//!   cargo run --example demo --release

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;

use sqrl_protocol::config::{
    TIF_ID_MATCH, TIF_IP_MATCH, TIF_SQRL_DISABLED, TIF_TRANSIENT_ERROR,
};
use sqrl_protocol::pack::{self, from_base64url_utf8, to_base64url};
use sqrl_protocol::store::memory::MemoryStore;
use sqrl_protocol::store::SqrlStore;
use sqrl_protocol::{SqrlConfig, SqrlHandler, UrlBuilder};

// ---------------------------------------------------------------------------
// ANSI color constants
// ---------------------------------------------------------------------------

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const MAGENTA: &str = "\x1b[35m";
const WHITE: &str = "\x1b[37m";

const BG_BLUE: &str = "\x1b[44m";

// ---------------------------------------------------------------------------
// Display helpers
// ---------------------------------------------------------------------------

fn banner() {
    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    SQRL PROTOCOL  --  Interactive Authentication Demo              {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    Secure Quick Reliable Login  |  Ed25519 + HMAC-SHA256           {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();
}

fn section(num: u32, title: &str) {
    println!();
    println!(
        "{BOLD}{CYAN}===[{YELLOW} Step {num} {CYAN}]=============================================================={RESET}"
    );
    println!("{BOLD}{WHITE}  {title}{RESET}");
    println!(
        "{CYAN}------------------------------------------------------------------------{RESET}"
    );
}

fn subsection(text: &str) {
    println!("{DIM}{CYAN}  >> {text}{RESET}");
}

fn success(text: &str) {
    println!("{GREEN}  [OK] {text}{RESET}");
}

fn info(label: &str, value: &str) {
    println!("{WHITE}  {BOLD}{label}:{RESET} {YELLOW}{value}{RESET}");
}

fn timing(label: &str, elapsed: std::time::Duration) {
    let ms = elapsed.as_secs_f64() * 1000.0;
    println!("{DIM}{MAGENTA}  [{label}: {ms:.2} ms]{RESET}");
}

fn tif_row(fields: &HashMap<String, String>) {
    let raw = fields.get("tif").cloned().unwrap_or_default();
    let value = u16::from_str_radix(&raw, 16).unwrap_or(0);
    let mut names = Vec::new();
    for (bit, name) in [
        (TIF_ID_MATCH, "id-match"),
        (TIF_IP_MATCH, "ip-match"),
        (TIF_SQRL_DISABLED, "disabled"),
        (TIF_TRANSIENT_ERROR, "transient"),
    ] {
        if value & bit != 0 {
            names.push(name);
        }
    }
    let decoded = if names.is_empty() {
        "none".to_string()
    } else {
        names.join(" | ")
    };
    println!("  {WHITE}{BOLD}tif:{RESET} {YELLOW}0x{raw}{RESET}  {DIM}({decoded}){RESET}");
}

// ---------------------------------------------------------------------------
// Simulated client
// ---------------------------------------------------------------------------

/// A conforming SQRL client: identity keypair, unlock keypair whose public
/// half becomes the registered `vuk`, and an opaque `suk`.
struct Client {
    identity: SigningKey,
    unlock: SigningKey,
    idk: String,
    suk: String,
    vuk: String,
}

impl Client {
    fn generate() -> Self {
        let identity = SigningKey::generate(&mut OsRng);
        let unlock = SigningKey::generate(&mut OsRng);
        let idk = to_base64url(identity.verifying_key().to_bytes());
        let suk = to_base64url(SigningKey::generate(&mut OsRng).verifying_key().to_bytes());
        let vuk = to_base64url(unlock.verifying_key().to_bytes());
        Self {
            identity,
            unlock,
            idk,
            suk,
            vuk,
        }
    }

    /// Build one signed exchange body. `server` is the previous reply (or
    /// the base64url login URL on the first exchange); `with_keys` attaches
    /// `suk`/`vuk`; `unlock` adds a `urs` signature from the unlock key.
    fn exchange(&self, cmd: &str, server: &str, with_keys: bool, unlock: bool) -> String {
        let mut lines = vec![
            ("ver", "1".to_string()),
            ("cmd", cmd.to_string()),
            ("idk", self.idk.clone()),
        ];
        if with_keys {
            lines.push(("suk", self.suk.clone()));
            lines.push(("vuk", self.vuk.clone()));
        }
        lines.push(("opt", "suk".to_string()));
        let raw = pack::encode(lines.iter().map(|(k, v)| (*k, v.as_str())));
        let client_raw = to_base64url(raw);

        let message = format!("{client_raw}{server}");
        let mut form = vec![
            ("client", client_raw.clone()),
            ("server", server.to_string()),
            (
                "ids",
                to_base64url(self.identity.sign(message.as_bytes()).to_bytes()),
            ),
        ];
        if unlock {
            form.push((
                "urs",
                to_base64url(self.unlock.sign(message.as_bytes()).to_bytes()),
            ));
        }
        serde_urlencoded::to_string(form).unwrap()
    }
}

fn decode_reply(body: &str) -> HashMap<String, String> {
    pack::decode(&from_base64url_utf8(body).expect("reply must be base64url"))
}

fn nut_of(fields: &HashMap<String, String>) -> String {
    fields.get("nut").expect("nut present").clone()
}

fn nut_from_login_url(login: &str) -> String {
    login
        .split("nut=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .to_string()
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let demo_start = Instant::now();
    let device_ip: IpAddr = "192.0.2.10".parse().unwrap();

    banner();

    // -----------------------------------------------------------------------
    // Step 1: Server Bootstrap
    // -----------------------------------------------------------------------

    section(1, "Server Bootstrap");
    subsection("Deriving endpoint URLs and wiring the engine over an in-memory store...");

    let t = Instant::now();
    let config = SqrlConfig::new("https://sqrl.example.com", "demo-hmac-secret").unwrap();
    let store = Arc::new(MemoryStore::new()) as Arc<dyn SqrlStore>;
    let handler = SqrlHandler::new(config.clone(), Arc::clone(&store));
    let urls = UrlBuilder::new(config, store);
    timing("bootstrap", t.elapsed());
    success("Engine ready at https://sqrl.example.com");

    // -----------------------------------------------------------------------
    // Step 2: Login URL Bundle
    // -----------------------------------------------------------------------

    section(2, "Login URL Bundle");
    subsection("Minting a fresh initial nut and the four URLs a browser needs...");

    let t = Instant::now();
    let bundle = urls.create_urls(device_ip).await.unwrap();
    timing("create_urls", t.elapsed());

    info("login (QR)", &bundle.login);
    info("cps  (same-device)", &bundle.cps[..60.min(bundle.cps.len())]);
    info("poll (browser)", &bundle.poll);
    let root_nut = nut_from_login_url(&bundle.login);
    info("chain root nut", &root_nut);
    success("Bundle issued; the browser renders the QR and polls for completion");

    // -----------------------------------------------------------------------
    // Step 3: Client Key Generation
    // -----------------------------------------------------------------------

    section(3, "Client Key Generation");
    subsection("Generating identity and unlock Ed25519 keypairs...");

    let t = Instant::now();
    let client = Client::generate();
    timing("keygen x3", t.elapsed());

    info("idk (identity key)", &client.idk);
    info("suk (server unlock key)", &client.suk);
    info("vuk (verify unlock key)", &client.vuk);
    success("Client identity ready");

    // -----------------------------------------------------------------------
    // Step 4: Query Exchange
    // -----------------------------------------------------------------------

    section(4, "Query Exchange (unknown identity)");
    subsection("Client signs client||server and asks whether the server knows it...");

    let server_echo = to_base64url(&bundle.login);
    let t = Instant::now();
    let reply = handler
        .handle(
            device_ip,
            &root_nut,
            &client.exchange("query", &server_echo, false, false),
        )
        .await;
    timing("query exchange", t.elapsed());

    let fields = decode_reply(&reply);
    tif_row(&fields);
    assert_eq!(
        u16::from_str_radix(&fields["tif"], 16).unwrap(),
        TIF_IP_MATCH
    );
    success("Server does not know this identity yet; nut chain advanced");

    // -----------------------------------------------------------------------
    // Step 5: Ident Registration
    // -----------------------------------------------------------------------

    section(5, "Ident Registration");
    subsection("Client sends ident with suk/vuk; server creates identity + account...");

    let t = Instant::now();
    let next_nut = nut_of(&fields);
    let reply = handler
        .handle(
            device_ip,
            &next_nut,
            &client.exchange("ident", &reply, true, false),
        )
        .await;
    timing("ident exchange", t.elapsed());

    let fields = decode_reply(&reply);
    tif_row(&fields);
    assert_eq!(
        u16::from_str_radix(&fields["tif"], 16).unwrap(),
        TIF_ID_MATCH | TIF_IP_MATCH
    );
    success("Identity registered and login bound to the chain root");

    // -----------------------------------------------------------------------
    // Step 6: Browser Code Redemption
    // -----------------------------------------------------------------------

    section(6, "Browser Code Redemption");
    subsection("The polling browser redeems its off-device code...");

    let code = bundle.poll.split("code=").nth(1).unwrap();
    let t = Instant::now();
    let account = urls
        .use_code(code, device_ip)
        .await
        .unwrap()
        .expect("identified chain must redeem");
    timing("use_code", t.elapsed());

    info("account id", &account.id.to_string());
    info("created", &account.created.to_rfc3339());

    // Codes are single-use.
    let replayed = urls.use_code(code, device_ip).await.unwrap();
    assert!(replayed.is_none());
    success("Session established; a second redemption of the same code is refused");

    // -----------------------------------------------------------------------
    // Step 7: Replay Defense
    // -----------------------------------------------------------------------

    section(7, "Replay Defense");
    subsection("Re-sending a perfectly signed exchange against a spent nut...");

    let t = Instant::now();
    let reply = handler
        .handle(
            device_ip,
            &next_nut,
            &client.exchange("ident", &reply, true, false),
        )
        .await;
    timing("replayed exchange", t.elapsed());

    let fields = decode_reply(&reply);
    tif_row(&fields);
    assert_eq!(
        u16::from_str_radix(&fields["tif"], 16).unwrap(),
        TIF_TRANSIENT_ERROR
    );
    success("Spent nut rejected; reply carries a fresh nut so the client can retry");

    // -----------------------------------------------------------------------
    // Step 8: Disable / Enable Unlock Ceremony
    // -----------------------------------------------------------------------

    section(8, "Disable / Enable Unlock Ceremony");
    subsection("Client disables SQRL access, then unlocks it with a urs signature...");

    // Disable over a fresh chain.
    let bundle = urls.create_urls(device_ip).await.unwrap();
    let server_echo = to_base64url(&bundle.login);
    let reply = handler
        .handle(
            device_ip,
            &nut_from_login_url(&bundle.login),
            &client.exchange("query", &server_echo, false, false),
        )
        .await;
    let fields = decode_reply(&reply);
    let reply = handler
        .handle(
            device_ip,
            &nut_of(&fields),
            &client.exchange("disable", &reply, false, false),
        )
        .await;
    let fields = decode_reply(&reply);
    tif_row(&fields);
    success("Identity disabled");

    // A later chain sees the disabled flag, then re-enables with the
    // unlock key.
    let bundle = urls.create_urls(device_ip).await.unwrap();
    let server_echo = to_base64url(&bundle.login);
    let reply = handler
        .handle(
            device_ip,
            &nut_from_login_url(&bundle.login),
            &client.exchange("query", &server_echo, false, false),
        )
        .await;
    let fields = decode_reply(&reply);
    tif_row(&fields);
    assert!(u16::from_str_radix(&fields["tif"], 16).unwrap() & TIF_SQRL_DISABLED != 0);
    info("suk returned for unlock", fields.get("suk").map(String::as_str).unwrap_or("-"));

    let t = Instant::now();
    let reply = handler
        .handle(
            device_ip,
            &nut_of(&fields),
            &client.exchange("enable", &reply, false, true),
        )
        .await;
    timing("enable + urs verification", t.elapsed());

    let fields = decode_reply(&reply);
    tif_row(&fields);
    let tif = u16::from_str_radix(&fields["tif"], 16).unwrap();
    assert!(tif & TIF_ID_MATCH != 0 && tif & TIF_SQRL_DISABLED == 0);
    success("urs verified against the stored vuk; identity re-enabled and logged in");

    // -----------------------------------------------------------------------
    // Final Summary
    // -----------------------------------------------------------------------

    let total_elapsed = demo_start.elapsed();

    println!();
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}    DEMO COMPLETE -- Final Summary                                  {RESET}"
    );
    println!(
        "{BG_BLUE}{BOLD}{WHITE}                                                                    {RESET}"
    );
    println!();

    println!("  {BOLD}{WHITE}Protocol Statistics:{RESET}");
    println!("  {DIM}----------------------------------------------{RESET}");
    info("Exchanges handled", "7 (query/ident/disable/enable + replay)");
    info("Codes redeemed", "1 (second attempt refused)");
    info("Signing algorithm", "Ed25519 (ed25519-dalek 2.1)");
    info("Chain binding", "HMAC-SHA256 over each reply body");
    info("Nut entropy", "16 CSPRNG bytes, base64url");
    println!();
    println!(
        "  {BOLD}{GREEN}Total demo time: {:.2}s{RESET}",
        total_elapsed.as_secs_f64()
    );
    println!();
}
