use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Default well-known master server UDP port.
pub const MASTER_PORT: u16 = 27950;
/// Safe-MTU ceiling for a single datagram.
pub const MAX_PACKET: usize = 1400;
/// Out-of-band marker prefixed to every protocol message.
pub const OOB_PREFIX: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

pub const CHALLENGE_MIN_LEN: usize = 9;
pub const CHALLENGE_MAX_LEN: usize = 12;

/// A server known to the directory, keyed by its network address.
///
/// The `info` attributes are free-form key/value pairs reported by the game
/// server itself (map name, player count, ...). `last_update` is refreshed on
/// every info refresh; `permanent` marks seed entries that survive pruning.
#[derive(Debug, Clone, Serialize)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    pub info: HashMap<String, String>,
    #[serde(skip)]
    pub last_update: Instant,
    #[serde(skip)]
    pub permanent: bool,
}

impl ServerEntry {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            info: HashMap::new(),
            last_update: Instant::now(),
            permanent: false,
        }
    }

    /// Returns true if the entry has not been refreshed within `window`.
    pub fn is_expired(&self, window: Duration) -> bool {
        self.last_update.elapsed() > window
    }
}

/// Inbound protocol commands, classified by literal prefix.
///
/// Matching is case-sensitive and follows the wire convention: `infoResponse`
/// and `statusResponse` carry their payload after a newline, `getservers`
/// carries a trailing query token after a space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Heartbeat,
    GetServers { query: String },
    Subscribe,
    InfoResponse { payload: String },
    StatusResponse,
    Unknown(String),
}

impl Command {
    pub fn parse(msg: &str) -> Command {
        if msg.starts_with("heartbeat") {
            Command::Heartbeat
        } else if let Some(rest) = msg.strip_prefix("getservers ") {
            Command::GetServers {
                query: rest.trim().to_string(),
            }
        } else if msg.starts_with("subscribe") {
            Command::Subscribe
        } else if let Some(payload) = msg.strip_prefix("infoResponse\n") {
            Command::InfoResponse {
                payload: payload.to_string(),
            }
        } else if msg.starts_with("statusResponse\n") {
            Command::StatusResponse
        } else {
            Command::Unknown(msg.to_string())
        }
    }
}

/// Wraps a payload in the out-of-band envelope: four 0xFF bytes, the payload,
/// and a single 0x00 terminator.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    out.extend_from_slice(&OOB_PREFIX);
    out.extend_from_slice(payload);
    out.push(0x00);
    out
}

/// Strips the out-of-band envelope and decodes the payload as ISO-8859-1.
///
/// Returns `None` for packets shorter than five bytes or without the four
/// 0xFF marker bytes. A single trailing 0x00 is removed if present.
pub fn unframe(packet: &[u8]) -> Option<String> {
    if packet.len() < 5 || packet[..4] != OOB_PREFIX {
        return None;
    }
    let mut end = packet.len();
    if packet[end - 1] == 0x00 {
        end -= 1;
    }
    // ISO-8859-1: every byte maps to the code point of the same value.
    Some(packet[4..end].iter().map(|&b| b as char).collect())
}

/// Parses a backslash-delimited info string into a key/value map.
///
/// Tokens alternate key, value, key, value; an odd trailing key without a
/// value is dropped silently. Empty input yields an empty map.
pub fn parse_info_string(s: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let s = s.strip_prefix('\\').unwrap_or(s);
    if s.is_empty() {
        return map;
    }
    let mut tokens = s.split('\\');
    while let (Some(key), Some(value)) = (tokens.next(), tokens.next()) {
        map.insert(key.to_string(), value.to_string());
    }
    map
}

/// Generates a random challenge token of 9 to 12 visible-ASCII characters.
///
/// Excludes `\`, `;`, `"`, `%` and `/`, which would corrupt info-string
/// parsing on the receiving side.
pub fn generate_challenge() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(CHALLENGE_MIN_LEN..=CHALLENGE_MAX_LEN);
    let mut token = String::with_capacity(len);
    while token.len() < len {
        let c = rng.gen_range(33u8..127) as char;
        if matches!(c, '\\' | ';' | '"' | '%' | '/') {
            continue;
        }
        token.push(c);
    }
    token
}

/// Encodes a server list as a `getserversResponse` payload.
///
/// For each entry whose host is a dotted-quad IPv4 address: one backslash,
/// the four address octets, and the port in big-endian order. Entries with
/// any other host (unresolved hostnames, IPv6) contribute no bytes. The list
/// is terminated by the literal `\EOT`.
pub fn encode_server_list(servers: &[ServerEntry]) -> Vec<u8> {
    let mut out = Vec::from(&b"getserversResponse"[..]);
    for server in servers {
        let ip: Ipv4Addr = match server.host.parse() {
            Ok(ip) => ip,
            Err(_) => continue,
        };
        out.push(b'\\');
        out.extend_from_slice(&ip.octets());
        out.extend_from_slice(&server.port.to_be_bytes());
    }
    out.extend_from_slice(b"\\EOT");
    out
}
