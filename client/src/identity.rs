//! Session identity: who this client is for the lifetime of the process.

use rand::Rng;

pub const SESSION_ID_PREFIX: &str = "player_";
pub const SESSION_ID_LENGTH: usize = 9;
pub const DEFAULT_COLOR: &str = "#ffff66";

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub color: String,
}

impl Identity {
    /// Generates a fresh session id. Collisions are not detected.
    pub fn generate<R: Rng>(rng: &mut R, name: Option<String>, color: Option<String>) -> Self {
        let id = generate_session_id(rng);
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("Bird {}", &id[id.len() - 4..]));
        let color = color
            .and_then(|c| normalize_hex_color(&c))
            .unwrap_or_else(|| DEFAULT_COLOR.to_string());

        Self { id, name, color }
    }
}

pub fn generate_session_id<R: Rng>(rng: &mut R) -> String {
    let suffix: String = (0..SESSION_ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}{}", SESSION_ID_PREFIX, suffix)
}

/// Accepts `#rgb` and `#rrggbb`.
pub fn is_hex_color(color: &str) -> bool {
    match color.strip_prefix('#') {
        Some(hex) => (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// Lowercase `#rrggbb` form of a valid colour; `#rgb` is expanded.
pub fn normalize_hex_color(color: &str) -> Option<String> {
    if !is_hex_color(color) {
        return None;
    }
    let hex = color[1..].to_ascii_lowercase();
    if hex.len() == 3 {
        Some(hex.chars().fold(String::from("#"), |mut full, c| {
            full.push(c);
            full.push(c);
            full
        }))
    } else {
        Some(format!("#{}", hex))
    }
}
