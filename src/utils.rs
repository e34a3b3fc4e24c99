use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

const ICE_SCHEMES: [&str; 4] = ["stun:", "stuns:", "turn:", "turns:"];

/// Adds a `stun:` scheme to bare `host:port` entries; anything already
/// carrying an ICE scheme is returned unchanged.
pub fn add_ice_url_scheme(url: &str) -> String {
    let url = url.trim();
    if ICE_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        url.to_string()
    } else {
        format!("stun:{}", url)
    }
}
