use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 sign `payload` with `secret`, hex-encoded. `payload` must
/// already include the request's `timestamp` field so the signature is
/// bound to a specific moment, not just a specific set of parameters.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts a key of any length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_for_the_same_inputs() {
        let a = sign("secret", "symbol=BTCZAR&timestamp=1000");
        let b = sign("secret", "symbol=BTCZAR&timestamp=1000");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_the_payload() {
        let a = sign("secret", "symbol=BTCZAR&timestamp=1000");
        let b = sign("secret", "symbol=BTCZAR&timestamp=1001");
        assert_ne!(a, b);
    }
}
