use sha1::{Digest, Sha1};

/// 4.1 native-password scramble:
/// `SHA1(password) XOR SHA1(challenge ++ SHA1(SHA1(password)))`.
///
/// An empty password produces an empty response, not a 20-byte one.
pub fn scramble_native(challenge: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2);
    let mut out = hasher.finalize();

    for (o, s) in out.iter_mut().zip(stage1.iter()) {
        *o ^= s;
    }

    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::scramble_native;

    #[test]
    fn it_scrambles_an_empty_password_to_nothing() {
        assert!(scramble_native(b"01234567890123456789", b"").is_empty());
    }

    #[test]
    fn it_produces_twenty_bytes_for_any_password() {
        for pw in [&b"x"[..], b"secret", b"a much longer password than the block"] {
            assert_eq!(scramble_native(b"01234567890123456789", pw).len(), 20);
        }
    }

    #[test]
    fn it_is_deterministic() {
        let a = scramble_native(b"01234567890123456789", b"secret");
        let b = scramble_native(b"01234567890123456789", b"secret");

        assert_eq!(a, b);
    }

    #[test]
    fn it_depends_on_the_challenge() {
        let a = scramble_native(b"01234567890123456789", b"secret");
        let b = scramble_native(b"98765432109876543210", b"secret");

        assert_ne!(a, b);
    }
}
