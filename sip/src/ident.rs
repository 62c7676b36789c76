//! Tag, branch and Call-ID generation. Everything draws from the thread
//! rng, which is a CSPRNG.

/// RFC 3261 magic cookie: a branch starting with this marks a transaction
/// id unique on the wire.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// From/To tag: 16 alphabetic characters, well past the 32 bits of entropy
/// the RFC asks for.
pub fn tag() -> String {
    quasar_utils::rand_alpha(16)
}

pub fn branch() -> String {
    format!("{}{}", MAGIC_COOKIE, quasar_utils::rand_string(20))
}

/// Call-IDs must be unique over space and time; a v4 UUID is exactly that.
pub fn call_id() -> String {
    quasar_utils::uuid()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_alphabetic() {
        let t = tag();
        assert_eq!(16, t.len());
        assert!(t.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(tag(), tag());
    }

    #[test]
    fn branches_carry_the_cookie() {
        let b = branch();
        assert!(b.starts_with(MAGIC_COOKIE));
        assert!(b.len() > MAGIC_COOKIE.len());
        assert_ne!(branch(), branch());
    }

    #[test]
    fn call_ids_are_unique() {
        assert_ne!(call_id(), call_id());
    }
}
