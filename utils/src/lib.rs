use crypto::digest::Digest;
use crypto::md5::Md5;
use crypto::sha1::Sha1;
use crypto::sha2::Sha256;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

pub fn md5(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.input(input.as_bytes());
    hasher.result_str()
}

pub fn sha256(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.input(input.as_bytes());
    hasher.result_str()
}

pub fn sha1(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.input(input.as_bytes());
    hasher.result_str()
}

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn rand_string(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// Random string drawn from [A-Za-z] only, for values that must stay
/// strictly alphabetic on the wire.
pub fn rand_alpha(n: usize) -> String {
    const ALPHA: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| ALPHA[rng.gen_range(0..ALPHA.len())] as char)
        .collect()
}

pub fn get_local_ip() -> Option<String> {
    let output = match std::process::Command::new("hostname")
        .args(["-I"])
        .output()
    {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let stdout = match String::from_utf8(output.stdout) {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let ips: Vec<&str> = stdout.trim().split(' ').collect::<Vec<&str>>();
    match ips.first() {
        Some(first) if !first.is_empty() => Some(first.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests() {
        assert_eq!("d41d8cd98f00b204e9800998ecf8427e", md5(""));
        assert_eq!("900150983cd24fb0d6963f7d28e17f72", md5("abc"));
        assert_eq!("a9993e364706816aba3e25717850c26c9cd0d89d", sha1("abc"));
    }

    #[test]
    fn random_strings() {
        let s = rand_alpha(16);
        assert_eq!(16, s.len());
        assert!(s.chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(rand_alpha(16), rand_alpha(16));
        assert_eq!(20, rand_string(20).len());
    }
}
