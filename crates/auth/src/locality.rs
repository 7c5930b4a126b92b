//! Who may run first-time setup.

use std::net::IpAddr;

use {
    secrecy::{ExposeSecret, Secret},
    sha2::{Digest, Sha256},
};

use crate::error::{AuthError, Denied};

/// `127.0.0.0/8`, `::1`, and IPv4-mapped loopback.
pub fn is_loopback(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}

/// Gate the bootstrap endpoint.
///
/// With a configured setup token the caller must present it, from any
/// address. Without one, setup is only reachable from loopback.
pub fn authorize_setup(
    configured: Option<&Secret<String>>,
    provided: Option<&str>,
    client_ip: IpAddr,
) -> Result<(), AuthError> {
    match configured {
        Some(expected) => match provided {
            Some(token) if safe_equal(token, expected.expose_secret()) => Ok(()),
            _ => Err(AuthError::Forbidden(Denied::SetupTokenRequired)),
        },
        None if is_loopback(client_ip) => Ok(()),
        None => Err(AuthError::Forbidden(Denied::SetupLocalhostOnly)),
    }
}

/// Constant-time comparison. Both sides are hashed first so the running time
/// does not depend on where, or whether, their lengths differ.
pub(crate) fn safe_equal(a: &str, b: &str) -> bool {
    let (a, b) = (Sha256::digest(a.as_bytes()), Sha256::digest(b.as_bytes()));
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[rstest]
    #[case("127.0.0.1", true)]
    #[case("127.0.0.2", true)]
    #[case("::1", true)]
    #[case("::ffff:127.0.0.1", true)]
    #[case("192.168.1.1", false)]
    #[case("10.0.0.1", false)]
    fn loopback_detection(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(is_loopback(ip(addr)), expected);
    }

    #[test]
    fn configured_token_must_match() {
        let secret = Secret::new("s3cret-token".to_string());
        assert!(authorize_setup(Some(&secret), Some("s3cret-token"), ip("203.0.113.1")).is_ok());
        assert!(matches!(
            authorize_setup(Some(&secret), Some("s3cret-tokeX"), ip("127.0.0.1")),
            Err(AuthError::Forbidden(Denied::SetupTokenRequired))
        ));
        assert!(matches!(
            authorize_setup(Some(&secret), None, ip("127.0.0.1")),
            Err(AuthError::Forbidden(Denied::SetupTokenRequired))
        ));
    }

    #[test]
    fn without_token_only_loopback() {
        assert!(authorize_setup(None, None, ip("127.0.0.1")).is_ok());
        assert!(matches!(
            authorize_setup(None, Some("anything"), ip("198.51.100.2")),
            Err(AuthError::Forbidden(Denied::SetupLocalhostOnly))
        ));
    }

    #[rstest]
    #[case("abc", "abc", true)]
    #[case("", "", true)]
    #[case("abc", "abd", false)]
    #[case("abc", "abcd", false)]
    #[case("abc", "", false)]
    #[case("s3cret-token", "s3cret-token-and-more", false)]
    fn safe_equal_compares_whole_values(#[case] a: &str, #[case] b: &str, #[case] equal: bool) {
        assert_eq!(safe_equal(a, b), equal);
        assert_eq!(safe_equal(b, a), equal);
    }
}
