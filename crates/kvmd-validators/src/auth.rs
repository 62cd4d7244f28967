use crate::{raise, raise_hidden, Result};

/// `^[a-z_][a-z0-9_-]*$`
pub fn valid_user(arg: &str) -> Result<String> {
    let arg = arg.trim();
    let mut chars = arg.chars();
    let ok = match chars.next() {
        Some(first) => {
            (first.is_ascii_lowercase() || first == '_')
                && chars.all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-')
        }
        None => false,
    };
    if ok {
        Ok(arg.to_owned())
    } else {
        raise(arg, "username")
    }
}

/// Printable ASCII, not trimmed, empty allowed.
pub fn valid_passwd(arg: &str) -> Result<String> {
    if arg.chars().all(|ch| (' '..='~').contains(&ch)) {
        Ok(arg.to_owned())
    } else {
        raise_hidden("passwd")
    }
}

/// 64 lowercase hex chars.
pub fn valid_auth_token(arg: &str) -> Result<String> {
    if arg.len() == 64 && arg.chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)) {
        Ok(arg.to_owned())
    } else {
        raise_hidden("auth token")
    }
}

/// Non-negative expiration in seconds; currently only validated.
pub fn valid_expire(arg: &str) -> Result<i64> {
    crate::basic::valid_int(arg, Some(0), None, "expire")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users() {
        assert!(valid_user("admin").is_ok());
        assert!(valid_user("_svc-1").is_ok());
        assert!(valid_user("Admin").is_err());
        assert!(valid_user("1admin").is_err());
        assert!(valid_user("").is_err());
    }

    #[test]
    fn passwds() {
        assert!(valid_passwd("").is_ok());
        assert!(valid_passwd("p@ss word!").is_ok());
        assert!(valid_passwd("tab\there").is_err());
        assert!(valid_passwd("\u{fc}ber").is_err());
    }

    #[test]
    fn tokens() {
        let token = "0123456789abcdef".repeat(4);
        assert!(valid_auth_token(&token).is_ok());
        assert!(valid_auth_token(&token[..63]).is_err());
        assert!(valid_auth_token(&token.to_uppercase()).is_err());
    }
}
