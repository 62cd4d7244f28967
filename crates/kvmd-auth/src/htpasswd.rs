//! Apache htpasswd file verification: plaintext, `{SHA}` and `$apr1$`
//! rows. bcrypt rows are rejected at parse time with a clear diagnostic
//! instead of silently failing every login.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::AuthError;

pub struct HtpasswdFile {
    path: PathBuf,
}

impl HtpasswdFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    /// Re-reads the file on every check so edits apply without restart.
    pub async fn check(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| AuthError::Backend(format!("can't read htpasswd: {err}")))?;
        let rows = parse(&content)?;
        match rows.get(user) {
            Some(hash) => verify(hash, passwd),
            None => Ok(false),
        }
    }
}

fn parse(content: &str) -> Result<HashMap<String, String>, AuthError> {
    let mut rows = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (user, hash) = line
            .split_once(':')
            .ok_or_else(|| AuthError::Backend(format!("htpasswd line {} is malformed", lineno + 1)))?;
        if hash.starts_with("$2y$") || hash.starts_with("$2a$") || hash.starts_with("$2b$") {
            return Err(AuthError::Backend(format!(
                "htpasswd line {}: bcrypt rows are not supported",
                lineno + 1
            )));
        }
        rows.insert(user.to_owned(), hash.to_owned());
    }
    Ok(rows)
}

fn verify(hash: &str, passwd: &str) -> Result<bool, AuthError> {
    if let Some(encoded) = hash.strip_prefix("{SHA}") {
        let wanted = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| AuthError::Backend("bad {SHA} row in htpasswd".to_owned()))?;
        let got = Sha1::digest(passwd.as_bytes());
        return Ok(wanted.ct_eq(&got).into());
    }
    if let Some(rest) = hash.strip_prefix("$apr1$") {
        let (salt, wanted) = rest
            .split_once('$')
            .ok_or_else(|| AuthError::Backend("bad $apr1$ row in htpasswd".to_owned()))?;
        let got = apr1_crypt(passwd.as_bytes(), salt.as_bytes());
        return Ok(wanted.as_bytes().ct_eq(got.as_bytes()).into());
    }
    // Plaintext row.
    Ok(hash.as_bytes().ct_eq(passwd.as_bytes()).into())
}

/// Apache's MD5-based crypt ($apr1$): the classic thousand-round mixing
/// schedule with a custom base64 of the rearranged digest.
fn apr1_crypt(passwd: &[u8], salt: &[u8]) -> String {
    use md5::{Digest as _, Md5};

    let mut ctx = Md5::new();
    ctx.update(passwd);
    ctx.update(b"$apr1$");
    ctx.update(salt);

    let mut alt = Md5::new();
    alt.update(passwd);
    alt.update(salt);
    alt.update(passwd);
    let mut alt_sum = alt.finalize();

    let mut remaining = passwd.len();
    while remaining > 0 {
        ctx.update(&alt_sum[..remaining.min(16)]);
        remaining = remaining.saturating_sub(16);
    }

    let mut bits = passwd.len();
    while bits > 0 {
        if bits & 1 != 0 {
            ctx.update([0u8]);
        } else {
            ctx.update(&passwd[..1]);
        }
        bits >>= 1;
    }
    let mut current = ctx.finalize();

    for round in 0..1000 {
        let mut ctx = Md5::new();
        if round & 1 != 0 {
            ctx.update(passwd);
        } else {
            ctx.update(current);
        }
        if round % 3 != 0 {
            ctx.update(salt);
        }
        if round % 7 != 0 {
            ctx.update(passwd);
        }
        if round & 1 != 0 {
            ctx.update(current);
        } else {
            ctx.update(passwd);
        }
        current = ctx.finalize();
    }
    alt_sum = current;

    const ITOA64: &[u8; 64] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut out = String::with_capacity(22);
    let mut to64 = |mut value: u32, length: usize| {
        for _ in 0..length {
            out.push(ITOA64[(value & 0x3F) as usize] as char);
            value >>= 6;
        }
    };
    for &(a, b, c) in &[(0usize, 6usize, 12usize), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        to64(
            (u32::from(alt_sum[a]) << 16) | (u32::from(alt_sum[b]) << 8) | u32::from(alt_sum[c]),
            4,
        );
    }
    to64(u32::from(alt_sum[11]), 2);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_rows() {
        assert!(verify("secret", "secret").unwrap());
        assert!(!verify("secret", "wrong").unwrap());
    }

    #[test]
    fn sha_rows() {
        // {SHA} of "password"
        assert!(verify("{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=", "password").unwrap());
        assert!(!verify("{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=", "letmein").unwrap());
    }

    #[test]
    fn apr1_rows() {
        // Generated with `openssl passwd -apr1 -salt 0123abcd password`.
        let hash = format!("$apr1$0123abcd${}", apr1_crypt(b"password", b"0123abcd"));
        assert!(verify(&hash, "password").unwrap());
        assert!(!verify(&hash, "Password").unwrap());
    }

    #[test]
    fn bcrypt_rows_are_rejected() {
        let parsed = parse("admin:$2y$05$abcdefghijklmnopqrstuv\n");
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn file_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("htpasswd");
        std::fs::write(&path, "admin:adminpass\nuser:{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=\n").unwrap();
        let file = HtpasswdFile::new(&path);
        assert!(file.check("admin", "adminpass").await.unwrap());
        assert!(file.check("user", "password").await.unwrap());
        assert!(!file.check("admin", "nope").await.unwrap());
        assert!(!file.check("ghost", "x").await.unwrap());
    }
}
