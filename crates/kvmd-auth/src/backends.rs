//! External credential checkers. Each answers a plain yes/no; network
//! failures surface as errors so the caller can distinguish "denied"
//! from "backend down".

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use rand::RngCore;
use tracing::{error, warn};

use crate::htpasswd::HtpasswdFile;
use crate::AuthError;

#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError>;
}

// ===== htpasswd.

pub struct HtpasswdBackend {
    file: HtpasswdFile,
}

impl HtpasswdBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            file: HtpasswdFile::new(&path),
        }
    }
}

#[async_trait]
impl AuthBackend for HtpasswdBackend {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        self.file.check(user, passwd).await
    }
}

// ===== LDAP simple bind.

#[derive(Debug, Clone)]
pub struct LdapConfig {
    pub url: String,
    /// `{user}` expands to the login name, e.g.
    /// `uid={user},ou=people,dc=example,dc=org`.
    pub user_dn_template: String,
    pub timeout: Duration,
}

pub struct LdapBackend {
    config: LdapConfig,
}

impl LdapBackend {
    pub fn new(config: LdapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AuthBackend for LdapBackend {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        if passwd.is_empty() {
            // Unauthenticated binds always "succeed"; never allow them.
            return Ok(false);
        }
        let dn = self.config.user_dn_template.replace("{user}", user);
        let settings = ldap3::LdapConnSettings::new().set_conn_timeout(self.config.timeout);
        let (conn, mut ldap) =
            ldap3::LdapConnAsync::with_settings(settings, &self.config.url)
                .await
                .map_err(|err| AuthError::Backend(format!("LDAP connect failed: {err}")))?;
        ldap3::drive!(conn);
        let result = ldap
            .simple_bind(&dn, passwd)
            .await
            .map_err(|err| AuthError::Backend(format!("LDAP bind failed: {err}")))?;
        let _ = ldap.unbind().await;
        Ok(result.rc == 0)
    }
}

// ===== RADIUS PAP.

#[derive(Debug, Clone)]
pub struct RadiusConfig {
    pub server: String,
    pub port: u16,
    pub secret: String,
    pub timeout: Duration,
}

pub struct RadiusBackend {
    config: RadiusConfig,
}

impl RadiusBackend {
    pub fn new(config: RadiusConfig) -> Self {
        Self { config }
    }

    /// RFC 2865 User-Password obfuscation: each 16-byte block XORed with
    /// MD5(secret + previous block), seeded by the request authenticator.
    fn obfuscate_password(&self, passwd: &str, authenticator: &[u8; 16]) -> Vec<u8> {
        let mut padded = passwd.as_bytes().to_vec();
        let blocks = padded.len().div_ceil(16).max(1);
        padded.resize(blocks * 16, 0);

        let mut out = Vec::with_capacity(padded.len());
        let mut prev: Vec<u8> = authenticator.to_vec();
        for block in padded.chunks(16) {
            let mut hasher = Md5::new();
            hasher.update(self.config.secret.as_bytes());
            hasher.update(&prev);
            let mask = hasher.finalize();
            let mixed: Vec<u8> = block.iter().zip(mask.iter()).map(|(b, m)| b ^ m).collect();
            out.extend_from_slice(&mixed);
            prev = mixed;
        }
        out
    }
}

const RADIUS_ACCESS_REQUEST: u8 = 1;
const RADIUS_ACCESS_ACCEPT: u8 = 2;
const ATTR_USER_NAME: u8 = 1;
const ATTR_USER_PASSWORD: u8 = 2;
const ATTR_NAS_IDENTIFIER: u8 = 32;

#[async_trait]
impl AuthBackend for RadiusBackend {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        let mut authenticator = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut authenticator);
        let request_id = rand::random::<u8>();

        let mut attrs = Vec::new();
        push_attr(&mut attrs, ATTR_USER_NAME, user.as_bytes());
        push_attr(
            &mut attrs,
            ATTR_USER_PASSWORD,
            &self.obfuscate_password(passwd, &authenticator),
        );
        push_attr(&mut attrs, ATTR_NAS_IDENTIFIER, b"kvmd");

        let length = 20 + attrs.len();
        let mut packet = Vec::with_capacity(length);
        packet.push(RADIUS_ACCESS_REQUEST);
        packet.push(request_id);
        packet.extend_from_slice(&(length as u16).to_be_bytes());
        packet.extend_from_slice(&authenticator);
        packet.extend_from_slice(&attrs);

        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|err| AuthError::Backend(format!("RADIUS socket failed: {err}")))?;
        socket
            .connect((self.config.server.as_str(), self.config.port))
            .await
            .map_err(|err| AuthError::Backend(format!("RADIUS connect failed: {err}")))?;
        socket
            .send(&packet)
            .await
            .map_err(|err| AuthError::Backend(format!("RADIUS send failed: {err}")))?;

        let mut response = [0u8; 4096];
        let received = tokio::time::timeout(self.config.timeout, socket.recv(&mut response))
            .await
            .map_err(|_| AuthError::Backend("RADIUS timeout".to_owned()))?
            .map_err(|err| AuthError::Backend(format!("RADIUS recv failed: {err}")))?;
        if received < 20 || response[1] != request_id {
            warn!("mismatched RADIUS response");
            return Ok(false);
        }
        Ok(response[0] == RADIUS_ACCESS_ACCEPT)
    }
}

fn push_attr(out: &mut Vec<u8>, kind: u8, value: &[u8]) {
    let value = &value[..value.len().min(253)];
    out.push(kind);
    out.push((value.len() + 2) as u8);
    out.extend_from_slice(value);
}

// ===== HTTP POST service.

#[derive(Debug, Clone)]
pub struct HttpAuthConfig {
    pub url: String,
    pub verify_tls: bool,
    pub timeout: Duration,
}

pub struct HttpBackend {
    config: HttpAuthConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: HttpAuthConfig) -> Self {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .build()
            .expect("reqwest client");
        Self { config, client }
    }
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn authorize(&self, user: &str, passwd: &str) -> Result<bool, AuthError> {
        let response = self
            .client
            .post(&self.config.url)
            .json(&serde_json::json!({"user": user, "passwd": passwd}))
            .send()
            .await
            .map_err(|err| AuthError::Backend(format!("auth service unreachable: {err}")))?;
        if response.status().is_success() {
            Ok(true)
        } else if response.status().as_u16() == 403 || response.status().as_u16() == 401 {
            Ok(false)
        } else {
            error!(status = %response.status(), "auth service error");
            Err(AuthError::Backend(format!(
                "auth service answered {}",
                response.status()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_obfuscation_is_reversible() {
        let backend = RadiusBackend::new(RadiusConfig {
            server: "127.0.0.1".to_owned(),
            port: 1812,
            secret: "testing123".to_owned(),
            timeout: Duration::from_secs(1),
        });
        let authenticator = [7u8; 16];
        let hidden = backend.obfuscate_password("hunter2hunter2hunter2", &authenticator);
        assert_eq!(hidden.len(), 32);

        // Reverse with the same keystream.
        let mut revealed = Vec::new();
        let mut prev = authenticator.to_vec();
        for block in hidden.chunks(16) {
            let mut hasher = Md5::new();
            hasher.update(b"testing123");
            hasher.update(&prev);
            let mask = hasher.finalize();
            revealed.extend(block.iter().zip(mask.iter()).map(|(b, m)| b ^ m));
            prev = block.to_vec();
        }
        revealed.retain(|&byte| byte != 0);
        assert_eq!(revealed, b"hunter2hunter2hunter2");
    }

    #[test]
    fn attribute_encoding() {
        let mut out = Vec::new();
        push_attr(&mut out, ATTR_USER_NAME, b"admin");
        assert_eq!(out, [1, 7, b'a', b'd', b'm', b'i', b'n']);
    }
}
