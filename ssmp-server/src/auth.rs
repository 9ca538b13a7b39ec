use std::net::SocketAddr;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio_rustls::rustls::pki_types::CertificateDer;

/// Transport-level facts about a connection attempt, made available to
/// authenticators so TLS state can back a credential check.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    /// The verified client certificate chain, when the connection came in
    /// over TLS with client authentication.
    pub peer_certificates: Option<Vec<CertificateDer<'static>>>,
}

/// Accepts or rejects LOGIN attempts.
///
/// The core never interprets scheme or credential bytes; they are passed
/// through verbatim from the LOGIN request.
pub trait Authenticator: Send + Sync + 'static {
    /// Decides whether `cred` is a valid credential for `user` under the
    /// given authentication scheme.
    fn authenticate(&self, peer: &PeerInfo, user: &[u8], scheme: &[u8], cred: &[u8]) -> bool;

    /// The serialized 401 response sent on rejection. Implementations may
    /// enumerate their supported schemes after the code.
    fn unauthorized(&self) -> Bytes {
        Bytes::from_static(b"401\n")
    }
}

/// A credential check for one authentication scheme.
pub type SchemeFn = Box<dyn Fn(&PeerInfo, &[u8], &[u8], &[u8]) -> bool + Send + Sync>;

/// An [`Authenticator`] that routes each LOGIN to the [`SchemeFn`] registered
/// for its scheme name, rejecting unknown schemes outright.
pub struct MultiSchemeAuthenticator {
    schemes: FxHashMap<String, SchemeFn>,
    unauthorized: Bytes,
}

impl Default for MultiSchemeAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiSchemeAuthenticator {
    pub fn new() -> Self {
        Self { schemes: FxHashMap::default(), unauthorized: Bytes::from_static(b"401\n") }
    }

    /// Registers `check` for the scheme `name`.
    pub fn with_scheme(mut self, name: impl Into<String>, check: SchemeFn) -> Self {
        self.schemes.insert(name.into(), check);
        let mut names: Vec<&str> = self.schemes.keys().map(String::as_str).collect();
        names.sort_unstable();
        let mut resp = String::with_capacity(4 + names.len() * 8);
        resp.push_str("401");
        for name in names {
            resp.push(' ');
            resp.push_str(name);
        }
        resp.push('\n');
        self.unauthorized = Bytes::from(resp);
        self
    }
}

impl Authenticator for MultiSchemeAuthenticator {
    fn authenticate(&self, peer: &PeerInfo, user: &[u8], scheme: &[u8], cred: &[u8]) -> bool {
        let name = String::from_utf8_lossy(scheme);
        match self.schemes.get(name.as_ref()) {
            Some(check) => check(peer, user, scheme, cred),
            None => false,
        }
    }

    fn unauthorized(&self) -> Bytes {
        self.unauthorized.clone()
    }
}

/// A scheme accepting every credential. Only suitable for open deployments.
pub fn open_scheme() -> SchemeFn {
    Box::new(|_, _, _, _| true)
}

/// A shared-secret scheme. The comparison does not exit early on the first
/// mismatching byte.
pub fn secret_scheme(secret: Vec<u8>) -> SchemeFn {
    Box::new(move |_, _, _, cred| {
        if cred.len() != secret.len() {
            return false;
        }
        cred.iter().zip(&secret).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
    })
}
