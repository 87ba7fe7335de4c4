// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TLS sessions for inbound and outbound connections.
//!
//! A [`TlsContext`] is built once per security profile and shared by every
//! connection of the endpoints that reference it. Sessions are driven
//! non-blocking by the I/O processor: ciphertext moves through
//! [`TlsSession::read_tls`] / [`TlsSession::write_tls`], plaintext through
//! [`TlsSession::read_plain`] / [`TlsSession::write_plain`].
//!
//! # Certificate checks
//!
//! - Client certificates are verified against the profile CA with rustls'
//!   webpki verifier, including the profile CRLs (end-entity only).
//! - The revoked serial set is kept so live connections can be revalidated
//!   when a profile is replaced ([`TlsContext::is_revoked`]).
//! - The identity string handed to the upper layer is the subject common name.

use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig, SupportedProtocolVersion};

use crate::config::{SecurityProfile, TlsVersion};
use crate::error::{Result, TransportError};

fn tls_err(e: impl fmt::Display) -> TransportError {
    TransportError::Tls(e.to_string())
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_err)?;
    if certs.is_empty() {
        return Err(TransportError::Tls(
            "no certificates found in PEM data".into(),
        ));
    }
    Ok(certs)
}

fn parse_crls(pem: &[u8]) -> Result<Vec<CertificateRevocationListDer<'static>>> {
    CertificateRevocationListDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_err)
}

fn root_store(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(pem)? {
        roots.add(cert).map_err(tls_err)?;
    }
    Ok(roots)
}

fn provider_for(ciphers: &[String]) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !ciphers.is_empty() {
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite());
            ciphers.iter().any(|c| c.eq_ignore_ascii_case(&name))
        });
        if provider.cipher_suites.is_empty() {
            return Err(TransportError::Tls(
                "cipher list leaves no usable suite".into(),
            ));
        }
    }
    Ok(Arc::new(provider))
}

fn versions_for(min: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    static ALL: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
    static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
    match min {
        TlsVersion::Tls12 => ALL,
        TlsVersion::Tls13 => TLS13_ONLY,
    }
}

/// Serial numbers listed in the given CRLs.
fn revoked_serials(crls: &[CertificateRevocationListDer<'_>]) -> HashSet<Vec<u8>> {
    let mut serials = HashSet::new();
    for der in crls {
        match x509_parser::parse_x509_crl(der.as_ref()) {
            Ok((_, crl)) => {
                for revoked in crl.iter_revoked_certificates() {
                    serials.insert(revoked.raw_serial().to_vec());
                }
            }
            Err(e) => log::warn!("[msgwire-tls] Unparseable CRL skipped: {}", e),
        }
    }
    serials
}

/// Subject common name of a DER certificate.
pub fn peer_identity(cert_der: &[u8]) -> Option<String> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_string)
}

// ============================================================================
// Server context
// ============================================================================

/// Server-side TLS configuration built from a [`SecurityProfile`].
pub struct TlsContext {
    profile: String,
    config: Arc<ServerConfig>,
    revoked: HashSet<Vec<u8>>,
    client_auth: bool,
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsContext")
            .field("profile", &self.profile)
            .field("client_auth", &self.client_auth)
            .field("revoked", &self.revoked.len())
            .finish()
    }
}

impl TlsContext {
    /// Build the server configuration for `profile`.
    pub fn from_profile(profile: &SecurityProfile) -> Result<Self> {
        profile.validate().map_err(TransportError::InvalidConfig)?;

        let cert_pem = profile
            .cert_bytes()?
            .ok_or(TransportError::InvalidConfig("security profile requires a certificate"))?;
        let key_pem = profile
            .key_bytes()?
            .ok_or(TransportError::InvalidConfig("security profile requires a private key"))?;
        let certs = parse_certs(&cert_pem)?;
        let key = PrivateKeyDer::from_pem_slice(&key_pem).map_err(tls_err)?;

        let crls = match profile.crl_bytes()? {
            Some(pem) => parse_crls(&pem)?,
            None => Vec::new(),
        };
        let revoked = revoked_serials(&crls);

        let provider = provider_for(&profile.ciphers)?;
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions_for(profile.min_version))
            .map_err(tls_err)?;

        let builder = match profile.ca_bytes()? {
            Some(ca) if profile.client_cert_required => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(&ca)?), provider)
                        .with_crls(crls)
                        .only_check_end_entity_revocation()
                        .allow_unknown_revocation_status()
                        .build()
                        .map_err(tls_err)?;
                builder.with_client_cert_verifier(verifier)
            }
            _ => builder.with_no_client_auth(),
        };
        let config = builder.with_single_cert(certs, key).map_err(tls_err)?;

        log::debug!(
            "[msgwire-tls] Security profile '{}' loaded (min={:?}, client_auth={}, revoked={})",
            profile.name,
            profile.min_version,
            profile.client_cert_required,
            revoked.len()
        );

        Ok(Self {
            profile: profile.name.clone(),
            config: Arc::new(config),
            revoked,
            client_auth: profile.client_cert_required,
        })
    }

    /// Profile name this context was built from.
    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Whether client certificates are requested and verified.
    pub fn client_auth(&self) -> bool {
        self.client_auth
    }

    /// Start a server session.
    pub fn new_session(&self) -> Result<TlsSession> {
        let conn = rustls::ServerConnection::new(Arc::clone(&self.config)).map_err(tls_err)?;
        Ok(TlsSession::Server(conn))
    }

    /// Whether the certificate's serial is listed in this profile's CRLs.
    pub fn is_revoked(&self, cert_der: &[u8]) -> bool {
        if self.revoked.is_empty() {
            return false;
        }
        match x509_parser::parse_x509_certificate(cert_der) {
            Ok((_, cert)) => self.revoked.contains(cert.raw_serial()),
            Err(_) => true,
        }
    }
}

// ============================================================================
// Client context
// ============================================================================

/// Client-side TLS configuration for outbound connections.
#[derive(Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
}

impl fmt::Debug for ClientTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientTls").finish_non_exhaustive()
    }
}

impl ClientTls {
    /// Verify servers against the bundled web PKI roots.
    pub fn with_system_roots() -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::build(roots, None)
    }

    /// Verify servers against the CAs in `ca_pem`.
    pub fn with_root_pem(ca_pem: &[u8]) -> Result<Self> {
        Self::build(root_store(ca_pem)?, None)
    }

    /// Verify servers against `ca_pem` and present a client certificate.
    pub fn with_client_cert(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(cert_pem)?;
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(tls_err)?;
        Self::build(root_store(ca_pem)?, Some((certs, key)))
    }

    fn build(
        roots: RootCertStore,
        identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    ) -> Result<Self> {
        let builder = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_root_certificates(roots);
        let config = match identity {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key).map_err(tls_err)?,
            None => builder.with_no_client_auth(),
        };
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Start a client session for `server_name`.
    pub fn new_session(&self, server_name: &str) -> Result<TlsSession> {
        let name = ServerName::try_from(server_name.to_string()).map_err(tls_err)?;
        let conn = rustls::ClientConnection::new(Arc::clone(&self.config), name).map_err(tls_err)?;
        Ok(TlsSession::Client(conn))
    }
}

// ============================================================================
// Session
// ============================================================================

/// A client or server TLS session.
pub enum TlsSession {
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

macro_rules! with_conn {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            TlsSession::Client($c) => $body,
            TlsSession::Server($c) => $body,
        }
    };
}

impl TlsSession {
    /// Pull ciphertext from `rd`. `Ok(0)` means end of stream.
    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        with_conn!(self, c => c.read_tls(rd))
    }

    /// Process pulled records.
    pub fn process_new_packets(&mut self) -> std::result::Result<(), rustls::Error> {
        with_conn!(self, c => c.process_new_packets().map(|_| ()))
    }

    /// Push pending ciphertext into `wr`.
    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        with_conn!(self, c => c.write_tls(wr))
    }

    pub fn wants_write(&self) -> bool {
        with_conn!(self, c => c.wants_write())
    }

    pub fn wants_read(&self) -> bool {
        with_conn!(self, c => c.wants_read())
    }

    pub fn is_handshaking(&self) -> bool {
        with_conn!(self, c => c.is_handshaking())
    }

    /// Decrypted bytes. `WouldBlock` when none are buffered.
    pub fn read_plain(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        with_conn!(self, c => c.reader().read(buf))
    }

    /// Queue plaintext for encryption.
    pub fn write_plain(&mut self, buf: &[u8]) -> io::Result<usize> {
        with_conn!(self, c => c.writer().write(buf))
    }

    pub fn send_close_notify(&mut self) {
        with_conn!(self, c => c.send_close_notify())
    }

    /// DER of the peer's end-entity certificate.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        with_conn!(self, c => c
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(|cert| cert.as_ref().to_vec()))
    }

    /// Feed bytes already read off the socket into the session.
    pub fn replay(&mut self, prefix: &[u8]) -> std::result::Result<(), rustls::Error> {
        let mut cursor = io::Cursor::new(prefix);
        while (cursor.position() as usize) < prefix.len() {
            match self.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(_) => self.process_new_packets()?,
                Err(e) => {
                    return Err(rustls::Error::General(format!("prefix replay: {}", e)));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self {
            TlsSession::Client(_) => "client",
            TlsSession::Server(_) => "server",
        };
        f.debug_struct("TlsSession")
            .field("role", &role)
            .field("handshaking", &self.is_handshaking())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct TestPki {
        pub ca_pem: String,
        pub server_cert: String,
        pub server_key: String,
        pub client_cert: String,
        pub client_key: String,
    }

    fn ca() -> (rcgen::Certificate, rcgen::KeyPair) {
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "msgwire test ca");
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn leaf(
        cn: &str,
        sans: &[&str],
        usage: rcgen::ExtendedKeyUsagePurpose,
        ca: &rcgen::Certificate,
        ca_key: &rcgen::KeyPair,
    ) -> (String, String) {
        let sans: Vec<String> = sans.iter().map(|s| (*s).to_string()).collect();
        let mut params = rcgen::CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, cn);
        params.extended_key_usages = vec![usage];
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, ca, ca_key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    pub(crate) fn test_pki() -> TestPki {
        let (ca, ca_key) = ca();
        let (server_cert, server_key) = leaf(
            "broker",
            &["localhost"],
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            &ca,
            &ca_key,
        );
        let (client_cert, client_key) = leaf(
            "device-7",
            &[],
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            &ca,
            &ca_key,
        );
        TestPki {
            ca_pem: ca.pem(),
            server_cert,
            server_key,
            client_cert,
            client_key,
        }
    }

    /// Shuttle records between two sessions until neither has output.
    fn pump(a: &mut TlsSession, b: &mut TlsSession) -> std::result::Result<(), rustls::Error> {
        fn transfer(
            from: &mut TlsSession,
            to: &mut TlsSession,
        ) -> std::result::Result<bool, rustls::Error> {
            let mut wire = Vec::new();
            while from.wants_write() {
                from.write_tls(&mut wire).unwrap();
            }
            if wire.is_empty() {
                return Ok(false);
            }
            to.replay(&wire)?;
            Ok(true)
        }

        for _ in 0..20 {
            let ab = transfer(a, b)?;
            let ba = transfer(b, a)?;
            if !ab && !ba {
                break;
            }
        }
        Ok(())
    }

    #[test]
    fn test_handshake_and_identity() {
        let pki = test_pki();
        let profile = SecurityProfile::new("p", pki.server_cert.clone(), pki.server_key.clone())
            .with_client_ca(pki.ca_pem.clone());
        let ctx = TlsContext::from_profile(&profile).unwrap();
        assert!(ctx.client_auth());

        let client = ClientTls::with_client_cert(
            pki.ca_pem.as_bytes(),
            pki.client_cert.as_bytes(),
            pki.client_key.as_bytes(),
        )
        .unwrap();
        let mut c = client.new_session("localhost").unwrap();
        let mut s = ctx.new_session().unwrap();
        pump(&mut c, &mut s).unwrap();
        assert!(!c.is_handshaking());
        assert!(!s.is_handshaking());

        let der = s.peer_certificate().unwrap();
        assert_eq!(peer_identity(&der).as_deref(), Some("device-7"));
        assert!(!ctx.is_revoked(&der));

        c.write_plain(b"ping").unwrap();
        pump(&mut c, &mut s).unwrap();
        let mut buf = [0u8; 16];
        let n = s.read_plain(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn test_missing_client_cert_fails() {
        let pki = test_pki();
        let profile = SecurityProfile::new("p", pki.server_cert, pki.server_key)
            .with_client_ca(pki.ca_pem.clone());
        let ctx = TlsContext::from_profile(&profile).unwrap();
        let client = ClientTls::with_root_pem(pki.ca_pem.as_bytes()).unwrap();
        let mut c = client.new_session("localhost").unwrap();
        let mut s = ctx.new_session().unwrap();
        assert!(pump(&mut c, &mut s).is_err());
    }

    #[test]
    fn test_cipher_filter() {
        let pki = test_pki();
        let profile = SecurityProfile::new("p", pki.server_cert.clone(), pki.server_key.clone())
            .with_ciphers(&["TLS13_AES_256_GCM_SHA384"]);
        assert!(TlsContext::from_profile(&profile).is_ok());

        let profile = SecurityProfile::new("p", pki.server_cert, pki.server_key)
            .with_ciphers(&["NOT_A_SUITE"]);
        assert!(matches!(
            TlsContext::from_profile(&profile),
            Err(TransportError::Tls(_))
        ));
    }

    #[test]
    fn test_bad_pem() {
        let profile = SecurityProfile::new("p", "garbage".into(), "garbage".into());
        assert!(TlsContext::from_profile(&profile).is_err());
    }
}
