//! TLS/DTLS context configuration, mirroring the knobs `TlsAdapter`'s
//! constructor accepts in the source: certificate/key material, the
//! separate TLS1.3 cipher-suite and legacy cipher-list strings, protocol
//! version bounds (TLS and DTLS tracked independently since a context can
//! be reused for either), SNI, and peer verification.

use std::io;
use std::path::PathBuf;

use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode, SslVersion};

use crate::error;

#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca_path: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub privkey_file: Option<PathBuf>,
    /// `TLSv1.3` cipher suites, colon-separated (`SSL_CTX_set_ciphersuites`).
    pub cipher_suites: Option<String>,
    /// Pre-`TLSv1.3` cipher list, colon-separated (`SSL_CTX_set_cipher_list`).
    pub cipher_list: Option<String>,
    pub min_tls_ver: Option<SslVersion>,
    pub max_tls_ver: Option<SslVersion>,
    pub min_dtls_ver: Option<SslVersion>,
    pub max_dtls_ver: Option<SslVersion>,
    pub sni: Option<String>,
    /// `None` takes the role-based default: verification on for clients,
    /// off for servers. `Some` overrides that default either way.
    pub verify_peer: Option<bool>,
}

impl TlsConfig {
    pub fn new() -> Self {
        TlsConfig::default()
    }

    pub fn ca_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(path.into());
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(path.into());
        self
    }

    pub fn privkey_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.privkey_file = Some(path.into());
        self
    }

    pub fn cipher_suites(mut self, suites: impl Into<String>) -> Self {
        self.cipher_suites = Some(suites.into());
        self
    }

    pub fn cipher_list(mut self, list: impl Into<String>) -> Self {
        self.cipher_list = Some(list.into());
        self
    }

    pub fn tls_versions(mut self, min: SslVersion, max: SslVersion) -> Self {
        self.min_tls_ver = Some(min);
        self.max_tls_ver = Some(max);
        self
    }

    pub fn dtls_versions(mut self, min: SslVersion, max: SslVersion) -> Self {
        self.min_dtls_ver = Some(min);
        self.max_dtls_ver = Some(max);
        self
    }

    pub fn sni(mut self, name: impl Into<String>) -> Self {
        self.sni = Some(name.into());
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    /// Builds an `SSL_CTX` for `method` (a stream or datagram method,
    /// client or server) with this configuration applied. `is_dtls`
    /// selects which of the two independently-tracked version ranges
    /// (TLS vs. DTLS) is applied; `is_server` picks the verify-peer
    /// default when [`TlsConfig::verify_peer`] was never called, and
    /// additionally requires a peer certificate when verification is on.
    pub(crate) fn build_context(
        &self,
        method: SslMethod,
        is_dtls: bool,
        is_server: bool,
    ) -> io::Result<SslContextBuilder> {
        let mut builder =
            SslContextBuilder::new(method).map_err(|e| error::tls_protocol_error(e.to_string()))?;

        if self.ca_path.is_some() || self.ca_file.is_some() {
            builder
                .load_verify_locations(self.ca_file.as_deref(), self.ca_path.as_deref())
                .map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        if let Some(cert) = &self.cert_file {
            builder
                .set_certificate_chain_file(cert)
                .map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        if let Some(key) = &self.privkey_file {
            builder
                .set_private_key_file(key, openssl::ssl::SslFiletype::PEM)
                .map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        if let Some(suites) = &self.cipher_suites {
            builder.set_ciphersuites(suites).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        if let Some(list) = &self.cipher_list {
            builder.set_cipher_list(list).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        let (min, max) =
            if is_dtls { (self.min_dtls_ver, self.max_dtls_ver) } else { (self.min_tls_ver, self.max_tls_ver) };
        if let Some(v) = min {
            builder.set_min_proto_version(Some(v)).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        if let Some(v) = max {
            builder.set_max_proto_version(Some(v)).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        let verify_peer = self.verify_peer.unwrap_or(!is_server);
        if verify_peer {
            let mode = if is_server {
                SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT
            } else {
                SslVerifyMode::PEER
            };
            builder.set_verify(mode);
        } else {
            builder.set_verify(SslVerifyMode::NONE);
        }

        // Renegotiation (TLSv1.2 and earlier) is never allowed mid-session.
        builder.set_options(SslOptions::NO_RENEGOTIATION);

        Ok(builder)
    }

    fn new_ssl(&self, method: SslMethod, is_dtls: bool, is_server: bool) -> io::Result<Ssl> {
        let ctx = self.build_context(method, is_dtls, is_server)?.build();
        let mut ssl = Ssl::new(&ctx).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        if let Some(name) = &self.sni {
            ssl.set_hostname(name).map_err(|e| error::tls_protocol_error(e.to_string()))?;
        }
        Ok(ssl)
    }

    /// A per-connection `Ssl` for a client-side TLS handshake over a
    /// stream transport.
    pub fn client_ssl(&self) -> io::Result<Ssl> {
        self.new_ssl(SslMethod::tls_client(), false, false)
    }

    /// A per-connection `Ssl` for a server-side TLS handshake over a
    /// stream transport.
    pub fn server_ssl(&self) -> io::Result<Ssl> {
        self.new_ssl(SslMethod::tls_server(), false, true)
    }

    /// A per-connection `Ssl` for a client-side DTLS handshake over a
    /// datagram transport.
    pub fn client_dtls(&self) -> io::Result<Ssl> {
        self.new_ssl(SslMethod::dtls_client(), true, false)
    }

    /// A per-connection `Ssl` for a server-side DTLS handshake over a
    /// datagram transport.
    pub fn server_dtls(&self) -> io::Result<Ssl> {
        self.new_ssl(SslMethod::dtls_server(), true, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    fn write_self_signed() -> (PathBuf, PathBuf) {
        let rsa = Rsa::generate(2048).unwrap();
        let pkey = PKey::from_rsa(rsa).unwrap();
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "config-test").unwrap();
        let name = name.build();
        let mut builder = openssl::x509::X509::builder().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&pkey).unwrap();
        builder
            .set_not_before(&openssl::asn1::Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&openssl::asn1::Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&pkey, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let dir = std::env::temp_dir().join(format!("ioreactor-tls-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
        std::fs::write(&key_path, pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn build_context_applies_cert_key_and_version_bounds() {
        let (cert_path, key_path) = write_self_signed();
        let config = TlsConfig::new()
            .cert_file(cert_path)
            .privkey_file(key_path)
            .cipher_list("HIGH:!aNULL")
            .tls_versions(SslVersion::TLS1_2, SslVersion::TLS1_3)
            .verify_peer(false);

        config.build_context(SslMethod::tls_server(), false, true).unwrap();
    }

    #[test]
    fn server_ssl_with_sni_succeeds() {
        let (cert_path, key_path) = write_self_signed();
        let config =
            TlsConfig::new().cert_file(cert_path).privkey_file(key_path).sni("example.test");
        config.server_ssl().unwrap();
    }
}
