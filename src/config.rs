//! Run configuration and construction of the TLS client context template.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use rustls::client::Resumption;
use rustls::crypto::aws_lc_rs;
use rustls::{version, ClientConfig, RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};

/// Hard cap on worker threads.
pub const MAX_WORKERS: usize = 512;

/// Reference cipher selections used when the version is pinned and no
/// explicit `-c` was given.
const DEFAULT_CIPHER_12: &str = "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256";
const DEFAULT_CIPHER_13: &str = "TLS13_AES_256_GCM_SHA384";

/// Which protocol versions the client offers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TlsVersion {
    #[value(name = "1.2")]
    V12,
    #[value(name = "1.3")]
    V13,
    /// Let the peers negotiate either 1.2 or 1.3.
    #[value(name = "any")]
    Any,
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V12 => f.write_str("1.2"),
            TlsVersion::V13 => f.write_str("1.3"),
            TlsVersion::Any => f.write_str("any of 1.2 or 1.3"),
        }
    }
}

/// Which completed handshakes contribute latency samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LatencyScope {
    /// Only handshakes that completed within a single drive of the handshake
    /// routine, measured over that drive.  Excludes every handshake that had
    /// to wait for socket readiness, so the distribution approximates the
    /// target's raw handshake processing cost.
    Drive,
    /// Every completed handshake, measured from TLS session creation to
    /// completion across all readiness waits.
    Cycle,
}

/// Everything decided on the command line.  Read-only once the run starts.
pub struct RunConfig {
    /// Target address; always a literal IP, never a resolved name.
    pub endpoint: SocketAddr,
    /// Concurrent connection slots per worker.
    pub peers_per_worker: usize,
    /// Worker thread count.
    pub workers: usize,
    /// Stop after this many successful handshakes; `u64::MAX` means run
    /// until the duration elapses or a signal arrives.
    pub handshake_budget: u64,
    /// Wall-clock cap in seconds; 0 means unbounded.
    pub duration_secs: u64,
    pub tls_version: TlsVersion,
    /// Requested cipher name, verbatim from the command line.
    pub cipher: Option<String>,
    /// When false, session resumption is fully disabled and every handshake
    /// is a full handshake.
    pub use_tickets: bool,
    pub latency_scope: LatencyScope,
    /// Verify the server certificate chain instead of accepting anything.
    pub verify: bool,
    /// Extra PEM trust anchors for `--verify`.
    pub cafile: Option<PathBuf>,
    pub debug: bool,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            bail!("worker count must be between 1 and {MAX_WORKERS}");
        }
        if self.peers_per_worker == 0 {
            bail!("at least one peer per worker is required");
        }
        Ok(())
    }

    /// The cipher restriction actually applied, after defaulting and the
    /// "any" escape hatches.  A pinned version without an explicit `-c`
    /// gets the reference default for that version; `-c any` or a
    /// negotiated version lifts the restriction entirely.
    pub fn effective_cipher(&self) -> Option<String> {
        match (&self.cipher, self.tls_version) {
            (Some(cipher), _) if cipher.eq_ignore_ascii_case("any") => None,
            (_, TlsVersion::Any) => None,
            (Some(cipher), _) => Some(cipher.clone()),
            (None, TlsVersion::V12) => Some(DEFAULT_CIPHER_12.to_string()),
            (None, TlsVersion::V13) => Some(DEFAULT_CIPHER_13.to_string()),
        }
    }

    /// Builds the client context template every worker clones sessions from.
    /// This is the only place TLS policy is decided; the result is immutable
    /// for the rest of the run.
    pub fn tls_client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut provider = aws_lc_rs::default_provider();
        if let Some(cipher) = self.effective_cipher() {
            restrict_ciphers(&mut provider.cipher_suites, &cipher, self.tls_version)?;
        }

        let versions: &[&SupportedProtocolVersion] = match self.tls_version {
            TlsVersion::V12 => &[&version::TLS12],
            TlsVersion::V13 => &[&version::TLS13],
            TlsVersion::Any => &[&version::TLS13, &version::TLS12],
        };

        let builder = ClientConfig::builder_with_provider(Arc::new(provider))
            .with_protocol_versions(versions)
            .context("cipher selection does not support the requested TLS version")?;

        let mut config = if self.verify || self.cafile.is_some() {
            builder
                .with_root_certificates(self.root_store()?)
                .with_no_client_auth()
        } else {
            // Load targets usually run self-signed certificates; without
            // --verify, accept whatever the server presents.
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification::new(
                    aws_lc_rs::default_provider(),
                )))
                .with_no_client_auth()
        };

        // With tickets off nothing carries over between cycles and every
        // handshake is a full one; dropping a session also discards any
        // resumption state it acquired.
        config.resumption = if self.use_tickets {
            Resumption::in_memory_sessions(256)
        } else {
            Resumption::disabled()
        };

        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.cafile {
            let mut reader = BufReader::new(
                File::open(path)
                    .with_context(|| format!("cannot open CA file {}", path.display()))?,
            );
            for cert in rustls_pemfile::certs(&mut reader) {
                let cert = cert
                    .with_context(|| format!("cannot parse CA file {}", path.display()))?;
                roots
                    .add(cert)
                    .context("cannot add CA certificate to the root store")?;
            }
        }

        Ok(roots)
    }
}

/// Drops every suite of the selected version except the named one.  Suites
/// belonging to the other version are left alone; the version pin excludes
/// them anyway.
fn restrict_ciphers(
    suites: &mut Vec<SupportedCipherSuite>,
    cipher: &str,
    tls_version: TlsVersion,
) -> Result<()> {
    let in_scope = |suite: &SupportedCipherSuite| {
        matches!(
            (suite, tls_version),
            (SupportedCipherSuite::Tls12(_), TlsVersion::V12)
                | (SupportedCipherSuite::Tls13(_), TlsVersion::V13)
        )
    };

    let wanted = cipher.to_lowercase();
    let mut matched = false;
    suites.retain(|suite| {
        if !in_scope(suite) {
            return true;
        }
        if suite_name(suite) == wanted {
            matched = true;
            return true;
        }
        false
    });

    if !matched {
        let mut known = Vec::new();
        for suite in aws_lc_rs::default_provider().cipher_suites.iter() {
            if in_scope(suite) {
                known.push(suite_name(suite));
            }
        }
        bail!(
            "unsupported cipher '{cipher}' for TLS {tls_version}; should be one of {}",
            known.join(", ")
        );
    }
    Ok(())
}

fn suite_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite()).to_lowercase()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Accepts any server certificate while still verifying handshake
    /// signatures, so a corrupt key exchange is caught even in insecure mode.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(CryptoProvider);

    impl NoCertificateVerification {
        pub(super) fn new(provider: CryptoProvider) -> Self {
            Self(provider)
        }
    }

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls_version: TlsVersion, cipher: Option<&str>) -> RunConfig {
        RunConfig {
            endpoint: "127.0.0.1:443".parse().unwrap(),
            peers_per_worker: 1,
            workers: 1,
            handshake_budget: u64::MAX,
            duration_secs: 0,
            tls_version,
            cipher: cipher.map(str::to_string),
            use_tickets: false,
            latency_scope: LatencyScope::Drive,
            verify: false,
            cafile: None,
            debug: false,
        }
    }

    #[test]
    fn builds_template_for_every_version() {
        for tls_version in [TlsVersion::V12, TlsVersion::V13, TlsVersion::Any] {
            config(tls_version, None)
                .tls_client_config()
                .unwrap_or_else(|e| panic!("{tls_version}: {e}"));
        }
    }

    #[test]
    fn default_cipher_tracks_pinned_version() {
        assert_eq!(
            config(TlsVersion::V12, None).effective_cipher().as_deref(),
            Some(DEFAULT_CIPHER_12)
        );
        assert_eq!(
            config(TlsVersion::V13, None).effective_cipher().as_deref(),
            Some(DEFAULT_CIPHER_13)
        );
        assert_eq!(config(TlsVersion::Any, None).effective_cipher(), None);
    }

    #[test]
    fn any_cipher_lifts_restriction() {
        assert_eq!(config(TlsVersion::V12, Some("any")).effective_cipher(), None);
        assert_eq!(config(TlsVersion::V13, Some("ANY")).effective_cipher(), None);
    }

    #[test]
    fn cipher_ignored_when_version_negotiated() {
        assert_eq!(
            config(TlsVersion::Any, Some(DEFAULT_CIPHER_13)).effective_cipher(),
            None
        );
    }

    #[test]
    fn explicit_cipher_is_matched_case_insensitively() {
        let cfg = config(TlsVersion::V13, Some("tls13_aes_128_gcm_sha256"));
        cfg.tls_client_config().unwrap();
    }

    #[test]
    fn unknown_cipher_is_a_configuration_error() {
        let err = config(TlsVersion::V12, Some("NOT_A_SUITE"))
            .tls_client_config()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported cipher"), "{err}");
    }

    #[test]
    fn cipher_of_wrong_version_is_rejected() {
        // A 1.3 suite name cannot satisfy a 1.2 pin.
        let err = config(TlsVersion::V12, Some(DEFAULT_CIPHER_13))
            .tls_client_config()
            .unwrap_err();
        assert!(err.to_string().contains("unsupported cipher"), "{err}");
    }

    #[test]
    fn worker_bounds_are_enforced() {
        let mut cfg = config(TlsVersion::Any, None);
        cfg.workers = MAX_WORKERS + 1;
        assert!(cfg.validate().is_err());
        cfg.workers = 0;
        assert!(cfg.validate().is_err());
        cfg.workers = MAX_WORKERS;
        cfg.validate().unwrap();
    }
}
