//! FTPS sessions (explicit TLS through rustls, data channel protected)
//!
//! The TLS client configs are built once per process: loading the native
//! root store is slow and pooled connections are reopened often.

use once_cell::sync::Lazy;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use suppaftp::types::{FileType, Mode};
use suppaftp::{RustlsConnector, RustlsFtpStream};

use crate::logging::log_with_tag;
use crate::protocols::{first_reachable, io_error, Endpoint, Login, RemoteError, RemoteSession};

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate
    #[derive(Debug)]
    pub struct AcceptAnyCertificate;

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

type TlsConfig = Result<Arc<rustls::ClientConfig>, String>;

static VERIFYING: Lazy<TlsConfig> = Lazy::new(|| build_tls_config(false));
static PERMISSIVE: Lazy<TlsConfig> = Lazy::new(|| build_tls_config(true));

fn build_tls_config(insecure: bool) -> TlsConfig {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?;

    let config = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::AcceptAnyCertificate))
            .with_no_client_auth()
    } else {
        let native = rustls_native_certs::load_native_certs();
        if !native.errors.is_empty() {
            let _ = log_with_tag(
                &format!("Some native certificates could not be loaded: {:?}", native.errors),
                Some("ftps"),
            );
        }
        let mut roots = rustls::RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        if ignored > 0 {
            let _ = log_with_tag(
                &format!("Ignored {} unparsable root certificates ({} loaded)", ignored, added),
                Some("ftps"),
            );
        }
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

fn tls_config(insecure: bool) -> Result<Arc<rustls::ClientConfig>, RemoteError> {
    let cached = if insecure { &*PERMISSIVE } else { &*VERIFYING };
    cached.clone().map_err(RemoteError::SecureError)
}

pub struct FtpsSession {
    stream: RustlsFtpStream,
}

impl RemoteSession for FtpsSession {
    fn open(endpoint: &Endpoint<'_>, login: &Login<'_>) -> Result<Self, RemoteError> {
        let config = tls_config(endpoint.insecure_skip_verify)?;
        let mut stream = first_reachable(endpoint, |addr| {
            let plain = RustlsFtpStream::connect_timeout(addr, endpoint.timeout)?;
            plain.into_secure(RustlsConnector::from(config.clone()), endpoint.host)
        })?;

        let ready = stream
            .login(login.user, login.password.unwrap_or(""))
            .and_then(|_| stream.transfer_type(FileType::Binary));
        if let Err(e) = ready {
            let _ = stream.quit();
            return Err(e);
        }
        stream.set_mode(Mode::Passive);
        stream.set_passive_nat_workaround(true);
        Ok(FtpsSession { stream })
    }

    fn enter(&mut self, dir: &str) -> Result<(), RemoteError> {
        self.stream.cwd(dir)
    }

    fn mkdir(&mut self, path: &str) -> Result<(), RemoteError> {
        self.stream.mkdir(path)
    }

    fn upload(&mut self, name: &str, mut reader: &mut dyn Read, _size: u64) -> Result<u64, RemoteError> {
        self.stream.put_file(name, &mut reader)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.stream.rename(from, to)
    }

    fn remove(&mut self, name: &str) -> Result<(), RemoteError> {
        self.stream.rm(name)
    }

    fn ping(&mut self) -> Result<(), RemoteError> {
        self.stream
            .noop()
            .map_err(|e| io_error(ErrorKind::BrokenPipe, format!("FTPS session lost: {}", e)))
    }

    fn close(mut self) {
        let _ = self.stream.quit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_configs_are_cached() {
        let first = tls_config(true).unwrap();
        let second = tls_config(true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(tls_config(false).is_ok());
    }
}
