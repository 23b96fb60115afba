//! Certificate-trust gate for upstream connections.

/// Outcome of standard certificate validation against the upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateValidation {
    /// Validation reported no errors.
    Valid,
    /// Validation failed with the given reason.
    Invalid(String),
}

impl CertificateValidation {
    /// Returns true if validation reported no errors.
    pub fn is_valid(&self) -> bool {
        matches!(self, CertificateValidation::Valid)
    }
}

/// Verdict of the certificate-trust gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateTrust {
    /// Proceed with the connection.
    Trusted,
    /// The caller must abort the connection.
    Untrusted,
}

/// Decides whether an upstream certificate is accepted.
///
/// With validation disabled every certificate is trusted; otherwise only a
/// certificate that passed standard validation is.
pub fn certificate_trust(
    validate_server_certificate: bool,
    validation: &CertificateValidation,
) -> CertificateTrust {
    if !validate_server_certificate || validation.is_valid() {
        CertificateTrust::Trusted
    } else {
        CertificateTrust::Untrusted
    }
}
