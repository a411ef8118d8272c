//! TLS material validation for pipeline outputs
//!
//! Certificates are parsed with x509-parser. The private key is decoded
//! with rcgen so its public half can be compared against the certificate.

use chrono::{DateTime, Duration, TimeZone, Utc};
use thiserror::Error;
use x509_parser::certificate::X509Certificate;
use x509_parser::pem::Pem;

/// Certificates expiring within this window are reported as a warning
pub const DEFAULT_CERT_EXPIRY_LEAD_TIME_DAYS: i64 = 14;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TlsCertError {
    #[error("a certificate and private key must either both be provided or both be missing")]
    MissingCertKeyPair,

    #[error("failed to decode PEM block containing {0}")]
    PemDecode(&'static str),

    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    #[error("certificate and private key do not match")]
    KeyPairMismatch,

    #[error("not a CA certificate")]
    CertIsNotCa,

    #[error("certificate was not issued by the configured CA")]
    IssuerMismatch,

    #[error("{}", expired_message(.expiry, .is_ca))]
    Expired { expiry: DateTime<Utc>, is_ca: bool },

    #[error("{}", about_to_expire_message(.expiry, .is_ca))]
    AboutToExpire { expiry: DateTime<Utc>, is_ca: bool },
}

fn expired_message(expiry: &DateTime<Utc>, is_ca: &bool) -> String {
    let date = expiry.format("%Y-%m-%d");
    if *is_ca {
        format!("TLS CA certificate expired on {date}")
    } else {
        format!("TLS certificate expired on {date}")
    }
}

fn about_to_expire_message(expiry: &DateTime<Utc>, is_ca: &bool) -> String {
    let date = expiry.format("%Y-%m-%d");
    if *is_ca {
        format!("TLS CA certificate is about to expire, configured certificate is valid until {date}")
    } else {
        format!("TLS certificate is about to expire, configured certificate is valid until {date}")
    }
}

/// Classification of a set of TLS material
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsCertStatus {
    Valid,
    AboutToExpire,
    Expired,
    Invalid,
}

impl TlsCertError {
    pub fn status(&self) -> TlsCertStatus {
        match self {
            TlsCertError::Expired { .. } => TlsCertStatus::Expired,
            TlsCertError::AboutToExpire { .. } => TlsCertStatus::AboutToExpire,
            _ => TlsCertStatus::Invalid,
        }
    }

    /// About-to-expire leaves the pipeline usable
    pub fn is_warning(&self) -> bool {
        matches!(self, TlsCertError::AboutToExpire { .. })
    }
}

/// Resolved PEM strings of a TLS configuration
#[derive(Clone, Debug, Default)]
pub struct TlsMaterial {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Facts derived from a client certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertFacts {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_expired: bool,
    pub is_about_to_expire: bool,
    /// `None` when the key algorithm cannot be decoded for comparison
    pub key_matches_cert: Option<bool>,
}

/// Secret values are often pasted with escaped newlines
pub fn sanitize_pem(pem: &str) -> String {
    pem.replace("\\n", "\n")
}

/// Validates TLS material against an injected clock
pub struct TlsCertValidator {
    now: Box<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    lead_time: Duration,
}

impl Default for TlsCertValidator {
    fn default() -> Self {
        Self::new(Duration::days(DEFAULT_CERT_EXPIRY_LEAD_TIME_DAYS))
    }
}

impl TlsCertValidator {
    pub fn new(lead_time: Duration) -> Self {
        Self {
            now: Box::new(Utc::now),
            lead_time,
        }
    }

    /// Use a fixed point in time instead of the wall clock
    pub fn with_clock(mut self, now: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.now = Box::new(now);
        self
    }

    /// Validate the material. Errors are ordered by severity: structural
    /// problems first, then expiry of the client certificate, then the CA.
    pub fn validate(&self, material: &TlsMaterial) -> Result<Option<CertFacts>, TlsCertError> {
        let cert = material.cert.as_deref().filter(|s| !s.trim().is_empty());
        let key = material.key.as_deref().filter(|s| !s.trim().is_empty());
        let ca = material.ca.as_deref().filter(|s| !s.trim().is_empty());

        if cert.is_some() != key.is_some() {
            return Err(TlsCertError::MissingCertKeyPair);
        }

        let ca_pems = match ca {
            Some(ca) => decode_pems(&sanitize_pem(ca), "CA certificate")?,
            None => Vec::new(),
        };
        let ca_certs = ca_pems
            .iter()
            .map(|pem| parse_cert(pem, "CA certificate"))
            .collect::<Result<Vec<_>, _>>()?;

        let mut facts = None;
        if let (Some(cert), Some(key)) = (cert, key) {
            let cert_pems = decode_pems(&sanitize_pem(cert), "certificate")?;
            let leaf_pem = cert_pems
                .first()
                .ok_or(TlsCertError::PemDecode("certificate"))?;
            let leaf = parse_cert(leaf_pem, "certificate")?;

            let key_matches = key_matches_cert(&sanitize_pem(key), &leaf)?;
            if key_matches == Some(false) {
                return Err(TlsCertError::KeyPairMismatch);
            }

            if !ca_certs.is_empty()
                && !ca_certs
                    .iter()
                    .any(|c| c.subject().as_raw() == leaf.issuer().as_raw())
            {
                return Err(TlsCertError::IssuerMismatch);
            }

            facts = Some(self.facts(&leaf, key_matches));
        }

        for ca_cert in &ca_certs {
            if !ca_cert.is_ca() {
                return Err(TlsCertError::CertIsNotCa);
            }
        }

        if let Some(f) = &facts {
            if f.is_expired {
                return Err(TlsCertError::Expired {
                    expiry: f.not_after,
                    is_ca: false,
                });
            }
        }
        for ca_cert in &ca_certs {
            let ca_facts = self.facts(ca_cert, None);
            if ca_facts.is_expired {
                return Err(TlsCertError::Expired {
                    expiry: ca_facts.not_after,
                    is_ca: true,
                });
            }
        }

        if let Some(f) = &facts {
            if f.is_about_to_expire {
                return Err(TlsCertError::AboutToExpire {
                    expiry: f.not_after,
                    is_ca: false,
                });
            }
        }
        for ca_cert in &ca_certs {
            let ca_facts = self.facts(ca_cert, None);
            if ca_facts.is_about_to_expire {
                return Err(TlsCertError::AboutToExpire {
                    expiry: ca_facts.not_after,
                    is_ca: true,
                });
            }
        }

        Ok(facts)
    }

    /// Derive validity facts for a single PEM certificate
    pub fn inspect(&self, cert_pem: &str) -> Result<CertFacts, TlsCertError> {
        let pems = decode_pems(&sanitize_pem(cert_pem), "certificate")?;
        let pem = pems.first().ok_or(TlsCertError::PemDecode("certificate"))?;
        let cert = parse_cert(pem, "certificate")?;
        Ok(self.facts(&cert, None))
    }

    fn facts(&self, cert: &X509Certificate<'_>, key_matches_cert: Option<bool>) -> CertFacts {
        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp());
        let not_after = timestamp(validity.not_after.timestamp());
        let now = (self.now)();

        let is_expired = now > not_after;
        CertFacts {
            not_before,
            not_after,
            is_expired,
            is_about_to_expire: !is_expired && not_after - now <= self.lead_time,
            key_matches_cert,
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn decode_pems(data: &str, what: &'static str) -> Result<Vec<Pem>, TlsCertError> {
    let pems = Pem::iter_from_buffer(data.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TlsCertError::PemDecode(what))?;
    if pems.is_empty() {
        return Err(TlsCertError::PemDecode(what));
    }
    Ok(pems)
}

fn parse_cert<'a>(pem: &'a Pem, what: &'static str) -> Result<X509Certificate<'a>, TlsCertError> {
    pem.parse_x509().map_err(|e| TlsCertError::Parse {
        what,
        detail: e.to_string(),
    })
}

fn key_matches_cert(key_pem: &str, cert: &X509Certificate<'_>) -> Result<Option<bool>, TlsCertError> {
    // Make sure the key is at least a well-formed PEM block
    decode_pems(key_pem, "private key")?;

    match rcgen::KeyPair::from_pem(key_pem) {
        Ok(key_pair) => Ok(Some(
            key_pair.public_key_raw() == cert.public_key().subject_public_key.data.as_ref(),
        )),
        // Algorithms rcgen cannot load are accepted without comparison
        Err(rcgen::Error::CouldNotParseKeyPair) | Err(rcgen::Error::UnsupportedSignatureAlgorithm) => {
            Ok(None)
        }
        Err(e) => Err(TlsCertError::Parse {
            what: "private key",
            detail: e.to_string(),
        }),
    }
}

#[cfg(test)]
pub(crate) mod test_certs {
    //! Certificate minting for tests

    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};

    pub struct Minted {
        pub cert: String,
        pub key: String,
    }

    fn params(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> CertificateParams {
        let mut params = CertificateParams::new(vec!["backend.example.com".to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(not_before.0, not_before.1, not_before.2);
        params.not_after = rcgen::date_time_ymd(not_after.0, not_after.1, not_after.2);
        params
    }

    pub fn self_signed(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> Minted {
        let key = KeyPair::generate().unwrap();
        let cert = params(not_before, not_after).self_signed(&key).unwrap();
        Minted {
            cert: cert.pem(),
            key: key.serialize_pem(),
        }
    }

    pub fn ca(not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> Minted {
        let key = KeyPair::generate().unwrap();
        let mut p = params(not_before, not_after);
        p.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = p.self_signed(&key).unwrap();
        Minted {
            cert: cert.pem(),
            key: key.serialize_pem(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_certs::*;
    use super::*;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    fn validator(now: DateTime<Utc>) -> TlsCertValidator {
        TlsCertValidator::default().with_clock(move || now)
    }

    fn pair(minted: &Minted) -> TlsMaterial {
        TlsMaterial {
            ca: None,
            cert: Some(minted.cert.clone()),
            key: Some(minted.key.clone()),
        }
    }

    #[test]
    fn test_valid_pair() {
        let minted = self_signed((2030, 1, 1), (2031, 1, 1));
        let facts = validator(at(2030, 6, 1)).validate(&pair(&minted)).unwrap().unwrap();

        assert!(!facts.is_expired);
        assert!(!facts.is_about_to_expire);
        assert_eq!(facts.key_matches_cert, Some(true));
    }

    #[test]
    fn test_empty_material_is_valid() {
        let result = validator(at(2030, 6, 1)).validate(&TlsMaterial::default());
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_cert_without_key() {
        let minted = self_signed((2030, 1, 1), (2031, 1, 1));
        let material = TlsMaterial {
            cert: Some(minted.cert),
            ..Default::default()
        };

        let err = validator(at(2030, 6, 1)).validate(&material).unwrap_err();
        assert_eq!(err, TlsCertError::MissingCertKeyPair);
        assert_eq!(err.status(), TlsCertStatus::Invalid);
    }

    #[test]
    fn test_mismatched_key() {
        let a = self_signed((2030, 1, 1), (2031, 1, 1));
        let b = self_signed((2030, 1, 1), (2031, 1, 1));
        let material = TlsMaterial {
            ca: None,
            cert: Some(a.cert),
            key: Some(b.key),
        };

        let err = validator(at(2030, 6, 1)).validate(&material).unwrap_err();
        assert_eq!(err, TlsCertError::KeyPairMismatch);
        assert_eq!(err.status(), TlsCertStatus::Invalid);
    }

    #[test]
    fn test_garbage_pem_is_invalid() {
        let material = TlsMaterial {
            ca: None,
            cert: Some("not a certificate".to_string()),
            key: Some("not a key".to_string()),
        };

        let err = validator(at(2030, 6, 1)).validate(&material).unwrap_err();
        assert_eq!(err.status(), TlsCertStatus::Invalid);
    }

    #[test]
    fn test_escaped_newlines_are_accepted() {
        let minted = self_signed((2030, 1, 1), (2031, 1, 1));
        let material = TlsMaterial {
            ca: None,
            cert: Some(minted.cert.replace('\n', "\\n")),
            key: Some(minted.key.replace('\n', "\\n")),
        };

        assert!(validator(at(2030, 6, 1)).validate(&material).is_ok());
    }

    #[test]
    fn test_expired_then_about_to_expire_transition() {
        let minted = self_signed((2030, 1, 1), (2030, 12, 31));
        let material = pair(&minted);

        assert!(validator(at(2030, 6, 1)).validate(&material).is_ok());

        let warning = validator(at(2030, 12, 25)).validate(&material).unwrap_err();
        assert_eq!(warning.status(), TlsCertStatus::AboutToExpire);
        assert!(warning.is_warning());
        assert!(warning.to_string().contains("valid until 2030-12-31"));

        let expired = validator(at(2031, 1, 2)).validate(&material).unwrap_err();
        assert_eq!(expired.status(), TlsCertStatus::Expired);
        assert!(!expired.is_warning());
        assert_eq!(expired.to_string(), "TLS certificate expired on 2030-12-31");
    }

    #[test]
    fn test_lead_time_is_configurable() {
        let minted = self_signed((2030, 1, 1), (2030, 12, 31));
        let v = TlsCertValidator::new(Duration::days(60)).with_clock(|| at(2030, 11, 15));

        assert_eq!(
            v.validate(&pair(&minted)).unwrap_err().status(),
            TlsCertStatus::AboutToExpire
        );
    }

    #[test]
    fn test_ca_alone_is_valid() {
        let ca = ca((2030, 1, 1), (2035, 1, 1));
        let material = TlsMaterial {
            ca: Some(ca.cert),
            ..Default::default()
        };

        assert_eq!(validator(at(2030, 6, 1)).validate(&material), Ok(None));
    }

    #[test]
    fn test_non_ca_certificate_as_ca() {
        let leaf = self_signed((2030, 1, 1), (2031, 1, 1));
        let material = TlsMaterial {
            ca: Some(leaf.cert),
            ..Default::default()
        };

        assert_eq!(
            validator(at(2030, 6, 1)).validate(&material),
            Err(TlsCertError::CertIsNotCa)
        );
    }

    #[test]
    fn test_expired_ca() {
        let ca = ca((2020, 1, 1), (2021, 1, 1));
        let material = TlsMaterial {
            ca: Some(ca.cert),
            ..Default::default()
        };

        let err = validator(at(2030, 6, 1)).validate(&material).unwrap_err();
        assert_eq!(err.to_string(), "TLS CA certificate expired on 2021-01-01");
    }

    #[test]
    fn test_leaf_not_issued_by_ca() {
        let ca = ca((2030, 1, 1), (2035, 1, 1));
        let mut leaf = pair(&self_signed((2030, 1, 1), (2031, 1, 1)));
        leaf.ca = Some(ca.cert);

        // Both carry the same subject, so issue a leaf with a different name
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["other.example.com".to_string()]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "other");
        params.not_before = rcgen::date_time_ymd(2030, 1, 1);
        params.not_after = rcgen::date_time_ymd(2031, 1, 1);
        let cert = params.self_signed(&key).unwrap();
        leaf.cert = Some(cert.pem());
        leaf.key = Some(key.serialize_pem());

        assert_eq!(
            validator(at(2030, 6, 1)).validate(&leaf),
            Err(TlsCertError::IssuerMismatch)
        );
    }

    #[test]
    fn test_inspect_reports_validity_window() {
        let minted = self_signed((2030, 1, 1), (2031, 1, 1));
        let facts = validator(at(2030, 6, 1)).inspect(&minted.cert).unwrap();

        assert_eq!(facts.not_before.format("%Y-%m-%d").to_string(), "2030-01-01");
        assert_eq!(facts.not_after.format("%Y-%m-%d").to_string(), "2031-01-01");
        assert!(facts.key_matches_cert.is_none());
    }
}
