#[cfg(test)]
pub mod utils {
    use std::str::FromStr;
    use std::sync::Arc;

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use der::asn1::{BitString, Ia5String, ObjectIdentifier, OctetString};
    use der::Encode;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::{DerSignature, SigningKey};
    use x509_cert::ext::pkix::name::GeneralName;
    use x509_cert::ext::pkix::{AccessDescription, AuthorityInfoAccessSyntax};
    use x509_cert::ext::{Extension, Extensions};
    use x509_cert::name::RdnSequence;
    use x509_cert::serial_number::SerialNumber;
    use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
    use x509_cert::time::{Time, Validity};
    use x509_cert::{Certificate, TbsCertificate, Version};

    use crate::cert::{Cert, AD_CA_ISSUERS_OID, AUTHORITY_INFO_ACCESS_OID};

    const ECDSA_WITH_SHA256_OID: ObjectIdentifier =
        ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
    const BASIC_CONSTRAINTS_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
    const BASIC_CONSTRAINTS_CA_TRUE: &[u8] = &[0x30, 0x03, 0x01, 0x01, 0xFF];

    pub fn new_signing_key() -> SigningKey {
        SigningKey::random(&mut rand::thread_rng())
    }

    /// Builds a real ECDSA-signed certificate so that openssl verification of
    /// issuer links genuinely passes or fails in tests.
    pub fn make_cert(
        subject: &str,
        issuer: &str,
        is_ca: bool,
        mut extensions: Vec<Extension>,
        subject_key: &SigningKey,
        issuer_key: &SigningKey,
    ) -> Arc<Cert> {
        let verifying_key = subject_key.verifying_key();

        let subject = RdnSequence::from_str(subject).unwrap();
        let issuer = RdnSequence::from_str(issuer).unwrap();

        let not_before = Time::UtcTime(
            der::asn1::UtcTime::from_system_time(
                std::time::SystemTime::now() - std::time::Duration::from_secs(60),
            )
            .unwrap(),
        );
        let not_after = Time::UtcTime(
            der::asn1::UtcTime::from_system_time(
                std::time::SystemTime::now() + std::time::Duration::from_secs(365 * 24 * 60 * 60),
            )
            .unwrap(),
        );

        if is_ca {
            extensions.push(Extension {
                extn_id: BASIC_CONSTRAINTS_OID,
                critical: true,
                extn_value: OctetString::new(BASIC_CONSTRAINTS_CA_TRUE.to_vec()).unwrap(),
            });
        }

        let serial: [u8; 4] = rand::random();
        let tbs = TbsCertificate {
            version: Version::V3,
            serial_number: SerialNumber::new(&[1, serial[0], serial[1], serial[2], serial[3]])
                .unwrap(),
            signature: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256_OID,
                parameters: None,
            },
            issuer,
            validity: Validity {
                not_before,
                not_after,
            },
            subject,
            subject_public_key_info: SubjectPublicKeyInfoOwned::from_key(*verifying_key).unwrap(),
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: if extensions.is_empty() {
                None
            } else {
                Some(Extensions::from(extensions))
            },
        };

        let tbs_der = tbs.to_der().unwrap();
        let signature: DerSignature = issuer_key.sign(&tbs_der);

        let certificate = Certificate {
            tbs_certificate: tbs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA256_OID,
                parameters: None,
            },
            signature: BitString::from_bytes(signature.to_bytes().as_ref()).unwrap(),
        };

        Cert::from_der(certificate.to_der().unwrap()).unwrap()
    }

    /// Self-signed CA certificate plus its key.
    pub fn self_signed_root(name: &str) -> (SigningKey, Arc<Cert>) {
        let key = new_signing_key();
        let cert = make_cert(name, name, true, vec![], &key, &key);
        (key, cert)
    }

    /// CA certificate signed by `issuer_key`, plus its own key.
    pub fn intermediate_cert(
        name: &str,
        issuer_name: &str,
        issuer_key: &SigningKey,
    ) -> (SigningKey, Arc<Cert>) {
        let key = new_signing_key();
        let cert = make_cert(name, issuer_name, true, vec![], &key, issuer_key);
        (key, cert)
    }

    /// End-entity certificate signed by `issuer_key`.
    pub fn leaf_cert(name: &str, issuer_name: &str, issuer_key: &SigningKey) -> Arc<Cert> {
        let key = new_signing_key();
        make_cert(name, issuer_name, false, vec![], &key, issuer_key)
    }

    /// End-entity certificate carrying a CA Issuers AIA pointer.
    pub fn leaf_with_aia(
        name: &str,
        issuer_name: &str,
        issuer_key: &SigningKey,
        url: &str,
    ) -> Arc<Cert> {
        let key = new_signing_key();
        make_cert(
            name,
            issuer_name,
            false,
            vec![aia_extension(url)],
            &key,
            issuer_key,
        )
    }

    pub fn aia_extension(url: &str) -> Extension {
        let aia = AuthorityInfoAccessSyntax(vec![AccessDescription {
            access_method: AD_CA_ISSUERS_OID,
            access_location: GeneralName::UniformResourceIdentifier(
                Ia5String::new(url).unwrap(),
            ),
        }]);
        Extension {
            extn_id: AUTHORITY_INFO_ACCESS_OID,
            critical: false,
            extn_value: OctetString::new(aia.to_der().unwrap()).unwrap(),
        }
    }

    pub fn cert_to_pem(cert: &Cert) -> String {
        let b64 = STANDARD.encode(cert.raw());
        let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }

    /// Subjects of each cert in a chain, for compact assertions.
    pub fn chain_subjects(chain: &[Arc<Cert>]) -> Vec<String> {
        chain.iter().map(|c| c.subject().to_string()).collect()
    }

    /// Asserts that `got` contains exactly the chains described by `want`
    /// (each a list of subject substrings), in any order.
    pub fn assert_chain_set(want: &[&[&str]], got: &[Vec<Arc<Cert>>]) {
        assert_eq!(
            want.len(),
            got.len(),
            "wanted {} chains, got {}: {:?}",
            want.len(),
            got.len(),
            got.iter().map(|c| chain_subjects(c)).collect::<Vec<_>>()
        );
        let mut seen = vec![false; want.len()];
        'next_chain: for chain in got {
            'try_expected: for (i, expected) in want.iter().enumerate() {
                if seen[i] || chain.len() != expected.len() {
                    continue;
                }
                for (cert, fragment) in chain.iter().zip(expected.iter()) {
                    if !cert.subject().contains(fragment) {
                        continue 'try_expected;
                    }
                }
                seen[i] = true;
                continue 'next_chain;
            }
            panic!(
                "no expected chain matched output chain {:?}",
                chain_subjects(chain)
            );
        }
    }
}
