//! DNSSEC signing per RFC 4034: canonical RRset ordering, the RRSIG
//! pre-image, and signatures through ring. Ed25519 (13), RSASHA256 (8) and
//! RSASHA512 (10) sign; Ed448 (15) keys can be stored but won't sign.

use crate::enums::{DnssecAlgorithm, RecordClass, RecordType};
use crate::error::HoldfastError;
use crate::message::Message;
use crate::name::name_as_bytes;
use crate::resourcerecord::{DomainName, InternalResourceRecord};
use crate::zones::ZoneKey;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;
use ring::rand::SystemRandom;
use ring::signature::{self, Ed25519KeyPair, RsaKeyPair, UnparsedPublicKey};

/// Signatures cover a month, antedated an hour against clock skew.
const INCEPTION_SKEW_SECS: i64 = 3600;
const EXPIRATION_SECS: i64 = 30 * 86400;

/// RFC 4034 appendix B: the key tag is a ones-complement-ish checksum over
/// the DNSKEY rdata.
pub fn key_tag(dnskey_rdata: &[u8]) -> u16 {
    let mut acc: u32 = 0;
    for (i, byte) in dnskey_rdata.iter().enumerate() {
        if i % 2 == 0 {
            acc += (*byte as u32) << 8;
        } else {
            acc += *byte as u32;
        }
    }
    acc += (acc >> 16) & 0xFFFF;
    (acc & 0xFFFF) as u16
}

/// Pick the key that signs answers: the ZSK if one is active, otherwise the
/// first active key.
pub fn select_signing_key(keys: &[ZoneKey]) -> Option<&ZoneKey> {
    keys.iter()
        .find(|k| k.active && k.is_zsk())
        .or_else(|| keys.iter().find(|k| k.active))
}

/// One RRset member in its canonical wire form.
fn canonical_rr(owner: &str, rrtype: RecordType, original_ttl: u32, rdata: &[u8]) -> Vec<u8> {
    let mut out = name_as_bytes(&owner.to_lowercase(), None);
    out.extend((rrtype as u16).to_be_bytes());
    out.extend((RecordClass::Internet as u16).to_be_bytes());
    out.extend(original_ttl.to_be_bytes());
    out.extend((rdata.len() as u16).to_be_bytes());
    out.extend(rdata);
    out
}

/// The RRSIG rdata with the signature field empty - both the pre-image
/// prefix and the skeleton of the final record.
#[allow(clippy::too_many_arguments)]
fn rrsig_rdata_sans_signature(
    type_covered: RecordType,
    algorithm: u8,
    labels: u8,
    original_ttl: u32,
    expiration: u32,
    inception: u32,
    key_tag: u16,
    signer: &str,
) -> Vec<u8> {
    let mut out = (type_covered as u16).to_be_bytes().to_vec();
    out.push(algorithm);
    out.push(labels);
    out.extend(original_ttl.to_be_bytes());
    out.extend(expiration.to_be_bytes());
    out.extend(inception.to_be_bytes());
    out.extend(key_tag.to_be_bytes());
    out.extend(name_as_bytes(&signer.to_lowercase(), None));
    out
}

/// Sign one RRset. `rdatas` is every member's wire rdata; ordering is
/// handled here. Returns the RRSIG as a typed record.
pub fn sign_rrset(
    key: &ZoneKey,
    zone_name: &str,
    owner: &str,
    rrtype: RecordType,
    original_ttl: u32,
    rdatas: &[Vec<u8>],
    now: i64,
) -> Result<InternalResourceRecord, HoldfastError> {
    let algorithm = DnssecAlgorithm::from_number(key.algorithm).ok_or_else(|| {
        HoldfastError::Dnssec(format!("unknown algorithm {} on zone key", key.algorithm))
    })?;
    let inception = (now - INCEPTION_SKEW_SECS) as u32;
    let expiration = (now + EXPIRATION_SECS) as u32;
    let labels = owner.split('.').filter(|l| !l.is_empty()).count() as u8;

    let mut preimage = rrsig_rdata_sans_signature(
        rrtype,
        key.algorithm,
        labels,
        original_ttl,
        expiration,
        inception,
        key.key_tag,
        zone_name,
    );

    // canonical order: members sorted by their wire rdata
    let mut sorted: Vec<&Vec<u8>> = rdatas.iter().collect();
    sorted.sort();
    for rdata in sorted {
        preimage.extend(canonical_rr(owner, rrtype, original_ttl, rdata));
    }

    let signature = sign_bytes(key, algorithm, &preimage)?;

    Ok(InternalResourceRecord::RRSIG {
        type_covered: rrtype as u16,
        algorithm: key.algorithm,
        labels,
        original_ttl,
        expiration,
        inception,
        key_tag: key.key_tag,
        signer: DomainName::from(zone_name),
        signature,
        ttl: original_ttl,
    })
}

fn sign_bytes(
    key: &ZoneKey,
    algorithm: DnssecAlgorithm,
    preimage: &[u8],
) -> Result<Vec<u8>, HoldfastError> {
    let private = BASE64.decode(&key.private_key).map_err(|e| {
        HoldfastError::Dnssec(format!("zone key private material isn't base64: {e}"))
    })?;
    match algorithm {
        DnssecAlgorithm::Ed25519 => {
            let keypair = Ed25519KeyPair::from_pkcs8_maybe_unchecked(&private)
                .map_err(|e| HoldfastError::Dnssec(format!("bad ed25519 key: {e}")))?;
            Ok(keypair.sign(preimage).as_ref().to_vec())
        }
        DnssecAlgorithm::RsaSha256 | DnssecAlgorithm::RsaSha512 => {
            let keypair = RsaKeyPair::from_pkcs8(&private)
                .map_err(|e| HoldfastError::Dnssec(format!("bad rsa key: {e}")))?;
            let padding: &'static dyn signature::RsaEncoding = match algorithm {
                DnssecAlgorithm::RsaSha256 => &signature::RSA_PKCS1_SHA256,
                _ => &signature::RSA_PKCS1_SHA512,
            };
            let mut sig = vec![0u8; keypair.public().modulus_len()];
            keypair
                .sign(padding, &SystemRandom::new(), preimage, &mut sig)
                .map_err(|e| HoldfastError::Dnssec(format!("rsa signing failed: {e}")))?;
            Ok(sig)
        }
        DnssecAlgorithm::Ed448 => Err(HoldfastError::Dnssec(
            "ed448 keys are stored but signing them isn't supported".to_string(),
        )),
    }
}

/// Verify the RRSIGs in an upstream response against the DNSKEYs carried in
/// the same response. This is signature checking, not chain-of-trust
/// validation; a response with no signatures passes vacuously.
pub fn validate_response(response: &[u8]) -> Result<(), HoldfastError> {
    let message = Message::parse(response)?;

    let dnskeys: Vec<(u16, u8, Vec<u8>)> = message
        .answers
        .iter()
        .chain(message.additionals.iter())
        .filter(|rr| rr.record_type == RecordType::DNSKEY && rr.rdata.len() > 4)
        .map(|rr| (key_tag(&rr.rdata), rr.rdata[3], rr.rdata.clone()))
        .collect();

    for rrsig_rr in message
        .answers
        .iter()
        .chain(message.additionals.iter())
        .filter(|rr| rr.record_type == RecordType::RRSIG)
    {
        let rrsig =
            InternalResourceRecord::from_wire(RecordType::RRSIG, rrsig_rr.ttl, &rrsig_rr.rdata)?;
        let InternalResourceRecord::RRSIG {
            type_covered,
            algorithm,
            labels,
            original_ttl,
            expiration,
            inception,
            key_tag: sig_key_tag,
            ref signer,
            ref signature,
            ..
        } = rrsig
        else {
            continue;
        };

        let covered_type = RecordType::from(type_covered);
        let members: Vec<&crate::ResourceRecord> = message
            .answers
            .iter()
            .filter(|rr| rr.record_type == covered_type && rr.name == rrsig_rr.name)
            .collect();
        if members.is_empty() {
            continue;
        }

        let Some((_, _, dnskey_rdata)) = dnskeys
            .iter()
            .find(|(tag, alg, _)| *tag == sig_key_tag && *alg == algorithm)
        else {
            warn!(
                "no DNSKEY with tag {sig_key_tag} in response, skipping signature over {}",
                rrsig_rr.name
            );
            continue;
        };
        let public_key = &dnskey_rdata[4..];

        let mut preimage = rrsig_rdata_sans_signature(
            covered_type,
            algorithm,
            labels,
            original_ttl,
            expiration,
            inception,
            sig_key_tag,
            &signer.name,
        );
        let mut rdatas: Vec<&Vec<u8>> = members.iter().map(|rr| &rr.rdata).collect();
        rdatas.sort();
        for rdata in rdatas {
            preimage.extend(canonical_rr(&rrsig_rr.name, covered_type, original_ttl, rdata));
        }

        verify_signature(algorithm, public_key, &preimage, signature)?;
    }

    Ok(())
}

fn verify_signature(
    algorithm: u8,
    public_key: &[u8],
    preimage: &[u8],
    signature: &[u8],
) -> Result<(), HoldfastError> {
    match DnssecAlgorithm::from_number(algorithm) {
        Some(DnssecAlgorithm::Ed25519) => {
            UnparsedPublicKey::new(&signature::ED25519, public_key)
                .verify(preimage, signature)
                .map_err(|_| {
                    HoldfastError::ValidationFailure("ed25519 signature check failed".to_string())
                })
        }
        Some(DnssecAlgorithm::RsaSha256) | Some(DnssecAlgorithm::RsaSha512) => {
            let der = rsa_dnskey_to_der(public_key)?;
            let scheme = match algorithm {
                8 => &signature::RSA_PKCS1_2048_8192_SHA256,
                _ => &signature::RSA_PKCS1_2048_8192_SHA512,
            };
            UnparsedPublicKey::new(scheme, &der)
                .verify(preimage, signature)
                .map_err(|_| {
                    HoldfastError::ValidationFailure("rsa signature check failed".to_string())
                })
        }
        _ => Err(HoldfastError::ValidationFailure(format!(
            "can't verify signatures made with algorithm {algorithm}"
        ))),
    }
}

/// DNSKEY wire RSA keys are `exponent-length | exponent | modulus`
/// (RFC 3110); ring wants a DER RSAPublicKey.
fn rsa_dnskey_to_der(wire: &[u8]) -> Result<Vec<u8>, HoldfastError> {
    let short = || HoldfastError::ValidationFailure("short RSA key in DNSKEY".to_string());
    let (exp_len, rest) = match wire.split_first().ok_or_else(short)? {
        (0, rest) => {
            let len_bytes = rest.get(0..2).ok_or_else(short)?;
            (
                u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize,
                &rest[2..],
            )
        }
        (len, rest) => (*len as usize, rest),
    };
    let exponent = rest.get(..exp_len).ok_or_else(short)?;
    let modulus = rest.get(exp_len..).ok_or_else(short)?;
    if modulus.is_empty() {
        return Err(short());
    }

    fn der_integer(bytes: &[u8]) -> Vec<u8> {
        // strip leading zeros, re-pad one if the high bit is set
        let mut value: &[u8] = bytes;
        while value.len() > 1 && value[0] == 0 {
            value = &value[1..];
        }
        let needs_pad = value.first().is_some_and(|b| b & 0x80 != 0);
        let content_len = value.len() + needs_pad as usize;
        let mut out = vec![0x02];
        out.extend(der_length(content_len));
        if needs_pad {
            out.push(0);
        }
        out.extend(value);
        out
    }

    fn der_length(len: usize) -> Vec<u8> {
        if len < 128 {
            vec![len as u8]
        } else {
            let bytes: Vec<u8> = len.to_be_bytes().iter().copied().skip_while(|b| *b == 0).collect();
            let mut out = vec![0x80 | bytes.len() as u8];
            out.extend(bytes);
            out
        }
    }

    let mut content = der_integer(modulus);
    content.extend(der_integer(exponent));
    let mut out = vec![0x30];
    out.extend(der_length(content.len()));
    out.extend(content);
    Ok(out)
}

/// Generate a fresh Ed25519 zone key (flags 256 for a ZSK, 257 for a KSK).
pub fn generate_ed25519_key(flags: u16) -> Result<ZoneKey, HoldfastError> {
    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
        .map_err(|e| HoldfastError::Dnssec(format!("key generation failed: {e}")))?;
    let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
        .map_err(|e| HoldfastError::Dnssec(format!("generated key didn't parse: {e}")))?;
    use ring::signature::KeyPair;
    let public = keypair.public_key().as_ref().to_vec();

    let mut dnskey_rdata = flags.to_be_bytes().to_vec();
    dnskey_rdata.push(3);
    dnskey_rdata.push(DnssecAlgorithm::Ed25519 as u8);
    dnskey_rdata.extend(&public);

    Ok(ZoneKey {
        id: None,
        zoneid: None,
        algorithm: DnssecAlgorithm::Ed25519 as u8,
        flags,
        key_tag: key_tag(&dnskey_rdata),
        private_key: BASE64.encode(pkcs8.as_ref()),
        public_key: BASE64.encode(&public),
        active: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::PacketType;
    use crate::reply::Reply;
    use crate::zones::FLAG_ZSK;
    use crate::{Header, Question, ResourceRecord};

    const NOW: i64 = 1_718_000_000;

    #[test]
    fn test_key_tag_is_stable() {
        let rdata = vec![1, 0, 3, 13, 0xde, 0xad, 0xbe, 0xef];
        let tag = key_tag(&rdata);
        assert_eq!(tag, key_tag(&rdata));
    }

    #[test]
    fn test_zsk_preferred_for_signing() {
        let ksk = ZoneKey {
            flags: 257,
            ..generate_ed25519_key(257).expect("keygen")
        };
        let zsk = generate_ed25519_key(FLAG_ZSK).expect("keygen");
        let keys = vec![ksk.clone(), zsk.clone()];
        assert_eq!(select_signing_key(&keys).expect("key").flags, FLAG_ZSK);
        // with only a KSK, it still signs
        assert_eq!(select_signing_key(&[ksk]).expect("key").flags, 257);
    }

    #[test]
    fn test_sign_and_verify_round_trip() {
        let key = generate_ed25519_key(FLAG_ZSK).expect("keygen");
        let rdatas = vec![vec![10, 0, 0, 2], vec![10, 0, 0, 1]];
        let rrsig = sign_rrset(
            &key,
            "mydomain.test",
            "foo.mydomain.test",
            RecordType::A,
            300,
            &rdatas,
            NOW,
        )
        .expect("sign");

        let InternalResourceRecord::RRSIG {
            labels,
            expiration,
            inception,
            ref signature,
            ..
        } = rrsig
        else {
            panic!("expected an RRSIG")
        };
        assert_eq!(labels, 3);
        assert_eq!(inception, (NOW - 3600) as u32);
        assert_eq!(expiration, (NOW + 30 * 86400) as u32);
        assert_eq!(signature.len(), 64);

        // a full response carrying the rrset, the signature and the key
        // passes validation
        let question = Question {
            qname: "foo.mydomain.test".to_string(),
            qtype: RecordType::A,
            qclass: RecordClass::Internet,
        };
        let mut answers: Vec<ResourceRecord> = rdatas
            .iter()
            .map(|rdata| ResourceRecord {
                name: "foo.mydomain.test".to_string(),
                record_type: RecordType::A,
                class: RecordClass::Internet,
                ttl: 300,
                rdata: rdata.clone(),
            })
            .collect();
        answers.push(ResourceRecord {
            name: "foo.mydomain.test".to_string(),
            record_type: RecordType::RRSIG,
            class: RecordClass::Internet,
            ttl: 300,
            rdata: rrsig.as_bytes().expect("rrsig bytes"),
        });
        answers.push(ResourceRecord {
            name: "mydomain.test".to_string(),
            record_type: RecordType::DNSKEY,
            class: RecordClass::Internet,
            ttl: 300,
            rdata: key.dnskey(300).expect("dnskey").as_bytes().expect("bytes"),
        });
        let mut reply = Reply {
            header: Header {
                id: 5,
                qr: PacketType::Answer,
                ..Default::default()
            },
            question: Some(question),
            answers,
            authorities: vec![],
            additionals: vec![],
        };
        let bytes = reply.as_bytes().expect("encode");
        validate_response(&bytes).expect("validation should pass");
    }

    #[test]
    fn test_validation_catches_tampering() {
        let key = generate_ed25519_key(FLAG_ZSK).expect("keygen");
        let rdatas = vec![vec![10, 0, 0, 1]];
        let rrsig = sign_rrset(
            &key,
            "mydomain.test",
            "foo.mydomain.test",
            RecordType::A,
            300,
            &rdatas,
            NOW,
        )
        .expect("sign");

        let mut reply = Reply {
            header: Header {
                id: 5,
                qr: PacketType::Answer,
                ..Default::default()
            },
            question: None,
            answers: vec![
                ResourceRecord {
                    name: "foo.mydomain.test".to_string(),
                    record_type: RecordType::A,
                    class: RecordClass::Internet,
                    ttl: 300,
                    // not the rdata that was signed
                    rdata: vec![10, 9, 9, 9],
                },
                ResourceRecord {
                    name: "foo.mydomain.test".to_string(),
                    record_type: RecordType::RRSIG,
                    class: RecordClass::Internet,
                    ttl: 300,
                    rdata: rrsig.as_bytes().expect("rrsig bytes"),
                },
                ResourceRecord {
                    name: "mydomain.test".to_string(),
                    record_type: RecordType::DNSKEY,
                    class: RecordClass::Internet,
                    ttl: 300,
                    rdata: key.dnskey(300).expect("dnskey").as_bytes().expect("bytes"),
                },
            ],
            authorities: vec![],
            additionals: vec![],
        };
        let bytes = reply.as_bytes().expect("encode");
        assert!(validate_response(&bytes).is_err());
    }

    #[test]
    fn test_ed448_keys_refuse_to_sign() {
        let mut key = generate_ed25519_key(FLAG_ZSK).expect("keygen");
        key.algorithm = DnssecAlgorithm::Ed448 as u8;
        let result = sign_rrset(
            &key,
            "mydomain.test",
            "foo.mydomain.test",
            RecordType::A,
            300,
            &[vec![10, 0, 0, 1]],
            NOW,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rsa_dnskey_der_shape() {
        // 3-byte exponent 65537, 4-byte toy modulus
        let wire = [3u8, 1, 0, 1, 0xC0, 0xFF, 0xEE, 0x42];
        let der = rsa_dnskey_to_der(&wire).expect("der");
        assert_eq!(der[0], 0x30);
        // INTEGER modulus comes first, padded because the high bit is set
        assert_eq!(&der[2..5], &[0x02, 0x05, 0x00]);
    }
}
