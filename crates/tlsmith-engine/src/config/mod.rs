//! Engine configuration with builder pattern.
//!
//! The configuration is the fully resolved source of every default that
//! compute-defaults falls back to when connection state has not negotiated a
//! value yet. Deterministic randoms and key-share scalars are the default so
//! that re-running a trace reproduces the same bytes.

use std::fmt;
use std::time::Duration;

use tlsmith_types::{CipherSuite, EngineError, NamedGroup, ProtocolVersion, SignatureScheme};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::fragment::OverlapPolicy;
use crate::Role;

/// Default DTLS path MTU (conservative for UDP over IPv4/IPv6).
pub const DEFAULT_MTU: usize = 1200;

/// Default TLS plaintext limit (RFC 8446 Section 5.1).
pub const MAX_PLAINTEXT_LENGTH: usize = 16384;

/// Byte string zeroized on drop and redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

/// Engine configuration.
#[derive(Clone)]
pub struct EngineConfig {
    /// Local role.
    pub role: Role,
    /// Versions offered or accepted, most preferred first.
    pub supported_versions: Vec<ProtocolVersion>,
    /// Cipher suites offered or accepted, most preferred first.
    pub cipher_suites: Vec<CipherSuite>,
    pub named_groups: Vec<NamedGroup>,
    pub signature_schemes: Vec<SignatureScheme>,
    pub server_name: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    /// Random sent in ClientHello when acting as client.
    pub client_random: Vec<u8>,
    /// Random sent in ServerHello when acting as server.
    pub server_random: Vec<u8>,
    /// Legacy session id sent by a client.
    pub session_id: Vec<u8>,
    /// X25519 scalar used for client key shares.
    pub client_key_share_private: SecretBytes,
    /// X25519 scalar used for server key shares.
    pub server_key_share_private: SecretBytes,
    /// DER certificates sent in Certificate, leaf first.
    pub certificate_chain: Vec<Vec<u8>>,
    /// Largest plaintext placed into one record.
    pub max_record_payload: usize,
    /// Largest handshake fragment body in one DTLS fragment.
    pub dtls_max_fragment_length: usize,
    /// Cookie returned in HelloVerifyRequest.
    pub dtls_cookie: Vec<u8>,
    /// Flight resends allowed over the whole connection.
    pub dtls_max_retransmissions: u32,
    /// First wait before an unanswered flight is resent while receiving.
    /// `None` leaves resends to explicit workflow actions.
    pub dtls_retransmit_timeout: Option<Duration>,
    /// Resolution rule for overlapping fragment bytes.
    pub overlap_policy: OverlapPolicy,
    /// Receive timeout used when a configuration does not carry its own.
    pub receive_timeout: Duration,
    pub connect_timeout: Duration,
    /// Payload of ApplicationData units without a hand-set payload.
    pub default_application_data: Vec<u8>,
    /// Alert (level, description) sent when an Alert unit has no values.
    pub default_alert: (u8, u8),
    pub http_path: String,
    pub http_user_agent: String,
    /// Largest CRYPTO frame payload packed into one QUIC datagram.
    pub quic_max_crypto_payload: usize,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("role", &self.role)
            .field("supported_versions", &self.supported_versions)
            .field("cipher_suites", &self.cipher_suites)
            .field("named_groups", &self.named_groups)
            .field("server_name", &self.server_name)
            .field("client_key_share_private", &self.client_key_share_private)
            .field("server_key_share_private", &self.server_key_share_private)
            .field("overlap_policy", &self.overlap_policy)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Create a builder for engine configuration.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Most preferred version.
    pub fn highest_version(&self) -> ProtocolVersion {
        self.supported_versions
            .first()
            .copied()
            .unwrap_or(ProtocolVersion::TLS12)
    }

    pub fn is_dtls(&self) -> bool {
        self.highest_version().is_dtls()
    }

    /// Random used by the local side.
    pub fn local_random(&self) -> &[u8] {
        match self.role {
            Role::Client => &self.client_random,
            Role::Server => &self.server_random,
        }
    }

    /// Key-share scalar used by the local side.
    pub fn local_key_share_private(&self) -> &SecretBytes {
        match self.role {
            Role::Client => &self.client_key_share_private,
            Role::Server => &self.server_key_share_private,
        }
    }

    /// Same configuration with the opposite role, for building a peer.
    pub fn with_role(&self, role: Role) -> Self {
        let mut config = self.clone();
        config.role = role;
        config
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfigBuilder::default().config
    }
}

/// Builder for `EngineConfig`.
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig {
                role: Role::Client,
                supported_versions: vec![ProtocolVersion::TLS13, ProtocolVersion::TLS12],
                cipher_suites: vec![
                    CipherSuite::TLS_AES_128_GCM_SHA256,
                    CipherSuite::TLS_AES_256_GCM_SHA384,
                    CipherSuite::TLS_CHACHA20_POLY1305_SHA256,
                    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
                ],
                named_groups: vec![NamedGroup::X25519],
                signature_schemes: vec![
                    SignatureScheme::RSA_PSS_RSAE_SHA256,
                    SignatureScheme::ECDSA_SECP256R1_SHA256,
                    SignatureScheme::ED25519,
                ],
                server_name: None,
                alpn_protocols: Vec::new(),
                client_random: (0x00..0x20).collect(),
                server_random: (0x70..0x90).collect(),
                session_id: Vec::new(),
                client_key_share_private: SecretBytes::new(vec![0x11; 32]),
                server_key_share_private: SecretBytes::new(vec![0x22; 32]),
                certificate_chain: Vec::new(),
                max_record_payload: MAX_PLAINTEXT_LENGTH,
                dtls_max_fragment_length: DEFAULT_MTU - 13 - 12,
                dtls_cookie: (0xC0..0xD0).collect(),
                dtls_max_retransmissions: 12,
                dtls_retransmit_timeout: None,
                overlap_policy: OverlapPolicy::FirstWins,
                receive_timeout: Duration::from_millis(1000),
                connect_timeout: Duration::from_secs(5),
                default_application_data: b"tlsmith".to_vec(),
                default_alert: (1, 0),
                http_path: "/".into(),
                http_user_agent: concat!("tlsmith/", env!("CARGO_PKG_VERSION")).into(),
                quic_max_crypto_payload: 1100,
            },
        }
    }
}

impl fmt::Debug for EngineConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfigBuilder")
            .field("role", &self.config.role)
            .field("supported_versions", &self.config.supported_versions)
            .finish_non_exhaustive()
    }
}

impl EngineConfigBuilder {
    pub fn role(mut self, role: Role) -> Self {
        self.config.role = role;
        self
    }

    pub fn supported_versions(mut self, versions: &[ProtocolVersion]) -> Self {
        self.config.supported_versions = versions.to_vec();
        self
    }

    pub fn cipher_suites(mut self, suites: &[CipherSuite]) -> Self {
        self.config.cipher_suites = suites.to_vec();
        self
    }

    pub fn named_groups(mut self, groups: &[NamedGroup]) -> Self {
        self.config.named_groups = groups.to_vec();
        self
    }

    pub fn signature_schemes(mut self, schemes: &[SignatureScheme]) -> Self {
        self.config.signature_schemes = schemes.to_vec();
        self
    }

    pub fn server_name(mut self, name: &str) -> Self {
        self.config.server_name = Some(name.to_string());
        self
    }

    pub fn alpn(mut self, protocols: &[&[u8]]) -> Self {
        self.config.alpn_protocols = protocols.iter().map(|p| p.to_vec()).collect();
        self
    }

    pub fn client_random(mut self, random: Vec<u8>) -> Self {
        self.config.client_random = random;
        self
    }

    pub fn server_random(mut self, random: Vec<u8>) -> Self {
        self.config.server_random = random;
        self
    }

    pub fn session_id(mut self, session_id: Vec<u8>) -> Self {
        self.config.session_id = session_id;
        self
    }

    pub fn client_key_share_private(mut self, scalar: Vec<u8>) -> Self {
        self.config.client_key_share_private = SecretBytes::new(scalar);
        self
    }

    pub fn server_key_share_private(mut self, scalar: Vec<u8>) -> Self {
        self.config.server_key_share_private = SecretBytes::new(scalar);
        self
    }

    pub fn certificate_chain(mut self, certs: Vec<Vec<u8>>) -> Self {
        self.config.certificate_chain = certs;
        self
    }

    pub fn max_record_payload(mut self, size: usize) -> Self {
        self.config.max_record_payload = size;
        self
    }

    pub fn dtls_max_fragment_length(mut self, size: usize) -> Self {
        self.config.dtls_max_fragment_length = size;
        self
    }

    pub fn dtls_cookie(mut self, cookie: Vec<u8>) -> Self {
        self.config.dtls_cookie = cookie;
        self
    }

    pub fn dtls_max_retransmissions(mut self, count: u32) -> Self {
        self.config.dtls_max_retransmissions = count;
        self
    }

    pub fn dtls_retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.config.dtls_retransmit_timeout = Some(timeout);
        self
    }

    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.config.overlap_policy = policy;
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn default_application_data(mut self, data: Vec<u8>) -> Self {
        self.config.default_application_data = data;
        self
    }

    pub fn default_alert(mut self, level: u8, description: u8) -> Self {
        self.config.default_alert = (level, description);
        self
    }

    pub fn http_path(mut self, path: &str) -> Self {
        self.config.http_path = path.to_string();
        self
    }

    pub fn quic_max_crypto_payload(mut self, size: usize) -> Self {
        self.config.quic_max_crypto_payload = size;
        self
    }

    pub fn build(self) -> Result<EngineConfig, EngineError> {
        let config = self.config;
        if config.supported_versions.is_empty() {
            return Err(EngineError::Config("no supported versions".into()));
        }
        if config.max_record_payload == 0 {
            return Err(EngineError::Config("max_record_payload must be positive".into()));
        }
        if config.dtls_max_fragment_length == 0 {
            return Err(EngineError::Config(
                "dtls_max_fragment_length must be positive".into(),
            ));
        }
        if config.quic_max_crypto_payload == 0 {
            return Err(EngineError::Config(
                "quic_max_crypto_payload must be positive".into(),
            ));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder_defaults() {
        let config = EngineConfig::builder().build().unwrap();
        assert_eq!(config.role, Role::Client);
        assert_eq!(config.highest_version(), ProtocolVersion::TLS13);
        assert!(!config.is_dtls());
        assert_eq!(config.named_groups[0], NamedGroup::X25519);
        assert_eq!(config.client_random.len(), 32);
        assert_eq!(config.overlap_policy, OverlapPolicy::FirstWins);
        assert_eq!(config.local_random(), config.client_random.as_slice());
    }

    #[test]
    fn test_config_builder_dtls_server() {
        let config = EngineConfig::builder()
            .role(Role::Server)
            .supported_versions(&[ProtocolVersion::DTLS12])
            .dtls_max_fragment_length(100)
            .build()
            .unwrap();
        assert!(config.is_dtls());
        assert_eq!(config.dtls_max_fragment_length, 100);
        assert_eq!(config.local_random(), config.server_random.as_slice());
        assert_eq!(
            config.local_key_share_private().as_bytes(),
            config.server_key_share_private.as_bytes()
        );
    }

    #[test]
    fn test_config_builder_rejects_invalid_sizes() {
        assert!(matches!(
            EngineConfig::builder().supported_versions(&[]).build(),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::builder().dtls_max_fragment_length(0).build(),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let config = EngineConfig::default();
        let text = format!("{config:?}");
        assert!(text.contains("[32 bytes]"));
        assert!(!text.contains("17, 17"));
    }

    #[test]
    fn test_with_role_flips_only_role() {
        let client = EngineConfig::builder().server_name("example.com").build().unwrap();
        let server = client.with_role(Role::Server);
        assert_eq!(server.role, Role::Server);
        assert_eq!(server.server_name.as_deref(), Some("example.com"));
    }
}
