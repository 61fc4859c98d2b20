//! Per-connection negotiation context.
//!
//! [`ConnectionState`] is passed explicitly to every unit capability: read by
//! compute-defaults through the chooser accessors, written only by apply.
//! Values observed from the peer live in [`Negotiated`]; choices the local side
//! made while sending live in [`LocalValues`]. Every write is journaled with
//! the index of the workflow action that caused it.

pub mod key_schedule;
pub mod keys;
pub mod transcript;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tlsmith_crypto::{CryptoProvider, RustCryptoProvider};
use tlsmith_types::{CipherSuite, NamedGroup, ProtocolVersion, SignatureScheme};

use crate::config::EngineConfig;
use crate::unit::{Origin, UnitRegistry};
use crate::Role;

pub use key_schedule::{KeySchedule, KeyScheduleStage, TrafficKeys};
pub use keys::{KeyDirection, KeyMaterial};
pub use transcript::Transcript;

/// Values read from units received from the peer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Negotiated {
    pub version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub named_group: Option<NamedGroup>,
    /// Group requested by a HelloRetryRequest.
    pub hello_retry_group: Option<NamedGroup>,
    pub peer_random: Option<Vec<u8>>,
    pub peer_session_id: Option<Vec<u8>>,
    pub peer_versions: Vec<ProtocolVersion>,
    pub peer_cipher_suites: Vec<CipherSuite>,
    pub peer_groups: Vec<NamedGroup>,
    pub peer_signature_schemes: Vec<SignatureScheme>,
    /// Peer public key share (TLS 1.3 key_share or TLS 1.2 ECDHE point).
    pub peer_key_share: Option<Vec<u8>>,
    pub peer_key_share_group: Option<NamedGroup>,
    /// Extension types seen in the peer's hello messages, in wire order.
    pub peer_extensions: Vec<u16>,
    pub server_name: Option<String>,
    pub alpn_protocol: Option<Vec<u8>>,
    pub peer_alpn_protocols: Vec<Vec<u8>>,
    /// Cookie from a DTLS HelloVerifyRequest.
    pub dtls_cookie: Option<Vec<u8>>,
    /// Cookie extension from a HelloRetryRequest.
    pub hello_retry_cookie: Option<Vec<u8>>,
    pub peer_certificates: Vec<Vec<u8>>,
    pub peer_signature_scheme: Option<SignatureScheme>,
    pub peer_finished_valid: Option<bool>,
    pub peer_sent_change_cipher_spec: bool,
    /// Last alert as (level, description).
    pub last_alert: Option<(u8, u8)>,
    pub received_application_data: Vec<u8>,
    pub http_status: Option<u16>,
    pub http_headers: Vec<(String, String)>,
    pub http_request_target: Option<String>,
    pub quic_close_error: Option<u64>,
}

/// Choices made by the local side when it sent a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocalValues {
    pub version: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
    pub named_group: Option<NamedGroup>,
}

/// Record, DTLS and QUIC sequence bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub read_epoch: u16,
    pub write_epoch: u16,
    pub read_sequence: u64,
    pub write_sequence: u64,
    pub dtls_next_send_message_seq: u16,
    pub dtls_next_receive_message_seq: u16,
    pub dtls_flight_retransmissions: u32,
    pub quic_crypto_send_offset: u64,
}

/// One journaled state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateWrite {
    /// Index of the workflow action that was executing, if any.
    pub action: Option<usize>,
    pub field: &'static str,
    pub origin: Origin,
}

/// Shared negotiation context of one connection.
pub struct ConnectionState {
    config: Arc<EngineConfig>,
    registry: Arc<UnitRegistry>,
    crypto: Arc<dyn CryptoProvider>,
    negotiated: Negotiated,
    local: LocalValues,
    transcript: Transcript,
    keys: KeyMaterial,
    counters: Counters,
    journal: Vec<StateWrite>,
    current_action: Option<usize>,
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("role", &self.config.role)
            .field("negotiated", &self.negotiated)
            .field("local", &self.local)
            .field("counters", &self.counters)
            .field("transcript_messages", &self.transcript.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionState {
    /// Fresh state with every built-in unit kind and the default crypto
    /// provider.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            Arc::new(config),
            Arc::new(UnitRegistry::with_defaults()),
            Arc::new(RustCryptoProvider::new()),
        )
    }

    pub fn with_parts(
        config: Arc<EngineConfig>,
        registry: Arc<UnitRegistry>,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            config,
            registry,
            crypto,
            negotiated: Negotiated::default(),
            local: LocalValues::default(),
            transcript: Transcript::new(),
            keys: KeyMaterial::default(),
            counters: Counters::default(),
            journal: Vec::new(),
            current_action: None,
        }
    }

    /// A fresh state sharing configuration, registry and provider.
    pub fn fresh(&self) -> Self {
        Self::with_parts(
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
            Arc::clone(&self.crypto),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    pub fn crypto(&self) -> &dyn CryptoProvider {
        self.crypto.as_ref()
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn negotiated(&self) -> &Negotiated {
        &self.negotiated
    }

    pub fn local(&self) -> &LocalValues {
        &self.local
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn keys(&self) -> &KeyMaterial {
        &self.keys
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut Counters {
        &mut self.counters
    }

    pub fn journal(&self) -> &[StateWrite] {
        &self.journal
    }

    /// Tag subsequent writes with workflow action `index`.
    pub fn begin_action(&mut self, index: usize) {
        self.current_action = Some(index);
    }

    pub fn current_action(&self) -> Option<usize> {
        self.current_action
    }

    /// Write a value observed from the peer.
    pub fn record_negotiated(&mut self, field: &'static str, write: impl FnOnce(&mut Negotiated)) {
        write(&mut self.negotiated);
        self.journal.push(StateWrite {
            action: self.current_action,
            field,
            origin: Origin::Received,
        });
    }

    /// Write a choice the local side made while sending.
    pub fn record_local(&mut self, field: &'static str, write: impl FnOnce(&mut LocalValues)) {
        write(&mut self.local);
        self.journal.push(StateWrite {
            action: self.current_action,
            field,
            origin: Origin::Sent,
        });
    }

    // -------------------------------------------------------------------
    // Choosers: negotiated → local → configuration
    // -------------------------------------------------------------------

    /// Version in effect. A server picks its most preferred version the peer
    /// offered.
    pub fn selected_version(&self) -> ProtocolVersion {
        if let Some(v) = self.negotiated.version.or(self.local.version) {
            return v;
        }
        if self.role() == Role::Server && !self.negotiated.peer_versions.is_empty() {
            if let Some(v) = self
                .config
                .supported_versions
                .iter()
                .find(|v| self.negotiated.peer_versions.contains(v))
            {
                return *v;
            }
        }
        self.config.highest_version()
    }

    pub fn is_tls13(&self) -> bool {
        self.selected_version().is_tls13()
    }

    pub fn is_dtls(&self) -> bool {
        self.config.is_dtls() || self.selected_version().is_dtls()
    }

    /// Whether every flight resend this connection allows has been made,
    /// scripted or timer driven.
    pub fn retransmissions_exhausted(&self) -> bool {
        self.counters.dtls_flight_retransmissions >= self.config.dtls_max_retransmissions
    }

    /// Version in record headers and in the legacy version field of hellos.
    pub fn record_version(&self) -> ProtocolVersion {
        let version = self.selected_version();
        if version.is_dtls() {
            if version.is_tls13() {
                ProtocolVersion::DTLS12
            } else {
                version
            }
        } else if self.is_dtls() {
            ProtocolVersion::DTLS12
        } else if version.0 > ProtocolVersion::TLS12.0 {
            ProtocolVersion::TLS12
        } else {
            version
        }
    }

    /// Cipher suite in effect. Only suites matching the selected version's
    /// generation are chosen from preferences.
    pub fn selected_cipher_suite(&self) -> CipherSuite {
        if let Some(s) = self.negotiated.cipher_suite.or(self.local.cipher_suite) {
            return s;
        }
        let tls13 = self.is_tls13();
        let compatible = |s: &&CipherSuite| s.is_tls13() == tls13;
        if self.role() == Role::Server && !self.negotiated.peer_cipher_suites.is_empty() {
            if let Some(s) = self
                .config
                .cipher_suites
                .iter()
                .filter(compatible)
                .find(|s| self.negotiated.peer_cipher_suites.contains(s))
            {
                return *s;
            }
        }
        self.config
            .cipher_suites
            .iter()
            .find(compatible)
            .or(self.config.cipher_suites.first())
            .copied()
            .unwrap_or(CipherSuite::TLS_AES_128_GCM_SHA256)
    }

    /// Key exchange group in effect.
    pub fn selected_group(&self) -> NamedGroup {
        if let Some(g) = self
            .negotiated
            .named_group
            .or(self.negotiated.hello_retry_group)
            .or(self.local.named_group)
        {
            return g;
        }
        if self.role() == Role::Server {
            if let Some(g) = self
                .negotiated
                .peer_key_share_group
                .filter(|g| self.config.named_groups.contains(g))
            {
                return g;
            }
            if let Some(g) = self
                .config
                .named_groups
                .iter()
                .find(|g| self.negotiated.peer_groups.contains(g))
            {
                return *g;
            }
        }
        self.config
            .named_groups
            .first()
            .copied()
            .unwrap_or(NamedGroup::X25519)
    }

    /// Group a server asks for in a HelloRetryRequest: the first configured
    /// group the client supports but did not send a share for.
    pub fn hello_retry_group(&self) -> NamedGroup {
        let shared = self.negotiated.peer_key_share_group;
        self.config
            .named_groups
            .iter()
            .find(|g| Some(**g) != shared && self.negotiated.peer_groups.contains(g))
            .or(self.config.named_groups.first())
            .copied()
            .unwrap_or(NamedGroup::X25519)
    }

    pub fn local_random(&self) -> &[u8] {
        self.config.local_random()
    }

    /// ClientHello.random, whichever side this is.
    pub fn client_random(&self) -> &[u8] {
        match self.role() {
            Role::Client => &self.config.client_random,
            Role::Server => self.negotiated.peer_random.as_deref().unwrap_or_default(),
        }
    }

    /// ServerHello.random, whichever side this is.
    pub fn server_random(&self) -> &[u8] {
        match self.role() {
            Role::Server => &self.config.server_random,
            Role::Client => self.negotiated.peer_random.as_deref().unwrap_or_default(),
        }
    }

    /// Application protocol in effect; a server picks its first configured
    /// protocol the client offered.
    pub fn selected_alpn(&self) -> Option<Vec<u8>> {
        if let Some(p) = &self.negotiated.alpn_protocol {
            return Some(p.clone());
        }
        if self.role() == Role::Server {
            return self
                .config
                .alpn_protocols
                .iter()
                .find(|p| self.negotiated.peer_alpn_protocols.contains(p))
                .cloned();
        }
        None
    }

    /// Signature scheme a local CertificateVerify or ServerKeyExchange
    /// announces.
    pub fn selected_signature_scheme(&self) -> SignatureScheme {
        self.config
            .signature_schemes
            .iter()
            .find(|s| self.negotiated.peer_signature_schemes.contains(s))
            .or(self.config.signature_schemes.first())
            .copied()
            .unwrap_or(SignatureScheme::RSA_PSS_RSAE_SHA256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_state() -> ConnectionState {
        ConnectionState::new(EngineConfig::builder().role(Role::Server).build().unwrap())
    }

    #[test]
    fn test_client_defaults_come_from_config() {
        let state = ConnectionState::new(EngineConfig::default());
        assert_eq!(state.selected_version(), ProtocolVersion::TLS13);
        assert!(state.is_tls13());
        assert!(!state.is_dtls());
        assert_eq!(state.record_version(), ProtocolVersion::TLS12);
        assert_eq!(
            state.selected_cipher_suite(),
            CipherSuite::TLS_AES_128_GCM_SHA256
        );
        assert_eq!(state.selected_group(), NamedGroup::X25519);
    }

    #[test]
    fn test_negotiated_wins_over_local_and_config() {
        let mut state = ConnectionState::new(EngineConfig::default());
        state.record_local("version", |l| l.version = Some(ProtocolVersion::TLS11));
        assert_eq!(state.selected_version(), ProtocolVersion::TLS11);
        state.record_negotiated("version", |n| n.version = Some(ProtocolVersion::TLS12));
        assert_eq!(state.selected_version(), ProtocolVersion::TLS12);
        assert!(!state.is_tls13());
        assert_eq!(
            state.selected_cipher_suite(),
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        );
    }

    #[test]
    fn test_server_picks_from_peer_offer() {
        let mut state = server_state();
        state.record_negotiated("peer_versions", |n| {
            n.peer_versions = vec![ProtocolVersion::TLS12]
        });
        state.record_negotiated("peer_cipher_suites", |n| {
            n.peer_cipher_suites = vec![
                CipherSuite::TLS_AES_256_GCM_SHA384,
                CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            ]
        });
        assert_eq!(state.selected_version(), ProtocolVersion::TLS12);
        assert_eq!(
            state.selected_cipher_suite(),
            CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256
        );
    }

    #[test]
    fn test_journal_tags_writes_with_action() {
        let mut state = ConnectionState::new(EngineConfig::default());
        state.record_negotiated("server_name", |n| n.server_name = Some("a".into()));
        state.begin_action(3);
        state.record_local("cipher_suite", |l| {
            l.cipher_suite = Some(CipherSuite::TLS_AES_128_GCM_SHA256)
        });
        let journal = state.journal();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].action, None);
        assert_eq!(journal[0].origin, Origin::Received);
        assert_eq!(journal[1].action, Some(3));
        assert_eq!(journal[1].field, "cipher_suite");
        assert_eq!(journal[1].origin, Origin::Sent);
    }

    #[test]
    fn test_dtls_record_version() {
        let config = EngineConfig::builder()
            .supported_versions(&[ProtocolVersion::DTLS12])
            .build()
            .unwrap();
        let state = ConnectionState::new(config);
        assert!(state.is_dtls());
        assert_eq!(state.record_version(), ProtocolVersion::DTLS12);
    }

    #[test]
    fn test_hello_retry_group_skips_offered_share() {
        let config = EngineConfig::builder()
            .role(Role::Server)
            .named_groups(&[NamedGroup::SECP256R1, NamedGroup::X25519])
            .build()
            .unwrap();
        let mut state = ConnectionState::new(config);
        state.record_negotiated("peer_groups", |n| {
            n.peer_groups = vec![NamedGroup::X25519, NamedGroup::SECP256R1];
            n.peer_key_share_group = Some(NamedGroup::SECP256R1);
        });
        assert_eq!(state.hello_retry_group(), NamedGroup::X25519);
    }
}
