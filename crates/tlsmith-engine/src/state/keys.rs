//! Key material of a connection and the state operations that derive it.
//!
//! Only X25519 key agreement is wired up. TLS 1.3 traffic keys protect
//! records; TLS 1.2 keeps the premaster and master secrets for Finished.

use tlsmith_crypto::{CipherSuiteParams, HashAlgorithm};
use tlsmith_types::{CipherSuite, EngineError, NamedGroup};
use tracing::debug;
use zeroize::Zeroize;

use super::key_schedule::{prf, KeySchedule};
use super::ConnectionState;
use crate::record::protection::RecordCipher;
use crate::Role;

/// Direction of a record cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    Read,
    Write,
}

/// Secrets and installed record ciphers. Zeroized on drop.
#[derive(Default)]
pub struct KeyMaterial {
    schedule: Option<KeySchedule>,
    client_handshake_secret: Vec<u8>,
    server_handshake_secret: Vec<u8>,
    client_application_secret: Vec<u8>,
    server_application_secret: Vec<u8>,
    pre_master_secret: Vec<u8>,
    master_secret: Vec<u8>,
    read_cipher: Option<RecordCipher>,
    write_cipher: Option<RecordCipher>,
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.client_handshake_secret.zeroize();
        self.server_handshake_secret.zeroize();
        self.client_application_secret.zeroize();
        self.server_application_secret.zeroize();
        self.pre_master_secret.zeroize();
        self.master_secret.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("schedule", &self.schedule)
            .field("read_protected", &self.read_cipher.is_some())
            .field("write_protected", &self.write_cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl KeyMaterial {
    pub fn read_cipher(&self) -> Option<&RecordCipher> {
        self.read_cipher.as_ref()
    }

    pub fn write_cipher(&self) -> Option<&RecordCipher> {
        self.write_cipher.as_ref()
    }

    pub fn client_handshake_secret(&self) -> &[u8] {
        &self.client_handshake_secret
    }

    pub fn server_handshake_secret(&self) -> &[u8] {
        &self.server_handshake_secret
    }

    pub fn client_application_secret(&self) -> &[u8] {
        &self.client_application_secret
    }

    pub fn server_application_secret(&self) -> &[u8] {
        &self.server_application_secret
    }

    pub fn master_secret(&self) -> &[u8] {
        &self.master_secret
    }

    pub fn has_handshake_secrets(&self) -> bool {
        !self.client_handshake_secret.is_empty()
    }

    pub fn has_application_secrets(&self) -> bool {
        !self.client_application_secret.is_empty()
    }

    pub fn has_master_secret(&self) -> bool {
        !self.master_secret.is_empty()
    }
}

fn key_error(reason: impl Into<String>) -> EngineError {
    EngineError::ApplyFailed {
        unit: "KeySchedule",
        reason: reason.into(),
    }
}

/// PRF hash of a TLS 1.2 suite.
fn tls12_prf_hash(suite: CipherSuite) -> HashAlgorithm {
    match suite {
        CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
        | CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        | CipherSuite::TLS_RSA_WITH_AES_256_GCM_SHA384 => HashAlgorithm::Sha384,
        _ => HashAlgorithm::Sha256,
    }
}

impl ConnectionState {
    /// Hash algorithm of the handshake transcript for the selected suite.
    pub fn transcript_hash_algorithm(&self) -> HashAlgorithm {
        let suite = self.selected_cipher_suite();
        CipherSuiteParams::from_suite(suite)
            .map(|p| p.hash)
            .unwrap_or_else(|| tls12_prf_hash(suite))
    }

    fn tls13_params(&self) -> Result<CipherSuiteParams, EngineError> {
        let suite = self.selected_cipher_suite();
        CipherSuiteParams::from_suite(suite)
            .ok_or_else(|| key_error(format!("suite {:04x} is not a TLS 1.3 suite", suite.0)))
    }

    /// Local public key share for the selected group.
    pub fn local_key_share_public(&self) -> Result<Vec<u8>, EngineError> {
        self.key_share_public_for(self.selected_group())
    }

    pub fn key_share_public_for(&self, group: NamedGroup) -> Result<Vec<u8>, EngineError> {
        if group != NamedGroup::X25519 {
            return Err(EngineError::Unsupported(format!(
                "key share for group {:04x}",
                group.0
            )));
        }
        Ok(self
            .crypto()
            .x25519_public_key(self.config().local_key_share_private().as_bytes())?)
    }

    /// (EC)DHE shared secret from the local scalar and the peer's share.
    pub fn shared_secret(&self) -> Result<Vec<u8>, EngineError> {
        let group = self.selected_group();
        if group != NamedGroup::X25519 {
            return Err(EngineError::Unsupported(format!(
                "key agreement for group {:04x}",
                group.0
            )));
        }
        let peer = self
            .negotiated()
            .peer_key_share
            .as_deref()
            .ok_or_else(|| key_error("no peer key share"))?;
        Ok(self
            .crypto()
            .x25519_agree(self.config().local_key_share_private().as_bytes(), peer)?)
    }

    /// Run the TLS 1.3 schedule up to the handshake traffic secrets over the
    /// current transcript and install handshake record ciphers.
    pub fn derive_handshake_keys(&mut self) -> Result<(), EngineError> {
        let params = self.tls13_params()?;
        let mut shared = self.shared_secret()?;
        let crypto = self.crypto.clone();
        let mut schedule = KeySchedule::new(params);
        schedule.derive_early_secret(crypto.as_ref(), None)?;
        let result = schedule.derive_handshake_secret(crypto.as_ref(), &shared);
        shared.zeroize();
        result?;
        let transcript_hash = self.transcript.hash(crypto.as_ref(), params.hash)?;
        let (client, server) =
            schedule.derive_handshake_traffic_secrets(crypto.as_ref(), &transcript_hash)?;
        let client_cipher = RecordCipher::from_secret(crypto.as_ref(), &params, &client)?;
        let server_cipher = RecordCipher::from_secret(crypto.as_ref(), &params, &server)?;
        let (read, write) = match self.role() {
            Role::Client => (server_cipher, client_cipher),
            Role::Server => (client_cipher, server_cipher),
        };
        self.keys.schedule = Some(schedule);
        self.keys.client_handshake_secret = client;
        self.keys.server_handshake_secret = server;
        self.keys.read_cipher = Some(read);
        self.keys.write_cipher = Some(write);
        self.counters.read_sequence = 0;
        self.counters.write_sequence = 0;
        self.counters.read_epoch = 2;
        self.counters.write_epoch = 2;
        debug!(suite = params.suite.0, "handshake keys installed");
        Ok(())
    }

    /// Advance to the master secret and derive application traffic secrets
    /// over the current transcript (which ends with the server Finished).
    pub fn derive_application_secrets(&mut self) -> Result<(), EngineError> {
        let crypto = self.crypto.clone();
        let hash = self.transcript_hash_algorithm();
        let transcript_hash = self.transcript.hash(crypto.as_ref(), hash)?;
        let schedule = self
            .keys
            .schedule
            .as_mut()
            .ok_or_else(|| key_error("handshake secret not derived"))?;
        schedule.derive_master_secret(crypto.as_ref())?;
        let (client, server) =
            schedule.derive_app_traffic_secrets(crypto.as_ref(), &transcript_hash)?;
        self.keys.client_application_secret = client;
        self.keys.server_application_secret = server;
        Ok(())
    }

    /// Replace one direction's record cipher with the application key.
    pub fn activate_application_keys(&mut self, direction: KeyDirection) -> Result<(), EngineError> {
        let params = self.tls13_params()?;
        let sender = match (direction, self.role()) {
            (KeyDirection::Read, role) => role.peer(),
            (KeyDirection::Write, role) => role,
        };
        let secret = match sender {
            Role::Client => &self.keys.client_application_secret,
            Role::Server => &self.keys.server_application_secret,
        };
        if secret.is_empty() {
            return Err(key_error("application secrets not derived"));
        }
        let cipher = RecordCipher::from_secret(self.crypto(), &params, secret)?;
        match direction {
            KeyDirection::Read => {
                self.keys.read_cipher = Some(cipher);
                self.counters.read_sequence = 0;
                self.counters.read_epoch = 3;
            }
            KeyDirection::Write => {
                self.keys.write_cipher = Some(cipher);
                self.counters.write_sequence = 0;
                self.counters.write_epoch = 3;
            }
        }
        debug!(?direction, "application keys installed");
        Ok(())
    }

    /// Collapse ClientHello1 into a message_hash entry after a
    /// HelloRetryRequest (RFC 8446 Section 4.4.1).
    pub fn replace_transcript_with_message_hash(&mut self) -> Result<(), EngineError> {
        let hash = self.transcript_hash_algorithm();
        self.transcript
            .replace_with_message_hash(self.crypto.as_ref(), hash)
    }

    /// TLS 1.2: premaster → master secret (RFC 5246 Section 8.1).
    pub fn derive_master_secret(&mut self, mut pre_master: Vec<u8>) -> Result<(), EngineError> {
        let mut seed = self.client_random().to_vec();
        seed.extend_from_slice(self.server_random());
        let hash = tls12_prf_hash(self.selected_cipher_suite());
        let master = prf(self.crypto(), hash, &pre_master, "master secret", &seed, 48);
        self.keys.pre_master_secret.zeroize();
        self.keys.pre_master_secret = std::mem::take(&mut pre_master);
        self.keys.master_secret = master?;
        Ok(())
    }

    /// Finished.verify_data for a Finished sent by `sender`. With
    /// `exclude_last` the most recent transcript message (the Finished being
    /// checked) is left out.
    pub fn finished_verify_data(
        &self,
        sender: Role,
        exclude_last: bool,
    ) -> Result<Vec<u8>, EngineError> {
        let hash = self.transcript_hash_algorithm();
        let transcript_hash = if exclude_last {
            self.transcript.hash_without_last(self.crypto(), hash)?
        } else {
            self.transcript.hash(self.crypto(), hash)?
        };
        if self.is_tls13() {
            let schedule = self
                .keys
                .schedule
                .as_ref()
                .ok_or_else(|| key_error("handshake secret not derived"))?;
            let base_key = match sender {
                Role::Client => &self.keys.client_handshake_secret,
                Role::Server => &self.keys.server_handshake_secret,
            };
            let mut finished_key = schedule.derive_finished_key(self.crypto(), base_key)?;
            let verify_data =
                schedule.compute_finished_verify_data(self.crypto(), &finished_key, &transcript_hash);
            finished_key.zeroize();
            verify_data
        } else {
            if self.keys.master_secret.is_empty() {
                return Err(key_error("master secret not derived"));
            }
            let label = match sender {
                Role::Client => "client finished",
                Role::Server => "server finished",
            };
            prf(
                self.crypto(),
                hash,
                &self.keys.master_secret,
                label,
                &transcript_hash,
                12,
            )
        }
    }
}
