//! TLS 1.3 key schedule (RFC 8446 Section 7.1) and the TLS 1.2 PRF
//! (RFC 5246 Section 5).
//!
//! Early Secret → Handshake Secret → Master Secret → traffic secrets. All
//! primitive calls go through the [`CryptoProvider`].

use tlsmith_crypto::hkdf::{derive_secret, hkdf_expand_label};
use tlsmith_crypto::{CipherSuiteParams, CryptoProvider, HashAlgorithm};
use tlsmith_types::EngineError;
use zeroize::Zeroize;

/// Current stage of the TLS 1.3 key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScheduleStage {
    Initial,
    EarlySecret,
    HandshakeSecret,
    MasterSecret,
}

fn wrong_stage(step: &str) -> EngineError {
    EngineError::ApplyFailed {
        unit: "KeySchedule",
        reason: format!("{step}: wrong stage"),
    }
}

/// TLS 1.3 key schedule state. Secret material is zeroized on drop.
pub struct KeySchedule {
    params: CipherSuiteParams,
    stage: KeyScheduleStage,
    current_secret: Vec<u8>,
}

impl Drop for KeySchedule {
    fn drop(&mut self) {
        self.current_secret.zeroize();
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule")
            .field("suite", &self.params.suite)
            .field("stage", &self.stage)
            .finish_non_exhaustive()
    }
}

impl KeySchedule {
    pub fn new(params: CipherSuiteParams) -> Self {
        Self {
            params,
            stage: KeyScheduleStage::Initial,
            current_secret: Vec::new(),
        }
    }

    pub fn stage(&self) -> KeyScheduleStage {
        self.stage
    }

    pub fn params(&self) -> &CipherSuiteParams {
        &self.params
    }

    fn hash(&self) -> HashAlgorithm {
        self.params.hash
    }

    /// Initial → EarlySecret. `None` means no PSK (zero IKM).
    pub fn derive_early_secret(
        &mut self,
        crypto: &dyn CryptoProvider,
        psk: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        if self.stage != KeyScheduleStage::Initial {
            return Err(wrong_stage("derive_early_secret"));
        }
        let zero_psk = vec![0u8; self.params.hash_len()];
        let ikm = psk.unwrap_or(&zero_psk);
        self.current_secret = crypto.hkdf_extract(self.hash(), &[], ikm)?;
        self.stage = KeyScheduleStage::EarlySecret;
        Ok(())
    }

    /// EarlySecret → HandshakeSecret, from the (EC)DHE shared secret.
    pub fn derive_handshake_secret(
        &mut self,
        crypto: &dyn CryptoProvider,
        shared_secret: &[u8],
    ) -> Result<(), EngineError> {
        if self.stage != KeyScheduleStage::EarlySecret {
            return Err(wrong_stage("derive_handshake_secret"));
        }
        let empty_hash = crypto.hash(self.hash(), b"")?;
        let mut salt = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"derived",
            &empty_hash,
        )?;
        self.current_secret.zeroize();
        self.current_secret = crypto.hkdf_extract(self.hash(), &salt, shared_secret)?;
        salt.zeroize();
        self.stage = KeyScheduleStage::HandshakeSecret;
        Ok(())
    }

    /// `(client, server)` handshake traffic secrets for Hash(ClientHello..ServerHello).
    pub fn derive_handshake_traffic_secrets(
        &self,
        crypto: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        if self.stage != KeyScheduleStage::HandshakeSecret {
            return Err(wrong_stage("derive_handshake_traffic_secrets"));
        }
        let client = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"c hs traffic",
            transcript_hash,
        )?;
        let server = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"s hs traffic",
            transcript_hash,
        )?;
        Ok((client, server))
    }

    /// HandshakeSecret → MasterSecret.
    pub fn derive_master_secret(&mut self, crypto: &dyn CryptoProvider) -> Result<(), EngineError> {
        if self.stage != KeyScheduleStage::HandshakeSecret {
            return Err(wrong_stage("derive_master_secret"));
        }
        let empty_hash = crypto.hash(self.hash(), b"")?;
        let mut salt = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"derived",
            &empty_hash,
        )?;
        let zero_ikm = vec![0u8; self.params.hash_len()];
        self.current_secret.zeroize();
        self.current_secret = crypto.hkdf_extract(self.hash(), &salt, &zero_ikm)?;
        salt.zeroize();
        self.stage = KeyScheduleStage::MasterSecret;
        Ok(())
    }

    /// `(client, server)` application traffic secrets for
    /// Hash(ClientHello..server Finished).
    pub fn derive_app_traffic_secrets(
        &self,
        crypto: &dyn CryptoProvider,
        transcript_hash: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
        if self.stage != KeyScheduleStage::MasterSecret {
            return Err(wrong_stage("derive_app_traffic_secrets"));
        }
        let client = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"c ap traffic",
            transcript_hash,
        )?;
        let server = derive_secret(
            crypto,
            self.hash(),
            &self.current_secret,
            b"s ap traffic",
            transcript_hash,
        )?;
        Ok((client, server))
    }

    /// `finished_key = HKDF-Expand-Label(base_key, "finished", "", Hash.length)`.
    pub fn derive_finished_key(
        &self,
        crypto: &dyn CryptoProvider,
        base_key: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        Ok(hkdf_expand_label(
            crypto,
            self.hash(),
            base_key,
            b"finished",
            b"",
            self.params.hash_len(),
        )?)
    }

    /// `verify_data = HMAC(finished_key, transcript_hash)`.
    pub fn compute_finished_verify_data(
        &self,
        crypto: &dyn CryptoProvider,
        finished_key: &[u8],
        transcript_hash: &[u8],
    ) -> Result<Vec<u8>, EngineError> {
        Ok(crypto.hmac(self.hash(), finished_key, transcript_hash)?)
    }
}

/// AEAD key and IV derived from a traffic secret.
pub struct TrafficKeys {
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl Drop for TrafficKeys {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
    }
}

impl TrafficKeys {
    /// ```text
    /// key = HKDF-Expand-Label(secret, "key", "", key_length)
    /// iv  = HKDF-Expand-Label(secret, "iv", "", iv_length)
    /// ```
    pub fn derive(
        crypto: &dyn CryptoProvider,
        params: &CipherSuiteParams,
        traffic_secret: &[u8],
    ) -> Result<Self, EngineError> {
        let key = hkdf_expand_label(
            crypto,
            params.hash,
            traffic_secret,
            b"key",
            b"",
            params.key_len(),
        )?;
        let iv = hkdf_expand_label(
            crypto,
            params.hash,
            traffic_secret,
            b"iv",
            b"",
            params.iv_len(),
        )?;
        Ok(Self { key, iv })
    }
}

/// TLS 1.2 PRF: `P_hash(secret, label + seed)` truncated to `output_len`.
pub fn prf(
    crypto: &dyn CryptoProvider,
    hash: HashAlgorithm,
    secret: &[u8],
    label: &str,
    seed: &[u8],
    output_len: usize,
) -> Result<Vec<u8>, EngineError> {
    let mut label_seed = Vec::with_capacity(label.len() + seed.len());
    label_seed.extend_from_slice(label.as_bytes());
    label_seed.extend_from_slice(seed);

    let mut result = Vec::with_capacity(output_len);
    // A(0) = seed
    let mut a = label_seed.clone();
    while result.len() < output_len {
        a = crypto.hmac(hash, secret, &a)?;
        let mut ai_seed = Vec::with_capacity(a.len() + label_seed.len());
        ai_seed.extend_from_slice(&a);
        ai_seed.extend_from_slice(&label_seed);
        result.extend_from_slice(&crypto.hmac(hash, secret, &ai_seed)?);
    }
    result.truncate(output_len);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlsmith_crypto::RustCryptoProvider;
    use tlsmith_types::CipherSuite;

    fn hex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    fn params() -> CipherSuiteParams {
        CipherSuiteParams::from_suite(CipherSuite::TLS_AES_128_GCM_SHA256).unwrap()
    }

    // RFC 8448 Section 3: Simple 1-RTT Handshake (TLS_AES_128_GCM_SHA256)
    #[test]
    fn test_full_key_schedule_rfc8448() {
        let crypto = RustCryptoProvider::new();
        let mut ks = KeySchedule::new(params());

        ks.derive_early_secret(&crypto, None).unwrap();
        assert_eq!(
            ks.current_secret,
            hex("33ad0a1c607ec03b09e6cd9893680ce210adf300aa1f2660e1b22e10f170f92a")
        );

        let dhe = hex("8bd4054fb55b9d63fdfbacf9f04b9f0d35e6d63f537563efd46272900f89492d");
        ks.derive_handshake_secret(&crypto, &dhe).unwrap();
        assert_eq!(
            ks.current_secret,
            hex("1dc826e93606aa6fdc0aadc12f741b01046aa6b99f691ed221a9f0ca043fbeac")
        );

        let th = hex("860c06edc07858ee8e78f0e7428c58edd6b43f2ca3e6e95f02ed063cf0e1cad8");
        let (client_hs, server_hs) = ks.derive_handshake_traffic_secrets(&crypto, &th).unwrap();
        assert_eq!(
            client_hs,
            hex("b3eddb126e067f35a780b3abf45e2d8f3b1a950738f52e9600746a0e27a55a21")
        );
        assert_eq!(
            server_hs,
            hex("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38")
        );

        ks.derive_master_secret(&crypto).unwrap();
        assert_eq!(ks.stage(), KeyScheduleStage::MasterSecret);
        assert_eq!(
            ks.current_secret,
            hex("18df06843d13a08bf2a449844c5f8a478001bc4d4c627984d5a41da8d0402919")
        );

        let th = hex("9608102a0f1ccc6db6250b7b7e417b1a000eaada3daae4777a7686c9ff83df13");
        let (client_app, server_app) = ks.derive_app_traffic_secrets(&crypto, &th).unwrap();
        assert_eq!(
            client_app,
            hex("9e40646ce79a7f9dc05af8889bce6552875afa0b06df0087f792ebb7c17504a5")
        );
        assert_eq!(
            server_app,
            hex("a11af9f05531f856ad47116b45a950328204b4f44bfb6b3a4b4f1f3fcb631643")
        );
    }

    #[test]
    fn test_stage_enforcement() {
        let crypto = RustCryptoProvider::new();
        let mut ks = KeySchedule::new(params());
        assert!(ks.derive_handshake_secret(&crypto, &[0; 32]).is_err());
        assert!(ks.derive_master_secret(&crypto).is_err());
        ks.derive_early_secret(&crypto, None).unwrap();
        assert!(ks.derive_early_secret(&crypto, None).is_err());
        assert!(ks.derive_app_traffic_secrets(&crypto, &[0; 32]).is_err());
    }

    #[test]
    fn test_traffic_keys_rfc8448() {
        let crypto = RustCryptoProvider::new();
        let secret = hex("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38");
        let keys = TrafficKeys::derive(&crypto, &params(), &secret).unwrap();
        assert_eq!(keys.key, hex("3fce516009c21727d0f2e4e86ee403bc"));
        assert_eq!(keys.iv, hex("5d313eb2671276ee13000b30"));
    }

    #[test]
    fn test_finished_key_is_deterministic() {
        let crypto = RustCryptoProvider::new();
        let ks = KeySchedule::new(params());
        let base = hex("b67b7d690cc16c4e75e54213cb2d37b4e9c912bcded9105d42befd59d391ad38");
        let k1 = ks.derive_finished_key(&crypto, &base).unwrap();
        let k2 = ks.derive_finished_key(&crypto, &base).unwrap();
        assert_eq!(k1.len(), 32);
        assert_eq!(k1, k2);
        let vd = ks
            .compute_finished_verify_data(&crypto, &k1, &[0u8; 32])
            .unwrap();
        assert_eq!(vd.len(), 32);
    }

    // Widely used TLS 1.2 PRF (SHA-256) test vector.
    #[test]
    fn test_prf_sha256_known_vector() {
        let crypto = RustCryptoProvider::new();
        let out = prf(
            &crypto,
            HashAlgorithm::Sha256,
            &hex("9bbe436ba940f017b17652849a71db35"),
            "test label",
            &hex("a0ba9f936cda311827a6f796ffd5198c"),
            100,
        )
        .unwrap();
        assert_eq!(out.len(), 100);
        assert_eq!(
            &out[..32],
            hex("e3f229ba727be17b8d122620557cd453c2aab21d07c3d495329b52d4e61edb5a").as_slice()
        );
    }
}
