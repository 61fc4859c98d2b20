use tlsmith_types::{CipherSuite, EngineError, ProtocolVersion};

use super::{HandshakeHeader, HandshakeType};
use crate::extensions::{
    self, Alpn, Cookie, KeyShare, ServerName, SignatureAlgorithms, SupportedGroups,
    SupportedVersions, VersionsForm,
};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{
    len_u16, len_u8, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind,
};

/// ServerHello.random value marking a HelloRetryRequest
/// (RFC 8446 Section 4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8,
    0x91, 0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8,
    0x33, 0x9C,
];

type ExtensionList = Option<Vec<Box<dyn ProtocolUnit>>>;

fn read_opaque_u8(r: &mut Reader<'_>, len_field: &'static str, field: &'static str) -> Result<(u8, Vec<u8>), EngineError> {
    let len = r.read_u8(len_field)?;
    Ok((len, r.read_bytes(len as usize, field)?.to_vec()))
}

/// Decode a trailing extension block if any bytes remain.
fn read_extensions(
    r: &mut Reader<'_>,
    parent: UnitKind,
    state: &ConnectionState,
) -> Result<(Field<u16>, ExtensionList), EngineError> {
    if r.is_empty() {
        return Ok((Field::new(), Some(Vec::new())));
    }
    let (len, units) = extensions::decode_list(r, parent, state)?;
    Ok((Field::with_value(len), Some(units)))
}

/// Encode the extension block. A block with no length and no extensions is
/// left out entirely.
fn write_extensions(
    out: &mut Vec<u8>,
    unit: &'static str,
    length: &Field<u16>,
    list: &ExtensionList,
) -> Result<(), EngineError> {
    let units = list.as_deref().unwrap_or_default();
    if length.get().is_none() && units.is_empty() {
        return Ok(());
    }
    put_u16(out, length.require(unit, "extensions_length")?);
    out.extend_from_slice(&extensions::encode_list(units)?);
    Ok(())
}

fn compute_extensions(
    length: &mut Field<u16>,
    list: &mut ExtensionList,
    state: &ConnectionState,
    defaults: impl FnOnce() -> Vec<Box<dyn ProtocolUnit>>,
) -> Result<(), EngineError> {
    let units = list.get_or_insert_with(defaults);
    let len = extensions::compute_list(units, state)?;
    length.compute(|| len_u16(len));
    Ok(())
}

fn apply_extensions(
    list: &ExtensionList,
    state: &mut ConnectionState,
    origin: Origin,
) -> Result<(), EngineError> {
    extensions::apply_list(list.as_deref().unwrap_or_default(), state, origin)
}

// ---------------------------------------------------------------------------
// ClientHello
// ---------------------------------------------------------------------------

/// ClientHello (RFC 8446 Section 4.1.2; with the DTLS cookie of
/// RFC 6347 Section 4.2.1 when the connection is DTLS).
#[derive(Debug, Clone, Default)]
pub struct ClientHello {
    pub header: HandshakeHeader,
    pub legacy_version: Field<u16>,
    pub random: Field<Vec<u8>>,
    pub session_id_length: Field<u8>,
    pub session_id: Field<Vec<u8>>,
    /// DTLS layout (cookie present).
    pub dtls: bool,
    pub cookie_length: Field<u8>,
    pub cookie: Field<Vec<u8>>,
    pub cipher_suites_length: Field<u16>,
    pub cipher_suites: Field<Vec<u16>>,
    pub compression_methods_length: Field<u8>,
    pub compression_methods: Field<Vec<u8>>,
    pub extensions_length: Field<u16>,
    /// `None` until compute-defaults fills the configured set.
    pub extensions: ExtensionList,
}

impl ClientHello {
    pub fn with_extensions(extensions: Vec<Box<dyn ProtocolUnit>>) -> Self {
        Self {
            extensions: Some(extensions),
            ..Self::default()
        }
    }

    /// Client forms throughout, whichever role builds the hello.
    fn default_extensions(state: &ConnectionState) -> Vec<Box<dyn ProtocolUnit>> {
        let config = state.config();
        let mut list: Vec<Box<dyn ProtocolUnit>> = Vec::new();
        if let Some(name) = &config.server_name {
            list.push(Box::new(ServerName::host(name)));
        }
        list.push(Box::new(SupportedGroups::default()));
        list.push(Box::new(SignatureAlgorithms::default()));
        if !config.alpn_protocols.is_empty() {
            list.push(Box::new(Alpn::offer(&config.alpn_protocols)));
        }
        if config.supported_versions.iter().any(|v| v.is_tls13()) {
            list.push(Box::new(SupportedVersions::list()));
            list.push(Box::new(KeyShare::client()));
            if state.negotiated().hello_retry_cookie.is_some() {
                list.push(Box::new(Cookie::default()));
            }
        }
        list
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        const NAME: &str = ClientHello::NAME;
        let mut out = Vec::with_capacity(128);
        put_u16(&mut out, self.legacy_version.require(NAME, "legacy_version")?);
        out.extend_from_slice(&self.random.require(NAME, "random")?);
        out.push(self.session_id_length.require(NAME, "session_id_length")?);
        out.extend_from_slice(&self.session_id.require(NAME, "session_id")?);
        if self.dtls {
            out.push(self.cookie_length.require(NAME, "cookie_length")?);
            out.extend_from_slice(&self.cookie.require(NAME, "cookie")?);
        }
        put_u16(&mut out, self.cipher_suites_length.require(NAME, "cipher_suites_length")?);
        for suite in self.cipher_suites.require(NAME, "cipher_suites")? {
            put_u16(&mut out, suite);
        }
        out.push(
            self.compression_methods_length
                .require(NAME, "compression_methods_length")?,
        );
        out.extend_from_slice(&self.compression_methods.require(NAME, "compression_methods")?);
        write_extensions(&mut out, NAME, &self.extensions_length, &self.extensions)?;
        Ok(out)
    }
}

impl RegisteredUnit for ClientHello {
    const KIND: UnitKind = HandshakeType::CLIENT_HELLO.kind();
    const NAME: &'static str = "ClientHello";

    fn decode(r: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let dtls = state.is_dtls();
        let legacy_version = body.read_u16("legacy_version")?;
        let random = body.read_bytes(32, "random")?.to_vec();
        let (session_id_length, session_id) =
            read_opaque_u8(&mut body, "session_id_length", "session_id")?;
        let mut hello = Self {
            header,
            legacy_version: Field::with_value(legacy_version),
            random: Field::with_value(random),
            session_id_length: Field::with_value(session_id_length),
            session_id: Field::with_value(session_id),
            dtls,
            ..Self::default()
        };
        if dtls {
            let (len, cookie) = read_opaque_u8(&mut body, "cookie_length", "cookie")?;
            hello.cookie_length.set(len);
            hello.cookie.set(cookie);
        }
        let suites_len = body.read_u16("cipher_suites_length")?;
        let mut suites = body.sub_reader(suites_len as usize, "cipher_suites")?;
        let mut list = Vec::with_capacity(suites_len as usize / 2);
        while !suites.is_empty() {
            list.push(suites.read_u16("cipher_suite")?);
        }
        hello.cipher_suites_length.set(suites_len);
        hello.cipher_suites.set(list);
        let (compression_len, compression) =
            read_opaque_u8(&mut body, "compression_methods_length", "compression_methods")?;
        hello.compression_methods_length.set(compression_len);
        hello.compression_methods.set(compression);
        let (extensions_length, extensions) = read_extensions(&mut body, Self::KIND, state)?;
        body.expect_end()?;
        hello.extensions_length = extensions_length;
        hello.extensions = extensions;
        Ok(hello)
    }
}

impl ProtocolUnit for ClientHello {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        let config = state.config();
        self.dtls = state.is_dtls();
        self.legacy_version.compute(|| state.record_version().0);
        self.random.fill(|| config.client_random.clone());
        self.session_id.fill(|| config.session_id.clone());
        let session_id_len = self.session_id.emitted_len();
        self.session_id_length.compute(|| len_u8(session_id_len));
        if self.dtls {
            self.cookie
                .compute(|| state.negotiated().dtls_cookie.clone().unwrap_or_default());
            let cookie_len = self.cookie.emitted_len();
            self.cookie_length.compute(|| len_u8(cookie_len));
        }
        self.cipher_suites
            .fill(|| config.cipher_suites.iter().map(|s| s.0).collect());
        let suites = self.cipher_suites.emitted_len();
        self.cipher_suites_length.compute(|| len_u16(suites * 2));
        self.compression_methods.fill(|| vec![0]);
        let methods = self.compression_methods.emitted_len();
        self.compression_methods_length.compute(|| len_u8(methods));
        compute_extensions(&mut self.extensions_length, &mut self.extensions, state, || {
            Self::default_extensions(state)
        })?;
        let body_len = self.body()?.len();
        self.header.compute(HandshakeType::CLIENT_HELLO, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Sent {
            return apply_extensions(&self.extensions, state, origin);
        }
        let random = self.random.get();
        let session_id = self.session_id.get();
        let suites: Vec<CipherSuite> = self
            .cipher_suites
            .get()
            .unwrap_or_default()
            .into_iter()
            .map(CipherSuite)
            .collect();
        let legacy = self.legacy_version.get().map(ProtocolVersion);
        state.record_negotiated("peer_random", |n| n.peer_random = random);
        state.record_negotiated("peer_session_id", |n| n.peer_session_id = session_id);
        state.record_negotiated("peer_cipher_suites", |n| n.peer_cipher_suites = suites);
        state.record_negotiated("peer_versions", |n| {
            n.peer_versions = legacy.into_iter().collect()
        });
        apply_extensions(&self.extensions, state, origin)
    }

    unit_boilerplate!(registered);
}

// ---------------------------------------------------------------------------
// ServerHello / HelloRetryRequest
// ---------------------------------------------------------------------------

/// ServerHello (RFC 8446 Section 4.1.3). A HelloRetryRequest is a
/// ServerHello with [`HELLO_RETRY_REQUEST_RANDOM`] as its random.
#[derive(Debug, Clone, Default)]
pub struct ServerHello {
    pub header: HandshakeHeader,
    pub legacy_version: Field<u16>,
    pub random: Field<Vec<u8>>,
    pub session_id_length: Field<u8>,
    pub session_id: Field<Vec<u8>>,
    pub cipher_suite: Field<u16>,
    pub compression_method: Field<u8>,
    pub extensions_length: Field<u16>,
    pub extensions: ExtensionList,
    /// Send as HelloRetryRequest.
    pub hello_retry: bool,
}

impl ServerHello {
    pub fn hello_retry_request() -> Self {
        Self {
            hello_retry: true,
            ..Self::default()
        }
    }

    /// Whether the emitted random is the HelloRetryRequest marker.
    pub fn is_hello_retry(&self) -> bool {
        self.random
            .get()
            .is_some_and(|r| r == HELLO_RETRY_REQUEST_RANDOM)
    }

    fn default_extensions(&self, state: &ConnectionState) -> Vec<Box<dyn ProtocolUnit>> {
        let mut list: Vec<Box<dyn ProtocolUnit>> = Vec::new();
        if state.is_tls13() {
            list.push(Box::new(SupportedVersions::selected(state.selected_version())));
            if self.hello_retry {
                list.push(Box::new(KeyShare::hello_retry()));
            } else {
                list.push(Box::new(KeyShare::server()));
            }
        } else if let Some(protocol) = state.selected_alpn() {
            list.push(Box::new(Alpn::offer(&[protocol])));
        }
        list
    }

    /// Version this hello selects: supported_versions if present, else the
    /// legacy field.
    fn version(&self) -> Option<ProtocolVersion> {
        self.extensions
            .iter()
            .flatten()
            .find_map(|e| e.downcast_ref::<SupportedVersions>())
            .filter(|sv| sv.form == Some(VersionsForm::Selected))
            .and_then(|sv| sv.selected.get())
            .or(self.legacy_version.get())
            .map(ProtocolVersion)
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        const NAME: &str = ServerHello::NAME;
        let mut out = Vec::with_capacity(96);
        put_u16(&mut out, self.legacy_version.require(NAME, "legacy_version")?);
        out.extend_from_slice(&self.random.require(NAME, "random")?);
        out.push(self.session_id_length.require(NAME, "session_id_length")?);
        out.extend_from_slice(&self.session_id.require(NAME, "session_id")?);
        put_u16(&mut out, self.cipher_suite.require(NAME, "cipher_suite")?);
        out.push(self.compression_method.require(NAME, "compression_method")?);
        write_extensions(&mut out, NAME, &self.extensions_length, &self.extensions)?;
        Ok(out)
    }
}

impl RegisteredUnit for ServerHello {
    const KIND: UnitKind = HandshakeType::SERVER_HELLO.kind();
    const NAME: &'static str = "ServerHello";

    fn decode(r: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let legacy_version = body.read_u16("legacy_version")?;
        let random = body.read_bytes(32, "random")?.to_vec();
        let (session_id_length, session_id) =
            read_opaque_u8(&mut body, "session_id_length", "session_id")?;
        let cipher_suite = body.read_u16("cipher_suite")?;
        let compression_method = body.read_u8("compression_method")?;
        let (extensions_length, extensions) = read_extensions(&mut body, Self::KIND, state)?;
        body.expect_end()?;
        Ok(Self {
            header,
            legacy_version: Field::with_value(legacy_version),
            hello_retry: random == HELLO_RETRY_REQUEST_RANDOM,
            random: Field::with_value(random),
            session_id_length: Field::with_value(session_id_length),
            session_id: Field::with_value(session_id),
            cipher_suite: Field::with_value(cipher_suite),
            compression_method: Field::with_value(compression_method),
            extensions_length,
            extensions,
        })
    }
}

impl ProtocolUnit for ServerHello {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.legacy_version.compute(|| state.record_version().0);
        if self.hello_retry {
            self.random.compute(|| HELLO_RETRY_REQUEST_RANDOM.to_vec());
        } else {
            self.random.fill(|| state.config().server_random.clone());
        }
        self.session_id.compute(|| {
            state
                .negotiated()
                .peer_session_id
                .clone()
                .unwrap_or_default()
        });
        let session_id_len = self.session_id.emitted_len();
        self.session_id_length.compute(|| len_u8(session_id_len));
        self.cipher_suite.compute(|| state.selected_cipher_suite().0);
        self.compression_method.fill(|| 0);
        if self.extensions.is_none() {
            self.extensions = Some(self.default_extensions(state));
        }
        compute_extensions(&mut self.extensions_length, &mut self.extensions, state, Vec::new)?;
        let body_len = self.body()?.len();
        self.header.compute(HandshakeType::SERVER_HELLO, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let hello_retry = self.is_hello_retry();
        let version = self.version();
        let suite = self.cipher_suite.get().map(CipherSuite);
        let extension_result = match origin {
            Origin::Received => {
                if !hello_retry {
                    let random = self.random.get();
                    state.record_negotiated("peer_random", |n| n.peer_random = random);
                }
                let session_id = self.session_id.get();
                state.record_negotiated("peer_session_id", |n| n.peer_session_id = session_id);
                state.record_negotiated("cipher_suite", |n| n.cipher_suite = suite);
                state.record_negotiated("version", |n| n.version = version);
                apply_extensions(&self.extensions, state, origin)
            }
            Origin::Sent => {
                state.record_local("version", |l| l.version = version);
                state.record_local("cipher_suite", |l| l.cipher_suite = suite);
                apply_extensions(&self.extensions, state, origin)
            }
        };
        if hello_retry {
            state.replace_transcript_with_message_hash()?;
        } else if state.is_tls13() {
            state.derive_handshake_keys()?;
        }
        extension_result
    }

    unit_boilerplate!(registered);
}

// ---------------------------------------------------------------------------
// EncryptedExtensions
// ---------------------------------------------------------------------------

/// EncryptedExtensions (RFC 8446 Section 4.3.1).
#[derive(Debug, Clone, Default)]
pub struct EncryptedExtensions {
    pub header: HandshakeHeader,
    pub extensions_length: Field<u16>,
    pub extensions: ExtensionList,
}

impl EncryptedExtensions {
    fn default_extensions(state: &ConnectionState) -> Vec<Box<dyn ProtocolUnit>> {
        let mut list: Vec<Box<dyn ProtocolUnit>> = Vec::new();
        if state.negotiated().server_name.is_some() {
            list.push(Box::new(ServerName::acknowledgement()));
        }
        if let Some(protocol) = state.selected_alpn() {
            list.push(Box::new(Alpn::offer(&[protocol])));
        }
        list
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        let units = self.extensions.as_deref().unwrap_or_default();
        put_u16(&mut out, self.extensions_length.require(Self::NAME, "extensions_length")?);
        out.extend_from_slice(&extensions::encode_list(units)?);
        Ok(out)
    }
}

impl RegisteredUnit for EncryptedExtensions {
    const KIND: UnitKind = HandshakeType::ENCRYPTED_EXTENSIONS.kind();
    const NAME: &'static str = "EncryptedExtensions";

    fn decode(r: &mut Reader<'_>, state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = HandshakeHeader::read(r)?;
        let (len, units) = extensions::decode_list(&mut body, Self::KIND, state)?;
        body.expect_end()?;
        Ok(Self {
            header,
            extensions_length: Field::with_value(len),
            extensions: Some(units),
        })
    }
}

impl ProtocolUnit for EncryptedExtensions {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        compute_extensions(&mut self.extensions_length, &mut self.extensions, state, || {
            Self::default_extensions(state)
        })?;
        let body_len = self.body()?.len();
        self.header
            .compute(HandshakeType::ENCRYPTED_EXTENSIONS, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        apply_extensions(&self.extensions, state, origin)
    }

    unit_boilerplate!(registered);
}
