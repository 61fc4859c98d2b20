use tlsmith_types::{EngineError, NamedGroup};

use super::{ExtensionHeader, ExtensionType, HelloContext};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// Body layout of key_share (RFC 8446 Section 4.2.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyShareForm {
    /// ClientHello: list of entries.
    Client,
    /// ServerHello: one entry.
    Server,
    /// HelloRetryRequest: the selected group only.
    HelloRetry,
}

/// One KeyShareEntry.
#[derive(Debug, Clone, Default)]
pub struct KeyShareEntry {
    pub group: Field<u16>,
    pub key_exchange_length: Field<u16>,
    pub key_exchange: Field<Vec<u8>>,
}

impl KeyShareEntry {
    pub fn new(group: NamedGroup, key_exchange: Vec<u8>) -> Self {
        Self {
            group: Field::with_value(group.0),
            key_exchange_length: Field::new(),
            key_exchange: Field::with_value(key_exchange),
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, EngineError> {
        let group = r.read_u16("group")?;
        let len = r.read_u16("key_exchange_length")?;
        let key = r.read_bytes(len as usize, "key_exchange")?.to_vec();
        Ok(Self {
            group: Field::with_value(group),
            key_exchange_length: Field::with_value(len),
            key_exchange: Field::with_value(key),
        })
    }

    fn compute(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.group.fill(|| state.selected_group().0);
        if self.key_exchange.value().is_none() {
            let group = NamedGroup(self.group.require(KeyShare::NAME, "group")?);
            self.key_exchange
                .try_compute(|| state.key_share_public_for(group))?;
        }
        let len = self.key_exchange.emitted_len();
        self.key_exchange_length.compute(|| len_u16(len));
        Ok(())
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<(), EngineError> {
        put_u16(out, self.group.require(KeyShare::NAME, "group")?);
        put_u16(
            out,
            self.key_exchange_length
                .require(KeyShare::NAME, "key_exchange_length")?,
        );
        out.extend_from_slice(&self.key_exchange.require(KeyShare::NAME, "key_exchange")?);
        Ok(())
    }
}

/// key_share in any of its three forms.
#[derive(Debug, Clone, Default)]
pub struct KeyShare {
    pub header: ExtensionHeader,
    /// Set by the carrying message; compute-defaults falls back to the
    /// local role when a standalone extension leaves it unset.
    pub form: Option<KeyShareForm>,
    /// Client form only.
    pub client_shares_length: Field<u16>,
    /// Client form: every entry. Server form: exactly one.
    pub entries: Vec<KeyShareEntry>,
    /// HelloRetryRequest form only.
    pub selected_group: Field<u16>,
}

impl KeyShare {
    pub fn client() -> Self {
        Self {
            form: Some(KeyShareForm::Client),
            ..Self::default()
        }
    }

    pub fn server() -> Self {
        Self {
            form: Some(KeyShareForm::Server),
            ..Self::default()
        }
    }

    pub fn hello_retry() -> Self {
        Self {
            form: Some(KeyShareForm::HelloRetry),
            ..Self::default()
        }
    }

    fn entries_bytes(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        for entry in &self.entries {
            entry.write(&mut out)?;
        }
        Ok(out)
    }

    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        match self.form.unwrap_or(KeyShareForm::Client) {
            KeyShareForm::Client => {
                put_u16(
                    &mut out,
                    self.client_shares_length
                        .require(Self::NAME, "client_shares_length")?,
                );
                out.extend_from_slice(&self.entries_bytes()?);
            }
            KeyShareForm::Server => {
                let entry = self
                    .entries
                    .first()
                    .ok_or(EngineError::MissingField {
                        unit: Self::NAME,
                        field: "server_share",
                    })?;
                entry.write(&mut out)?;
            }
            KeyShareForm::HelloRetry => {
                put_u16(&mut out, self.selected_group.require(Self::NAME, "selected_group")?);
            }
        }
        Ok(out)
    }

    /// The entry a server uses: the first for a configured group, else the
    /// first offered.
    fn preferred_entry(&self, state: &ConnectionState) -> Option<&KeyShareEntry> {
        let configured = &state.config().named_groups;
        self.entries
            .iter()
            .find(|e| {
                e.group
                    .get()
                    .is_some_and(|g| configured.contains(&NamedGroup(g)))
            })
            .or(self.entries.first())
    }
}

/// Form of a body read without a carrying message. A two-byte body is a
/// selected group; a body whose leading u16 spans the rest is a client list;
/// anything else is a single server entry.
fn infer_form(body: &Reader<'_>) -> KeyShareForm {
    let data = body.data();
    match data {
        [_, _] => KeyShareForm::HelloRetry,
        [hi, lo, rest @ ..] if usize::from(u16::from_be_bytes([*hi, *lo])) == rest.len() => {
            KeyShareForm::Client
        }
        _ => KeyShareForm::Server,
    }
}

impl RegisteredUnit for KeyShare {
    const KIND: UnitKind = ExtensionType::KEY_SHARE.kind();
    const NAME: &'static str = "KeyShare";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let context = HelloContext::of(r);
        let (header, mut body) = ExtensionHeader::read(r)?;
        let form = match context {
            HelloContext::ServerHello if body.remaining() == 2 => KeyShareForm::HelloRetry,
            HelloContext::ServerHello => KeyShareForm::Server,
            HelloContext::Other => infer_form(&body),
            HelloContext::ClientHello | HelloContext::EncryptedExtensions => KeyShareForm::Client,
        };
        let mut ext = Self {
            header,
            form: Some(form),
            ..Self::default()
        };
        match form {
            KeyShareForm::Client => {
                let len = body.read_u16("client_shares_length")?;
                let mut list = body.sub_reader(len as usize, "client_shares")?;
                while !list.is_empty() {
                    ext.entries.push(KeyShareEntry::read(&mut list)?);
                }
                ext.client_shares_length.set(len);
            }
            KeyShareForm::Server => ext.entries.push(KeyShareEntry::read(&mut body)?),
            KeyShareForm::HelloRetry => ext.selected_group.set(body.read_u16("selected_group")?),
        }
        body.expect_end()?;
        Ok(ext)
    }
}

impl ProtocolUnit for KeyShare {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        let form = *self.form.get_or_insert(match state.role() {
            Role::Client => KeyShareForm::Client,
            Role::Server => KeyShareForm::Server,
        });
        match form {
            KeyShareForm::Client | KeyShareForm::Server => {
                if self.entries.is_empty() {
                    self.entries.push(KeyShareEntry::default());
                }
                for entry in &mut self.entries {
                    entry.compute(state)?;
                }
                if form == KeyShareForm::Client {
                    let len = self.entries_bytes()?.len();
                    self.client_shares_length.compute(|| len_u16(len));
                }
            }
            KeyShareForm::HelloRetry => {
                self.selected_group.compute(|| state.hello_retry_group().0);
            }
        }
        let body_len = self.body()?.len();
        self.header.compute(ExtensionType::KEY_SHARE, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        let form = self.form.unwrap_or(KeyShareForm::Client);
        match (origin, form) {
            (Origin::Received, KeyShareForm::Client) => {
                if let Some(entry) = self.preferred_entry(state) {
                    let group = entry.group.get().map(NamedGroup);
                    let key = entry.key_exchange.get();
                    state.record_negotiated("peer_key_share", |n| {
                        n.peer_key_share_group = group;
                        n.peer_key_share = key;
                    });
                }
            }
            (Origin::Received, KeyShareForm::Server) => {
                let entry = self.entries.first().ok_or_else(|| EngineError::ApplyFailed {
                    unit: Self::NAME,
                    reason: "server key share without entry".into(),
                })?;
                let group = entry.group.get().map(NamedGroup);
                let key = entry.key_exchange.get();
                state.record_negotiated("peer_key_share", |n| {
                    n.named_group = group;
                    n.peer_key_share_group = group;
                    n.peer_key_share = key;
                });
            }
            (Origin::Received, KeyShareForm::HelloRetry) => {
                let group = self.selected_group.get().map(NamedGroup);
                state.record_negotiated("hello_retry_group", |n| n.hello_retry_group = group);
            }
            (Origin::Sent, KeyShareForm::Server) => {
                let group = self.entries.first().and_then(|e| e.group.get()).map(NamedGroup);
                state.record_local("named_group", |l| l.named_group = group);
            }
            (Origin::Sent, KeyShareForm::HelloRetry) => {
                let group = self.selected_group.get().map(NamedGroup);
                state.record_local("named_group", |l| l.named_group = group);
            }
            (Origin::Sent, KeyShareForm::Client) => {}
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}
