use tlsmith_types::EngineError;

use super::{ExtensionHeader, ExtensionType};
use crate::state::ConnectionState;
use crate::unit::codec::put_u16;
use crate::unit::{len_u16, Field, Origin, ProtocolUnit, Reader, RegisteredUnit, UnitKind};
use crate::Role;

/// cookie (RFC 8446 Section 4.2.2). Sent by a server in HelloRetryRequest
/// and echoed by the client in its second ClientHello.
#[derive(Debug, Clone, Default)]
pub struct Cookie {
    pub header: ExtensionHeader,
    pub cookie_length: Field<u16>,
    pub cookie: Field<Vec<u8>>,
}

impl Cookie {
    fn body(&self) -> Result<Vec<u8>, EngineError> {
        let cookie = self.cookie.require(Self::NAME, "cookie")?;
        let mut out = Vec::with_capacity(2 + cookie.len());
        put_u16(&mut out, self.cookie_length.require(Self::NAME, "cookie_length")?);
        out.extend_from_slice(&cookie);
        Ok(out)
    }
}

impl RegisteredUnit for Cookie {
    const KIND: UnitKind = ExtensionType::COOKIE.kind();
    const NAME: &'static str = "Cookie";

    fn decode(r: &mut Reader<'_>, _state: &ConnectionState) -> Result<Self, EngineError> {
        let (header, mut body) = ExtensionHeader::read(r)?;
        let cookie_length = body.read_u16("cookie_length")?;
        let cookie = body.read_bytes(cookie_length as usize, "cookie")?.to_vec();
        body.expect_end()?;
        Ok(Self {
            header,
            cookie_length: Field::with_value(cookie_length),
            cookie: Field::with_value(cookie),
        })
    }
}

impl ProtocolUnit for Cookie {
    fn compute_defaults(&mut self, state: &ConnectionState) -> Result<(), EngineError> {
        self.cookie.fill(|| match state.role() {
            Role::Client => state
                .negotiated()
                .hello_retry_cookie
                .clone()
                .unwrap_or_default(),
            Role::Server => state.config().dtls_cookie.clone(),
        });
        let len = self.cookie.emitted_len();
        self.cookie_length.compute(|| len_u16(len));
        let body_len = self.body()?.len();
        self.header.compute(ExtensionType::COOKIE, body_len);
        Ok(())
    }

    fn encode(&self) -> Result<Vec<u8>, EngineError> {
        self.header.write(Self::NAME, &self.body()?)
    }

    fn apply(&self, state: &mut ConnectionState, origin: Origin) -> Result<(), EngineError> {
        if origin == Origin::Received && state.role() == Role::Client {
            let cookie = self.cookie.get();
            state.record_negotiated("hello_retry_cookie", |n| n.hello_retry_cookie = cookie);
        }
        Ok(())
    }

    unit_boilerplate!(registered);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn test_client_echoes_retry_cookie() {
        let mut client = ConnectionState::new(EngineConfig::default());
        let server =
            ConnectionState::new(EngineConfig::builder().role(Role::Server).dtls_cookie(vec![7, 8]).build().unwrap());

        let mut sent = Cookie::default();
        sent.compute_defaults(&server).unwrap();
        let bytes = sent.encode().unwrap();
        assert_eq!(bytes, [0, 44, 0, 4, 0, 2, 7, 8]);

        let received = client.registry().decode(Cookie::KIND, &bytes, &client).unwrap();
        received.apply(&mut client, Origin::Received).unwrap();
        let mut echo = Cookie::default();
        echo.compute_defaults(&client).unwrap();
        assert_eq!(echo.encode().unwrap(), bytes);
    }
}
