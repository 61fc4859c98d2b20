//! Ordered composition of layers for one connection.

use std::time::Duration;

use tlsmith_types::EngineError;
use tracing::{debug, trace};

use super::{
    DtlsFragmentLayer, HttpLayer, LayerConfiguration, LayerResult, LayerType, MessageLayer,
    ProtocolLayer, QuicFrameLayer, ReceivePolicy, RecordLayer, TransportLayer,
};
use crate::state::ConnectionState;
use crate::transport::Transport;
use crate::unit::{ProtocolUnit, UnitKind};

/// Layers of one connection, top first; the last one owns the transport.
#[derive(Debug)]
pub struct LayerStack {
    layers: Vec<Box<dyn ProtocolLayer>>,
}

impl LayerStack {
    pub fn new(layers: Vec<Box<dyn ProtocolLayer>>) -> Self {
        Self { layers }
    }

    /// Message over records over a byte stream.
    pub fn tls(transport: Box<dyn Transport>) -> Self {
        Self::new(vec![
            Box::new(MessageLayer::new()),
            Box::new(RecordLayer::new()),
            Box::new(TransportLayer::new(transport)),
        ])
    }

    /// Message over DTLS fragments over records over datagrams.
    pub fn dtls(transport: Box<dyn Transport>) -> Self {
        Self::new(vec![
            Box::new(MessageLayer::new()),
            Box::new(DtlsFragmentLayer::new()),
            Box::new(RecordLayer::new()),
            Box::new(TransportLayer::new(transport)),
        ])
    }

    /// HTTP over TLS.
    pub fn https(transport: Box<dyn Transport>) -> Self {
        Self::new(vec![
            Box::new(HttpLayer::new()),
            Box::new(MessageLayer::new()),
            Box::new(RecordLayer::new()),
            Box::new(TransportLayer::new(transport)),
        ])
    }

    /// Handshake messages in QUIC CRYPTO frames over datagrams.
    pub fn quic(transport: Box<dyn Transport>) -> Self {
        Self::new(vec![
            Box::new(MessageLayer::new()),
            Box::new(QuicFrameLayer::new()),
            Box::new(TransportLayer::new(transport)),
        ])
    }

    pub fn layer_types(&self) -> Vec<LayerType> {
        self.layers.iter().map(|l| l.layer_type()).collect()
    }

    pub fn index_of(&self, layer: LayerType) -> Option<usize> {
        self.layers.iter().position(|l| l.layer_type() == layer)
    }

    /// The layer that owns units of `kind`.
    pub fn owner_of(&self, kind: UnitKind) -> Option<LayerType> {
        self.layers
            .iter()
            .find(|l| l.owns(kind.family))
            .map(|l| l.layer_type())
    }

    fn require_index(&self, layer: LayerType) -> Result<usize, EngineError> {
        self.index_of(layer).ok_or_else(|| {
            EngineError::Layer(format!("no {layer:?} layer in stack {:?}", self.layer_types()))
        })
    }

    /// Start recording a new action on every layer.
    pub fn begin_action(&mut self) {
        for layer in &mut self.layers {
            layer.begin_action();
        }
    }

    /// Send the units of every `Send` configuration. The top-most configured
    /// layer sends its units; units configured for layers beneath it are
    /// staged as framing templates and whatever is left of them is flushed
    /// afterwards, top down.
    pub fn send(
        &mut self,
        configs: Vec<LayerConfiguration>,
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let mut planned: Vec<(usize, Vec<Box<dyn ProtocolUnit>>)> = Vec::new();
        for config in configs {
            match config {
                LayerConfiguration::Send { layer, units } => {
                    planned.push((self.require_index(layer)?, units));
                }
                LayerConfiguration::Receive { layer, .. } => {
                    debug!(?layer, "receive configuration ignored while sending");
                }
            }
        }
        planned.sort_by_key(|(index, _)| *index);
        let mut planned = planned.into_iter();
        let Some((top, units)) = planned.next() else {
            return Ok(());
        };
        for (index, units) in planned {
            self.layers[index].stage_units(units);
        }
        trace!(layer = ?self.layers[top].layer_type(), units = units.len(), "send");
        let (layer, lower) = split_at(&mut self.layers, top)?;
        layer.send_units(units, lower, state)?;
        for index in top + 1..self.layers.len() {
            let (layer, lower) = split_at(&mut self.layers, index)?;
            layer.flush_staged(lower, state)?;
        }
        Ok(())
    }

    /// Drive the top-most `Receive` configuration until its policy is
    /// finished or its timeout elapses. Layers beneath record what they
    /// processed along the way. When the receive ends on the timeout,
    /// buffered bytes that never formed a frame are surfaced as opaque
    /// units.
    pub fn receive(
        &mut self,
        configs: &[LayerConfiguration],
        state: &mut ConnectionState,
    ) -> Result<(), EngineError> {
        let mut driver: Option<(usize, &[UnitKind], &ReceivePolicy, Duration)> = None;
        for config in configs {
            if let LayerConfiguration::Receive {
                layer,
                expected,
                policy,
                timeout,
            } = config
            {
                let index = self.require_index(*layer)?;
                if driver.map_or(true, |(top, ..)| index < top) {
                    let timeout = timeout.unwrap_or(state.config().receive_timeout);
                    driver = Some((index, expected, policy, timeout));
                }
            }
        }
        let Some((top, expected, policy, timeout)) = driver else {
            return Ok(());
        };
        let (layer, lower) = split_at(&mut self.layers, top)?;
        let timed_out = layer.receive_units(policy, expected, timeout, lower, state)?;
        if timed_out {
            for layer in &mut self.layers[top..] {
                layer.drain_partial();
            }
        }
        Ok(())
    }

    /// What every layer processed in the current action, top first.
    pub fn take_results(&mut self) -> Vec<LayerResult> {
        self.layers.iter_mut().map(|l| l.take_processed()).collect()
    }

    /// Resend the last flight through the first layer that keeps one.
    pub fn retransmit(&mut self, state: &mut ConnectionState) -> Result<bool, EngineError> {
        for index in 0..self.layers.len() {
            let (layer, lower) = split_at(&mut self.layers, index)?;
            if layer.retransmit(lower, state)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Release the transport. Idempotent.
    pub fn close(&mut self) {
        for layer in &mut self.layers {
            layer.close();
        }
    }
}

fn split_at(
    layers: &mut [Box<dyn ProtocolLayer>],
    index: usize,
) -> Result<(&mut Box<dyn ProtocolLayer>, &mut [Box<dyn ProtocolLayer>]), EngineError> {
    layers
        .get_mut(index..)
        .and_then(|rest| rest.split_first_mut())
        .ok_or_else(|| EngineError::Layer(format!("no layer at position {index}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handshake::{ClientHello, HandshakeType};
    use crate::http::HttpRequest;
    use crate::record::Record;
    use crate::transport::{MemoryTransport, TransportChunk};
    use crate::unit::{Override, RegisteredUnit, UnitFamily};
    use crate::Role;

    fn states() -> (ConnectionState, ConnectionState) {
        let config = EngineConfig::default();
        (
            ConnectionState::new(config.clone()),
            ConnectionState::new(config.with_role(Role::Server)),
        )
    }

    #[test]
    fn test_constructors_and_ownership() {
        let (a, _b) = MemoryTransport::pair();
        let stack = LayerStack::https(Box::new(a));
        assert_eq!(
            stack.layer_types(),
            [LayerType::Http, LayerType::Message, LayerType::Record, LayerType::Transport]
        );
        assert_eq!(stack.owner_of(HttpRequest::KIND), Some(LayerType::Http));
        assert_eq!(
            stack.owner_of(HandshakeType::FINISHED.kind()),
            Some(LayerType::Message)
        );
        assert_eq!(stack.owner_of(UnitKind::opaque(UnitFamily::QuicFrame)), None);
        assert!(stack.index_of(LayerType::DtlsFragment).is_none());
    }

    #[test]
    fn test_send_with_record_template_and_receive() {
        let (a, b) = MemoryTransport::pair();
        let (mut client, mut server) = states();
        let mut left = LayerStack::tls(Box::new(a));
        let mut right = LayerStack::tls(Box::new(b));

        let mut record = Record::new();
        record.version.set_override(Override::Explicit(0x0301));
        left.begin_action();
        left.send(
            vec![
                LayerConfiguration::send(LayerType::Record, vec![Box::new(record)]),
                LayerConfiguration::send(LayerType::Message, vec![Box::new(ClientHello::default())]),
            ],
            &mut client,
        )
        .unwrap();
        let sent = left.take_results();
        assert_eq!(sent[0].kinds(), [HandshakeType::CLIENT_HELLO.kind()]);
        assert_eq!(sent[1].kinds(), [Record::KIND]);
        assert_eq!(sent[2].kinds(), [TransportChunk::KIND]);

        right.begin_action();
        let configs = [LayerConfiguration::receive(
            LayerType::Message,
            vec![HandshakeType::CLIENT_HELLO.kind()],
        )];
        right.receive(&configs, &mut server).unwrap();
        let received = right.take_results();
        assert!(configs[0].is_satisfied(&received[0].kinds()));
        let record = received[1].units[0].downcast_ref::<Record>().unwrap();
        assert_eq!(record.version.get(), Some(0x0301));
    }

    #[test]
    fn test_receive_timeout_returns_partial_list() {
        let (a, b) = MemoryTransport::pair();
        let (mut client, mut server) = states();
        let mut left = LayerStack::tls(Box::new(a));
        let mut right = LayerStack::tls(Box::new(b));

        left.send(
            vec![LayerConfiguration::send(
                LayerType::Message,
                vec![Box::new(ClientHello::default())],
            )],
            &mut client,
        )
        .unwrap();

        right.begin_action();
        let configs = [LayerConfiguration::receive(
            LayerType::Message,
            vec![
                HandshakeType::CLIENT_HELLO.kind(),
                HandshakeType::FINISHED.kind(),
            ],
        )
        .with_timeout(Duration::from_millis(50))];
        right.receive(&configs, &mut server).unwrap();
        let received = right.take_results();
        assert_eq!(received[0].kinds(), [HandshakeType::CLIENT_HELLO.kind()]);
        assert!(!configs[0].is_satisfied(&received[0].kinds()));
    }

    #[test]
    fn test_unknown_layer_is_an_error() {
        let (a, _b) = MemoryTransport::pair();
        let (mut client, _) = states();
        let mut stack = LayerStack::tls(Box::new(a));
        let err = stack
            .send(vec![LayerConfiguration::send(LayerType::Http, vec![])], &mut client)
            .unwrap_err();
        assert!(matches!(err, EngineError::Layer(_)));
        assert!(!stack.retransmit(&mut client).unwrap());
        stack.close();
        stack.close();
    }
}
