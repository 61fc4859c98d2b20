//! Integration tests for tlsmith.
//! A client and a server executor run scripted workflows against each other
//! over loopback sockets and in-memory transports.

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener};
    use std::thread;
    use std::time::Duration;

    use tlsmith_engine::alert::Alert;
    use tlsmith_engine::handshake::{
        Certificate, CertificateVerify, ClientHello, EncryptedExtensions, Finished, HandshakeType,
        HelloVerifyRequest, ServerHello, ServerHelloDone, ServerKeyExchange,
    };
    use tlsmith_engine::http::{HttpRequest, HttpResponse};
    use tlsmith_engine::message::{ApplicationData, ChangeCipherSpec};
    use tlsmith_engine::quic::{ConnectionClose, Ping};
    use tlsmith_engine::transport::{MemoryTransport, TcpTransport, UdpTransport};
    use tlsmith_engine::unit::RegisteredUnit;
    use tlsmith_engine::workflow::UnitSelector;
    use tlsmith_engine::{
        ConnectionState, EngineConfig, ExecutionResult, ExecutorStatus, LayerStack, LayerType,
        ProtocolUnit, Role, UnitKind, WorkflowAction, WorkflowExecutor, WorkflowTrace,
    };
    use tlsmith_types::ProtocolVersion;

    const CH: UnitKind = HandshakeType::CLIENT_HELLO.kind();
    const SH: UnitKind = HandshakeType::SERVER_HELLO.kind();
    const HVR: UnitKind = HandshakeType::HELLO_VERIFY_REQUEST.kind();
    const EE: UnitKind = HandshakeType::ENCRYPTED_EXTENSIONS.kind();
    const CERT: UnitKind = HandshakeType::CERTIFICATE.kind();
    const CV: UnitKind = HandshakeType::CERTIFICATE_VERIFY.kind();
    const SKE: UnitKind = HandshakeType::SERVER_KEY_EXCHANGE.kind();
    const SHD: UnitKind = HandshakeType::SERVER_HELLO_DONE.kind();
    const CKE: UnitKind = HandshakeType::CLIENT_KEY_EXCHANGE.kind();
    const FIN: UnitKind = HandshakeType::FINISHED.kind();

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn config(role: Role, versions: &[ProtocolVersion]) -> EngineConfig {
        EngineConfig::builder()
            .role(role)
            .supported_versions(versions)
            .server_name("tlsmith.test")
            .receive_timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn send(units: Vec<Box<dyn ProtocolUnit>>) -> WorkflowAction {
        WorkflowAction::send(LayerType::Message, units)
    }

    fn expect(kinds: &[UnitKind]) -> WorkflowAction {
        WorkflowAction::receive(LayerType::Message, kinds.to_vec())
    }

    fn tls13_client_handshake() -> Vec<WorkflowAction> {
        vec![
            send(vec![Box::new(ClientHello::default())]),
            expect(&[SH, EE, CERT, CV, FIN]),
            WorkflowAction::dynamic_send(LayerType::Message, vec![UnitSelector::KeyExchange]),
            send(vec![Box::new(Finished::default())]),
        ]
    }

    fn tls13_server_handshake() -> Vec<WorkflowAction> {
        vec![
            expect(&[CH]),
            send(vec![
                Box::new(ServerHello::default()),
                Box::new(EncryptedExtensions::default()),
                Box::new(Certificate::default()),
                Box::new(CertificateVerify::default()),
                Box::new(Finished::default()),
            ]),
            expect(&[FIN]),
        ]
    }

    /// Run the server executor on its own thread and the client on this one.
    fn run<F>(server: F, client: WorkflowExecutor) -> (ExecutionResult, ExecutionResult)
    where
        F: FnOnce() -> WorkflowExecutor + Send + 'static,
    {
        let handle = thread::spawn(move || server().execute());
        let client = client.execute();
        let server = handle.join().unwrap();
        (client, server)
    }

    // -------------------------------------------------------
    // 1. TCP loopback: TLS 1.3 handshake, then HTTP over it
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls13_https_loopback() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = move || {
            let transport = TcpTransport::accept(&listener).unwrap();
            let mut actions = tls13_server_handshake();
            actions.push(WorkflowAction::receive(
                LayerType::Http,
                vec![HttpRequest::KIND],
            ));
            let mut response = HttpResponse::default();
            response.body.set(b"Hello from server!".to_vec());
            actions.push(WorkflowAction::send(LayerType::Http, vec![Box::new(response)]));
            WorkflowExecutor::new(
                WorkflowTrace::new(actions),
                LayerStack::https(Box::new(transport)),
                ConnectionState::new(config(Role::Server, &[ProtocolVersion::TLS13])),
            )
        };

        let transport = TcpTransport::connect(addr, Duration::from_secs(5)).unwrap();
        let mut actions = tls13_client_handshake();
        actions.push(WorkflowAction::send(
            LayerType::Http,
            vec![Box::new(HttpRequest::default())],
        ));
        actions.push(WorkflowAction::receive(
            LayerType::Http,
            vec![HttpResponse::KIND],
        ));
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(actions),
            LayerStack::https(Box::new(transport)),
            ConnectionState::new(config(Role::Client, &[ProtocolVersion::TLS13])),
        );

        let (client, server) = run(server, client);
        assert_eq!(client.status, ExecutorStatus::Completed);
        assert!(client.executed_as_planned, "{:#?}", client.trace.entries());
        assert!(server.executed_as_planned, "{:#?}", server.trace.entries());
        assert!(client.trace.entries()[2].outcome.is_skipped());

        let negotiated = client.state.negotiated();
        assert_eq!(negotiated.version, Some(ProtocolVersion::TLS13));
        assert_eq!(negotiated.peer_finished_valid, Some(true));
        assert_eq!(negotiated.http_status, Some(200));
        assert_eq!(server.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().server_name.as_deref(), Some("tlsmith.test"));
        assert_eq!(
            server.state.negotiated().http_request_target.as_deref(),
            Some("/")
        );

        let summary = serde_json::to_value(client.summary()).unwrap();
        assert_eq!(summary["executed_as_planned"], true);
        assert_eq!(summary["actions"].as_array().unwrap().len(), 6);
    }

    // -------------------------------------------------------
    // 2. TCP loopback: TLS 1.2 ECDHE with application data
    // -------------------------------------------------------
    #[test]
    fn test_tcp_tls12_ecdhe_loopback() {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = move || {
            let transport = TcpTransport::accept(&listener).unwrap();
            let actions = vec![
                expect(&[CH]),
                send(vec![
                    Box::new(ServerHello::default()),
                    Box::new(Certificate::default()),
                    Box::new(ServerKeyExchange::default()),
                    Box::new(ServerHelloDone::default()),
                ]),
                WorkflowAction::receive(
                    LayerType::Message,
                    vec![CKE, ChangeCipherSpec::KIND, FIN],
                ),
                send(vec![
                    Box::new(ChangeCipherSpec::default()),
                    Box::new(Finished::default()),
                ]),
                expect(&[ApplicationData::KIND]),
            ];
            WorkflowExecutor::new(
                WorkflowTrace::new(actions),
                LayerStack::tls(Box::new(transport)),
                ConnectionState::new(config(Role::Server, &[ProtocolVersion::TLS12])),
            )
        };

        let transport = TcpTransport::connect(addr, Duration::from_secs(5)).unwrap();
        let actions = vec![
            send(vec![Box::new(ClientHello::default())]),
            expect(&[SH, CERT, SKE, SHD]),
            WorkflowAction::dynamic_send(LayerType::Message, vec![UnitSelector::KeyExchange]),
            send(vec![
                Box::new(ChangeCipherSpec::default()),
                Box::new(Finished::default()),
            ]),
            expect(&[ChangeCipherSpec::KIND, FIN]),
            send(vec![Box::new(ApplicationData::new(b"Hello from client!".to_vec()))]),
        ];
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(actions),
            LayerStack::tls(Box::new(transport)),
            ConnectionState::new(config(Role::Client, &[ProtocolVersion::TLS12])),
        );

        let (client, server) = run(server, client);
        assert!(client.executed_as_planned, "{:#?}", client.trace.entries());
        assert!(server.executed_as_planned, "{:#?}", server.trace.entries());
        assert_eq!(client.state.negotiated().version, Some(ProtocolVersion::TLS12));
        assert_eq!(client.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().peer_finished_valid, Some(true));
        assert!(client.state.keys().has_master_secret());
        assert_eq!(
            server.state.negotiated().received_application_data,
            b"Hello from client!"
        );
    }

    // -------------------------------------------------------
    // 3. UDP loopback: DTLS 1.2 with cookie exchange,
    //    fragmentation and a retransmitted flight
    // -------------------------------------------------------
    #[test]
    fn test_udp_dtls12_cookie_exchange_loopback() {
        init_tracing();
        let dtls = |role| {
            EngineConfig::builder()
                .role(role)
                .supported_versions(&[ProtocolVersion::DTLS12])
                .dtls_max_fragment_length(48)
                .receive_timeout(Duration::from_secs(5))
                .build()
                .unwrap()
        };
        let bind: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server_transport = UdpTransport::bind(bind).unwrap();
        let addr = server_transport.local_addr().unwrap();

        let server_config = dtls(Role::Server);
        let server = move || {
            let actions = vec![
                expect(&[CH]),
                send(vec![Box::new(HelloVerifyRequest::default())]),
                expect(&[CH]),
                WorkflowAction::dynamic_send(
                    LayerType::Message,
                    vec![
                        UnitSelector::Kind(SH),
                        UnitSelector::KeyExchange,
                        UnitSelector::Kind(SHD),
                    ],
                ),
                WorkflowAction::receive(
                    LayerType::Message,
                    vec![CKE, ChangeCipherSpec::KIND, FIN],
                ),
                send(vec![
                    Box::new(ChangeCipherSpec::default()),
                    Box::new(Finished::default()),
                ]),
            ];
            WorkflowExecutor::new(
                WorkflowTrace::new(actions),
                LayerStack::dtls(Box::new(server_transport)),
                ConnectionState::new(server_config),
            )
        };

        let transport = UdpTransport::connect(addr).unwrap();
        let actions = vec![
            send(vec![Box::new(ClientHello::default())]),
            WorkflowAction::ResendFlight,
            expect(&[HVR]),
            send(vec![Box::new(ClientHello::default())]),
            expect(&[SH, SKE, SHD]),
            WorkflowAction::dynamic_send(LayerType::Message, vec![UnitSelector::KeyExchange]),
            send(vec![
                Box::new(ChangeCipherSpec::default()),
                Box::new(Finished::default()),
            ]),
            expect(&[ChangeCipherSpec::KIND, FIN]),
        ];
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(actions),
            LayerStack::dtls(Box::new(transport)),
            ConnectionState::new(dtls(Role::Client)),
        );

        let (client, server) = run(server, client);
        assert!(client.executed_as_planned, "{:#?}", client.trace.entries());
        assert!(server.executed_as_planned, "{:#?}", server.trace.entries());
        assert_eq!(client.state.counters().dtls_flight_retransmissions, 1);
        assert_eq!(client.state.negotiated().version, Some(ProtocolVersion::DTLS12));
        assert_eq!(
            client.state.negotiated().dtls_cookie.as_deref(),
            Some(&(0xC0..0xD0).collect::<Vec<u8>>()[..])
        );
        assert_eq!(client.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().peer_finished_valid, Some(true));

        let second_hello = &server.trace.entries()[2];
        assert_eq!(second_hello.kinds(LayerType::Message), [CH]);
        assert!(second_hello.kinds(LayerType::DtlsFragment).len() > 1);
    }

    // -------------------------------------------------------
    // 4. In memory: TLS 1.3 handshake in QUIC CRYPTO frames
    // -------------------------------------------------------
    #[test]
    fn test_memory_quic_handshake() {
        init_tracing();
        let (a, b) = MemoryTransport::pair();

        let server = move || {
            let mut actions = tls13_server_handshake();
            actions.push(WorkflowAction::receive(
                LayerType::QuicFrame,
                vec![Ping::KIND, ConnectionClose::KIND],
            ));
            WorkflowExecutor::new(
                WorkflowTrace::new(actions),
                LayerStack::quic(Box::new(b)),
                ConnectionState::new(config(Role::Server, &[ProtocolVersion::TLS13])),
            )
        };

        let mut actions = tls13_client_handshake();
        actions.push(WorkflowAction::send(
            LayerType::QuicFrame,
            vec![Box::new(Ping::default()), Box::new(ConnectionClose::transport(0))],
        ));
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(actions),
            LayerStack::quic(Box::new(a)),
            ConnectionState::new(config(Role::Client, &[ProtocolVersion::TLS13])),
        );

        let (client, server) = run(server, client);
        assert!(client.executed_as_planned, "{:#?}", client.trace.entries());
        assert!(server.executed_as_planned, "{:#?}", server.trace.entries());
        assert_eq!(client.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().quic_close_error, Some(0));
        assert!(client.state.counters().quic_crypto_send_offset > 0);
    }

    // -------------------------------------------------------
    // 5. In memory: a forged Finished is observed, not rejected
    // -------------------------------------------------------
    #[test]
    fn test_memory_tls13_forged_finished() {
        init_tracing();
        let (a, b) = MemoryTransport::pair();
        let server = move || {
            WorkflowExecutor::new(
                WorkflowTrace::new(tls13_server_handshake()),
                LayerStack::tls(Box::new(b)),
                ConnectionState::new(config(Role::Server, &[ProtocolVersion::TLS13])),
            )
        };

        let mut forged = Finished::default();
        forged.verify_data.force(vec![0; 32]);
        let actions = vec![
            send(vec![Box::new(ClientHello::default())]),
            expect(&[SH, EE, CERT, CV, FIN]),
            send(vec![Box::new(forged)]),
        ];
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(actions),
            LayerStack::tls(Box::new(a)),
            ConnectionState::new(config(Role::Client, &[ProtocolVersion::TLS13])),
        );

        let (client, server) = run(server, client);
        assert!(client.executed_as_planned);
        assert!(server.executed_as_planned);
        assert_eq!(client.state.negotiated().peer_finished_valid, Some(true));
        assert_eq!(server.state.negotiated().peer_finished_valid, Some(false));
    }

    // -------------------------------------------------------
    // 6. In memory: an alert instead of the expected hello
    // -------------------------------------------------------
    #[test]
    fn test_memory_unexpected_alert_is_a_deviation() {
        init_tracing();
        let (a, b) = MemoryTransport::pair();
        let server = move || {
            WorkflowExecutor::new(
                WorkflowTrace::new(vec![
                    expect(&[CH]),
                    send(vec![Box::new(ServerHello::default())]),
                ]),
                LayerStack::tls(Box::new(b)),
                ConnectionState::new(config(Role::Server, &[ProtocolVersion::TLS13])),
            )
        };
        let client = WorkflowExecutor::new(
            WorkflowTrace::new(vec![send(vec![Box::new(Alert::close_notify())])]),
            LayerStack::tls(Box::new(a)),
            ConnectionState::new(config(Role::Client, &[ProtocolVersion::TLS13])),
        );

        let (client, server) = run(server, client);
        assert!(client.executed_as_planned);
        assert!(!server.executed_as_planned);
        assert_eq!(server.trace.entries()[0].kinds(LayerType::Message), [Alert::KIND]);
        assert_eq!(server.state.negotiated().last_alert, Some((1, 0)));
    }
}
