//! End-to-end tests of the server secure channel over an in-memory duplex
//! stream, with a hand-rolled client built from the core channel machinery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;

use uasc_core::comms::channel_security::ChannelSecurity;
use uasc_core::comms::chunker::Chunker;
use uasc_core::comms::message_chunk::{
    MessageChunk, MessageChunkHeader, MessageChunkType, MessageIsFinalType,
    MESSAGE_CHUNK_HEADER_SIZE,
};
use uasc_core::comms::security_header::{AsymmetricSecurityHeader, SequenceHeader};
use uasc_core::comms::tcp_codec::{Message, TcpCodec};
use uasc_core::comms::tcp_types::HelloMessage;
use uasc_core::{Message as MessageTrait, RequestMessage, ResponseMessage};
use uasc_crypto::{PrivateKey, SecurityPolicy, X509};
use uasc_server::{
    ChannelConfig, ChannelError, ChannelEvents, Request, SecureChannelHandle, ServerEndpoint,
    ServerInfo, ServerSecureChannel, TransactionStats,
};
use uasc_types::{
    ByteString, CancelRequest, CancelResponse, DateTime, DecodingOptions, MessageSecurityMode,
    NodeId, OpenSecureChannelRequest, RequestHeader, ResponseHeader, SecurityTokenRequestType,
    SimpleBinaryEncodable, StatusCode, UAString,
};

const ENDPOINT_URL: &str = "opc.tcp://localhost:4855/";

/// Event recorder handed to the channel under test.
struct Recorder {
    messages: mpsc::UnboundedSender<Request>,
    transactions: Mutex<Vec<TransactionStats>>,
    aborts: Mutex<Vec<StatusCode>>,
    abort_count: AtomicUsize,
}

impl Recorder {
    fn new() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Request>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                messages: tx,
                transactions: Mutex::new(Vec::new()),
                aborts: Mutex::new(Vec::new()),
                abort_count: AtomicUsize::new(0),
            }),
            rx,
        )
    }
}

impl ChannelEvents for Recorder {
    fn message(&self, request: Request) {
        let _ = self.messages.send(request);
    }

    fn transaction_done(&self, stats: TransactionStats) {
        self.transactions.lock().unwrap().push(stats);
    }

    fn abort(&self, status: StatusCode) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.aborts.lock().unwrap().push(status);
    }
}

struct ServerFixture {
    info: Arc<ServerInfo>,
    server_cert: Option<X509>,
}

fn cert_pair(valid: bool) -> (PrivateKey, X509) {
    let key = PrivateKey::new(2048).unwrap();
    let now = DateTime::now();
    let (not_before, not_after) = if valid {
        (now + chrono::Duration::hours(-1), now + chrono::Duration::hours(24))
    } else {
        // Expired an hour ago
        (now + chrono::Duration::hours(-2), now + chrono::Duration::hours(-1))
    };
    let cert = X509::self_signed(&key, "UASC test", not_before, not_after).unwrap();
    (key, cert)
}

fn plain_fixture(config: ChannelConfig) -> ServerFixture {
    ServerFixture {
        info: Arc::new(ServerInfo::new(
            "urn:uasc:test-server",
            config,
            None,
            None,
            vec![ServerEndpoint::new_none("/")],
        )),
        server_cert: None,
    }
}

fn secured_fixture(endpoints: Vec<ServerEndpoint>) -> ServerFixture {
    let (key, cert) = cert_pair(true);
    ServerFixture {
        info: Arc::new(ServerInfo::new(
            "urn:uasc:test-server",
            ChannelConfig::default(),
            Some(cert.clone()),
            Some(key),
            endpoints,
        )),
        server_cert: Some(cert),
    }
}

/// Spawn a channel on one end of a duplex pipe. The task resolves with the
/// init result; on success it keeps running the channel until it aborts.
fn spawn_channel(
    stream: DuplexStream,
    info: Arc<ServerInfo>,
    events: Arc<Recorder>,
) -> (
    tokio::task::JoinHandle<Result<(), ChannelError>>,
    tokio::sync::oneshot::Receiver<SecureChannelHandle>,
) {
    let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(async move {
        let (channel, handle) = ServerSecureChannel::init(stream, info, events).await?;
        let _ = handle_tx.send(handle);
        channel.run().await;
        Ok(())
    });
    (task, handle_rx)
}

/// The client half of the tests, built from the same core machinery the
/// server uses.
struct TestClient {
    read: FramedRead<ReadHalf<DuplexStream>, TcpCodec>,
    write: WriteHalf<DuplexStream>,
    security: ChannelSecurity,
    sequence_number: u32,
    next_request_id: u32,
}

impl TestClient {
    async fn connect(stream: DuplexStream) -> TestClient {
        let (read, mut write) = tokio::io::split(stream);
        let mut read = FramedRead::new(read, TcpCodec::new(DecodingOptions::test()));

        let hello = HelloMessage::new(ENDPOINT_URL, 65535, 65535, 0, 0);
        write.write_all(&hello.encode_to_vec()).await.unwrap();
        match read.next().await {
            Some(Ok(Message::Acknowledge(_))) => {}
            other => panic!("Expected ACK, got {:?}", other),
        }

        TestClient {
            read,
            write,
            security: ChannelSecurity::new(DecodingOptions::test()),
            sequence_number: 0,
            next_request_id: 0,
        }
    }

    fn configure_security(
        &mut self,
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        own: Option<(PrivateKey, X509)>,
        server_cert: Option<X509>,
    ) {
        self.security.set_security_policy(policy);
        self.security.set_security_mode(mode);
        if let Some((key, cert)) = own {
            self.security.set_own_private_key(Some(key));
            self.security.set_own_certificate(Some(cert));
        }
        self.security.set_peer_certificate(server_cert);
    }

    fn open_request(
        &self,
        request_type: SecurityTokenRequestType,
        requested_lifetime: u32,
        client_nonce: ByteString,
        request_handle: u32,
    ) -> RequestMessage {
        RequestMessage::from(OpenSecureChannelRequest {
            request_header: RequestHeader::new(NodeId::null(), request_handle),
            client_protocol_version: 0,
            request_type,
            security_mode: self.security.security_mode(),
            client_nonce,
            requested_lifetime,
        })
    }

    async fn send_request(&mut self, request: &RequestMessage) -> u32 {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let chunks = Chunker::encode(
            self.sequence_number + 1,
            request_id,
            0,
            65535,
            &self.security,
            request,
        )
        .unwrap();
        self.sequence_number += chunks.len() as u32;
        for chunk in chunks {
            self.send_chunk(&chunk).await;
        }
        request_id
    }

    async fn send_chunk(&mut self, chunk: &MessageChunk) {
        let mut dst = vec![0u8; chunk.data.len() * 2 + 2048];
        let size = self.security.secure_outgoing_chunk(chunk, &mut dst).unwrap();
        self.write.write_all(&dst[..size]).await.unwrap();
    }

    /// Receive chunks until a whole response can be decoded.
    async fn recv_response(&mut self) -> ResponseMessage {
        let mut chunks = Vec::new();
        loop {
            let chunk = match self.read.next().await {
                Some(Ok(Message::Chunk(chunk))) => chunk,
                other => panic!("Expected a chunk, got {:?}", other),
            };
            let header = chunk
                .message_header(&self.security.decoding_options())
                .unwrap();
            let chunk = self.security.unsecure_incoming_chunk(&chunk.data).unwrap();
            chunks.push(chunk);
            if header.is_final == MessageIsFinalType::Final {
                break;
            }
        }
        Chunker::decode(&chunks, &self.security, None).unwrap()
    }

    /// Open the channel and adopt the returned token and nonce.
    async fn open(
        &mut self,
        request_type: SecurityTokenRequestType,
        requested_lifetime: u32,
        client_nonce: ByteString,
        request_handle: u32,
    ) -> uasc_types::OpenSecureChannelResponse {
        let request =
            self.open_request(request_type, requested_lifetime, client_nonce.clone(), request_handle);
        self.send_request(&request).await;
        let response = self.recv_response().await;
        let ResponseMessage::OpenSecureChannel(response) = response else {
            panic!("Expected an OPN response, got {:?}", response);
        };
        if response.response_header.service_result.is_good() {
            self.security.set_security_token(&response.security_token);
            if self.security.security_policy() != SecurityPolicy::None {
                self.security
                    .set_peer_nonce_from_byte_string(&response.server_nonce)
                    .unwrap();
                self.security.set_own_nonce(client_nonce.as_ref());
                self.security.derive_keys();
            }
        }
        *response
    }

    /// `true` once the server has hung up.
    async fn is_closed(&mut self) -> bool {
        self.read.next().await.is_none()
    }
}

fn cancel_request(request_handle: u32) -> RequestMessage {
    RequestMessage::from(CancelRequest {
        request_header: RequestHeader::new(NodeId::null(), request_handle),
        request_handle,
    })
}

/// Builds a raw OPN chunk so tests can put arbitrary values into the
/// asymmetric security header.
fn build_raw_opn_chunk(
    policy_uri: &str,
    sender_certificate: ByteString,
    receiver_certificate_thumbprint: ByteString,
    request: &RequestMessage,
) -> MessageChunk {
    let mut body = Vec::new();
    request.type_id().encode(&mut body).unwrap();
    request.encode(&mut body).unwrap();

    let security_header = AsymmetricSecurityHeader {
        security_policy_uri: UAString::from(policy_uri),
        sender_certificate,
        receiver_certificate_thumbprint,
    };
    let sequence_header = SequenceHeader {
        sequence_number: 1,
        request_id: 1,
    };
    let message_size = MESSAGE_CHUNK_HEADER_SIZE
        + security_header.byte_len()
        + sequence_header.byte_len()
        + body.len();
    let chunk_header = MessageChunkHeader {
        message_type: MessageChunkType::OpenSecureChannel,
        is_final: MessageIsFinalType::Final,
        message_size: message_size as u32,
        secure_channel_id: 0,
    };

    let mut data = Vec::with_capacity(message_size);
    chunk_header.encode(&mut data).unwrap();
    security_header.encode(&mut data).unwrap();
    sequence_header.encode(&mut data).unwrap();
    data.extend_from_slice(&body);
    MessageChunk { data }
}

// Scenario: policy None, successful open.
#[tokio::test]
async fn open_none_policy() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    let response = client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 101)
        .await;

    assert_eq!(response.response_header.service_result, StatusCode::Good);
    assert_eq!(response.response_header.request_handle, 101);
    assert_eq!(response.security_token.token_id, 1);
    assert_eq!(response.security_token.revised_lifetime, 600_000);
    assert!(response.server_nonce.is_null_or_empty());
    assert_eq!(response.server_protocol_version, 0);

    // The channel reached the open state
    let handle = handle_rx.await.unwrap();
    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
    assert_eq!(events.aborts.lock().unwrap()[0], StatusCode::Good);
}

// Scenario: a policy URI outside the recognised set.
#[tokio::test]
async fn unknown_policy_is_rejected() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);

    let request = client.open_request(SecurityTokenRequestType::Issue, 0, ByteString::null(), 7);
    let chunk = build_raw_opn_chunk(
        "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss",
        ByteString::null(),
        ByteString::null(),
        &request,
    );
    client.write.write_all(&chunk.data).await.unwrap();

    let response = client.recv_response().await;
    let ResponseMessage::ServiceFault(fault) = response else {
        panic!("Expected a service fault, got {:?}", response);
    };
    assert_eq!(
        fault.response_header.service_result,
        StatusCode::BadSecurityPolicyRejected
    );

    // The channel closes after the fault and never opened
    assert!(client.is_closed().await);
    match task.await.unwrap() {
        Err(ChannelError::Status(status)) => {
            assert_eq!(status, StatusCode::BadSecurityPolicyRejected)
        }
        other => panic!("Expected a status error, got {:?}", other),
    }
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 0);
}

// Scenario: thumbprint mismatch under SignAndEncrypt.
#[tokio::test]
async fn thumbprint_mismatch_degrades_response() {
    let fixture = secured_fixture(vec![ServerEndpoint::new_basic256_sign_encrypt("/")]);
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let (client_key, client_cert) = cert_pair(true);
    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(
        SecurityPolicy::Basic256,
        MessageSecurityMode::SignAndEncrypt,
        Some((client_key, client_cert.clone())),
        fixture.server_cert.clone(),
    );

    // A syntactically valid thumbprint that names no certificate of the
    // server's
    let request = client.open_request(
        SecurityTokenRequestType::Issue,
        0,
        ByteString::from(vec![7u8; 32]),
        55,
    );
    let chunk = build_raw_opn_chunk(
        SecurityPolicy::Basic256.to_uri(),
        client_cert.as_byte_string(),
        ByteString::from(vec![0xAAu8; 20]),
        &request,
    );
    client.send_chunk(&chunk).await;

    let response = client.recv_response().await;
    let ResponseMessage::OpenSecureChannel(response) = response else {
        panic!("Expected an OPN response, got {:?}", response);
    };
    assert_eq!(
        response.response_header.service_result,
        StatusCode::BadCertificateInvalid
    );
    assert_eq!(response.response_header.request_handle, 55);

    assert!(client.is_closed().await);
    match task.await.unwrap() {
        Err(ChannelError::Status(status)) => {
            assert_eq!(status, StatusCode::BadCertificateInvalid)
        }
        other => panic!("Expected a status error, got {:?}", other),
    }
}

// Scenario: expired client certificate.
#[tokio::test]
async fn expired_client_certificate_is_a_fault() {
    let fixture = secured_fixture(vec![ServerEndpoint::new_basic256_sign_encrypt("/")]);
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let (client_key, client_cert) = cert_pair(false);
    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(
        SecurityPolicy::Basic256,
        MessageSecurityMode::SignAndEncrypt,
        Some((client_key, client_cert)),
        fixture.server_cert.clone(),
    );

    let request = client.open_request(
        SecurityTokenRequestType::Issue,
        0,
        ByteString::from(vec![9u8; 32]),
        18,
    );
    client.send_request(&request).await;

    let response = client.recv_response().await;
    let ResponseMessage::ServiceFault(fault) = response else {
        panic!("Expected a service fault, got {:?}", response);
    };
    assert_eq!(
        fault.response_header.service_result,
        StatusCode::BadCertificateTimeInvalid
    );

    assert!(client.is_closed().await);
    match task.await.unwrap() {
        Err(ChannelError::Status(status)) => {
            assert_eq!(status, StatusCode::BadCertificateTimeInvalid)
        }
        other => panic!("Expected a status error, got {:?}", other),
    }
}

// Scenario: nonce length mismatch.
#[tokio::test]
async fn nonce_length_mismatch_is_rejected() {
    let fixture = secured_fixture(vec![ServerEndpoint::new_basic128rsa15_sign_encrypt("/")]);
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let (client_key, client_cert) = cert_pair(true);
    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(
        SecurityPolicy::Basic128Rsa15,
        MessageSecurityMode::SignAndEncrypt,
        Some((client_key, client_cert)),
        fixture.server_cert.clone(),
    );

    // Basic128Rsa15 needs a 16 byte nonce, send 8
    let request = client.open_request(
        SecurityTokenRequestType::Issue,
        0,
        ByteString::from(vec![1u8; 8]),
        77,
    );
    client.send_request(&request).await;

    let response = client.recv_response().await;
    let ResponseMessage::OpenSecureChannel(response) = response else {
        panic!("Expected an OPN response, got {:?}", response);
    };
    assert_eq!(
        response.response_header.service_result,
        StatusCode::BadSecurityModeRejected
    );

    assert!(client.is_closed().await);
    match task.await.unwrap() {
        Err(ChannelError::Status(status)) => {
            assert_eq!(status, StatusCode::BadSecurityModeRejected)
        }
        other => panic!("Expected a status error, got {:?}", other),
    }
}

// Scenario: renewal.
#[tokio::test]
async fn renewal_issues_second_token() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, mut requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    let first = client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 1)
        .await;
    assert_eq!(first.security_token.token_id, 1);
    let channel_id = first.security_token.channel_id;
    let handle = handle_rx.await.unwrap();

    let second = client
        .open(SecurityTokenRequestType::Renew, 30_000, ByteString::null(), 2)
        .await;
    assert_eq!(second.response_header.service_result, StatusCode::Good);
    assert_eq!(second.response_header.request_handle, 2);
    assert_eq!(second.security_token.token_id, 2);
    assert_eq!(second.security_token.channel_id, channel_id);
    assert_eq!(second.security_token.revised_lifetime, 30_000);

    // The channel is still open: a request secured with the new token works
    client.send_request(&cancel_request(400)).await;
    let request = requests.recv().await.unwrap();
    assert_eq!(request.context.request_handle, 400);

    handle.close();
    task.await.unwrap().unwrap();
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
}

// A requested lifetime above the server default is capped.
#[tokio::test]
async fn requested_lifetime_is_capped() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (_task, _handle_rx) = spawn_channel(server_stream, fixture.info, events);

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    let response = client
        .open(SecurityTokenRequestType::Issue, 4_000_000, ByteString::null(), 1)
        .await;
    assert_eq!(response.security_token.revised_lifetime, 600_000);
}

// Request dispatch, response correlation and transaction statistics.
#[tokio::test]
async fn message_round_trip_and_events() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, mut requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 1)
        .await;
    let handle = handle_rx.await.unwrap();

    let request_id = client.send_request(&cancel_request(33)).await;

    // The request surfaces as a message event with its correlation data
    let request = requests.recv().await.unwrap();
    assert!(request.context.request_id > 0);
    assert_eq!(request.context.request_id, request_id);
    assert_eq!(request.context.request_handle, 33);
    let RequestMessage::Cancel(_) = &request.message else {
        panic!("Expected a cancel request");
    };

    // Answer it; the request handle is copied from the context
    let response = ResponseMessage::from(CancelResponse {
        response_header: ResponseHeader::null(),
        cancel_count: 1,
    });
    handle.send_response(response, request.context).unwrap();

    let response = client.recv_response().await;
    let ResponseMessage::Cancel(response) = response else {
        panic!("Expected a cancel response, got {:?}", response);
    };
    assert_eq!(response.response_header.request_handle, 33);
    assert_eq!(response.cancel_count, 1);

    // Session bookkeeping rides on the same queue
    handle.bind_session_token(ByteString::from(vec![1u8, 2, 3]));
    handle.unbind_session_token(ByteString::from(vec![1u8, 2, 3]));

    handle.close();
    task.await.unwrap().unwrap();

    // Exactly one transaction was recorded, after the response flushed
    let transactions = events.transactions.lock().unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].request_id, request_id);
    assert!(transactions[0].bytes_read > 0);
    assert!(transactions[0].bytes_written > 0);
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
}

// A full cryptographic session: open, then request/response under derived
// keys.
#[tokio::test]
async fn secure_message_round_trip() {
    let fixture = secured_fixture(vec![ServerEndpoint::new_basic256_sign_encrypt("/")]);
    let (events, mut requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let (client_key, client_cert) = cert_pair(true);
    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(
        SecurityPolicy::Basic256,
        MessageSecurityMode::SignAndEncrypt,
        Some((client_key, client_cert)),
        fixture.server_cert.clone(),
    );

    let nonce = SecurityPolicy::Basic256.random_nonce();
    let response = client
        .open(SecurityTokenRequestType::Issue, 0, nonce, 5)
        .await;
    assert_eq!(response.response_header.service_result, StatusCode::Good);
    assert_eq!(response.server_nonce.len(), 32);
    let handle = handle_rx.await.unwrap();

    // Request and response both travel signed and encrypted now
    client.send_request(&cancel_request(90)).await;
    let request = requests.recv().await.unwrap();
    assert_eq!(request.context.request_handle, 90);

    let response = ResponseMessage::from(CancelResponse {
        response_header: ResponseHeader::null(),
        cancel_count: 0,
    });
    handle.send_response(response, request.context).unwrap();

    let response = client.recv_response().await;
    let ResponseMessage::Cancel(response) = response else {
        panic!("Expected a cancel response, got {:?}", response);
    };
    assert_eq!(response.response_header.request_handle, 90);

    handle.close();
    task.await.unwrap().unwrap();
}

// The first decoded message must be an OPN.
#[tokio::test]
async fn first_message_must_be_open() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    client.send_request(&cancel_request(3)).await;

    let response = client.recv_response().await;
    let ResponseMessage::ServiceFault(fault) = response else {
        panic!("Expected a service fault, got {:?}", response);
    };
    assert_eq!(
        fault.response_header.service_result,
        StatusCode::BadCommunicationError
    );

    assert!(client.is_closed().await);
    match task.await.unwrap() {
        Err(ChannelError::Status(status)) => {
            assert_eq!(status, StatusCode::BadCommunicationError)
        }
        other => panic!("Expected a status error, got {:?}", other),
    }
    // The channel never opened, so no abort event
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 0);
}

// The initial open times out when the client goes quiet after HELLO.
#[tokio::test]
async fn initial_open_timeout() {
    let fixture = plain_fixture(ChannelConfig {
        open_timeout_ms: 200,
        ..Default::default()
    });
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    // Say hello and then nothing
    let started = std::time::Instant::now();
    let _client = TestClient::connect(client_stream).await;

    match task.await.unwrap() {
        Err(ChannelError::Timeout) => {}
        other => panic!("Expected a timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= std::time::Duration::from_millis(200));
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 0);
}

// The dispatcher can answer a request with a fault that tears the channel
// down after flushing.
#[tokio::test]
async fn send_error_and_abort_faults_and_closes() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, mut requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 1)
        .await;
    let handle = handle_rx.await.unwrap();

    client.send_request(&cancel_request(12)).await;
    let request = requests.recv().await.unwrap();
    handle
        .send_error_and_abort(
            StatusCode::BadServiceUnsupported,
            "cancel is not supported here",
            request.context,
        )
        .unwrap();

    let response = client.recv_response().await;
    let ResponseMessage::ServiceFault(fault) = response else {
        panic!("Expected a service fault, got {:?}", response);
    };
    assert_eq!(
        fault.response_header.service_result,
        StatusCode::BadServiceUnsupported
    );
    assert_eq!(fault.response_header.request_handle, 12);

    assert!(client.is_closed().await);
    task.await.unwrap().unwrap();
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
    assert_eq!(
        events.aborts.lock().unwrap()[0],
        StatusCode::BadServiceUnsupported
    );
}

// A client CLO closes the channel without a response.
#[tokio::test]
async fn close_request_from_client() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, _handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 1)
        .await;

    let close = RequestMessage::from(uasc_types::CloseSecureChannelRequest {
        request_header: RequestHeader::new(NodeId::null(), 2),
    });
    client.send_request(&close).await;

    // No response comes back, the connection just closes
    assert!(client.is_closed().await);
    task.await.unwrap().unwrap();
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
    assert_eq!(events.aborts.lock().unwrap()[0], StatusCode::Good);
}

// Closing from the dispatcher side drops the client connection.
#[tokio::test]
async fn explicit_close_aborts_once() {
    let fixture = plain_fixture(ChannelConfig::default());
    let (events, _requests) = Recorder::new();
    let (server_stream, client_stream) = tokio::io::duplex(1024 * 1024);
    let (task, handle_rx) = spawn_channel(server_stream, fixture.info, events.clone());

    let mut client = TestClient::connect(client_stream).await;
    client.configure_security(SecurityPolicy::None, MessageSecurityMode::None, None, None);
    client
        .open(SecurityTokenRequestType::Issue, 0, ByteString::null(), 1)
        .await;

    let handle = handle_rx.await.unwrap();
    handle.close();
    // Extra closes are harmless
    handle.close();

    task.await.unwrap().unwrap();
    assert!(client.is_closed().await);
    assert_eq!(events.abort_count.load(Ordering::SeqCst), 1);
    assert_eq!(events.aborts.lock().unwrap()[0], StatusCode::Good);
}
