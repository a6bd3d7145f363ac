//! Unary calls end to end: client → wire → server → wire → client.

use embrpc::rpc::{
    CallState, CallType, ChannelRegistry, Client, MethodHandler, Packet, PacketType, Server,
    ServerCall, ServiceTable, ids,
};
use embrpc::{Error, RpcConfig, Status};

use crate::mock_transport::{Outcome, Recorder, Wire, pump};

const CHANNEL: u32 = 1;
const SERVICE: u32 = 7;
const METHOD: u32 = 3;

/// Answers every request with `[0xAA]` / OK.
struct FixedReply;

impl MethodHandler for FixedReply {
    fn on_request(&self, call: ServerCall<'_>, payload: &[u8]) {
        assert_eq!(payload, &[0x01, 0x02]);
        call.respond(&[0xAA], Status::Ok).unwrap();
    }
}

#[test]
fn unary_round_trip_completes_exactly_once() {
    let to_server = Wire::new();
    let to_client = Wire::new();
    let client_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    client_channels.register(CHANNEL, &to_server).unwrap();
    let server_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    server_channels.register(CHANNEL, &to_client).unwrap();

    let handler = FixedReply;
    let mut services: ServiceTable<'_, 4> = ServiceTable::new();
    services
        .add_method(SERVICE, METHOD, CallType::Unary, &handler)
        .unwrap();

    let recorder = Recorder::new();
    let server: Server<'_, 4> = Server::new(&server_channels, &services);
    let client: Client<'_, 4> = Client::new(&client_channels);

    let call = client
        .invoke(CHANNEL, SERVICE, METHOD, CallType::Unary, &[0x01, 0x02], &recorder)
        .unwrap();
    assert_eq!(call.state(), CallState::Active);

    assert_eq!(pump(&client, &to_server, &server, &to_client), 2);

    assert_eq!(
        recorder.outcomes(),
        vec![Outcome::Completed(vec![0xAA], Status::Ok)]
    );
    assert_eq!(call.state(), CallState::Closed);
    assert_eq!(client.active_calls(), 0);
    assert_eq!(server.active_calls(), 0);
}

#[test]
fn unknown_channel_fails_synchronously() {
    let wire = Wire::new();
    let channels: ChannelRegistry<'_, 2> = ChannelRegistry::new();
    channels.register(CHANNEL, &wire).unwrap();
    let recorder = Recorder::new();
    let client: Client<'_, 4> = Client::new(&channels);

    let err = client
        .invoke(99, SERVICE, METHOD, CallType::Unary, &[], &recorder)
        .err();
    assert_eq!(err, Some(Error::ChannelNotFound));
    assert_eq!(client.active_calls(), 0);
    assert_eq!(wire.writes(), 0);
    assert!(recorder.outcomes().is_empty());
}

#[test]
fn unknown_method_reports_not_found() {
    let to_server = Wire::new();
    let to_client = Wire::new();
    let client_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    client_channels.register(CHANNEL, &to_server).unwrap();
    let server_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    server_channels.register(CHANNEL, &to_client).unwrap();

    let services: ServiceTable<'_, 1> = ServiceTable::new();
    let recorder = Recorder::new();
    let server: Server<'_, 2> = Server::new(&server_channels, &services);
    let client: Client<'_, 2> = Client::new(&client_channels);

    client
        .invoke(CHANNEL, SERVICE, 0xBEEF, CallType::Unary, &[], &recorder)
        .unwrap();
    pump(&client, &to_server, &server, &to_client);

    assert_eq!(recorder.outcomes(), vec![Outcome::Error(Status::NotFound)]);
    assert_eq!(client.active_calls(), 0);
}

#[test]
fn malformed_bytes_are_dropped_and_counted() {
    let to_client = Wire::new();
    let channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    channels.register(CHANNEL, &to_client).unwrap();
    let handler = FixedReply;
    let mut services: ServiceTable<'_, 1> = ServiceTable::new();
    services
        .add_method(SERVICE, METHOD, CallType::Unary, &handler)
        .unwrap();
    let server: Server<'_, 2> = Server::new(&channels, &services);

    for garbage in [&[0xFFu8][..], &[0x08], &[0x08, 0x07], &[0x2A, 0x05, 0x01]] {
        assert_eq!(
            server.process_incoming_packet(garbage),
            Err(Error::MalformedPacket)
        );
    }
    assert_eq!(server.stats().malformed_packets, 4);
    assert_eq!(to_client.len(), 0);

    // A good packet afterwards is still served.
    let key = embrpc::rpc::CallKey {
        channel_id: CHANNEL,
        service_id: SERVICE,
        method_id: METHOD,
        call_id: 1,
    };
    let req = Packet::new(PacketType::Request, key, &[0x01, 0x02], None)
        .encode_to_buffer()
        .unwrap();
    server.process_incoming_packet(&req).unwrap();
    assert_eq!(
        to_client.take_types(),
        vec![(PacketType::Response, Some(Status::Ok))]
    );
}

#[test]
fn payload_limit_applies_to_both_directions() {
    let to_server = Wire::new();
    let channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    channels.register(CHANNEL, &to_server).unwrap();
    let recorder = Recorder::new();
    let config = RpcConfig {
        max_payload_len: 4,
        ..RpcConfig::default()
    };
    let client: Client<'_, 2> = Client::with_config(&channels, config).unwrap();

    assert_eq!(
        client
            .invoke(CHANNEL, SERVICE, METHOD, CallType::Unary, &[0; 5], &recorder)
            .err(),
        Some(Error::InvalidArgument)
    );
    let call = client
        .invoke(CHANNEL, SERVICE, METHOD, CallType::Unary, &[0; 4], &recorder)
        .unwrap();

    // An oversized response never reaches the handler.
    let resp = Packet::new(PacketType::Response, call.info().key, &[1; 5], Some(Status::Ok))
        .encode_to_buffer()
        .unwrap();
    assert_eq!(
        client.process_incoming_packet(&resp),
        Err(Error::MalformedPacket)
    );
    assert!(call.is_active());
    assert!(recorder.outcomes().is_empty());
}

#[test]
fn failed_request_write_leaves_nothing_registered() {
    let wire = Wire::new();
    wire.set_failing(true);
    let channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    channels.register(CHANNEL, &wire).unwrap();
    let recorder = Recorder::new();
    let client: Client<'_, 2> = Client::new(&channels);

    assert_eq!(
        client
            .invoke(CHANNEL, SERVICE, METHOD, CallType::Unary, &[], &recorder)
            .err(),
        Some(Error::Aborted)
    );
    assert_eq!(client.active_calls(), 0);
    assert!(recorder.outcomes().is_empty());
}

#[test]
fn name_derived_ids_route_calls() {
    let (service, method) = ids::method_ids("embrpc.test.Echo", "Reverse");
    assert_eq!(service, ids::id("embrpc.test.Echo"));

    struct Reverse;
    impl MethodHandler for Reverse {
        fn on_request(&self, call: ServerCall<'_>, payload: &[u8]) {
            let mut reversed = payload.to_vec();
            reversed.reverse();
            call.respond(&reversed, Status::Ok).unwrap();
        }
    }

    let to_server = Wire::new();
    let to_client = Wire::new();
    let client_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    client_channels.register(CHANNEL, &to_server).unwrap();
    let server_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    server_channels.register(CHANNEL, &to_client).unwrap();

    let handler = Reverse;
    let mut services: ServiceTable<'_, 1> = ServiceTable::new();
    services
        .add_method(service, method, CallType::Unary, &handler)
        .unwrap();
    let recorder = Recorder::new();
    let server: Server<'_, 1> = Server::new(&server_channels, &services);
    let client: Client<'_, 1> = Client::new(&client_channels);

    client
        .invoke(CHANNEL, service, method, CallType::Unary, b"abc", &recorder)
        .unwrap();
    pump(&client, &to_server, &server, &to_client);
    assert_eq!(
        recorder.outcomes(),
        vec![Outcome::Completed(b"cba".to_vec(), Status::Ok)]
    );
}
