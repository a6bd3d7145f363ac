//! Parallel invocations, worker-thread responses and re-entrant handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Barrier, Mutex, OnceLock};
use std::thread;

use embrpc::rpc::{
    CallHandle, CallInfo, CallKey, CallType, ChannelRegistry, Client, MethodHandler, Packet,
    PacketType, Responder, ResponseHandler, Server, ServerCall, ServiceTable,
};
use embrpc::{Error, Status};

use crate::mock_transport::{DirectLink, Outcome, Recorder, Wire, pump};

const CHANNEL: u32 = 1;
const SERVICE: u32 = 0xC0FF_EE00;

struct Echo;

impl MethodHandler for Echo {
    fn on_request(&self, call: ServerCall<'_>, payload: &[u8]) {
        call.respond(payload, Status::Ok).unwrap();
    }
}

#[derive(Default)]
struct Parking {
    handles: Mutex<Vec<CallHandle>>,
    closed: Mutex<Vec<Status>>,
}

impl MethodHandler for Parking {
    fn on_request(&self, call: ServerCall<'_>, _payload: &[u8]) {
        self.handles.lock().unwrap().push(call.handle());
    }

    fn on_closed(&self, _info: &CallInfo, status: Status) {
        self.closed.lock().unwrap().push(status);
    }
}

#[test]
fn exhaustion_under_concurrent_invokes() {
    let wire = Wire::new();
    let channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    channels.register(CHANNEL, &wire).unwrap();
    let recorder = Recorder::new();
    let client: Client<'_, 2> = Client::new(&channels);
    let barrier = Barrier::new(3);

    let results: Vec<Result<CallKey, Error>> = thread::scope(|s| {
        let workers: Vec<_> = (0..3u32)
            .map(|method| {
                let (client, recorder, barrier) = (&client, &recorder, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    client
                        .invoke(CHANNEL, SERVICE, method, CallType::Unary, &[], recorder)
                        .map(|call| call.info().key)
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failures, vec![&Err(Error::ResourceExhausted)]);
    assert_eq!(client.active_calls(), 2);

    // The two survivors complete independently.
    for key in results.iter().filter_map(|r| r.as_ref().ok()) {
        let resp = Packet::new(PacketType::Response, *key, &[], Some(Status::Ok))
            .encode_to_buffer()
            .unwrap();
        client.process_incoming_packet(&resp).unwrap();
    }
    assert_eq!(recorder.terminal_count(), 2);
    assert_eq!(client.active_calls(), 0);
}

#[test]
fn parallel_clients_threads_each_call_completes_once() {
    const THREADS: usize = 4;
    const CALLS: usize = 50;

    let to_server = Wire::new();
    let to_client = Wire::new();
    let client_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    client_channels.register(CHANNEL, &to_server).unwrap();
    let server_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    server_channels.register(CHANNEL, &to_client).unwrap();

    let echo = Echo;
    let mut services: ServiceTable<'_, 1> = ServiceTable::new();
    services.add_method(SERVICE, 1, CallType::Unary, &echo).unwrap();
    let recorder = Recorder::new();
    let server: Server<'_, 32> = Server::new(&server_channels, &services);
    let client: Client<'_, 32> = Client::new(&client_channels);

    thread::scope(|s| {
        for t in 0..THREADS {
            let (client, server, recorder) = (&client, &server, &recorder);
            let (to_server, to_client) = (&to_server, &to_client);
            s.spawn(move || {
                for i in 0..CALLS {
                    let payload = [t as u8, i as u8];
                    client
                        .invoke(CHANNEL, SERVICE, 1, CallType::Unary, &payload, recorder)
                        .unwrap();
                    pump(client, to_server, server, to_client);
                }
            });
        }
    });
    pump(&client, &to_server, &server, &to_client);

    assert_eq!(recorder.terminal_count(), THREADS * CALLS);
    assert!(
        recorder
            .outcomes()
            .iter()
            .all(|o| matches!(o, Outcome::Completed(p, Status::Ok) if p.len() == 2))
    );
    assert_eq!(client.active_calls(), 0);
    assert_eq!(server.active_calls(), 0);
}

#[test]
fn worker_threads_answer_parked_calls() {
    let to_server = Wire::new();
    let to_client = Wire::new();
    let client_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    client_channels.register(CHANNEL, &to_server).unwrap();
    let server_channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    server_channels.register(CHANNEL, &to_client).unwrap();

    let parking = Parking::default();
    let mut services: ServiceTable<'_, 1> = ServiceTable::new();
    services
        .add_method(SERVICE, 2, CallType::ServerStreaming, &parking)
        .unwrap();
    let recorder = Recorder::new();
    let server: Server<'_, 8> = Server::new(&server_channels, &services);
    let client: Client<'_, 8> = Client::new(&client_channels);

    let ids: Vec<u32> = (0..4)
        .map(|_| {
            client
                .invoke(CHANNEL, SERVICE, 2, CallType::ServerStreaming, &[], &recorder)
                .unwrap()
                .info()
                .key
                .call_id
        })
        .collect();
    pump(&client, &to_server, &server, &to_client);
    let handles = parking.handles.lock().unwrap().clone();
    assert_eq!(handles.len(), 4);

    thread::scope(|s| {
        for (n, handle) in handles.iter().copied().enumerate() {
            let server = &server;
            s.spawn(move || {
                server.write(handle, &[n as u8]).unwrap();
                server.write(handle, &[n as u8 + 10]).unwrap();
                server.finish(handle, Status::Ok).unwrap();
                assert_eq!(server.finish(handle, Status::Ok), Err(Error::FailedPrecondition));
            });
        }
    });
    pump(&client, &to_server, &server, &to_client);

    for id in ids {
        let outcomes = recorder.outcomes_for(id);
        assert_eq!(outcomes.len(), 3, "call {id}: {outcomes:?}");
        assert_eq!(outcomes[2], Outcome::Completed(vec![], Status::Ok));
        // Per-call fragment order survives parallel writers.
        match (&outcomes[0], &outcomes[1]) {
            (Outcome::Next(a), Outcome::Next(b)) => assert_eq!(a[0] + 10, b[0]),
            other => panic!("unexpected fragments {other:?}"),
        }
    }
    assert_eq!(server.active_calls(), 0);
    assert!(parking.closed.lock().unwrap().is_empty());
}

#[test]
fn racing_duplicate_requests_leave_one_active_call() {
    const THREADS: usize = 6;

    let to_client = Wire::new();
    let channels: ChannelRegistry<'_, 1> = ChannelRegistry::new();
    channels.register(CHANNEL, &to_client).unwrap();
    let parking = Parking::default();
    let mut services: ServiceTable<'_, 1> = ServiceTable::new();
    services
        .add_method(SERVICE, 3, CallType::Bidirectional, &parking)
        .unwrap();
    let server: Server<'_, 4> = Server::new(&channels, &services);

    let key = CallKey {
        channel_id: CHANNEL,
        service_id: SERVICE,
        method_id: 3,
        call_id: 77,
    };
    let req = Packet::new(PacketType::Request, key, &[], None)
        .encode_to_buffer()
        .unwrap();
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let (server, req, barrier) = (&server, &req, &barrier);
            s.spawn(move || {
                barrier.wait();
                server.process_incoming_packet(req).unwrap();
            });
        }
    });

    assert_eq!(server.active_calls(), 1);
    let closed = parking.closed.lock().unwrap();
    assert_eq!(closed.len(), THREADS - 1);
    assert!(closed.iter().all(|s| *s == Status::Cancelled));
    let live = parking
        .handles
        .lock()
        .unwrap()
        .iter()
        .filter(|h| server.is_active(**h))
        .count();
    assert_eq!(live, 1);
}

// ── Re-entrancy ───────────────────────────────────────────────

/// Issues the next call from inside the previous call's completion.
struct Chain {
    client: OnceLock<&'static Client<'static, 4>>,
    completions: AtomicUsize,
}

static CHAIN: Chain = Chain {
    client: OnceLock::new(),
    completions: AtomicUsize::new(0),
};

impl ResponseHandler for Chain {
    fn on_completed(&self, _info: &CallInfo, payload: &[u8], status: Status) {
        assert_eq!(status, Status::Ok);
        let done = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(payload, &[done as u8 - 1]);
        if done < 3 {
            let client = self.client.get().unwrap();
            client
                .invoke(CHANNEL, SERVICE, 1, CallType::Unary, &[done as u8], &CHAIN)
                .unwrap();
        }
    }

    fn on_error(&self, _info: &CallInfo, status: Status) {
        panic!("unexpected error {status}");
    }
}

/// Fails its own call, then checks that every further operation on it is
/// rejected.
struct SelfClosing;

impl MethodHandler for SelfClosing {
    fn on_request(&self, call: ServerCall<'_>, _payload: &[u8]) {
        call.fail(Status::Unimplemented).unwrap();
        assert!(!call.is_active());
        assert_eq!(call.respond(&[], Status::Ok), Err(Error::FailedPrecondition));
        assert_eq!(call.fail(Status::Internal), Err(Error::FailedPrecondition));
    }
}

#[test]
fn handlers_reenter_endpoints_synchronously() {
    let to_server: &'static DirectLink = Box::leak(Box::default());
    let to_client: &'static DirectLink = Box::leak(Box::default());

    let client_channels: &'static ChannelRegistry<'static, 1> =
        Box::leak(Box::new(ChannelRegistry::new()));
    client_channels.register(CHANNEL, to_server).unwrap();
    let server_channels: &'static ChannelRegistry<'static, 1> =
        Box::leak(Box::new(ChannelRegistry::new()));
    server_channels.register(CHANNEL, to_client).unwrap();

    let mut services: ServiceTable<'static, 2> = ServiceTable::new();
    services.add_method(SERVICE, 1, CallType::Unary, &Echo).unwrap();
    services
        .add_method(SERVICE, 2, CallType::Unary, &SelfClosing)
        .unwrap();
    let services: &'static ServiceTable<'static, 2> = Box::leak(Box::new(services));

    let server: &'static Server<'static, 4> =
        Box::leak(Box::new(Server::new(server_channels, services)));
    let client: &'static Client<'static, 4> = Box::leak(Box::new(Client::new(client_channels)));
    to_server.connect(server);
    to_client.connect(client);
    let _ = CHAIN.client.set(client);

    // The whole chain runs on this stack before invoke returns.
    let first = client
        .invoke(CHANNEL, SERVICE, 1, CallType::Unary, &[0], &CHAIN)
        .unwrap();
    assert!(!first.is_active());
    assert_eq!(CHAIN.completions.load(Ordering::SeqCst), 3);

    let recorder: &'static Recorder = Box::leak(Box::default());
    client
        .invoke(CHANNEL, SERVICE, 2, CallType::Unary, &[], recorder)
        .unwrap();
    assert_eq!(recorder.outcomes(), vec![Outcome::Error(Status::Unimplemented)]);

    assert_eq!(client.active_calls(), 0);
    assert_eq!(server.active_calls(), 0);
}
