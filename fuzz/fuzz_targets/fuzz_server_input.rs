//! Fuzz target: `Server::process_incoming_packet`
//!
//! Splits the input into length-prefixed chunks and feeds each one to a
//! server with a streaming method registered. The server must never
//! panic and never track more calls than its capacity.
//!
//! cargo fuzz run fuzz_server_input

#![no_main]

use embrpc::rpc::{
    CallType, ChannelRegistry, MethodHandler, NullOutput, Server, ServerCall, ServiceTable,
};
use embrpc::Status;
use libfuzzer_sys::fuzz_target;

struct Streamer;

impl MethodHandler for Streamer {
    fn on_request(&self, call: ServerCall<'_>, payload: &[u8]) {
        if payload.first() == Some(&0) {
            let _ = call.finish(Status::Ok);
        }
    }

    fn on_client_stream(&self, call: ServerCall<'_>, payload: &[u8]) {
        let _ = call.write(payload);
    }
}

fuzz_target!(|data: &[u8]| {
    let out = NullOutput;
    let channels: ChannelRegistry<'_, 2> = ChannelRegistry::new();
    let _ = channels.register(1, &out);
    let handler = Streamer;
    let mut services: ServiceTable<'_, 2> = ServiceTable::new();
    let _ = services.add_method(0, 0, CallType::Bidirectional, &handler);
    let _ = services.add_method(1, 1, CallType::Unary, &handler);
    let server: Server<'_, 4> = Server::new(&channels, &services);

    let mut rest = data;
    while let Some((&len, tail)) = rest.split_first() {
        let len = usize::from(len).min(tail.len());
        let (chunk, tail) = tail.split_at(len);
        let _ = server.process_incoming_packet(chunk);
        assert!(server.active_calls() <= 4);
        rest = tail;
    }
});
