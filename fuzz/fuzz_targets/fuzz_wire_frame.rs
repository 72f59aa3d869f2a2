//! Fuzz target for frame decoding.
//!
//! Every frame read from a socket is decoded as either a request or a
//! gossip message; arbitrary bytes must produce an error, never a panic.

#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use trtl_replica::gossip::SyncMessage;
use trtl_replica::server::Request;
use trtl_replica::transport::decode;

fuzz_target!(|data: &[u8]| {
    let frame = BytesMut::from(data);
    let _ = decode::<Request>(&frame);
    let _ = decode::<SyncMessage>(&frame);
});
