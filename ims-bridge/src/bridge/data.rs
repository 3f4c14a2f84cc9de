//! Data channel consumer

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::{BlockHandler, RxBlock};
use crate::packet::{PacketCodec, ENVELOPE_LEN};
use crate::router::Router;

/// Reassembles data blocks and hands finished packets to the router
pub(crate) struct DataHandler {
    codec: Arc<PacketCodec>,
    router: Arc<Router>,
}

impl DataHandler {
    pub(crate) fn new(codec: Arc<PacketCodec>, router: Arc<Router>) -> Self {
        Self { codec, router }
    }
}

#[async_trait]
impl BlockHandler for DataHandler {
    fn header_len(&self) -> usize {
        ENVELOPE_LEN
    }

    fn handle(&self, block: RxBlock) {
        if let Some(packet) = self.codec.accept(block.bytes()) {
            self.router.deliver_from_cp(packet);
        }
    }
}
