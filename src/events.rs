use crate::{Block, MinedBlock, ReceiptLog, TxReceipt};
use alloy::primitives::B256;
use std::{ops::ControlFlow, sync::Arc};

/// A node lifecycle event.
///
/// Events are published on the node's broadcast channel once a mining round
/// has committed. For each block, its [`NodeEvent::NewBlock`] comes first,
/// followed by each receipt and then that receipt's logs. Events of two
/// blocks never interleave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A block was mined.
    NewBlock(Arc<Block>),
    /// A transaction was mined.
    NewReceipt(TxReceipt),
    /// A log was emitted by a mined transaction.
    NewLog(ReceiptLog),
    /// A transaction entered the pool.
    NewPendingTransaction(B256),
}

/// Synchronous callbacks run while a round's events are published.
///
/// Returning [`ControlFlow::Break`] stops delivery of every remaining
/// callback for the round. Mining and channel publication are unaffected.
pub trait MineObserver: Send {
    /// Called for each mined block.
    fn on_block(&mut self, _block: &Block) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called for each receipt, after its block.
    fn on_receipt(&mut self, _receipt: &TxReceipt) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called for each log, after its receipt.
    fn on_log(&mut self, _log: &ReceiptLog) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

/// Walk the events of mined blocks in publication order.
pub(crate) fn round_events(mined: &[MinedBlock]) -> impl Iterator<Item = NodeEvent> + '_ {
    mined.iter().flat_map(|mined| {
        std::iter::once(NodeEvent::NewBlock(mined.block.clone())).chain(
            mined.receipts.iter().flat_map(|receipt| {
                std::iter::once(NodeEvent::NewReceipt(receipt.clone()))
                    .chain(receipt.logs.iter().cloned().map(NodeEvent::NewLog))
            }),
        )
    })
}

/// Deliver an event to an observer.
pub(crate) fn observe(observer: &mut dyn MineObserver, event: &NodeEvent) -> ControlFlow<()> {
    match event {
        NodeEvent::NewBlock(block) => observer.on_block(block),
        NodeEvent::NewReceipt(receipt) => observer.on_receipt(receipt),
        NodeEvent::NewLog(log) => observer.on_log(log),
        NodeEvent::NewPendingTransaction(_) => ControlFlow::Continue(()),
    }
}
