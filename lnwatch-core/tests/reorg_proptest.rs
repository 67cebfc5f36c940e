use lnwatch::bitcoin::{OutPoint, Transaction};
use lnwatch::channel::HtlcDirection;
use lnwatch::config::MonitorConfig;
use lnwatch::monitor::ChannelMonitor;
use lnwatch::util::test_utils::*;

use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum BlockContent {
    Empty,
    Funding,
    HolderClose,
    CounterpartyClose,
    RevokedClose,
    CooperativeClose,
    // spend output `n` of whichever commitment is on chain
    SpendOutput(u32),
}

fn block_content() -> impl Strategy<Value = BlockContent> {
    prop_oneof![
        3 => Just(BlockContent::Empty),
        2 => Just(BlockContent::Funding),
        1 => Just(BlockContent::HolderClose),
        1 => Just(BlockContent::CounterpartyClose),
        1 => Just(BlockContent::RevokedClose),
        1 => Just(BlockContent::CooperativeClose),
        2 => (0u32..4).prop_map(BlockContent::SpendOutput),
    ]
}

fn transactions(fixture: &ChannelFixture, content: BlockContent) -> Vec<Transaction> {
    let htlcs = [
        fixture.htlc(1, 40_000, 150, HtlcDirection::Offered),
        fixture.htlc(2, 30_000, 160, HtlcDirection::Received),
    ];
    match content {
        BlockContent::Empty => vec![],
        BlockContent::Funding => vec![fixture.funding_tx.clone()],
        BlockContent::HolderClose => vec![fixture.holder_tx(2, &htlcs)],
        BlockContent::CounterpartyClose => vec![fixture.counterparty_tx(2, &htlcs)],
        BlockContent::RevokedClose => vec![fixture.counterparty_tx(1, &htlcs)],
        BlockContent::CooperativeClose => vec![fixture.cooperative_close_tx(500_000)],
        BlockContent::SpendOutput(n) => {
            let candidates = [
                fixture.holder_tx(2, &htlcs),
                fixture.counterparty_tx(2, &htlcs),
                fixture.counterparty_tx(1, &htlcs),
            ];
            let outpoints: Vec<OutPoint> =
                candidates.iter().map(|tx| OutPoint::new(tx.compute_txid(), n)).collect();
            vec![make_spend(&outpoints, 1000)]
        }
    }
}

fn monitor_at(fixture: &ChannelFixture, chain: &TestChain) -> ChannelMonitor {
    let htlcs = [
        fixture.htlc(1, 40_000, 150, HtlcDirection::Offered),
        fixture.htlc(2, 30_000, 160, HtlcDirection::Received),
    ];
    let mut monitor = fixture.monitor(chain.tip(), &MonitorConfig::default());
    monitor.update_commitment(fixture.state(1, &htlcs)).unwrap();
    monitor.update_commitment(fixture.state(2, &htlcs)).unwrap();
    monitor.provide_preimage(fixture.preimage(2)).unwrap();
    monitor
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn connect_then_disconnect_restores_chain_state(
        prefix in prop::collection::vec(block_content(), 0..6),
        blocks in prop::collection::vec(block_content(), 1..12),
    ) {
        let fixture = ChannelFixture::new(3);
        let mut chain = TestChain::new(100);
        let mut monitor = monitor_at(&fixture, &chain);
        for content in prefix {
            let (header, height) = chain.next();
            monitor.apply_block(&header, height, &transactions(&fixture, content), 253).unwrap();
        }
        let before = monitor.chain_state().clone();
        let base = chain.height();

        for content in blocks.iter() {
            let (header, height) = chain.next();
            monitor.apply_block(&header, height, &transactions(&fixture, *content), 253).unwrap();
        }
        while chain.height() > base {
            monitor.disconnect_block(chain.height()).unwrap();
            chain.truncate(chain.height() - 1);
        }
        prop_assert_eq!(monitor.chain_state(), &before);
    }

    #[test]
    fn reconnecting_never_duplicates_events(
        blocks in prop::collection::vec(block_content(), 1..12),
        depth in 1usize..6,
    ) {
        let fixture = ChannelFixture::new(4);
        let mut chain = TestChain::new(100);
        let mut monitor = monitor_at(&fixture, &chain);
        let mut delivered = Vec::new();
        for content in blocks.iter() {
            let (header, height) = chain.next();
            let txs = transactions(&fixture, *content);
            monitor.apply_block(&header, height, &txs, 253).unwrap();
            delivered.push((header, height, txs));
        }
        let mut events = monitor.take_pending_events();

        let depth = depth.min(delivered.len());
        for (_, height, _) in delivered.iter().rev().take(depth) {
            monitor.disconnect_block(*height).unwrap();
        }
        for (header, height, txs) in delivered[delivered.len() - depth..].iter() {
            monitor.apply_block(header, *height, txs, 253).unwrap();
        }
        events.extend(monitor.take_pending_events());
        for (i, event) in events.iter().enumerate() {
            prop_assert!(!events[i + 1..].contains(event), "duplicate {:?}", event);
        }
    }
}
