use std::time::Instant;

use lnwatch::bitcoin::{OutPoint, Transaction};
use lnwatch::chain::tracker::{ChainServices, ChainTracker};
use lnwatch::channel::{ChannelId, HtlcDirection};
use lnwatch::config::MonitorConfig;
use lnwatch::coordinator::{completion_channel, CompletionSender, MonitorUpdateId, UpdateOrigin};
use lnwatch::events::{ClosureReason, Event, SpendableKind};
use lnwatch::monitor::UpdateApplied;
use lnwatch::util::mocks::*;
use lnwatch::util::test_utils::*;
use lnwatch::Arc;

use test_log::test;

struct Node {
    tracker: ChainTracker,
    persister: Arc<MockPersister>,
    broadcaster: Arc<MockBroadcaster>,
    listener: Arc<RecordingListener>,
    sender: CompletionSender,
}

fn services(
    persister: &Arc<MockPersister>,
    broadcaster: &Arc<MockBroadcaster>,
    listener: &Arc<RecordingListener>,
) -> ChainServices {
    ChainServices {
        filter: Arc::new(MockFilter::new()),
        broadcaster: broadcaster.clone(),
        fee_estimator: Arc::new(MockFeeEstimator::new(2500)),
        signer: Arc::new(MockSigner::new()),
        persister: persister.clone(),
        listener: listener.clone(),
    }
}

impl Node {
    fn new(chain: &TestChain, persister: Arc<MockPersister>) -> Node {
        let broadcaster = Arc::new(MockBroadcaster::new());
        let listener = Arc::new(RecordingListener::new());
        let (sender, receiver) = completion_channel();
        let tracker = ChainTracker::new(
            chain.tip(),
            services(&persister, &broadcaster, &listener),
            MonitorConfig::default(),
            receiver,
        )
        .unwrap();
        Node { tracker, persister, broadcaster, listener, sender }
    }

    // restart on top of whatever the persister holds
    fn restart(self, chain: &TestChain) -> Node {
        let Node { persister, .. } = self;
        let broadcaster = Arc::new(MockBroadcaster::new());
        let listener = Arc::new(RecordingListener::new());
        let (sender, receiver) = completion_channel();
        let tracker = ChainTracker::load(
            chain.tip(),
            services(&persister, &broadcaster, &listener),
            MonitorConfig::default(),
            receiver,
        )
        .unwrap();
        Node { tracker, persister, broadcaster, listener, sender }
    }

    fn connect(&self, chain: &mut TestChain, txs: &[Transaction]) -> Vec<Event> {
        let (header, height) = chain.next();
        let failures = self.tracker.block_connected(&header, height, txs).unwrap();
        assert!(failures.is_empty(), "{:?}", failures);
        self.persister.complete_all(&self.sender);
        self.tracker.drain_events()
    }

    fn ack_all(&self) {
        self.persister.complete_all(&self.sender);
        self.tracker.process_pending_persistence(Instant::now());
    }
}

fn open(node: &Node, fixture: &ChannelFixture, chain: &TestChain) -> ChannelId {
    node.tracker.watch_channel(fixture.monitor(chain.tip(), &MonitorConfig::default())).unwrap();
    node.ack_all();
    fixture.channel_id()
}

#[test]
fn unblock_fires_once_after_async_ack() {
    let mut chain = TestChain::new(100);
    let node = Node::new(&chain, Arc::new(MockPersister::new(true)));
    let fixture = ChannelFixture::new(7);
    let channel_id = open(&node, &fixture, &chain);
    assert_eq!(node.listener.notifications(), vec![(channel_id, 0)]);

    let update = node.tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
    let update_id = MonitorUpdateId { channel_id, origin: UpdateOrigin::OffChain(update.update_id) };
    assert_eq!(node.persister.pending(), vec![update_id]);

    // a block arrives while the update is in flight
    let (header, height) = chain.next();
    node.tracker.block_connected(&header, height, &[]).unwrap();
    node.tracker.process_pending_persistence(Instant::now());
    assert_eq!(node.listener.notifications(), vec![(channel_id, 0)]);

    node.persister.complete(&node.sender, &update_id);
    node.tracker.process_pending_persistence(Instant::now());
    assert_eq!(node.listener.notifications(), vec![(channel_id, 0), (channel_id, 1)]);

    // a duplicate completion is ignored
    node.sender
        .send(lnwatch::coordinator::PersistCompletion { update_id, result: Ok(()) })
        .unwrap();
    node.tracker.process_pending_persistence(Instant::now());
    assert_eq!(node.listener.notifications().len(), 2);
}

#[test]
fn revoked_commitment_at_height_200() {
    let mut chain = TestChain::new(190);
    let node = Node::new(&chain, Arc::new(MockPersister::new(true)));
    let fixture = ChannelFixture::new(8);
    let channel_id = open(&node, &fixture, &chain);
    let htlc = fixture.htlc(4, 20_000, 400, HtlcDirection::Offered);
    for n in 1..=3 {
        node.tracker.update_commitment(&channel_id, fixture.state(n, &[htlc.clone()])).unwrap();
    }
    node.ack_all();

    node.connect(&mut chain, &[fixture.funding_tx.clone()]);
    while chain.height() < 199 {
        node.connect(&mut chain, &[]);
    }

    let revoked = fixture.counterparty_tx(1, &[htlc]);
    let events = node.connect(&mut chain, &[revoked.clone()]);
    assert_eq!(chain.height(), 200);
    assert_eq!(
        events,
        vec![Event::ChannelClosed {
            channel_id,
            closing_txid: revoked.compute_txid(),
            reason: ClosureReason::CounterpartyRevokedCommitment { commitment_number: 1 },
        }]
    );
    let justice = node.broadcaster.broadcasted().pop().expect("justice broadcast");
    assert_eq!(justice.input.len(), revoked.output.len());

    node.connect(&mut chain, &[justice.clone()]);
    let mut spendable = Vec::new();
    while chain.height() < 201 + 5 {
        let events = node.connect(&mut chain, &[]);
        if chain.height() < 206 {
            assert!(events.is_empty(), "at {}: {:?}", chain.height(), events);
        }
        spendable.extend(events);
    }
    match &spendable[..] {
        [Event::SpendableOutputs { outputs, .. }] => {
            assert_eq!(outputs[0].kind, SpendableKind::Justice);
            assert_eq!(outputs[0].outpoint, OutPoint::new(justice.compute_txid(), 0));
            assert_eq!(outputs[0].script_pubkey, fixture.params.destination_script);
        }
        other => panic!("unexpected {:?}", other),
    }
    node.tracker.ack_events();
    node.ack_all();
    assert_eq!(node.tracker.archive_fully_resolved_channels().unwrap(), vec![channel_id]);
}

#[test]
fn spendable_exactly_once_at_maturity() {
    let mut chain = TestChain::new(100);
    let node = Node::new(&chain, Arc::new(MockPersister::new(false)));
    let fixture = ChannelFixture::new(9);
    let channel_id = open(&node, &fixture, &chain);
    node.connect(&mut chain, &[fixture.funding_tx.clone()]);
    node.tracker.force_close(&channel_id).unwrap();
    let commitment = node.broadcaster.broadcasted().pop().unwrap();

    node.connect(&mut chain, &[commitment.clone()]);
    let close_height = chain.height();
    let maturity = close_height + TO_SELF_DELAY as u32;
    while chain.height() < maturity - 1 {
        let events = node.connect(&mut chain, &[]);
        assert!(
            events.iter().all(|e| !matches!(e, Event::SpendableOutputs { .. })),
            "early at {}",
            chain.height()
        );
    }
    let events = node.connect(&mut chain, &[]);
    assert_eq!(chain.height(), maturity);
    assert!(matches!(&events[..], [Event::SpendableOutputs { .. }]));

    // re-delivery of the same block
    let tip = chain.tip_header();
    node.tracker.block_connected(&tip, maturity, &[]).unwrap();
    assert!(node.tracker.drain_events().is_empty());

    // the block is reorged out and a replacement connected
    node.tracker.block_disconnected(&tip, maturity).unwrap();
    chain.truncate(maturity - 1);
    chain.salt(1);
    assert!(node.connect(&mut chain, &[]).is_empty());
    assert!(node.connect(&mut chain, &[]).is_empty());
}

#[test]
fn crash_before_ack_then_replay() {
    let mut chain = TestChain::new(100);
    let node = Node::new(&chain, Arc::new(MockPersister::new(true)));
    let fixture = ChannelFixture::new(10);
    let channel_id = open(&node, &fixture, &chain);
    node.connect(&mut chain, &[fixture.funding_tx.clone()]);

    let first = node.tracker.update_commitment(&channel_id, fixture.state(1, &[])).unwrap();
    node.ack_all();
    let htlc = fixture.htlc(2, 30_000, 500, HtlcDirection::Received);
    let second = node.tracker.update_commitment(&channel_id, fixture.state(2, &[htlc])).unwrap();
    assert_eq!(node.persister.pending().len(), 1);

    // crash: the write of the second update never lands
    node.persister.drop_pending();
    let node = node.restart(&chain);
    let reloaded = node.tracker.get_monitor(&channel_id).unwrap();
    assert_eq!(reloaded.latest_update_id(), 1);

    assert_eq!(node.tracker.apply_update(&channel_id, &first).unwrap(), UpdateApplied::AlreadyApplied);
    assert_eq!(node.tracker.apply_update(&channel_id, &second).unwrap(), UpdateApplied::Applied);
    node.ack_all();
    assert_eq!(node.listener.notifications(), vec![(channel_id, 2)]);

    // same state as if the second write had completed
    let mut expected = fixture.monitor(TestChain::new(100).tip(), &MonitorConfig::default());
    let (header, height) = TestChain::new(100).next();
    expected.apply_block(&header, height, &[fixture.funding_tx.clone()], 2500).unwrap();
    expected.apply_update(&first).unwrap();
    expected.apply_update(&second).unwrap();
    let actual = node.tracker.get_monitor(&channel_id).unwrap();
    assert_eq!(actual.latest_update_id(), expected.latest_update_id());
    assert_eq!(actual.holder_commitment(), expected.holder_commitment());
    assert_eq!(actual.htlcs(), expected.htlcs());
    assert_eq!(actual.chain_state(), expected.chain_state());
    assert_eq!(actual.claimable_balances(), expected.claimable_balances());
    assert_eq!(node.persister.stored(&channel_id).unwrap().latest_update_id, 2);
}

#[test]
fn channels_are_independent_within_a_block() {
    let mut chain = TestChain::new(100);
    let node = Node::new(&chain, Arc::new(MockPersister::new(false)));
    let a = ChannelFixture::new(11);
    let b = ChannelFixture::new(12);
    let a_id = open(&node, &a, &chain);
    let b_id = open(&node, &b, &chain);
    node.connect(&mut chain, &[a.funding_tx.clone(), b.funding_tx.clone()]);
    let events = node.connect(&mut chain, &[a.cooperative_close_tx(100_000)]);
    assert_eq!(events.len(), 3);
    assert!(events.contains(&Event::ChannelReady { channel_id: a_id, funding_height: 101 }));
    assert!(events.contains(&Event::ChannelReady { channel_id: b_id, funding_height: 101 }));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ChannelClosed { channel_id, reason: ClosureReason::CooperativeClosure, .. } if *channel_id == a_id
    )));
    assert!(node.tracker.get_monitor(&b_id).unwrap().chain_state().closing.is_none());
    assert_eq!(node.tracker.list_channels(), {
        let mut ids = vec![a_id, b_id];
        ids.sort();
        ids
    });
}
