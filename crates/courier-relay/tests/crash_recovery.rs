//! Restart tests: a relay rebuilt from storage picks up where the old one
//! stopped.

use courier_core::{ChatId, ChatType, DeliveryStatus, MessageId};
use courier_harness::{SimEnv, SimWorld};
use courier_relay::{MemoryStorage, RecoveryReport, RelayConfig, RelayDriver, RelayEvent};

fn restart(world: &SimWorld) -> (RelayDriver<SimEnv, MemoryStorage>, RecoveryReport) {
    let mut relay =
        RelayDriver::new(SimEnv::with_seed(0), world.relay().storage().clone(), RelayConfig::default());
    let report = relay.recover().unwrap();
    (relay, report)
}

#[test]
fn restart_restores_statuses_receipts_and_watermarks() {
    let mut world = SimWorld::new(77);
    let alice = world.add_client("alice");
    let bob = world.add_client("bob");
    let carol = world.add_client("carol");
    let group = world.create_group("team", &alice, &[bob.clone(), carol.clone()]);

    let direct = world.send_direct(&alice, &bob, "hi bob").unwrap();
    world.env().advance(10);
    let grouped = world.send_group(&alice, &group, "hi team").unwrap();
    world.rotate(&group, &alice);

    world.report(&bob, &direct, DeliveryStatus::Delivered);
    world.report(&bob, &grouped, DeliveryStatus::Seen);
    world.report(&carol, &grouped, DeliveryStatus::Delivered);
    let chat = ChatId::direct(&alice, &bob);
    let at = world.relay().message(&direct).unwrap().created_at;
    world.mark_seen(&bob, &chat, &direct, at);
    world.open_chat(&carol, ChatType::Group, "team");

    let (relay, report) = restart(&world);

    assert_eq!(report.groups, 1);
    assert_eq!(report.messages, 2);
    assert_eq!(report.receipts, 2);
    assert_eq!(report.read_states, 2);
    assert!(world.storage_failures().is_empty());

    for id in [&direct, &grouped] {
        assert_eq!(relay.status(id), world.relay().status(id));
        assert_eq!(relay.export_message(id), world.relay().export_message(id));
    }
    assert_eq!(relay.status(&direct), Some(DeliveryStatus::Seen));
    assert_eq!(relay.status(&grouped), Some(DeliveryStatus::Delivered));
    assert_eq!(relay.read_state().watermark(&bob, &chat), Some(at));
    assert_eq!(relay.unread_count(&carol, &ChatId::group(&group)), 1);
    assert_eq!(relay.directory().get(&group).unwrap().key_version, 2);
}

#[test]
fn recovered_relay_keeps_processing() {
    let mut world = SimWorld::new(78);
    let alice = world.add_client("alice");
    let bob = world.add_client("bob");
    let carol = world.add_client("carol");
    let group = world.create_group("team", &alice, &[bob.clone(), carol.clone()]);
    let id = world.send_group(&alice, &group, "before the crash").unwrap();
    world.report(&bob, &id, DeliveryStatus::Seen);

    let (mut relay, _) = restart(&world);

    let actions = relay.process_event(RelayEvent::StatusReported {
        message_id: id.clone(),
        acting_user_id: Some(carol.clone()),
        status: DeliveryStatus::Seen,
        at: world.relay().message(&id).unwrap().created_at,
    });
    assert!(!actions.is_empty());
    assert_eq!(relay.status(&id), Some(DeliveryStatus::Seen));

    // The id is taken even though this process never saw the submission
    let resubmitted = world.relay().message(&id).unwrap().clone();
    relay.process_event(RelayEvent::MessageSubmitted { message: resubmitted });
    assert_eq!(relay.delivery().receipts(&id).len(), 2);
}

#[test]
fn second_recover_skips_tracked_messages() {
    let mut world = SimWorld::new(79);
    let alice = world.add_client("alice");
    let bob = world.add_client("bob");
    world.send_direct(&alice, &bob, "once").unwrap();

    let (mut relay, first) = restart(&world);
    let second = relay.recover().unwrap();

    assert_eq!(first.messages, 1);
    assert_eq!(second.messages, 0);
    assert!(relay.message(&MessageId::new("missing").unwrap()).is_none());
}
