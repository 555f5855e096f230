// tests/channel_table_test.rs

//! Integration coverage for channel-table parity and capacity growth
//! across the initiator/acceptor split (spec.md §4.2), beyond the inline
//! unit tests in `src/channel.rs`.

use clustercache::channel::{ChannelTable, LinkRole, CONTROL_CHANNEL, MAX_CAPACITY};

#[test]
fn initiator_and_acceptor_never_collide_on_local_ids() {
    let mut initiator: ChannelTable<&'static str> = ChannelTable::new(LinkRole::Initiator);
    let mut acceptor: ChannelTable<&'static str> = ChannelTable::new(LinkRole::Acceptor);

    let local_initiator_id = initiator.alloc("a", None).unwrap();
    let local_acceptor_id = acceptor.alloc("b", None).unwrap();

    assert_eq!(local_initiator_id % 2, 1);
    assert_eq!(local_acceptor_id % 2, 0);
    assert_ne!(local_initiator_id, CONTROL_CHANNEL);
    assert_ne!(local_acceptor_id, CONTROL_CHANNEL);
}

#[test]
fn acceptor_binds_the_initiators_chosen_remote_id() {
    let mut initiator: ChannelTable<&'static str> = ChannelTable::new(LinkRole::Initiator);
    let mut acceptor: ChannelTable<&'static str> = ChannelTable::new(LinkRole::Acceptor);

    let id = initiator.alloc("local-side", None).unwrap();
    let bound = acceptor.alloc("remote-side", Some(id)).unwrap();
    assert_eq!(bound, id);
    assert!(acceptor.get(id).is_some());
}

#[test]
fn table_never_grows_past_32767_total_slots() {
    let mut table: ChannelTable<u32> = ChannelTable::new(LinkRole::Initiator);
    let mut allocated = Vec::new();
    loop {
        match table.alloc(allocated.len() as u32, None) {
            Ok(id) => allocated.push(id),
            Err(_) => break,
        }
    }
    assert!(table.capacity() <= MAX_CAPACITY);
    assert!(allocated.iter().all(|&id| id != CONTROL_CHANNEL));
}
