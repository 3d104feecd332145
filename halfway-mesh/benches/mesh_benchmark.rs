use criterion::{black_box, criterion_group, criterion_main, Criterion};
use halfway_mesh::mesh::{dial_targets, ConnectionTable};
use halfway_mesh::protocol::{Envelope, Location, LocationSource, Member, PeerAddress, RoomId};
use halfway_mesh::roster::Roster;
use std::collections::HashSet;

fn room() -> RoomId {
    RoomId::parse("bench-room").unwrap()
}

fn member_with_locations(name: &str, count: usize) -> Member {
    let mut member = Member::new(name);
    for i in 0..count {
        member.add_location(Location::new(
            48.0 + i as f64 * 0.01,
            2.0 + i as f64 * 0.01,
            format!("Stop {i}"),
            LocationSource::Place,
        ));
    }
    member
}

fn snapshot_of(size: usize) -> Vec<Member> {
    (0..size)
        .map(|i| {
            let mut member = member_with_locations(&format!("Peer{i}"), 2);
            member.address = Some(PeerAddress::new(room(), i as u32));
            member
        })
        .collect()
}

fn bench_member_update_encode(c: &mut Criterion) {
    let envelope = Envelope::MemberUpdate {
        member: member_with_locations("Alice", 3),
    };

    c.bench_function("member_update_encode", |b| {
        b.iter(|| black_box(black_box(&envelope).encode().unwrap()))
    });
}

fn bench_member_update_decode(c: &mut Criterion) {
    let encoded = Envelope::MemberUpdate {
        member: member_with_locations("Alice", 3),
    }
    .encode()
    .unwrap();

    c.bench_function("member_update_decode", |b| {
        b.iter(|| black_box(Envelope::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_snapshot_encode_12(c: &mut Criterion) {
    let envelope = Envelope::StateSnapshot {
        title: "Room bench-room".into(),
        members: snapshot_of(12),
    };

    c.bench_function("snapshot_encode_12_members", |b| {
        b.iter(|| black_box(envelope.encode().unwrap()))
    });
}

fn bench_roster_upsert(c: &mut Criterion) {
    let members = snapshot_of(100);

    c.bench_function("roster_upsert_100", |b| {
        b.iter(|| {
            let mut roster = Roster::new(Member::new("Local"));
            for member in &members {
                black_box(roster.upsert(member.clone()));
            }
        })
    });
}

fn bench_roster_duplicate_upsert(c: &mut Criterion) {
    let mut roster = Roster::new(Member::new("Local"));
    let member = member_with_locations("Bob", 5);
    roster.upsert(member.clone());

    c.bench_function("roster_duplicate_upsert", |b| {
        b.iter(|| black_box(roster.upsert(black_box(member.clone()))))
    });
}

fn bench_apply_snapshot_12(c: &mut Criterion) {
    let members = snapshot_of(12);
    let keep = HashSet::new();

    c.bench_function("apply_snapshot_12_members", |b| {
        b.iter(|| {
            let mut roster = Roster::new(Member::new("Local"));
            black_box(roster.apply_snapshot(members.clone(), &keep));
        })
    });
}

fn bench_midpoint_100(c: &mut Criterion) {
    let mut roster = Roster::new(member_with_locations("Local", 3));
    for member in snapshot_of(100) {
        roster.upsert(member);
    }

    c.bench_function("midpoint_100_members", |b| b.iter(|| black_box(roster.midpoint())));
}

fn bench_dial_targets(c: &mut Criterion) {
    c.bench_function("dial_targets_slot_6_of_12", |b| {
        b.iter(|| black_box(dial_targets(black_box(6), black_box(12)).count()))
    });
}

fn bench_connection_table_dials(c: &mut Criterion) {
    let targets: Vec<PeerAddress> = (0..12).map(|slot| PeerAddress::new(room(), slot)).collect();

    c.bench_function("connection_table_begin_dial_12", |b| {
        b.iter(|| {
            let mut table = ConnectionTable::new();
            for target in &targets {
                black_box(table.begin_dial(target.clone()));
            }
            for target in &targets {
                table.dial_failed(target);
            }
        })
    });
}

criterion_group!(
    benches,
    bench_member_update_encode,
    bench_member_update_decode,
    bench_snapshot_encode_12,
    bench_roster_upsert,
    bench_roster_duplicate_upsert,
    bench_apply_snapshot_12,
    bench_midpoint_100,
    bench_dial_targets,
    bench_connection_table_dials,
);
criterion_main!(benches);
