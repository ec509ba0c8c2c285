//! Fan-out throughput benchmarks.
//!
//! Measures how fast the router resolves recipients and enqueues one encoded
//! event for every online member of a room.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use talkroom_bench::RoomFixture;
use talkroom_protocol::{MessageRecord, MessageType, RoomId, ServerEvent, UserId};

fn message_event(room_id: RoomId) -> ServerEvent {
    ServerEvent::Message(MessageRecord {
        id: 1,
        room_id,
        sender_id: UserId(1),
        content: "x".repeat(256),
        message_type: MessageType::Text,
        reply_to_id: None,
        created_at: Utc::now(),
        sender: None,
    })
}

/// Broadcast a message to rooms of increasing size.
fn bench_room_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_broadcast");

    for members in [10, 100, 1000] {
        let room = RoomId(1);
        let mut fixture = RoomFixture::new(members, &[room]);
        let event = message_event(room);

        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, _| {
            b.iter(|| {
                let report = fixture
                    .hub
                    .router()
                    .broadcast_to_room(black_box(room), black_box(&event), None);
                fixture.drain();
                report.delivered()
            });
        });
    }

    group.finish();
}

/// Presence fan-out across overlapping rooms, deduplicated per recipient.
fn bench_presence_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_fanout");

    let rooms: Vec<RoomId> = (1..=10).map(RoomId).collect();
    let mut fixture = RoomFixture::new(500, &rooms);
    let event = ServerEvent::user_status(UserId(1), true);

    group.throughput(Throughput::Elements(499));
    group.bench_function("500_users_10_rooms", |b| {
        b.iter(|| {
            let report = fixture.hub.router().broadcast_to_rooms(
                black_box(rooms.iter().copied()),
                black_box(&event),
                Some(UserId(1)),
            );
            fixture.drain();
            report.delivered()
        });
    });

    group.finish();
}

/// Recipient resolution alone.
fn bench_online_members(c: &mut Criterion) {
    let fixture = RoomFixture::new(1000, &[RoomId(1)]);

    c.bench_function("online_members_1000", |b| {
        b.iter(|| fixture.hub.online_members(black_box(RoomId(1))).len())
    });
}

criterion_group!(
    benches,
    bench_room_broadcast,
    bench_presence_fanout,
    bench_online_members,
);
criterion_main!(benches);
