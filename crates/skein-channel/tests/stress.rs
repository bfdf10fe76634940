//! Stress tests: cross-thread, cross-mapping churn on a single channel.
//!
//! These exercise the free ring and data rings under load to catch races
//! in the claim/commit protocol and buffer ownership handoff.

use std::sync::atomic::{AtomicU32, Ordering};

use skein_channel::{Channel, ChannelConfig};
use skein_primitives::Backing;

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("skein-stress-{}-{}-{}", std::process::id(), tag, n)
}

fn attach_peer(channel: &Channel) -> Channel {
    match channel.backing() {
        Backing::PosixShm => Channel::attach(channel.name()).expect("attach by name"),
        Backing::HugePage => {
            Channel::attach_fd(channel.try_clone_fd().expect("dup fd")).expect("attach by fd")
        }
    }
}

#[test]
fn alloc_free_churn_across_mappings() {
    const ITERATIONS: usize = 10_000;

    let name = unique_name("churn");
    let config = ChannelConfig {
        engine_ring_slots: 64,
        app_ring_slots: 64,
        buf_ring_slots: 64,
        buffer_size: 1024,
        pin_memory: false,
    };
    let engine = Channel::create(&name, &config).expect("create");
    let app = attach_peer(&engine);

    std::thread::scope(|s| {
        for side in [&engine, &app, &engine, &app] {
            s.spawn(move || {
                let mut indices = [0u32; 4];
                for i in 0..ITERATIONS {
                    let want = 1 + (i % 4);
                    let n = side.alloc_msgbuf_bulk(&mut indices[..want]);
                    if n == 0 {
                        std::hint::spin_loop();
                        continue;
                    }
                    // Touch each frame while owning it.
                    for &index in &indices[..n as usize] {
                        let frame = unsafe { side.msg_buf_mut(index) };
                        assert_eq!(frame.index(), index);
                        frame.append(4).expect("tailroom");
                    }
                    while !side.free_msgbuf_bulk(&indices[..n as usize]) {
                        std::thread::yield_now();
                    }
                }
            });
        }
    });

    // Every buffer returned home.
    assert_eq!(engine.free_buf_count(), 64);
}

#[test]
fn pipelined_messages_arrive_in_order_and_recycle() {
    const TOTAL: u64 = 20_000;

    let name = unique_name("pipeline");
    let config = ChannelConfig {
        engine_ring_slots: 128,
        app_ring_slots: 128,
        buf_ring_slots: 64,
        buffer_size: 512,
        pin_memory: false,
    };
    let engine = Channel::create(&name, &config).expect("create");
    let app = attach_peer(&engine);

    std::thread::scope(|s| {
        // Engine: allocate, stamp a sequence number, send.
        s.spawn(|| {
            let mut seq = 0u64;
            let mut indices = [0u32; 8];
            while seq < TOTAL {
                let n = engine.alloc_msgbuf_bulk(&mut indices);
                if n == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                for &index in &indices[..n as usize] {
                    let frame = unsafe { engine.msg_buf_mut(index) };
                    frame
                        .append(8)
                        .expect("tailroom")
                        .copy_from_slice(&seq.to_le_bytes());
                    seq += 1;
                }
                let mut batch = &indices[..n as usize];
                while !batch.is_empty() {
                    let sent = engine.enqueue_messages_to_app(batch);
                    batch = &batch[sent as usize..];
                    if sent == 0 {
                        std::hint::spin_loop();
                    }
                }
            }
        });

        // App: receive, verify the sequence, recycle.
        let receiver = s.spawn(|| {
            let mut expected = 0u64;
            let mut out = [0u32; 8];
            while expected < TOTAL {
                let n = app.dequeue_messages_from_engine(&mut out);
                if n == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                for &index in &out[..n as usize] {
                    let frame = app.msg_buf(index);
                    let seq = u64::from_le_bytes(frame.data().try_into().unwrap());
                    assert_eq!(seq, expected, "messages reordered");
                    expected += 1;
                }
                while !app.free_msgbuf_bulk(&out[..n as usize]) {
                    std::thread::yield_now();
                }
            }
            expected
        });

        assert_eq!(receiver.join().unwrap(), TOTAL);
    });

    assert_eq!(engine.free_buf_count(), 64);
    assert_eq!(
        engine.stats().msgs_to_app.load(Ordering::Relaxed),
        TOTAL
    );
}

#[test]
fn bidirectional_traffic_settles_clean() {
    const PER_DIRECTION: u64 = 5_000;

    let name = unique_name("bidi");
    let config = ChannelConfig {
        engine_ring_slots: 64,
        app_ring_slots: 64,
        buf_ring_slots: 128,
        buffer_size: 256,
        pin_memory: false,
    };
    let engine = Channel::create(&name, &config).expect("create");
    let app = attach_peer(&engine);

    // Each side sends on its own ring and drains + frees the opposite one.
    fn pump(
        side: &Channel,
        send: impl Fn(&Channel, &[u32]) -> u32,
        recv: impl Fn(&Channel, &mut [u32]) -> u32,
        total: u64,
    ) {
        let mut sent = 0u64;
        let mut received = 0u64;
        let mut out = [0u32; 4];
        while sent < total || received < total {
            if sent < total {
                if let Some(index) = side.alloc_msgbuf() {
                    while send(side, &[index]) == 0 {
                        std::hint::spin_loop();
                    }
                    sent += 1;
                }
            }
            let n = recv(side, &mut out);
            for &index in &out[..n as usize] {
                assert_eq!(side.msg_buf(index).index(), index);
                while !side.free_msgbuf(index) {
                    std::thread::yield_now();
                }
                received += 1;
            }
        }
    }

    std::thread::scope(|s| {
        s.spawn(|| {
            pump(
                &engine,
                |c, idx| c.enqueue_messages_to_app(idx),
                |c, out| c.dequeue_messages_from_app(out),
                PER_DIRECTION,
            );
        });
        s.spawn(|| {
            pump(
                &app,
                |c, idx| c.enqueue_messages_to_engine(idx),
                |c, out| c.dequeue_messages_from_engine(out),
                PER_DIRECTION,
            );
        });
    });

    assert_eq!(engine.free_buf_count(), 128);
    assert_eq!(
        engine.stats().msgs_to_app.load(Ordering::Relaxed),
        PER_DIRECTION
    );
    assert_eq!(
        engine.stats().msgs_to_engine.load(Ordering::Relaxed),
        PER_DIRECTION
    );
}

#[test]
fn control_ping_pong_under_contention() {
    use skein_channel::{CtrlQueueEntry, FlowInfo, opcode, status};

    const ROUNDS: u64 = 2_000;

    let name = unique_name("ctrl");
    let config = ChannelConfig {
        engine_ring_slots: 16,
        app_ring_slots: 16,
        buf_ring_slots: 16,
        buffer_size: 256,
        pin_memory: false,
    };
    let engine = Channel::create(&name, &config).expect("create");
    let app = attach_peer(&engine);

    std::thread::scope(|s| {
        // Engine: service requests forever until it has completed ROUNDS.
        s.spawn(|| {
            let mut completed = 0u64;
            let mut requests = [CtrlQueueEntry::request(0, 0, FlowInfo::default()); 2];
            while completed < ROUNDS {
                let n = engine.dequeue_ctrl_requests(&mut requests);
                if n == 0 {
                    std::hint::spin_loop();
                    continue;
                }
                for request in &requests[..n as usize] {
                    let completion = CtrlQueueEntry::completion(
                        request.id,
                        request.opcode,
                        status::OK,
                        request.flow,
                    );
                    while engine.enqueue_ctrl_completions(&[completion]) == 0 {
                        std::hint::spin_loop();
                    }
                    completed += 1;
                }
            }
        });

        // App: issue requests one at a time and match completions.
        let client = s.spawn(|| {
            let mut completions = [CtrlQueueEntry::request(0, 0, FlowInfo::default()); 2];
            for _ in 0..ROUNDS {
                let id = app.next_ctrl_request_id();
                let request = CtrlQueueEntry::request(id, opcode::LISTEN, FlowInfo::default());
                while app.enqueue_ctrl_request(&request) == 0 {
                    std::hint::spin_loop();
                }
                loop {
                    let n = app.dequeue_ctrl_completions(&mut completions);
                    if n > 0 {
                        assert_eq!(completions[0].id, id);
                        assert!(completions[0].is_ok());
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            ROUNDS
        });

        assert_eq!(client.join().unwrap(), ROUNDS);
    });

    assert_eq!(
        engine.stats().ctrl_requests.load(Ordering::Relaxed),
        ROUNDS
    );
}
