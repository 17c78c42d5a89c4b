mod support;

use rpcreplay::entry::read_entry;
use rpcreplay::header::read_header;
use rpcreplay::{
    invoke, CallContext, Channel, Code, Entry, EntryKind, Message, Payload, Recorder,
    RecorderOptions, ReplayError, Replayer, ReplayerOptions, Status, TypedStream,
};
use std::collections::HashSet;
use std::sync::Arc;
use support::{
    GetRequest, IntStore, Item, ListItemsRequest, SetResponse, Summary, GET, INCR, LIST_ITEMS,
    SET, SET_STREAM,
};

// ── helpers ───────────────────────────────────────────────────────────────────

fn set(channel: &dyn Channel, name: &str, value: i64) -> Result<SetResponse, Status> {
    invoke(channel, &CallContext::new(), SET, &Item::new(name, value))
}

fn get(channel: &dyn Channel, name: &str) -> Result<Item, Status> {
    invoke(channel, &CallContext::new(), GET, &GetRequest::new(name))
}

fn list_items(channel: &dyn Channel) -> Result<Vec<Item>, Status> {
    let mut stream: TypedStream<ListItemsRequest, Item> =
        TypedStream::open(channel, &CallContext::new(), LIST_ITEMS)?;
    stream.send(&ListItemsRequest {})?;
    stream.close_send()?;
    stream.recv_all()
}

fn set_stream(channel: &dyn Channel, items: &[Item]) -> Result<Vec<Summary>, Status> {
    let mut stream: TypedStream<Item, Summary> =
        TypedStream::open(channel, &CallContext::new(), SET_STREAM)?;
    for item in items {
        stream.send(item)?;
    }
    stream.close_send()?;
    stream.recv_all()
}

fn encoded<M: Message>(message: &M) -> Payload {
    Payload::Message(message.encode().expect("encode"))
}

/// Run the same workload against any channel and return what it observed.
fn workload(channel: &dyn Channel) -> Vec<String> {
    vec![
        format!("{:?}", set(channel, "a", 1)),
        format!("{:?}", set(channel, "a", 2)),
        format!("{:?}", get(channel, "a")),
        format!("{:?}", get(channel, "x")),
        format!("{:?}", set_stream(channel, &[Item::new("b", 3), Item::new("c", 4)])),
        format!("{:?}", list_items(channel)),
    ]
}

fn record_workload(initial: &[u8]) -> (Vec<String>, Vec<u8>) {
    let recorder = Recorder::new(Vec::new(), initial).expect("recorder");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    let observed = workload(channel.as_ref());
    let log = recorder.close().expect("close");
    (observed, log)
}

// ── record then replay ────────────────────────────────────────────────────────

#[test]
fn replay_reproduces_recorded_results() {
    let (recorded, log) = record_workload(b"initial state");
    assert!(recorded[0].contains("prev_value: 0"));
    assert!(recorded[1].contains("prev_value: 1"));
    assert!(recorded[3].contains("NotFound"));

    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    assert_eq!(replayer.initial(), b"initial state");
    let replayed = workload(replayer.connection().as_ref());
    assert_eq!(replayed, recorded);
    assert!(replayer.unconsumed().is_empty());
}

#[test]
fn set_get_session_records_exact_entries_and_replays() {
    let recorder = Recorder::new(Vec::new(), b"initial state").expect("recorder");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    assert_eq!(set(channel.as_ref(), "a", 1).expect("set").prev_value, 0);
    assert_eq!(get(channel.as_ref(), "a").expect("get a"), Item::new("a", 1));
    assert_eq!(get(channel.as_ref(), "x").expect_err("get x"), Status::not_found("x"));
    let log = recorder.close().expect("close");

    let want = vec![
        Entry::request(SET, encoded(&Item::new("a", 1))),
        Entry::continuation(EntryKind::Response, encoded(&SetResponse { prev_value: 0 }), 1),
        Entry::request(GET, encoded(&GetRequest::new("a"))),
        Entry::continuation(EntryKind::Response, encoded(&Item::new("a", 1)), 3),
        Entry::request(GET, encoded(&GetRequest::new("x"))),
        Entry::continuation(EntryKind::Response, Payload::Error(Status::not_found("x")), 5),
    ];
    let mut reader = log.as_slice();
    assert_eq!(read_header(&mut reader).expect("header"), b"initial state".to_vec());
    for (i, want) in want.iter().enumerate() {
        let got = read_entry(&mut reader).expect("entry").expect("more entries");
        assert!(got.equivalent(want), "#{}: got {got:?}, want {want:?}", i + 1);
    }
    assert_eq!(read_entry(&mut reader).expect("end"), None);

    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    assert_eq!(replayer.initial(), b"initial state");
    let channel = replayer.connection();
    assert_eq!(set(channel.as_ref(), "a", 1).expect("set").prev_value, 0);
    assert_eq!(get(channel.as_ref(), "a").expect("get a"), Item::new("a", 1));
    assert_eq!(get(channel.as_ref(), "x").expect_err("get x"), Status::not_found("x"));
}

#[test]
fn replayed_not_found_keeps_code_and_message() {
    let (_, log) = record_workload(b"");
    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let channel = replayer.connection();
    let err = get(channel.as_ref(), "x").expect_err("not found");
    assert_eq!(err, Status::not_found("x"));
}

#[test]
fn replay_after_exhaustion_reports_unmatched_call() {
    let (_, log) = record_workload(b"");
    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let channel = replayer.connection();
    workload(channel.as_ref());

    let err = get(channel.as_ref(), "a").expect_err("exhausted");
    assert_eq!(err.code, Code::FailedPrecondition);
    assert!(err.message.starts_with("rpcreplay: "), "{}", err.message);
    let err = match Replayer::new(log.as_slice())
        .expect("replayer")
        .answer_unary(GET, b"{}")
    {
        Ok(payload) => panic!("unexpected answer: {payload:?}"),
        Err(err) => err,
    };
    assert!(matches!(err, ReplayError::UnmatchedCall { .. }), "{err}");
}

#[test]
fn out_of_order_calls_still_match_by_content() {
    let (_, log) = record_workload(b"");
    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let channel = replayer.connection();
    assert_eq!(get(channel.as_ref(), "a").expect("get a"), Item::new("a", 2));
    assert_eq!(set(channel.as_ref(), "a", 2).expect("set a=2").prev_value, 1);
    assert_eq!(set(channel.as_ref(), "a", 1).expect("set a=1").prev_value, 0);
}

// ── log structure ─────────────────────────────────────────────────────────────

#[test]
fn every_continuation_points_at_an_earlier_request() {
    let (_, log) = record_workload(b"");
    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let entries = replayer.entries();
    let mut responded = HashSet::new();
    for (pos, entry) in entries.iter().enumerate() {
        let index = pos as u64 + 1;
        if entry.kind == EntryKind::Request {
            assert_eq!(entry.ref_index, 0);
            assert!(!entry.method.is_empty());
            continue;
        }
        assert!(entry.ref_index < index, "entry #{index} points forward");
        let target = &entries[(entry.ref_index - 1) as usize];
        assert_eq!(target.kind, EntryKind::Request);
        if entry.kind == EntryKind::Response {
            let first = responded.insert(entry.ref_index);
            assert!(first, "second response for #{}", entry.ref_index);
        }
    }
    assert_eq!(responded.len(), replayer.call_count());
}

#[test]
fn streaming_calls_record_sends_and_receives() {
    let recorder = Recorder::new(Vec::new(), b"").expect("recorder");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    set_stream(channel.as_ref(), &[Item::new("b", 3), Item::new("c", 4)]).expect("set stream");
    let log = recorder.close().expect("close");

    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let kinds: Vec<(EntryKind, u64)> = replayer
        .entries()
        .iter()
        .map(|entry| (entry.kind, entry.ref_index))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EntryKind::Request, 0),
            (EntryKind::Send, 1),
            (EntryKind::Send, 1),
            (EntryKind::Receive, 1),
            (EntryKind::Response, 1),
        ]
    );
    assert_eq!(replayer.entries()[0].payload, Payload::empty());
    assert_eq!(
        replayer.entries()[3].payload,
        Payload::Message(Summary { count: 2 }.encode().expect("encode"))
    );
}

// ── concurrency ───────────────────────────────────────────────────────────────

#[test]
fn concurrent_identical_calls_are_each_served_once() {
    let recorder = Recorder::new(Vec::new(), b"").expect("recorder");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    for _ in 0..8 {
        let _: Item = invoke(channel.as_ref(), &CallContext::new(), INCR, &GetRequest::new("n"))
            .expect("incr");
    }
    let log = recorder.close().expect("close");

    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    let channel = replayer.connection();
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || {
                let item: Item =
                    invoke(channel.as_ref(), &CallContext::new(), INCR, &GetRequest::new("n"))
                        .expect("replayed incr");
                item.value
            })
        })
        .collect();
    let mut values: Vec<i64> = handles
        .into_iter()
        .map(|handle| handle.join().expect("thread"))
        .collect();
    values.sort_unstable();
    assert_eq!(values, (1..=8).collect::<Vec<_>>());
    assert!(replayer.unconsumed().is_empty());
}

#[test]
fn concurrent_recording_keeps_calls_correlated() {
    let recorder = Recorder::new(Vec::new(), b"").expect("recorder");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let channel = Arc::clone(&channel);
            std::thread::spawn(move || {
                for i in 0..10 {
                    set(channel.as_ref(), &format!("w{worker}"), i).expect("set");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread");
    }
    assert_eq!(recorder.entries_written(), 80);
    let log = recorder.close().expect("close");

    let replayer = Replayer::new(log.as_slice()).expect("replayer");
    assert_eq!(replayer.call_count(), 40);
    let channel = replayer.connection();
    for worker in 0..4 {
        for i in 0..10 {
            let prev = set(channel.as_ref(), &format!("w{worker}"), i)
                .expect("replayed set")
                .prev_value;
            assert_eq!(prev, if i == 0 { 0 } else { i - 1 });
        }
    }
}

// ── hooks ─────────────────────────────────────────────────────────────────────

fn redact(method: &str, bytes: &mut Vec<u8>) -> Result<(), Status> {
    if method != SET {
        return Ok(());
    }
    let mut item = Item::decode(bytes)?;
    if item.name == "password" {
        item.value = 0;
        *bytes = item.encode()?;
    }
    Ok(())
}

#[test]
fn scrubbed_requests_match_after_normalization() {
    let recorder = Recorder::with_options(
        Vec::new(),
        RecorderOptions::new(b"".to_vec()).with_before_write(redact),
    )
    .expect("recorder");
    let store = IntStore::default();
    let channel = recorder.wrap(Arc::new(store.clone()));
    set(channel.as_ref(), "password", 1234).expect("set");
    assert_eq!(get(&store, "password").expect("live value").value, 1234);
    let log = recorder.close().expect("close");
    let text = String::from_utf8_lossy(&log);
    assert!(!text.contains("1234"));

    let strict = Replayer::new(log.as_slice()).expect("replayer");
    assert!(set(strict.connection().as_ref(), "password", 9999).is_err());

    let options = ReplayerOptions::default().with_before_match(|method, bytes| {
        let _ = redact(method, bytes);
    });
    let replayer = Replayer::with_options(log.as_slice(), options).expect("replayer");
    let resp = set(replayer.connection().as_ref(), "password", 9999).expect("normalized");
    assert_eq!(resp.prev_value, 0);
}

// ── files ─────────────────────────────────────────────────────────────────────

#[test]
fn file_round_trip_through_create_and_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested/intstore.replay");
    let recorder =
        Recorder::create(&path, RecorderOptions::new(b"seed".to_vec())).expect("create");
    let channel = recorder.wrap(Arc::new(IntStore::default()));
    let recorded = workload(channel.as_ref());
    recorder.close().expect("close");

    let replayer = Replayer::open(&path).expect("open");
    assert_eq!(replayer.initial(), b"seed");
    assert_eq!(workload(replayer.connection().as_ref()), recorded);
}

#[test]
fn truncated_file_fails_to_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("intstore.replay");
    let (_, log) = record_workload(b"");
    std::fs::write(&path, &log[..log.len() - 1]).expect("write");
    let err = match Replayer::open(&path) {
        Ok(_) => panic!("expected truncation error"),
        Err(err) => err,
    };
    assert!(matches!(err, ReplayError::Truncated(_)), "{err}");
}

#[test]
fn missing_file_is_an_io_error() {
    let err = match Replayer::open("/nonexistent/intstore.replay") {
        Ok(_) => panic!("expected io error"),
        Err(err) => err,
    };
    assert!(matches!(err, ReplayError::Io(_)), "{err}");
}
