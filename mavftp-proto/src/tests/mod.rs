use assert_matches::assert_matches;

use crate::{
    seq_lt, Command, Completion, EngineConfig, Error, Opcode, ServerResult, MAX_DATA_SIZE,
};

mod util;
use util::Harness;

fn log_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn download(remote_path: &str, local_dir: &std::path::Path) -> Command {
    Command::Download {
        remote_path: remote_path.to_owned(),
        local_dir: local_dir.to_owned(),
    }
}

#[test]
fn serial_comparison() {
    assert!(seq_lt(0, 1));
    assert!(seq_lt(100, 200));
    assert!(!seq_lt(200, 100));
    assert!(!seq_lt(5, 5));
    // Wrap: 65535 happened just before 0.
    assert!(seq_lt(65535, 0));
    assert!(seq_lt(65000, 10));
    assert!(!seq_lt(10, 65000));
}

#[test]
fn download_small_file() {
    log_init();
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0u8..50).collect();
    let mut h = Harness::new();
    let op = h.push(download("/a/data.bin", dir.path()));

    let open = h.last_sent();
    assert_eq!(open.seq_number, 0);
    assert_eq!(open.opcode, u8::from(Opcode::OpenFileRo));
    assert_eq!(open.session, 0);
    assert_eq!(open.data(), b"/a/data.bin\0");
    h.deliver(Harness::ack(&open, 7, &50u32.to_le_bytes()));

    let read = h.last_sent();
    assert_eq!(read.seq_number, 1);
    assert_eq!(read.opcode, u8::from(Opcode::ReadFile));
    assert_eq!(read.session, 7);
    assert_eq!(read.offset, 0);
    assert_eq!(read.size, 50);
    h.deliver(Harness::ack(&read, 7, &content));

    let terminate = h.last_sent();
    assert_eq!(terminate.seq_number, 2);
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    assert_eq!(terminate.session, 7);
    h.deliver(Harness::ack(&terminate, 7, &[]));

    assert!(!h.progress.is_empty());
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), content);
}

#[test]
fn download_retransmits_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let content = vec![0xa5u8; 50];
    let mut h = Harness::new();
    let op = h.push(download("/a/data.bin", dir.path()));
    h.deliver(Harness::ack(&h.last_sent(), 7, &50u32.to_le_bytes()));

    // The read reply is lost; the timer fires and the request goes out
    // again with the same sequence number.
    let read = h.last_sent();
    h.timeout();
    let resent = h.last_sent();
    assert_eq!(resent, read);
    assert_eq!(h.sent.len(), 3);

    h.deliver(Harness::ack(&resent, 7, &content));
    h.deliver(Harness::ack(&h.last_sent(), 7, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), content);
}

#[test]
fn download_nak_maps_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new();
    let op = h.push(download("/a/gone.bin", dir.path()));
    let enoent = 2;
    h.deliver(Harness::nak(
        &h.last_sent(),
        ServerResult::FailErrno,
        Some(enoent),
    ));
    assert_eq!(h.completed, vec![(op, Err(Error::FileDoesNotExist))]);
    assert_eq!(h.sent.len(), 1);
}

#[test]
fn download_empty_file_skips_the_read_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new();
    let op = h.push(download("/a/empty", dir.path()));
    h.deliver(Harness::ack(&h.last_sent(), 3, &0u32.to_le_bytes()));

    let terminate = h.last_sent();
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    h.deliver(Harness::ack(&terminate, 3, &[]));

    assert!(h.progress.is_empty());
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(std::fs::read(dir.path().join("empty")).unwrap(), b"");
}

#[test]
fn download_chunks_an_exact_multiple() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..478).map(|i| (i % 251) as u8).collect();
    let mut h = Harness::new();
    let op = h.push(download("/a/twochunks", dir.path()));
    h.deliver(Harness::ack(&h.last_sent(), 5, &478u32.to_le_bytes()));

    let first = h.last_sent();
    assert_eq!((first.offset, first.size), (0, 239));
    h.deliver(Harness::ack(&first, 5, &content[..239]));

    let second = h.last_sent();
    assert_eq!((second.offset, second.size), (239, 239));
    h.deliver(Harness::ack(&second, 5, &content[239..]));

    // No trailing short read: the session closes immediately.
    let terminate = h.last_sent();
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    h.deliver(Harness::ack(&terminate, 5, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(std::fs::read(dir.path().join("twochunks")).unwrap(), content);
}

#[test]
fn download_accepts_eof_before_the_advertised_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new();
    let op = h.push(download("/a/short", dir.path()));
    // The server claims 100 bytes but the file ends immediately.
    h.deliver(Harness::ack(&h.last_sent(), 4, &100u32.to_le_bytes()));
    h.deliver(Harness::nak(&h.last_sent(), ServerResult::Eof, None));

    let terminate = h.last_sent();
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    h.deliver(Harness::ack(&terminate, 4, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
}

#[test]
fn download_accepts_a_zero_length_read_as_eof() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::new();
    let op = h.push(download("/a/short", dir.path()));
    h.deliver(Harness::ack(&h.last_sent(), 4, &100u32.to_le_bytes()));
    h.deliver(Harness::ack(&h.last_sent(), 4, &[]));

    let terminate = h.last_sent();
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    h.deliver(Harness::ack(&terminate, 4, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
}

#[test]
fn upload_chunks_and_reports_progress() {
    log_init();
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..500).map(|i| (i % 251) as u8).collect();
    let local = dir.path().join("src.bin");
    std::fs::write(&local, &content).unwrap();

    let mut h = Harness::new();
    let op = h.push(Command::Upload {
        local_path: local,
        remote_dir: "/remote".into(),
    });

    let open = h.last_sent();
    assert_eq!(open.opcode, u8::from(Opcode::OpenFileWo));
    assert_eq!(open.data(), b"/remote/src.bin\0");
    h.deliver(Harness::ack(&open, 3, &[]));

    for (offset, len) in [(0u32, 239usize), (239, 239), (478, 22)] {
        let write = h.last_sent();
        assert_eq!(write.opcode, u8::from(Opcode::WriteFile));
        assert_eq!(write.session, 3);
        assert_eq!(write.offset, offset);
        assert_eq!(write.size as usize, len);
        assert_eq!(write.data(), &content[offset as usize..offset as usize + len]);
        h.deliver(Harness::ack(&write, 3, &[]));
    }

    let terminate = h.last_sent();
    assert_eq!(terminate.opcode, u8::from(Opcode::TerminateSession));
    h.deliver(Harness::ack(&terminate, 3, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);

    // Per-write progress deltas add up to the file size.
    let mut last = 0;
    let mut total = 0;
    for &(_, bytes, total_bytes) in &h.progress {
        assert_eq!(total_bytes, 500);
        total += bytes - last;
        last = bytes;
    }
    assert_eq!(total, 500);
}

#[test]
fn upload_of_a_missing_file_fails_before_sending() {
    let mut h = Harness::new();
    let op = h.push(Command::Upload {
        local_path: "/definitely/not/here.bin".into(),
        remote_dir: "/remote".into(),
    });
    assert_eq!(h.completed, vec![(op, Err(Error::FileDoesNotExist))]);
    assert!(h.sent.is_empty());
}

#[test]
fn list_directory_pages_until_an_empty_batch() {
    let mut h = Harness::new();
    let op = h.push(Command::ListDirectory {
        remote_path: "/d".into(),
    });

    let first = h.last_sent();
    assert_eq!(first.opcode, u8::from(Opcode::ListDirectory));
    assert_eq!(first.offset, 0);
    assert_eq!(first.data(), b"/d\0");
    h.deliver(Harness::ack(&first, 0, b"Ffoo.txt\t10\0Dsub\0Sskip\0"));

    // Skipped entries take no slot in the cursor.
    let second = h.last_sent();
    assert_eq!(second.offset, 2);
    assert_eq!(second.data(), b"/d\0");
    h.deliver(Harness::ack(&second, 0, b""));

    assert_eq!(
        h.completed,
        vec![(
            op,
            Ok(Completion::Listing(vec![
                "Ffoo.txt\t10".to_owned(),
                "Dsub".to_owned(),
            ]))
        )]
    );
}

#[test]
fn list_directory_accepts_eof_as_the_end() {
    let mut h = Harness::new();
    let op = h.push(Command::ListDirectory {
        remote_path: "/d".into(),
    });
    h.deliver(Harness::ack(&h.last_sent(), 0, b"Fone\t1\0"));
    h.deliver(Harness::nak(&h.last_sent(), ServerResult::Eof, None));
    assert_eq!(
        h.completed,
        vec![(op, Ok(Completion::Listing(vec!["Fone\t1".to_owned()])))]
    );
}

#[test]
fn list_directory_salvages_a_partial_listing() {
    let mut h = Harness::new();
    let op = h.push(Command::ListDirectory {
        remote_path: "/d".into(),
    });
    h.deliver(Harness::ack(&h.last_sent(), 0, b"Fone\t1\0"));
    h.deliver(Harness::nak(&h.last_sent(), ServerResult::Fail, None));
    assert_eq!(
        h.completed,
        vec![(op, Ok(Completion::Listing(vec!["Fone\t1".to_owned()])))]
    );
}

#[test]
fn list_directory_surfaces_an_early_failure() {
    let mut h = Harness::new();
    let op = h.push(Command::ListDirectory {
        remote_path: "/d".into(),
    });
    h.deliver(Harness::nak(&h.last_sent(), ServerResult::Fail, None));
    assert_eq!(h.completed, vec![(op, Err(Error::ProtocolError))]);
}

#[test]
fn rename_frames_both_paths() {
    let mut h = Harness::new();
    let op = h.push(Command::Rename {
        from: "/a/x".into(),
        to: "/a/y".into(),
    });
    let sent = h.last_sent();
    assert_eq!(sent.opcode, u8::from(Opcode::Rename));
    assert_eq!(sent.data(), b"/a/x\0/a/y\0");
    h.deliver(Harness::ack(&sent, 0, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
}

#[test]
fn rename_rejects_an_overlong_pair() {
    let mut h = Harness::new();
    let op = h.push(Command::Rename {
        from: "a".repeat(120),
        to: "b".repeat(120),
    });
    assert_eq!(h.completed, vec![(op, Err(Error::InvalidParameter))]);
    assert!(h.sent.is_empty());
}

#[test]
fn path_length_boundary() {
    // 238 characters plus the NUL terminator exactly fill the data region.
    let mut h = Harness::new();
    h.push(Command::CreateDirectory {
        remote_path: "d".repeat(MAX_DATA_SIZE - 1),
    });
    assert_eq!(h.sent.len(), 1);
    assert_eq!(h.last_sent().size as usize, MAX_DATA_SIZE);
    assert!(h.completed.is_empty());

    let mut h = Harness::new();
    let op = h.push(Command::CreateDirectory {
        remote_path: "d".repeat(MAX_DATA_SIZE),
    });
    assert_eq!(h.completed, vec![(op, Err(Error::InvalidParameter))]);
    assert!(h.sent.is_empty());
}

#[test]
fn crc32_decodes_the_checksum() {
    let mut h = Harness::new();
    let op = h.push(Command::CalcFileCrc32 {
        remote_path: "/a/data.bin".into(),
    });
    let sent = h.last_sent();
    assert_eq!(sent.opcode, u8::from(Opcode::CalcFileCrc32));
    h.deliver(Harness::ack(&sent, 0, &0xdead_beefu32.to_le_bytes()));
    assert_eq!(
        h.completed,
        vec![(op, Ok(Completion::Crc32(0xdead_beef)))]
    );
}

#[test]
fn reset_is_a_single_round_trip() {
    let mut h = Harness::new();
    let op = h.push(Command::ResetSessions);
    let sent = h.last_sent();
    assert_eq!(sent.opcode, u8::from(Opcode::ResetSessions));
    h.deliver(Harness::ack(&sent, 0, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
}

#[test]
fn operations_run_one_at_a_time_in_order() {
    let mut h = Harness::new();
    let first = h.push(Command::CreateDirectory {
        remote_path: "/one".into(),
    });
    let second = h.push(Command::CreateDirectory {
        remote_path: "/two".into(),
    });
    // Only the head may be in flight.
    assert_eq!(h.sent.len(), 1);
    assert_eq!(h.last_sent().data(), b"/one\0");

    h.deliver(Harness::ack(&h.last_sent(), 0, &[]));
    assert_eq!(h.sent.len(), 2);
    assert_eq!(h.last_sent().data(), b"/two\0");
    assert_eq!(h.completed, vec![(first, Ok(Completion::Done))]);

    h.deliver(Harness::ack(&h.last_sent(), 0, &[]));
    assert_eq!(
        h.completed,
        vec![
            (first, Ok(Completion::Done)),
            (second, Ok(Completion::Done)),
        ]
    );
    assert_eq!(h.engine.queue_len(), 0);
}

#[test]
fn an_explicit_tick_is_idempotent() {
    let mut h = Harness::new();
    h.push(Command::ResetSessions);
    assert_eq!(h.sent.len(), 1);
    // The head is already in flight; ticking changes nothing.
    let events = h.engine.do_work();
    h.absorb(events);
    assert_eq!(h.sent.len(), 1);
    assert_eq!(h.timer_sets, 1);
}

#[test]
fn timeout_exhaustion_fails_the_operation() {
    let mut h = Harness::with_config(EngineConfig { retries: 2 });
    let op = h.push(Command::CreateDirectory {
        remote_path: "/nowhere".into(),
    });
    let original = h.last_sent();

    h.timeout();
    h.timeout();
    assert_eq!(h.sent.len(), 3);
    for resent in &h.sent[1..] {
        assert_eq!(*resent, original);
    }

    h.timeout();
    assert_eq!(h.sent.len(), 3);
    assert_matches!(h.completed.as_slice(), [(completed, Err(Error::Timeout))] if *completed == op);

    // Nothing left to retry.
    h.timeout();
    assert_eq!(h.sent.len(), 3);
    assert_eq!(h.completed.len(), 1);
}

#[test]
fn foreign_responses_are_ignored() {
    let mut h = Harness::new();
    let op = h.push(Command::CreateDirectory {
        remote_path: "/dir".into(),
    });
    let sent = h.last_sent();

    let mut foreign = Harness::ack(&sent, 0, &[]);
    foreign.req_opcode = Opcode::ListDirectory.into();
    h.deliver(foreign);
    assert!(h.completed.is_empty());
    assert_eq!(h.sent.len(), 1);

    h.deliver(Harness::ack(&sent, 0, &[]));
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
}

#[test]
fn late_duplicates_after_completion_are_ignored() {
    let mut h = Harness::new();
    let op = h.push(Command::CreateDirectory {
        remote_path: "/dir".into(),
    });
    let ack = Harness::ack(&h.last_sent(), 0, &[]);
    h.deliver(ack.clone());
    h.deliver(ack);
    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(h.sent.len(), 1);
}

#[test]
fn sequence_numbers_wrap_and_duplicates_stay_dead() {
    let dir = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..300).map(|i| (i % 251) as u8).collect();
    let mut h = Harness::new();
    h.engine.set_next_seq(65534);
    let op = h.push(download("/a/wrap.bin", dir.path()));

    let open = h.last_sent();
    assert_eq!(open.seq_number, 65534);
    h.deliver(Harness::ack(&open, 9, &300u32.to_le_bytes()));

    let first = h.last_sent();
    assert_eq!(first.seq_number, 65535);
    let first_ack = Harness::ack(&first, 9, &content[..239]);
    assert_eq!(first_ack.seq_number, 0);
    h.deliver(first_ack.clone());

    let second = h.last_sent();
    assert_eq!(second.seq_number, 0);
    assert_eq!(second.offset, 239);

    // A retransmitted copy of the previous reply (same seq across the wrap)
    // and a stale pre-wrap reply both bounce off.
    h.deliver(first_ack);
    let mut stale = Harness::ack(&first, 9, &content[..239]);
    stale.seq_number = 65535;
    h.deliver(stale);
    assert_eq!(h.last_sent(), second);
    assert_eq!(h.sent.len(), 3);

    h.deliver(Harness::ack(&second, 9, &content[239..]));
    let terminate = h.last_sent();
    assert_eq!(terminate.seq_number, 1);
    h.deliver(Harness::ack(&terminate, 9, &[]));

    assert_eq!(h.completed, vec![(op, Ok(Completion::Done))]);
    assert_eq!(std::fs::read(dir.path().join("wrap.bin")).unwrap(), content);
}

#[test]
fn oversize_payloads_are_dropped() {
    let mut h = Harness::new();
    h.push(Command::CreateDirectory {
        remote_path: "/dir".into(),
    });
    let mut bogus = Harness::ack(&h.last_sent(), 0, &[]);
    bogus.size = 240;
    h.deliver(bogus);
    assert!(h.completed.is_empty());

    h.deliver(Harness::ack(&h.last_sent(), 0, &[]));
    assert_eq!(h.completed.len(), 1);
}

#[test]
fn every_operation_completes_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = Harness::with_config(EngineConfig { retries: 0 });
    let good = h.push(Command::CreateDirectory {
        remote_path: "/dir".into(),
    });
    let bad = h.push(Command::Rename {
        from: "x".repeat(200),
        to: "y".repeat(200),
    });
    let slow = h.push(download("/a/file", dir.path()));

    h.deliver(Harness::ack(&h.last_sent(), 0, &[]));
    // The download is now in flight; starve it.
    h.timeout();

    let mut completions: Vec<_> = h.completed.iter().map(|(op, _)| *op).collect();
    completions.sort();
    assert_eq!(completions, vec![good, bad, slow]);
    assert_matches!(
        h.completed
            .iter()
            .find(|(op, _)| *op == slow)
            .map(|(_, result)| result),
        Some(Err(Error::Timeout))
    );
}
