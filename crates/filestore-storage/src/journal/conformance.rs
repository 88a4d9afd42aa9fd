//! Behaviour every journal writer must share, run against each backend

use super::format::{CHUNK_HEADER_SIZE, FILE_HEADER_SIZE};
use super::{JournalEntry, JournalStreamReader, JournalWriter, RandomAccessJournalReader};
use filestore_common::config::JournalConfig;
use filestore_common::{Error, FsId, WriterKind, Xid};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

fn kinds() -> Vec<WriterKind> {
    let mut kinds = vec![WriterKind::Serial, WriterKind::Concurrent];
    if cfg!(feature = "mmap-journal") {
        kinds.push(WriterKind::Mmap);
    }
    kinds
}

fn config(kind: WriterKind) -> JournalConfig {
    JournalConfig {
        writer: kind,
        chunk_schedule: vec![8, 16, 32],
        mmap_grow_bytes: 256,
        ..JournalConfig::default()
    }
}

fn id(s: &str) -> FsId {
    FsId::parse(s).unwrap()
}

fn random_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

fn scan(path: &Path, xid: Xid) -> Vec<JournalEntry> {
    JournalStreamReader::open(path, xid)
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
    xid: Xid,
}

fn fixture(kind: WriterKind) -> (Fixture, JournalWriter) {
    let dir = tempdir().unwrap();
    let path = dir.path().join(format!("{kind:?}.journal"));
    let xid = Xid::generate();
    let writer = JournalWriter::create(&path, xid, &config(kind)).unwrap();
    (Fixture { _dir: dir, path, xid }, writer)
}

/// Sizes around every boundary of the [8, 16, 32] schedule
const SIZES: [usize; 14] = [0, 1, 7, 8, 9, 23, 24, 25, 55, 56, 57, 88, 89, 1000];

#[test]
fn round_trip_across_chunk_boundaries() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let mut rng = StdRng::seed_from_u64(7);
        let mut expected = Vec::new();

        for (i, &size) in SIZES.iter().enumerate() {
            let data = random_bytes(&mut rng, size);
            let fsid = id(&format!("/rt/w{i}"));
            let offset = writer.write(&fsid, i as i64, &data).unwrap();
            expected.push((offset, fsid, i as i64, data));

            let data = random_bytes(&mut rng, size);
            let fsid = id(&format!("/rt/s{i}"));
            let mut stream = writer.output_stream(&fsid, -(i as i64)).unwrap();
            let mut rest = &data[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(40));
                stream.write_all(&rest[..n]).unwrap();
                rest = &rest[n..];
            }
            let offset = stream.close().unwrap();
            expected.push((offset, fsid, -(i as i64), data));
        }
        writer.close().unwrap();

        let entries = scan(&fx.path, fx.xid);
        assert_eq!(entries.len(), expected.len(), "{kind:?}");
        for (entry, (offset, fsid, originator, data)) in entries.iter().zip(&expected) {
            assert_eq!(entry.offset, *offset, "{kind:?}");
            assert_eq!(&entry.id, fsid);
            assert_eq!(entry.originator, *originator);
            assert_eq!(&entry.data[..], &data[..], "{kind:?} {fsid}");
        }

        let mut reader = RandomAccessJournalReader::open(&fx.path, fx.xid).unwrap();
        for (offset, fsid, originator, data) in expected.iter().rev() {
            let entry = reader.read(*offset).unwrap();
            assert_eq!(&entry.id, fsid);
            assert_eq!(entry.originator, *originator);
            assert_eq!(&entry.data[..], &data[..]);
        }
    }
}

#[test]
fn multi_write_reassembly() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let a = id("/multi/a");
        let b = id("/multi/b");

        let mut sa = writer.output_stream(&a, 1).unwrap();
        let mut sb = writer.output_stream(&b, 2).unwrap();
        let mut want_a = Vec::new();
        let mut want_b = Vec::new();
        for i in 0..100u8 {
            sa.write_all(&[i]).unwrap();
            want_a.push(i);
            if i % 3 == 0 {
                let chunk = vec![i; usize::from(i % 7) + 1];
                sb.write_all(&chunk).unwrap();
                want_b.extend_from_slice(&chunk);
            }
        }
        sb.write_all(b"").unwrap();
        let off_b = sb.close().unwrap();
        let off_a = sa.close().unwrap();
        writer.close().unwrap();

        let entries = scan(&fx.path, fx.xid);
        assert_eq!(entries.len(), 2);
        let by_id: HashMap<_, _> = entries.iter().map(|e| (e.id.clone(), e)).collect();
        assert_eq!(&by_id[&a].data[..], &want_a[..], "{kind:?}");
        assert_eq!(&by_id[&b].data[..], &want_b[..], "{kind:?}");
        assert_eq!(by_id[&a].offset, off_a);
        assert_eq!(by_id[&b].offset, off_b);

        // first chunk reserved at open, so `a` precedes `b`
        assert_eq!(off_a, FILE_HEADER_SIZE);
        assert!(off_b > off_a);
    }
}

#[test]
fn concurrent_writers_do_not_interleave() {
    const THREADS: u8 = 8;
    const SIZE: usize = 5000;

    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let writer = Arc::new(writer);
        let handles: Vec<_> = (1..=THREADS)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    let fill = vec![t; SIZE];
                    writer.write(&id(&format!("/conc/w{t}")), i64::from(t), &fill).unwrap();

                    let mut stream = writer
                        .output_stream_owned(&id(&format!("/conc/s{t}")), i64::from(t))
                        .unwrap();
                    for piece in fill.chunks(usize::from(t) * 37) {
                        stream.write_all(piece).unwrap();
                    }
                    stream.close().unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        writer.close().unwrap();

        let entries = scan(&fx.path, fx.xid);
        assert_eq!(entries.len(), usize::from(THREADS) * 2, "{kind:?}");
        for entry in &entries {
            let fill = u8::try_from(entry.originator).unwrap();
            assert!(entry.id.name().ends_with(&fill.to_string()));
            assert_eq!(entry.data.len(), SIZE);
            assert!(entry.data.iter().all(|&b| b == fill), "{kind:?} {}", entry.id);
        }
    }
}

#[test]
fn truncated_tail_is_clean_end() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let mut rng = StdRng::seed_from_u64(11);
        let mut bounds = Vec::new();
        for i in 0..5 {
            let data = random_bytes(&mut rng, SIZES[i * 3]);
            bounds.push(writer.write(&id(&format!("/crash/e{i}")), 0, &data).unwrap());
        }
        writer.close().unwrap();
        let bytes = std::fs::read(&fx.path).unwrap();
        bounds.push(bytes.len() as u64);

        let cut_path = fx.path.with_extension("cut");
        for k in 0..5 {
            let (start, end) = (bounds[k], bounds[k + 1]);
            for cut in [start + 1, start + 30, start + 49, start + 60, end - 1] {
                if cut >= end {
                    continue;
                }
                std::fs::write(&cut_path, &bytes[..usize::try_from(cut).unwrap()]).unwrap();
                let entries = scan(&cut_path, fx.xid);
                assert_eq!(entries.len(), k, "{kind:?} cut at {cut}");
            }
        }

        // a reserved but never written tail reads as zeros
        let mut padded = bytes.clone();
        padded.extend_from_slice(&[0u8; 4096]);
        std::fs::write(&cut_path, &padded).unwrap();
        assert_eq!(scan(&cut_path, fx.xid).len(), 5);
    }
}

#[test]
fn corruption_before_tail_is_fatal() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let first = writer.write(&id("/bad/a"), 0, b"0123456789abcdef").unwrap();
        writer.write(&id("/bad/b"), 0, b"tail").unwrap();
        writer.close().unwrap();

        let mut bytes = std::fs::read(&fx.path).unwrap();
        // inside /bad/a's first payload
        bytes[usize::try_from(first).unwrap() + CHUNK_HEADER_SIZE + 6 + 2] ^= 0xFF;
        std::fs::write(&fx.path, &bytes).unwrap();

        let result: Result<Vec<_>, _> = JournalStreamReader::open(&fx.path, fx.xid).unwrap().collect();
        assert!(matches!(result, Err(Error::Corruption { .. })), "{kind:?}");

        let mut reader = RandomAccessJournalReader::open(&fx.path, fx.xid).unwrap();
        assert!(matches!(reader.read(first), Err(Error::Corruption { .. })));
    }
}

#[test]
fn corrupt_chunk_size_before_tail_is_fatal() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let mut offsets = Vec::new();
        for name in ["a", "b", "c", "d"] {
            offsets.push(writer.write(&id(&format!("/bad/{name}")), 0, b"payload").unwrap());
        }
        writer.close().unwrap();

        // high byte of /bad/b's capacity: an unchecked size would run past the end
        let mut bytes = std::fs::read(&fx.path).unwrap();
        bytes[usize::try_from(offsets[1]).unwrap() + 23] = 0x7F;
        std::fs::write(&fx.path, &bytes).unwrap();

        let mut reader = JournalStreamReader::open(&fx.path, fx.xid).unwrap();
        assert_eq!(reader.next_entry().unwrap().unwrap().offset, offsets[0]);
        assert!(
            matches!(reader.next_entry(), Err(Error::Corruption { offset, .. }) if offset == offsets[1]),
            "{kind:?}"
        );

        let mut reader = RandomAccessJournalReader::open(&fx.path, fx.xid).unwrap();
        assert!(matches!(reader.read(offsets[1]), Err(Error::Corruption { .. })));
        assert_eq!(&reader.read(offsets[3]).unwrap().data[..], b"payload");
    }
}

#[test]
fn scan_while_streams_are_open() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let mut short = writer.output_stream(&id("/live/short"), 1).unwrap();
        short.write_all(b"abc").unwrap();
        let mut long = writer.output_stream(&id("/live/long"), 2).unwrap();
        // spills into a second chunk, so the first one is written with its link
        long.write_all(&[7u8; 20]).unwrap();
        let done = writer.write(&id("/live/w"), 3, b"finished").unwrap();
        writer.sync().unwrap();

        let entries = scan(&fx.path, fx.xid);
        assert_eq!(entries.len(), 1, "{kind:?}");
        assert_eq!(entries[0].offset, done);
        assert_eq!(&entries[0].data[..], b"finished");

        let mut reader = RandomAccessJournalReader::open(&fx.path, fx.xid).unwrap();
        assert!(matches!(reader.read(short.offset()), Err(Error::Corruption { .. })));

        short.close().unwrap();
        long.close().unwrap();
        writer.close().unwrap();
        let entries = scan(&fx.path, fx.xid);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        // entries come back in the order of their last chunks
        assert_eq!(ids, ["/live/short", "/live/long", "/live/w"], "{kind:?}");
    }
}

#[test]
fn journal_bound_to_its_transaction() {
    for kind in kinds() {
        let (fx, writer) = fixture(kind);
        let offset = writer.write(&id("/x/y"), 0, b"data").unwrap();
        writer.close().unwrap();

        let other = Xid::new(fx.xid.global, fx.xid.branch ^ 1);
        assert!(matches!(
            JournalStreamReader::open(&fx.path, other),
            Err(Error::XidMismatch { .. })
        ));
        assert!(matches!(
            RandomAccessJournalReader::open(&fx.path, other),
            Err(Error::XidMismatch { .. })
        ));

        // an offset that is not the start of an entry
        let mut reader = RandomAccessJournalReader::open(&fx.path, fx.xid).unwrap();
        assert!(reader.read(offset + 4).is_err());
        assert_eq!(&reader.read(offset).unwrap().data[..], b"data");
    }
}

#[test]
fn writers_produce_identical_bytes() {
    let mut outputs = Vec::new();
    let xid = Xid::new(0x1234, 0x5678);
    for kind in kinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("same.journal");
        let writer = JournalWriter::create(&path, xid, &config(kind)).unwrap();
        let mut rng = StdRng::seed_from_u64(3);

        let mut stream = writer.output_stream(&id("/same/stream"), 5).unwrap();
        for &size in &SIZES {
            let data = random_bytes(&mut rng, size);
            writer.write(&id("/same/blob"), size as i64, &data).unwrap();
            stream.write_all(&data[..size.min(13)]).unwrap();
        }
        stream.close().unwrap();
        writer.close().unwrap();
        outputs.push((kind, std::fs::read(&path).unwrap()));
    }
    let (first_kind, first) = &outputs[0];
    for (kind, bytes) in &outputs[1..] {
        assert_eq!(bytes, first, "{kind:?} differs from {first_kind:?}");
    }
}
